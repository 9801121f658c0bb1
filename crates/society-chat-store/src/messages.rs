use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use society_chat_shared::constants::REDACTED_TEXT;
use society_chat_shared::{
    ChatMessage, MessageContent, MessageId, OutgoingMessage, SocietyId, UserId,
};

use crate::database::Database;
use crate::error::{Result, StoreError};

/// A message that has not been written yet, so it has no id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender: UserId,
    pub receiver: UserId,
    pub society_id: SocietyId,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
}

impl From<OutgoingMessage> for NewMessage {
    fn from(m: OutgoingMessage) -> Self {
        Self {
            sender: m.sender,
            receiver: m.receiver,
            society_id: m.society_id,
            content: m.content,
            created_at: m.created_at,
        }
    }
}

const MESSAGE_COLUMNS: &str =
    "id, sender, receiver, society_id, text, file_url, file_type, audio_url, created_at, seen, deleted";

impl Database {
    /// Persist a message and return the canonical stored copy with its new id.
    pub fn insert_message(&self, message: &NewMessage) -> Result<ChatMessage> {
        if message.sender == message.receiver {
            return Err(society_chat_shared::ValidationError::SelfAddressed.into());
        }
        message.content.validate()?;

        let id = MessageId::generate();
        self.conn().execute(
            "INSERT INTO direct_messages
                 (id, sender, receiver, society_id, text, file_url, file_type, audio_url,
                  created_at, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                     (SELECT COALESCE(MAX(seq), 0) + 1 FROM direct_messages))",
            params![
                id.as_str(),
                message.sender.as_str(),
                message.receiver.as_str(),
                message.society_id.as_str(),
                message.content.text,
                message.content.file_url,
                message.content.file_type,
                message.content.audio_url,
                message.created_at.to_rfc3339(),
            ],
        )?;

        tracing::debug!(id = %id, sender = %message.sender, receiver = %message.receiver, "stored message");

        Ok(ChatMessage {
            id,
            sender: message.sender.clone(),
            receiver: message.receiver.clone(),
            society_id: message.society_id.clone(),
            content: message.content.clone(),
            created_at: message.created_at,
            seen: false,
            deleted: false,
        })
    }

    pub fn get_message(&self, id: &MessageId) -> Result<ChatMessage> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM direct_messages WHERE id = ?1"),
                params![id.as_str()],
                row_to_message,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    /// The most recent `limit` messages between `user` and `peer`, skipping
    /// `offset` newer ones, returned oldest first. Messages `user` hid for
    /// themselves are excluded.
    pub fn conversation_history(
        &self,
        user: &UserId,
        peer: &UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ChatMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM direct_messages m
             WHERE ((m.sender = ?1 AND m.receiver = ?2) OR (m.sender = ?2 AND m.receiver = ?1))
               AND NOT EXISTS (
                   SELECT 1 FROM hidden_messages h
                   WHERE h.message_id = m.id AND h.user_id = ?1
               )
             ORDER BY m.seq DESC
             LIMIT ?3 OFFSET ?4"
        ))?;

        let rows = stmt.query_map(
            params![user.as_str(), peer.as_str(), limit, offset],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        messages.reverse();
        Ok(messages)
    }

    /// Flag every message `peer` sent to `reader` as seen. Idempotent; returns
    /// how many rows actually changed.
    pub fn mark_conversation_seen(&self, reader: &UserId, peer: &UserId) -> Result<usize> {
        let changed = self.conn().execute(
            "UPDATE direct_messages SET seen = 1
             WHERE sender = ?1 AND receiver = ?2 AND seen = 0",
            params![peer.as_str(), reader.as_str()],
        )?;
        Ok(changed)
    }

    /// Remove a message from `user`'s own history only.
    pub fn hide_message_for(&self, user: &UserId, id: &MessageId) -> Result<()> {
        let message = self.get_message(id)?;
        if !message.involves(user) {
            return Err(StoreError::NotFound);
        }
        self.conn().execute(
            "INSERT OR IGNORE INTO hidden_messages (message_id, user_id, hidden_at)
             VALUES (?1, ?2, ?3)",
            params![id.as_str(), user.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Replace the content with the deletion placeholder for both participants.
    pub fn redact_message(&self, id: &MessageId) -> Result<ChatMessage> {
        let affected = self.conn().execute(
            "UPDATE direct_messages
             SET text = ?2, file_url = NULL, file_type = NULL, audio_url = NULL, deleted = 1
             WHERE id = ?1",
            params![id.as_str(), REDACTED_TEXT],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        self.get_message(id)
    }

    /// Everyone `user` has exchanged at least one message with.
    pub fn conversation_partners(&self, user: &UserId) -> Result<Vec<UserId>> {
        let mut stmt = self.conn().prepare(
            "SELECT DISTINCT CASE WHEN sender = ?1 THEN receiver ELSE sender END
             FROM direct_messages
             WHERE sender = ?1 OR receiver = ?1",
        )?;
        let rows = stmt.query_map(params![user.as_str()], |row| row.get::<_, String>(0))?;

        let mut partners = Vec::new();
        for row in rows {
            partners.push(UserId(row?));
        }
        Ok(partners)
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let ts_str: String = row.get(8)?;
    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&ts_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(ChatMessage {
        id: MessageId(row.get(0)?),
        sender: UserId(row.get(1)?),
        receiver: UserId(row.get(2)?),
        society_id: SocietyId(row.get(3)?),
        content: MessageContent {
            text: row.get(4)?,
            file_url: row.get(5)?,
            file_type: row.get(6)?,
            audio_url: row.get(7)?,
        },
        created_at,
        seen: row.get::<_, i64>(9)? != 0,
        deleted: row.get::<_, i64>(10)? != 0,
    })
}
