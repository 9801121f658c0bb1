use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{MAX_FRAME_SIZE, MAX_TEXT_LENGTH, REDACTED_TEXT};
use crate::error::{ProtocolError, ValidationError};
use crate::types::{ClientRef, DeleteScope, MessageId, SocietyId, UserId};

/// Events a client sends to the relay.
///
/// On the wire every frame is `{"event": "<name>", "data": <payload>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    /// Register this connection for a user and mark them online.
    #[serde(rename = "setup")]
    Setup(UserId),

    /// Push a message live. The relay persists it before fan-out.
    #[serde(rename = "send message")]
    SendMessage(OutgoingMessage),

    /// Tell the peer that everything they sent us has been seen.
    #[serde(rename = "mark as seen")]
    MarkAsSeen(MarkAsSeen),

    /// Remove a message for ourselves or redact it for both participants.
    #[serde(rename = "delete message")]
    DeleteMessage(DeleteRequest),

    /// Ask for the full presence table again.
    #[serde(rename = "online status")]
    RequestOnlineStatus,
}

/// Events the relay pushes to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "receive message")]
    ReceiveMessage(ChatMessage),

    /// Canonical stored copy, sent only to the connection that sent it.
    #[serde(rename = "message ack")]
    MessageAck(MessageAck),

    #[serde(rename = "message failed")]
    MessageFailed(MessageFailed),

    #[serde(rename = "messages seen")]
    MessagesSeen(MessagesSeen),

    #[serde(rename = "user status")]
    UserStatus(UserStatus),

    #[serde(rename = "online status")]
    OnlineStatus(BTreeMap<UserId, PresenceSnapshot>),

    #[serde(rename = "buzz message deleted for me")]
    DeletedForMe(DeletedMessage),

    #[serde(rename = "buzz message deleted for all")]
    DeletedForAll(DeletedMessage),

    #[serde(rename = "buzzMessageDeleted")]
    MessageDeleted(MessageDeleted),

    #[serde(rename = "error")]
    Error(ErrorPayload),
}

/// Text and/or attachment carried by a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
}

impl MessageContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn file(url: impl Into<String>, mime: impl Into<String>) -> Self {
        Self {
            file_url: Some(url.into()),
            file_type: Some(mime.into()),
            ..Default::default()
        }
    }

    pub fn has_text(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    pub fn has_attachment(&self) -> bool {
        self.file_url.is_some() || self.audio_url.is_some()
    }

    /// Text and attachment may coexist, but at least one must be present.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(text) = &self.text {
            if text.len() > MAX_TEXT_LENGTH {
                return Err(ValidationError::TextTooLong {
                    len: text.len(),
                    max: MAX_TEXT_LENGTH,
                });
            }
        }
        if self.file_type.is_some() && self.file_url.is_none() {
            return Err(ValidationError::FileTypeWithoutUrl);
        }
        if !self.has_text() && !self.has_attachment() {
            return Err(ValidationError::Empty);
        }
        Ok(())
    }

    /// Replace content with the deletion placeholder, dropping attachments.
    pub fn redact(&mut self) {
        self.text = Some(REDACTED_TEXT.to_string());
        self.file_url = None;
        self.file_type = None;
        self.audio_url = None;
    }
}

/// Payload of `send message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    pub client_ref: ClientRef,
    pub sender: UserId,
    pub receiver: UserId,
    pub society_id: SocietyId,
    #[serde(flatten)]
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
}

impl OutgoingMessage {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.sender.as_str().is_empty() {
            return Err(ValidationError::MissingField("sender"));
        }
        if self.receiver.as_str().is_empty() {
            return Err(ValidationError::MissingField("receiver"));
        }
        if self.sender == self.receiver {
            return Err(ValidationError::SelfAddressed);
        }
        self.content.validate()
    }
}

/// A message as stored and relayed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender: UserId,
    pub receiver: UserId,
    pub society_id: SocietyId,
    #[serde(flatten)]
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub seen: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl ChatMessage {
    /// The other participant, from `me`'s point of view.
    pub fn peer_of(&self, me: &UserId) -> &UserId {
        if &self.sender == me {
            &self.receiver
        } else {
            &self.sender
        }
    }

    pub fn involves(&self, user: &UserId) -> bool {
        &self.sender == user || &self.receiver == user
    }

    pub fn redact(&mut self) {
        self.content.redact();
        self.deleted = true;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkAsSeen {
    /// The reader.
    pub user_id: UserId,
    /// The original sender whose messages were seen.
    pub peer_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    pub message_id: MessageId,
    pub peer_id: UserId,
    #[serde(rename = "type")]
    pub scope: DeleteScope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAck {
    pub client_ref: ClientRef,
    pub message: ChatMessage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFailed {
    pub client_ref: ClientRef,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesSeen {
    pub from: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    pub user_id: UserId,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceSnapshot {
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedMessage {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDeleted {
    pub message_id: MessageId,
    #[serde(rename = "type")]
    pub scope: DeleteScope,
    /// The user who deleted the message.
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Setup(_) => "setup",
            Self::SendMessage(_) => "send message",
            Self::MarkAsSeen(_) => "mark as seen",
            Self::DeleteMessage(_) => "delete message",
            Self::RequestOnlineStatus => "online status",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(frame: &str) -> Result<Self, ProtocolError> {
        check_frame_size(frame)?;
        Ok(serde_json::from_str(frame)?)
    }
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReceiveMessage(_) => "receive message",
            Self::MessageAck(_) => "message ack",
            Self::MessageFailed(_) => "message failed",
            Self::MessagesSeen(_) => "messages seen",
            Self::UserStatus(_) => "user status",
            Self::OnlineStatus(_) => "online status",
            Self::DeletedForMe(_) => "buzz message deleted for me",
            Self::DeletedForAll(_) => "buzz message deleted for all",
            Self::MessageDeleted(_) => "buzzMessageDeleted",
            Self::Error(_) => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
        })
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(frame: &str) -> Result<Self, ProtocolError> {
        check_frame_size(frame)?;
        Ok(serde_json::from_str(frame)?)
    }
}

fn check_frame_size(frame: &str) -> Result<(), ProtocolError> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: frame.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outgoing(content: MessageContent) -> OutgoingMessage {
        OutgoingMessage {
            client_ref: ClientRef::new(),
            sender: "u1".into(),
            receiver: "u2".into(),
            society_id: SocietyId::new("s1"),
            content,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_setup_frame_shape() {
        let frame = ClientEvent::Setup("u1".into()).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value, json!({"event": "setup", "data": "u1"}));
    }

    #[test]
    fn test_send_message_uses_camel_case_fields() {
        let msg = outgoing(MessageContent::text("hi"));
        let value = serde_json::to_value(ClientEvent::SendMessage(msg)).unwrap();
        assert_eq!(value["event"], "send message");
        assert_eq!(value["data"]["text"], "hi");
        assert_eq!(value["data"]["societyId"], "s1");
        assert!(value["data"].get("fileUrl").is_none());
        assert!(value["data"].get("clientRef").is_some());
    }

    #[test]
    fn test_parse_mark_as_seen_from_raw_json() {
        let raw = r#"{"event":"mark as seen","data":{"userId":"u2","peerId":"u1"}}"#;
        let event = ClientEvent::from_json(raw).unwrap();
        assert_eq!(
            event,
            ClientEvent::MarkAsSeen(MarkAsSeen {
                user_id: "u2".into(),
                peer_id: "u1".into(),
            })
        );
    }

    #[test]
    fn test_request_online_status_without_data() {
        let event = ClientEvent::from_json(r#"{"event":"online status"}"#).unwrap();
        assert_eq!(event, ClientEvent::RequestOnlineStatus);
    }

    #[test]
    fn test_deleted_event_carries_type_and_actor() {
        let event = ServerEvent::MessageDeleted(MessageDeleted {
            message_id: "m1".into(),
            scope: DeleteScope::ForAll,
            user_id: "u1".into(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "buzzMessageDeleted",
                "data": {"messageId": "m1", "type": "for all", "userId": "u1"}
            })
        );
    }

    #[test]
    fn test_online_status_is_a_map() {
        let mut table = BTreeMap::new();
        table.insert(
            UserId::from("u1"),
            PresenceSnapshot {
                is_online: true,
                last_seen: None,
            },
        );
        let value = serde_json::to_value(ServerEvent::OnlineStatus(table)).unwrap();
        assert_eq!(value["data"]["u1"]["isOnline"], true);
    }

    #[test]
    fn test_unknown_event_rejected() {
        assert!(ClientEvent::from_json(r#"{"event":"typing","data":{}}"#).is_err());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let frame = "x".repeat(MAX_FRAME_SIZE + 1);
        assert!(matches!(
            ClientEvent::from_json(&frame),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_validation() {
        assert!(outgoing(MessageContent::text("hi")).validate().is_ok());
        assert!(outgoing(MessageContent::file("http://x/a.png", "image/png"))
            .validate()
            .is_ok());
        assert_eq!(
            outgoing(MessageContent::text("   ")).validate(),
            Err(ValidationError::Empty)
        );
        assert_eq!(
            outgoing(MessageContent {
                file_type: Some("image/png".into()),
                text: Some("x".into()),
                ..Default::default()
            })
            .validate(),
            Err(ValidationError::FileTypeWithoutUrl)
        );

        let mut to_self = outgoing(MessageContent::text("hi"));
        to_self.receiver = "u1".into();
        assert_eq!(to_self.validate(), Err(ValidationError::SelfAddressed));

        let long = outgoing(MessageContent::text("a".repeat(MAX_TEXT_LENGTH + 1)));
        assert!(matches!(
            long.validate(),
            Err(ValidationError::TextTooLong { .. })
        ));
    }

    #[test]
    fn test_redact_clears_attachments() {
        let mut content = MessageContent {
            text: Some("secret".into()),
            file_url: Some("http://x/a.png".into()),
            file_type: Some("image/png".into()),
            audio_url: Some("http://x/a.ogg".into()),
        };
        content.redact();
        assert_eq!(content.text.as_deref(), Some(REDACTED_TEXT));
        assert!(content.file_url.is_none());
        assert!(content.file_type.is_none());
        assert!(content.audio_url.is_none());
    }
}
