//! Per-peer conversation state held by the client.
//!
//! Entries are kept in arrival order and never re-sorted. A local send is
//! appended immediately as [`SendStatus::Pending`] and later confirmed or
//! failed by matching its [`ClientRef`] against the relay's reply.

use chrono::{DateTime, Utc};
use tracing::debug;

use society_chat_shared::{
    ChatMessage, ClientRef, DeleteScope, MessageAck, MessageContent, MessageDeleted, MessageId,
    OutgoingMessage, SocietyId, UserId, ValidationError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Empty,
    Loading,
    Loaded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendStatus {
    Pending,
    Confirmed(MessageId),
    Failed(String),
}

/// One row of the timeline, either relayed by the server or sent from here.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub client_ref: Option<ClientRef>,
    pub sender: UserId,
    pub receiver: UserId,
    pub society_id: SocietyId,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
    pub seen: bool,
    pub deleted: bool,
    pub status: SendStatus,
}

impl Entry {
    fn from_server(message: ChatMessage) -> Self {
        Self {
            client_ref: None,
            sender: message.sender,
            receiver: message.receiver,
            society_id: message.society_id,
            content: message.content,
            created_at: message.created_at,
            seen: message.seen,
            deleted: message.deleted,
            status: SendStatus::Confirmed(message.id),
        }
    }

    pub fn id(&self) -> Option<&MessageId> {
        match &self.status {
            SendStatus::Confirmed(id) => Some(id),
            _ => None,
        }
    }

    /// Not yet acknowledged by the relay.
    pub fn is_local(&self) -> bool {
        !matches!(self.status, SendStatus::Confirmed(_))
    }

    fn redact(&mut self) {
        self.content.redact();
        self.deleted = true;
    }

    fn to_outgoing(&self, client_ref: ClientRef) -> OutgoingMessage {
        OutgoingMessage {
            client_ref,
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            society_id: self.society_id.clone(),
            content: self.content.clone(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationViewModel {
    me: UserId,
    peer: UserId,
    society_id: SocietyId,
    state: LoadState,
    entries: Vec<Entry>,
    /// Live messages that arrived while history was loading.
    early: Vec<ChatMessage>,
}

impl ConversationViewModel {
    pub fn new(me: UserId, peer: UserId, society_id: SocietyId) -> Self {
        Self {
            me,
            peer,
            society_id,
            state: LoadState::Empty,
            entries: Vec::new(),
            early: Vec::new(),
        }
    }

    pub fn peer(&self) -> &UserId {
        &self.peer
    }

    pub fn state(&self) -> &LoadState {
        &self.state
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&Entry> {
        self.entries.last()
    }

    fn position_of_id(&self, id: &MessageId) -> Option<usize> {
        self.entries.iter().position(|e| e.id() == Some(id))
    }

    fn position_of_ref(&self, client_ref: ClientRef) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.client_ref == Some(client_ref) && e.is_local())
    }

    pub fn entry(&self, id: &MessageId) -> Option<&Entry> {
        self.position_of_id(id).map(|pos| &self.entries[pos])
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.position_of_id(id).is_some() || self.early.iter().any(|m| &m.id == id)
    }

    pub fn has_pending(&self, client_ref: ClientRef) -> bool {
        self.position_of_ref(client_ref).is_some()
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    pub fn begin_load(&mut self) {
        self.state = LoadState::Loading;
    }

    /// Replace the server-known part of the timeline with `history`.
    ///
    /// Live messages that raced the fetch are appended after it. Sends made
    /// from here survive too: pending and failed ones always, confirmed ones
    /// when the page does not contain them yet and they are not older than
    /// its newest message (an ack can beat the insert the fetch read from).
    pub fn finish_load(&mut self, history: Vec<ChatMessage>) {
        let own: Vec<Entry> = self
            .entries
            .drain(..)
            .filter(|e| e.client_ref.is_some())
            .collect();
        let early = std::mem::take(&mut self.early);
        let newest = history.last().map(|m| m.created_at);

        self.entries = history.into_iter().map(Entry::from_server).collect();
        for message in early {
            if self.position_of_id(&message.id).is_none() {
                self.entries.push(Entry::from_server(message));
            }
        }
        for entry in own {
            let keep = match entry.id() {
                None => true,
                Some(id) if self.position_of_id(id).is_some() => false,
                Some(_) => newest.map_or(true, |newest| entry.created_at >= newest),
            };
            if keep {
                self.entries.push(entry);
            }
        }

        self.state = LoadState::Loaded;
        debug!(peer = %self.peer.short(), entries = self.entries.len(), "History loaded");
    }

    /// The fetch failed; anything buffered is shown as-is.
    pub fn fail_load(&mut self) {
        for message in std::mem::take(&mut self.early) {
            self.push_server(message);
        }
        self.state = if self.entries.is_empty() {
            LoadState::Empty
        } else {
            LoadState::Loaded
        };
    }

    // -----------------------------------------------------------------------
    // Local sends
    // -----------------------------------------------------------------------

    /// Optimistically append a text message and return the event to send.
    pub fn compose_text(&mut self, text: &str, now: DateTime<Utc>) -> Result<OutgoingMessage, ValidationError> {
        let outgoing = OutgoingMessage {
            client_ref: ClientRef::new(),
            sender: self.me.clone(),
            receiver: self.peer.clone(),
            society_id: self.society_id.clone(),
            content: MessageContent::text(text),
            created_at: now,
        };
        outgoing.validate()?;
        self.push_local(&outgoing);
        Ok(outgoing)
    }

    /// Optimistically append a file message whose upload is about to start.
    /// The entry has no URL until the relay confirms it.
    pub fn compose_file(&mut self, mime_type: &str, caption: Option<&str>, now: DateTime<Utc>) -> ClientRef {
        let client_ref = ClientRef::new();
        self.entries.push(Entry {
            client_ref: Some(client_ref),
            sender: self.me.clone(),
            receiver: self.peer.clone(),
            society_id: self.society_id.clone(),
            content: MessageContent {
                text: caption.map(str::to_string),
                file_type: Some(mime_type.to_string()),
                ..MessageContent::default()
            },
            created_at: now,
            seen: false,
            deleted: false,
            status: SendStatus::Pending,
        });
        client_ref
    }

    fn push_local(&mut self, outgoing: &OutgoingMessage) {
        self.entries.push(Entry {
            client_ref: Some(outgoing.client_ref),
            sender: outgoing.sender.clone(),
            receiver: outgoing.receiver.clone(),
            society_id: outgoing.society_id.clone(),
            content: outgoing.content.clone(),
            created_at: outgoing.created_at,
            seen: false,
            deleted: false,
            status: SendStatus::Pending,
        });
    }

    /// Swap the optimistic entry for the canonical copy. If the canonical
    /// message is already present the optimistic one is dropped.
    pub fn confirm(&mut self, client_ref: ClientRef, message: ChatMessage) -> bool {
        let Some(pos) = self.position_of_ref(client_ref) else {
            return false;
        };
        if self.position_of_id(&message.id).is_some() {
            self.entries.remove(pos);
            return true;
        }
        let mut entry = Entry::from_server(message);
        entry.client_ref = Some(client_ref);
        self.entries[pos] = entry;
        true
    }

    pub fn on_ack(&mut self, ack: &MessageAck) -> bool {
        self.confirm(ack.client_ref, ack.message.clone())
    }

    pub fn on_failed(&mut self, client_ref: ClientRef, reason: &str) -> bool {
        let Some(pos) = self.position_of_ref(client_ref) else {
            return false;
        };
        self.entries[pos].status = SendStatus::Failed(reason.to_string());
        true
    }

    /// Put a failed text send back to pending and return the event to resend.
    /// File sends carry no URL yet and must be uploaded again instead.
    pub fn retry(&mut self, client_ref: ClientRef) -> Option<OutgoingMessage> {
        let pos = self.position_of_ref(client_ref)?;
        let entry = &mut self.entries[pos];
        if !matches!(entry.status, SendStatus::Failed(_)) || entry.content.validate().is_err() {
            return None;
        }
        entry.status = SendStatus::Pending;
        Some(entry.to_outgoing(client_ref))
    }

    /// Remove a failed send.
    pub fn discard(&mut self, client_ref: ClientRef) -> bool {
        match self.position_of_ref(client_ref) {
            Some(pos) if matches!(self.entries[pos].status, SendStatus::Failed(_)) => {
                self.entries.remove(pos);
                true
            }
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Relay events
    // -----------------------------------------------------------------------

    /// Append a relayed message. Ids already shown are ignored.
    pub fn on_receive(&mut self, message: ChatMessage) -> bool {
        if self.contains(&message.id) {
            debug!(id = %message.id, "Duplicate message ignored");
            return false;
        }
        if self.state == LoadState::Loading {
            self.early.push(message);
            return true;
        }
        self.push_server(message);
        true
    }

    fn push_server(&mut self, message: ChatMessage) {
        if self.state == LoadState::Empty {
            self.state = LoadState::Loaded;
        }
        self.entries.push(Entry::from_server(message));
    }

    /// `messages seen` from the peer: everything I sent is now seen.
    pub fn on_seen(&mut self, from: &UserId) -> usize {
        if from != &self.peer {
            return 0;
        }
        let mut changed = 0;
        for entry in self.entries.iter_mut().filter(|e| e.sender == self.me) {
            if !entry.seen {
                entry.seen = true;
                changed += 1;
            }
        }
        changed
    }

    pub fn remove(&mut self, id: &MessageId) -> bool {
        self.early.retain(|m| &m.id != id);
        match self.position_of_id(id) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn redact(&mut self, id: &MessageId) -> bool {
        for message in self.early.iter_mut().filter(|m| &m.id == id) {
            message.redact();
        }
        match self.position_of_id(id) {
            Some(pos) => {
                self.entries[pos].redact();
                true
            }
            None => false,
        }
    }

    /// `buzzMessageDeleted`: removal when I deleted it for myself, redaction
    /// otherwise.
    pub fn on_message_deleted(&mut self, event: &MessageDeleted) -> bool {
        match event.scope {
            DeleteScope::ForMe if event.user_id == self.me => self.remove(&event.message_id),
            DeleteScope::ForMe => false,
            DeleteScope::ForAll => self.redact(&event.message_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use society_chat_shared::constants::REDACTED_TEXT;

    use super::*;

    fn vm() -> ConversationViewModel {
        ConversationViewModel::new("me".into(), "peer".into(), SocietyId::new("s1"))
    }

    fn server_msg(id: &str, from: &str, to: &str, text: &str) -> ChatMessage {
        ChatMessage {
            id: id.into(),
            sender: from.into(),
            receiver: to.into(),
            society_id: SocietyId::new("s1"),
            content: MessageContent::text(text),
            created_at: Utc::now(),
            seen: false,
            deleted: false,
        }
    }

    #[test]
    fn test_load_lifecycle() {
        let mut vm = vm();
        assert_eq!(vm.state(), &LoadState::Empty);

        vm.begin_load();
        assert_eq!(vm.state(), &LoadState::Loading);

        vm.finish_load(vec![server_msg("1", "peer", "me", "hi")]);
        assert_eq!(vm.state(), &LoadState::Loaded);
        assert_eq!(vm.entries().len(), 1);
    }

    #[test]
    fn test_optimistic_send_is_visible_before_ack() {
        let mut vm = vm();
        let out = vm.compose_text("hi", Utc::now()).unwrap();

        let last = vm.last().unwrap();
        assert_eq!(last.status, SendStatus::Pending);
        assert!(last.is_local());
        assert_eq!(last.content.text.as_deref(), Some("hi"));

        let mut canonical = server_msg("srv-1", "me", "peer", "hi");
        canonical.created_at = out.created_at;
        assert!(vm.on_ack(&MessageAck {
            client_ref: out.client_ref,
            message: canonical,
        }));
        assert_eq!(vm.entries().len(), 1);
        assert_eq!(vm.last().unwrap().status, SendStatus::Confirmed("srv-1".into()));
    }

    #[test]
    fn test_empty_text_is_not_inserted() {
        let mut vm = vm();
        assert!(vm.compose_text("  ", Utc::now()).is_err());
        assert!(vm.entries().is_empty());
    }

    #[test]
    fn test_failed_send_can_be_retried_or_discarded() {
        let mut vm = vm();
        let out = vm.compose_text("hi", Utc::now()).unwrap();

        assert!(vm.retry(out.client_ref).is_none());
        assert!(vm.on_failed(out.client_ref, "offline"));
        assert_eq!(vm.last().unwrap().status, SendStatus::Failed("offline".into()));

        let again = vm.retry(out.client_ref).unwrap();
        assert_eq!(again.client_ref, out.client_ref);
        assert_eq!(vm.last().unwrap().status, SendStatus::Pending);

        vm.on_failed(out.client_ref, "still offline");
        assert!(vm.discard(out.client_ref));
        assert!(vm.entries().is_empty());
    }

    #[test]
    fn test_duplicate_receive_is_dropped() {
        let mut vm = vm();
        assert!(vm.on_receive(server_msg("1", "peer", "me", "hi")));
        assert!(!vm.on_receive(server_msg("1", "peer", "me", "hi")));
        assert_eq!(vm.entries().len(), 1);
        assert_eq!(vm.state(), &LoadState::Loaded);
    }

    #[test]
    fn test_messages_during_load_are_merged() {
        let mut vm = vm();
        vm.begin_load();
        vm.on_receive(server_msg("2", "peer", "me", "live"));
        vm.on_receive(server_msg("3", "peer", "me", "newer"));
        assert!(vm.entries().is_empty());

        vm.finish_load(vec![
            server_msg("1", "peer", "me", "old"),
            server_msg("2", "peer", "me", "live"),
        ]);
        let ids: Vec<_> = vm.entries().iter().filter_map(|e| e.id()).map(|id| id.as_str().to_string()).collect();
        assert_eq!(ids, ["1", "2", "3"]);
    }

    #[test]
    fn test_send_acked_during_load_survives_stale_history() {
        let mut vm = vm();
        vm.begin_load();
        let out = vm.compose_text("hi", Utc::now()).unwrap();
        let mut canonical = server_msg("srv-1", "me", "peer", "hi");
        canonical.created_at = out.created_at;
        assert!(vm.on_ack(&MessageAck {
            client_ref: out.client_ref,
            message: canonical,
        }));

        // the page was read before the insert committed
        vm.finish_load(vec![]);

        assert_eq!(vm.entries().len(), 1);
        assert_eq!(vm.entries()[0].status, SendStatus::Confirmed("srv-1".into()));
        assert_eq!(vm.entries()[0].client_ref, Some(out.client_ref));
    }

    #[test]
    fn test_send_acked_during_load_is_not_doubled() {
        let mut vm = vm();
        vm.begin_load();
        let out = vm.compose_text("hi", Utc::now()).unwrap();
        let mut canonical = server_msg("srv-1", "me", "peer", "hi");
        canonical.created_at = out.created_at;
        vm.on_ack(&MessageAck {
            client_ref: out.client_ref,
            message: canonical.clone(),
        });
        let pending = vm.compose_text("still going", Utc::now()).unwrap();

        vm.finish_load(vec![server_msg("0", "peer", "me", "before"), canonical]);

        let ids: Vec<_> = vm.entries().iter().map(|e| e.id().cloned()).collect();
        assert_eq!(ids, [Some(MessageId::from("0")), Some(MessageId::from("srv-1")), None]);
        assert!(vm.has_pending(pending.client_ref));
    }

    #[test]
    fn test_reload_does_not_append_old_confirmed_sends() {
        let mut vm = vm();
        let out = vm.compose_text("ancient", Utc::now() - chrono::Duration::hours(2)).unwrap();
        let mut canonical = server_msg("old", "me", "peer", "ancient");
        canonical.created_at = out.created_at;
        vm.on_ack(&MessageAck {
            client_ref: out.client_ref,
            message: canonical,
        });

        // reopened with a page that starts after the old send
        vm.begin_load();
        vm.finish_load(vec![server_msg("new", "peer", "me", "recent")]);

        assert_eq!(vm.entries().len(), 1);
        assert_eq!(vm.entries()[0].id(), Some(&MessageId::from("new")));
    }

    #[test]
    fn test_arrival_order_is_kept() {
        let mut vm = vm();
        let mut late = server_msg("b", "peer", "me", "written first");
        late.created_at = Utc::now() - chrono::Duration::minutes(5);
        vm.on_receive(server_msg("a", "peer", "me", "written second"));
        vm.on_receive(late);

        assert_eq!(vm.entries()[1].id(), Some(&MessageId::from("b")));
    }

    #[test]
    fn test_seen_flips_only_my_messages() {
        let mut vm = vm();
        vm.finish_load(vec![
            server_msg("1", "me", "peer", "mine"),
            server_msg("2", "peer", "me", "theirs"),
        ]);

        assert_eq!(vm.on_seen(&"someone-else".into()), 0);
        assert_eq!(vm.on_seen(&"peer".into()), 1);
        assert_eq!(vm.on_seen(&"peer".into()), 0);

        assert!(vm.entries()[0].seen);
        assert!(!vm.entries()[1].seen);
    }

    #[test]
    fn test_delete_scopes() {
        let mut vm = vm();
        vm.finish_load(vec![
            server_msg("1", "me", "peer", "keep"),
            server_msg("2", "me", "peer", "gone"),
        ]);

        assert!(vm.on_message_deleted(&MessageDeleted {
            message_id: "1".into(),
            scope: DeleteScope::ForAll,
            user_id: "peer".into(),
        }));
        let redacted = &vm.entries()[0];
        assert!(redacted.deleted);
        assert_eq!(redacted.content.text.as_deref(), Some(REDACTED_TEXT));
        assert!(redacted.content.file_url.is_none());

        assert!(!vm.on_message_deleted(&MessageDeleted {
            message_id: "2".into(),
            scope: DeleteScope::ForMe,
            user_id: "peer".into(),
        }));
        assert!(vm.on_message_deleted(&MessageDeleted {
            message_id: "2".into(),
            scope: DeleteScope::ForMe,
            user_id: "me".into(),
        }));
        assert_eq!(vm.entries().len(), 1);
    }

    #[test]
    fn test_file_send_confirmation() {
        let mut vm = vm();
        let client_ref = vm.compose_file("image/png", Some("look"), Utc::now());
        assert!(vm.last().unwrap().content.file_url.is_none());

        // no URL to resend, the upload has to be repeated
        vm.on_failed(client_ref, "upload interrupted");
        assert!(vm.retry(client_ref).is_none());

        let mut canonical = server_msg("f1", "me", "peer", "look");
        canonical.content.file_url = Some("http://chat.test/attachments/x".into());
        canonical.content.file_type = Some("image/png".into());
        assert!(vm.confirm(client_ref, canonical));
        assert!(vm.last().unwrap().content.file_url.is_some());
        assert!(!vm.last().unwrap().is_local());
    }
}
