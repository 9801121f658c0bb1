//! Message relay.
//!
//! Every operation follows the same order: validate, write to the store,
//! then fan out over the hub. A message is therefore never pushed live
//! before it has a server-assigned id, and the sender learns that id from a
//! single `message ack` on the connection it sent from.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use society_chat_shared::{
    ChatMessage, ConnectionId, DeleteRequest, DeleteScope, DeletedMessage, MarkAsSeen,
    MessageAck, MessageDeleted, MessageFailed, MessagesSeen, OutgoingMessage, PresenceScope,
    PresenceSnapshot, ServerEvent, UserId, UserStatus,
};
use society_chat_store::{Database, NewMessage};

use crate::attachments::AttachmentStore;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::hub::{BindError, ConnectionHub};
use crate::presence::PresenceRegistry;
use crate::rate_limit::RateLimiter;

#[derive(Clone)]
pub struct Relay {
    db: Arc<Mutex<Database>>,
    hub: ConnectionHub,
    presence: PresenceRegistry,
    attachments: Arc<AttachmentStore>,
    scope: PresenceScope,
    event_limiter: RateLimiter<UserId>,
}

impl Relay {
    pub fn new(db: Database, attachments: Arc<AttachmentStore>, config: &ServerConfig) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            hub: ConnectionHub::new(),
            presence: PresenceRegistry::new(),
            attachments,
            scope: config.presence_scope,
            event_limiter: RateLimiter::new(config.event_rate, config.event_burst),
        }
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn attachments(&self) -> &AttachmentStore {
        &self.attachments
    }

    /// Token-bucket check for inbound socket events.
    pub async fn allow_event(&self, user: &UserId) -> bool {
        self.event_limiter.check(user.clone()).await
    }

    pub async fn purge_rate_limits(&self, max_idle_secs: f64) -> usize {
        self.event_limiter.purge_stale(max_idle_secs).await
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// `setup`: bind the connection to `user`, mark them online, and hand the
    /// connection the full presence table.
    pub async fn setup(&self, conn: ConnectionId, user: &UserId) -> Result<(), ServerError> {
        if user.as_str().trim().is_empty() {
            return Err(ServerError::BadRequest("setup requires a user id".into()));
        }

        let newly_bound = self.hub.bind(conn, user).await.map_err(|e| match e {
            BindError::AlreadyBound => {
                ServerError::Forbidden("connection already set up for another user".into())
            }
            BindError::UnknownConnection => ServerError::Internal(e.to_string()),
        })?;

        if newly_bound {
            if let Some(status) = self.presence.on_connect(user, conn).await {
                info!(user = %user.short(), "User online");
                self.broadcast_presence(status).await;
            }
        }

        self.online_status(conn).await;
        Ok(())
    }

    /// Transport closed. Safe to call more than once.
    pub async fn disconnect(&self, conn: ConnectionId) {
        let Some(user) = self.hub.unregister(conn).await else {
            return;
        };
        match self.presence.on_disconnect(&user, conn).await {
            Some(status) => {
                info!(user = %user.short(), "User offline");
                self.broadcast_presence(status).await;
            }
            None => {
                let remaining = self.presence.connection_count(&user).await;
                debug!(
                    user = %user.short(),
                    remaining = remaining,
                    "Connection closed, user still online"
                )
            }
        }
    }

    /// `online status`: push the presence table the connection's user may see.
    pub async fn online_status(&self, conn: ConnectionId) {
        let viewer = self.hub.user_of(conn).await;
        let snapshot = match self.presence_for(viewer.as_ref()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(conn = %conn, error = %e, "Could not build presence snapshot");
                BTreeMap::new()
            }
        };
        self.hub
            .send_to_connection(conn, ServerEvent::OnlineStatus(snapshot))
            .await;
    }

    /// Presence table as `viewer` may see it. With conversation scope that is
    /// the viewer plus everyone they share a conversation with, and nobody
    /// at all for an anonymous viewer.
    pub async fn presence_for(
        &self,
        viewer: Option<&UserId>,
    ) -> Result<BTreeMap<UserId, PresenceSnapshot>, ServerError> {
        let viewer = match (self.scope, viewer) {
            (PresenceScope::Everyone, _) => return Ok(self.presence.snapshot().await),
            (PresenceScope::Conversations, None) => return Ok(BTreeMap::new()),
            (PresenceScope::Conversations, Some(viewer)) => viewer,
        };

        let partners = {
            let db = self.db.lock().await;
            db.conversation_partners(viewer)?
        };
        let mut table = BTreeMap::new();
        for user in partners.into_iter().chain(std::iter::once(viewer.clone())) {
            let snapshot = self.presence.get(&user).await;
            table.insert(user, snapshot);
        }
        Ok(table)
    }

    async fn broadcast_presence(&self, status: UserStatus) {
        let subject = status.user_id.clone();
        let event = ServerEvent::UserStatus(status);

        let delivered = match self.scope {
            PresenceScope::Everyone => self.hub.broadcast(&event, Some(&subject)).await,
            PresenceScope::Conversations => {
                let partners = {
                    let db = self.db.lock().await;
                    db.conversation_partners(&subject)
                };
                match partners {
                    Ok(partners) => {
                        let mut delivered = 0;
                        for partner in &partners {
                            delivered += self.hub.send_to_user(partner, &event, None).await;
                        }
                        delivered
                    }
                    Err(e) => {
                        warn!(user = %subject.short(), error = %e, "Could not load presence audience");
                        0
                    }
                }
            }
        };

        debug!(user = %subject.short(), delivered, "Presence broadcast");
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// `send message` from a live connection. Failures are reported to the
    /// originating connection as `message failed`; the socket stays open.
    pub async fn send_message(
        &self,
        conn: ConnectionId,
        user: &UserId,
        message: OutgoingMessage,
    ) -> Option<ChatMessage> {
        let client_ref = message.client_ref;

        if &message.sender != user {
            warn!(user = %user.short(), claimed = %message.sender.short(), "Sender mismatch");
            self.fail(conn, client_ref, "sender does not match this session")
                .await;
            return None;
        }
        if let Err(e) = message.validate() {
            self.fail(conn, client_ref, &e.to_string()).await;
            return None;
        }

        match self.submit(NewMessage::from(message)).await {
            Ok(stored) => {
                self.hub
                    .send_to_connection(
                        conn,
                        ServerEvent::MessageAck(MessageAck {
                            client_ref,
                            message: stored.clone(),
                        }),
                    )
                    .await;
                Some(stored)
            }
            Err(e) => {
                warn!(client_ref = %client_ref, error = %e, "Message not stored");
                self.fail(conn, client_ref, &e.to_string()).await;
                None
            }
        }
    }

    /// Persist then push live to the receiver. Shared by the socket and the
    /// REST submission endpoints.
    pub async fn submit(&self, draft: NewMessage) -> Result<ChatMessage, ServerError> {
        let stored = {
            let db = self.db.lock().await;
            db.insert_message(&draft)?
        };

        let delivered = self
            .hub
            .send_to_user(
                &stored.receiver,
                &ServerEvent::ReceiveMessage(stored.clone()),
                None,
            )
            .await;

        if delivered == 0 {
            debug!(id = %stored.id, receiver = %stored.receiver.short(), "Receiver offline, left for history fetch");
        } else {
            debug!(id = %stored.id, delivered, "Message relayed");
        }

        Ok(stored)
    }

    async fn fail(&self, conn: ConnectionId, client_ref: society_chat_shared::ClientRef, reason: &str) {
        self.hub
            .send_to_connection(
                conn,
                ServerEvent::MessageFailed(MessageFailed {
                    client_ref,
                    reason: reason.to_string(),
                }),
            )
            .await;
    }

    pub async fn history(
        &self,
        user: &UserId,
        peer: &UserId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ChatMessage>, ServerError> {
        let db = self.db.lock().await;
        Ok(db.conversation_history(user, peer, limit, offset)?)
    }

    // -----------------------------------------------------------------------
    // Seen receipts
    // -----------------------------------------------------------------------

    /// `mark as seen`: flag everything the peer sent to `user` as seen and
    /// tell the peer. Repeating it changes nothing further.
    pub async fn mark_as_seen(&self, user: &UserId, req: MarkAsSeen) -> Result<usize, ServerError> {
        if &req.user_id != user {
            return Err(ServerError::Forbidden(
                "cannot mark messages seen for another user".into(),
            ));
        }

        let changed = {
            let db = self.db.lock().await;
            db.mark_conversation_seen(&req.user_id, &req.peer_id)?
        };

        let event = ServerEvent::MessagesSeen(MessagesSeen {
            from: req.user_id.clone(),
        });
        let delivered = self.hub.send_to_user(&req.peer_id, &event, None).await;

        debug!(
            reader = %req.user_id.short(),
            sender = %req.peer_id.short(),
            changed,
            delivered,
            "Seen receipt"
        );
        Ok(changed)
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    /// `for me` hides the message from the requester and syncs their other
    /// sessions. `for all` (sender only) redacts it for both participants.
    pub async fn delete_message(
        &self,
        conn: ConnectionId,
        user: &UserId,
        req: DeleteRequest,
    ) -> Result<(), ServerError> {
        let message = {
            let db = self.db.lock().await;
            db.get_message(&req.message_id)?
        };
        if !message.involves(user) {
            return Err(ServerError::NotFound("message".into()));
        }

        let peer = message.peer_of(user).clone();
        if peer != req.peer_id {
            debug!(message = %req.message_id, claimed = %req.peer_id.short(), "Delete request peer differs from stored peer");
        }

        let deleted = DeletedMessage {
            message_id: req.message_id.clone(),
        };

        match req.scope {
            DeleteScope::ForMe => {
                {
                    let db = self.db.lock().await;
                    db.hide_message_for(user, &req.message_id)?;
                }
                self.hub
                    .send_to_user(user, &ServerEvent::DeletedForMe(deleted), Some(conn))
                    .await;
            }
            DeleteScope::ForAll => {
                if &message.sender != user {
                    return Err(ServerError::Forbidden(
                        "only the sender can delete a message for everyone".into(),
                    ));
                }
                {
                    let db = self.db.lock().await;
                    db.redact_message(&req.message_id)?;
                }
                self.remove_attachment(&message).await;

                let for_all = ServerEvent::DeletedForAll(deleted);
                self.hub.send_to_user(&peer, &for_all, None).await;
                self.hub
                    .send_to_user(
                        &peer,
                        &ServerEvent::MessageDeleted(MessageDeleted {
                            message_id: req.message_id.clone(),
                            scope: DeleteScope::ForAll,
                            user_id: user.clone(),
                        }),
                        None,
                    )
                    .await;
                self.hub.send_to_user(user, &for_all, Some(conn)).await;
            }
        }

        info!(message = %req.message_id, scope = req.scope.as_str(), user = %user.short(), "Message deleted");
        Ok(())
    }

    async fn remove_attachment(&self, message: &ChatMessage) {
        let Some(id) = message
            .content
            .file_url
            .as_deref()
            .and_then(|url| self.attachments.id_from_url(url))
        else {
            return;
        };
        if let Err(e) = self.attachments.delete(id).await {
            debug!(attachment = %id, error = %e, "Attachment already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use society_chat_shared::{ClientRef, MessageContent, SocietyId};

    use super::*;

    struct Harness {
        relay: Relay,
        _dir: TempDir,
    }

    async fn harness(scope: PresenceScope) -> Harness {
        let dir = TempDir::new().unwrap();
        let attachments = AttachmentStore::new(dir.path().to_path_buf(), 1024, "http://chat.test")
            .await
            .unwrap();
        let config = ServerConfig {
            presence_scope: scope,
            ..ServerConfig::default()
        };
        let relay = Relay::new(Database::open_in_memory().unwrap(), Arc::new(attachments), &config);
        Harness { relay, _dir: dir }
    }

    async fn join(relay: &Relay, user: &str) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let conn = ConnectionId::new();
        let (tx, rx) = mpsc::channel(64);
        relay.hub().register(conn, tx).await;
        relay.setup(conn, &user.into()).await.unwrap();
        (conn, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn outgoing(from: &str, to: &str, text: &str) -> OutgoingMessage {
        OutgoingMessage {
            client_ref: ClientRef::new(),
            sender: from.into(),
            receiver: to.into(),
            society_id: SocietyId::new("s1"),
            content: MessageContent::text(text),
            created_at: Utc::now(),
        }
    }

    fn statuses(events: &[ServerEvent]) -> Vec<&UserStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::UserStatus(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_setup_sends_snapshot_and_broadcasts_online() {
        let h = harness(PresenceScope::Everyone).await;
        let (_b, mut rx_b) = join(&h.relay, "u2").await;
        drain(&mut rx_b);

        let (_a, mut rx_a) = join(&h.relay, "u1").await;

        let own = drain(&mut rx_a);
        match &own[..] {
            [ServerEvent::OnlineStatus(table)] => {
                assert!(table[&UserId::from("u1")].is_online);
                assert!(table[&UserId::from("u2")].is_online);
            }
            other => panic!("unexpected events: {other:?}"),
        }

        let seen_by_b = drain(&mut rx_b);
        let online = statuses(&seen_by_b);
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].user_id, UserId::from("u1"));
        assert!(online[0].is_online);
    }

    #[tokio::test]
    async fn test_second_tab_does_not_rebroadcast() {
        let h = harness(PresenceScope::Everyone).await;
        let (_b, mut rx_b) = join(&h.relay, "u2").await;
        join(&h.relay, "u1").await;
        join(&h.relay, "u1").await;

        assert_eq!(statuses(&drain(&mut rx_b)).len(), 1);
    }

    #[tokio::test]
    async fn test_two_tabs_dropping_emit_one_offline() {
        let h = harness(PresenceScope::Everyone).await;
        let (_b, mut rx_b) = join(&h.relay, "u2").await;
        let (a1, _rx1) = join(&h.relay, "u1").await;
        let (a2, _rx2) = join(&h.relay, "u1").await;
        drain(&mut rx_b);

        tokio::join!(h.relay.disconnect(a1), h.relay.disconnect(a2));
        h.relay.disconnect(a1).await;

        let offline: Vec<_> = drain(&mut rx_b)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::UserStatus(s) if !s.is_online))
            .collect();
        assert_eq!(offline.len(), 1);
        assert_eq!(h.relay.presence().connection_count(&"u1".into()).await, 0);
    }

    #[tokio::test]
    async fn test_rebinding_to_other_user_is_rejected() {
        let h = harness(PresenceScope::Everyone).await;
        let (conn, _rx) = join(&h.relay, "u1").await;
        assert!(h.relay.setup(conn, &"u1".into()).await.is_ok());
        assert!(matches!(
            h.relay.setup(conn, &"u2".into()).await,
            Err(ServerError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_send_persists_pushes_and_acks() {
        let h = harness(PresenceScope::Everyone).await;
        let (a, mut rx_a) = join(&h.relay, "u1").await;
        let (_b, mut rx_b) = join(&h.relay, "u2").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        let msg = outgoing("u1", "u2", "hi");
        let client_ref = msg.client_ref;
        let stored = h.relay.send_message(a, &"u1".into(), msg).await.unwrap();

        match &drain(&mut rx_b)[..] {
            [ServerEvent::ReceiveMessage(m)] => {
                assert_eq!(m.sender, UserId::from("u1"));
                assert_eq!(m.id, stored.id);
            }
            other => panic!("unexpected events: {other:?}"),
        }
        match &drain(&mut rx_a)[..] {
            [ServerEvent::MessageAck(ack)] => {
                assert_eq!(ack.client_ref, client_ref);
                assert_eq!(ack.message.id, stored.id);
            }
            other => panic!("unexpected events: {other:?}"),
        }

        let history = h.relay.history(&"u2".into(), &"u1".into(), 50, 0).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_send_to_offline_receiver_is_quiet() {
        let h = harness(PresenceScope::Everyone).await;
        let (a, mut rx_a) = join(&h.relay, "u1").await;
        drain(&mut rx_a);

        let stored = h
            .relay
            .send_message(a, &"u1".into(), outgoing("u1", "u2", "hi"))
            .await;
        assert!(stored.is_some());

        let events = drain(&mut rx_a);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ServerEvent::MessageAck(_)));
    }

    #[tokio::test]
    async fn test_invalid_send_reports_failure() {
        let h = harness(PresenceScope::Everyone).await;
        let (a, mut rx_a) = join(&h.relay, "u1").await;
        drain(&mut rx_a);

        assert!(h
            .relay
            .send_message(a, &"u1".into(), outgoing("u1", "u2", " "))
            .await
            .is_none());
        assert!(h
            .relay
            .send_message(a, &"u1".into(), outgoing("u3", "u2", "spoof"))
            .await
            .is_none());

        let failures = drain(&mut rx_a)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::MessageFailed(_)))
            .count();
        assert_eq!(failures, 2);
    }

    #[tokio::test]
    async fn test_mark_as_seen_is_idempotent() {
        let h = harness(PresenceScope::Everyone).await;
        let (a, mut rx_a) = join(&h.relay, "u1").await;
        let (b, mut rx_b) = join(&h.relay, "u2").await;

        h.relay.send_message(a, &"u1".into(), outgoing("u1", "u2", "one")).await;
        h.relay.send_message(a, &"u1".into(), outgoing("u1", "u2", "two")).await;
        h.relay.send_message(b, &"u2".into(), outgoing("u2", "u1", "reply")).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        let req = MarkAsSeen {
            user_id: "u2".into(),
            peer_id: "u1".into(),
        };
        assert_eq!(h.relay.mark_as_seen(&"u2".into(), req.clone()).await.unwrap(), 2);
        assert_eq!(h.relay.mark_as_seen(&"u2".into(), req).await.unwrap(), 0);

        let receipts: Vec<_> = drain(&mut rx_a)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::MessagesSeen(s) if s.from == UserId::from("u2")))
            .collect();
        assert_eq!(receipts.len(), 2);

        let history = h.relay.history(&"u1".into(), &"u2".into(), 50, 0).await.unwrap();
        for m in history {
            assert_eq!(m.seen, m.sender == UserId::from("u1"));
        }
    }

    #[tokio::test]
    async fn test_mark_as_seen_for_someone_else_is_rejected() {
        let h = harness(PresenceScope::Everyone).await;
        let req = MarkAsSeen {
            user_id: "u2".into(),
            peer_id: "u1".into(),
        };
        assert!(h.relay.mark_as_seen(&"u3".into(), req).await.is_err());
    }

    #[tokio::test]
    async fn test_delete_for_me_syncs_own_sessions_only() {
        let h = harness(PresenceScope::Everyone).await;
        let (a1, mut rx_a1) = join(&h.relay, "u1").await;
        let (_a2, mut rx_a2) = join(&h.relay, "u1").await;
        let (_b, mut rx_b) = join(&h.relay, "u2").await;

        let stored = h
            .relay
            .send_message(a1, &"u1".into(), outgoing("u1", "u2", "oops"))
            .await
            .unwrap();
        drain(&mut rx_a1);
        drain(&mut rx_a2);
        drain(&mut rx_b);

        h.relay
            .delete_message(
                a1,
                &"u1".into(),
                DeleteRequest {
                    message_id: stored.id.clone(),
                    peer_id: "u2".into(),
                    scope: DeleteScope::ForMe,
                },
            )
            .await
            .unwrap();

        assert!(drain(&mut rx_a1).is_empty());
        assert!(matches!(&drain(&mut rx_a2)[..], [ServerEvent::DeletedForMe(_)]));
        assert!(drain(&mut rx_b).is_empty());
        assert!(h.relay.history(&"u1".into(), &"u2".into(), 50, 0).await.unwrap().is_empty());
        assert_eq!(h.relay.history(&"u2".into(), &"u1".into(), 50, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_for_all_redacts_and_notifies_peer() {
        let h = harness(PresenceScope::Everyone).await;
        let (a, mut rx_a) = join(&h.relay, "u1").await;
        let (b, mut rx_b) = join(&h.relay, "u2").await;

        let stored = h
            .relay
            .send_message(a, &"u1".into(), outgoing("u1", "u2", "secret"))
            .await
            .unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let req = DeleteRequest {
            message_id: stored.id.clone(),
            peer_id: "u1".into(),
            scope: DeleteScope::ForAll,
        };
        assert!(matches!(
            h.relay.delete_message(b, &"u2".into(), req.clone()).await,
            Err(ServerError::Forbidden(_))
        ));

        let req = DeleteRequest {
            peer_id: "u2".into(),
            ..req
        };
        h.relay.delete_message(a, &"u1".into(), req).await.unwrap();

        let to_peer = drain(&mut rx_b);
        assert!(to_peer.iter().any(|e| matches!(e, ServerEvent::DeletedForAll(d) if d.message_id == stored.id)));
        assert!(to_peer.iter().any(|e| matches!(
            e,
            ServerEvent::MessageDeleted(d) if d.scope == DeleteScope::ForAll && d.user_id == UserId::from("u1")
        )));

        let history = h.relay.history(&"u2".into(), &"u1".into(), 50, 0).await.unwrap();
        assert!(history[0].deleted);
    }

    #[tokio::test]
    async fn test_delete_unknown_message() {
        let h = harness(PresenceScope::Everyone).await;
        let (a, _rx) = join(&h.relay, "u1").await;
        let req = DeleteRequest {
            message_id: "nope".into(),
            peer_id: "u2".into(),
            scope: DeleteScope::ForMe,
        };
        assert!(matches!(
            h.relay.delete_message(a, &"u1".into(), req).await,
            Err(ServerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_conversation_scoped_presence() {
        let h = harness(PresenceScope::Conversations).await;
        let (_b, mut rx_b) = join(&h.relay, "u2").await;
        let (_c, mut rx_c) = join(&h.relay, "u3").await;

        h.relay
            .submit(NewMessage::from(outgoing("u2", "u1", "hello")))
            .await
            .unwrap();
        drain(&mut rx_b);
        drain(&mut rx_c);

        join(&h.relay, "u1").await;

        assert_eq!(statuses(&drain(&mut rx_b)).len(), 1);
        assert!(statuses(&drain(&mut rx_c)).is_empty());
    }

    #[tokio::test]
    async fn test_conversation_scoped_snapshot_hides_strangers() {
        let h = harness(PresenceScope::Conversations).await;
        join(&h.relay, "u2").await;
        join(&h.relay, "u3").await;
        h.relay
            .submit(NewMessage::from(outgoing("u1", "u2", "hello")))
            .await
            .unwrap();

        let (_a, mut rx_a) = join(&h.relay, "u1").await;
        match &drain(&mut rx_a)[..] {
            [ServerEvent::OnlineStatus(table)] => {
                let users: Vec<_> = table.keys().map(UserId::as_str).collect();
                assert_eq!(users, vec!["u1", "u2"]);
                assert!(table[&UserId::from("u2")].is_online);
            }
            other => panic!("unexpected events: {other:?}"),
        }

        // a partner who never connected is reported offline, not omitted
        h.relay
            .submit(NewMessage::from(outgoing("u4", "u1", "hi")))
            .await
            .unwrap();
        let table = h.relay.presence_for(Some(&"u1".into())).await.unwrap();
        assert!(!table[&UserId::from("u4")].is_online);
        assert!(h.relay.presence_for(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_everyone_scope_snapshot_is_global() {
        let h = harness(PresenceScope::Everyone).await;
        join(&h.relay, "u2").await;
        let table = h.relay.presence_for(None).await.unwrap();
        assert!(table[&UserId::from("u2")].is_online);
    }
}
