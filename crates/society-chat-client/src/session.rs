//! [`ChatSession`] ties the reconnecting socket, the REST client, the
//! per-peer view models and the seen tracker together for a UI layer.
//!
//! Inbound events are forwarded from the [`EventBus`] into a single pump task
//! that applies them to the session state in arrival order. UI code can
//! subscribe to the same bus under its own keys, or watch [`ChatSession::updates`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use society_chat_shared::{
    ChatMessage, ClientEvent, ClientRef, DeleteRequest, DeleteScope, MessageId, PresenceSnapshot,
    ServerEvent, SocietyId, UserId,
};

use crate::api_client::{ApiClient, Upload};
use crate::config::ClientConfig;
use crate::conversation::ConversationViewModel;
use crate::error::ClientError;
use crate::events::{EventBus, EventKind, Subscription};
use crate::seen::SeenTracker;
use crate::supervisor::{ConnectionState, Supervisor};

const SESSION_KEY: &str = "chat-session";

struct SessionState {
    me: UserId,
    society_id: SocietyId,
    conversations: HashMap<UserId, ConversationViewModel>,
    seen: SeenTracker,
    presence: BTreeMap<UserId, PresenceSnapshot>,
    last_error: Option<String>,
}

impl SessionState {
    fn conversation(&mut self, peer: &UserId) -> &mut ConversationViewModel {
        let (me, society_id) = (&self.me, &self.society_id);
        self.conversations
            .entry(peer.clone())
            .or_insert_with(|| ConversationViewModel::new(me.clone(), peer.clone(), society_id.clone()))
    }

    fn apply(&mut self, event: ServerEvent) -> bool {
        match event {
            ServerEvent::ReceiveMessage(message) => self.receive(message),
            ServerEvent::MessageAck(ack) => {
                let peer = ack.message.peer_of(&self.me).clone();
                let conversation = self.conversation(&peer);
                // acks for sends made from another tab have no pending entry
                conversation.on_ack(&ack) || conversation.on_receive(ack.message)
            }
            ServerEvent::MessageFailed(failed) => self
                .conversations
                .values_mut()
                .find(|c| c.has_pending(failed.client_ref))
                .is_some_and(|c| c.on_failed(failed.client_ref, &failed.reason)),
            ServerEvent::MessagesSeen(seen) => self
                .conversations
                .get_mut(&seen.from)
                .is_some_and(|c| c.on_seen(&seen.from) > 0),
            ServerEvent::UserStatus(status) => {
                self.presence.insert(
                    status.user_id,
                    PresenceSnapshot {
                        is_online: status.is_online,
                        last_seen: status.last_seen,
                    },
                );
                true
            }
            ServerEvent::OnlineStatus(table) => {
                self.presence = table;
                true
            }
            ServerEvent::DeletedForMe(deleted) => self.for_each(|c| c.remove(&deleted.message_id)),
            ServerEvent::DeletedForAll(deleted) => self.for_each(|c| c.redact(&deleted.message_id)),
            ServerEvent::MessageDeleted(event) => self.for_each(|c| c.on_message_deleted(&event)),
            ServerEvent::Error(err) => {
                warn!(error = %err.message, "Relay reported an error");
                self.last_error = Some(err.message);
                true
            }
        }
    }

    fn receive(&mut self, message: ChatMessage) -> bool {
        let peer = message.peer_of(&self.me).clone();
        let added = self.conversation(&peer).on_receive(message);
        if added && self.seen.active() == Some(&peer) {
            self.seen.on_new_last_message();
        }
        added
    }

    fn for_each<F>(&mut self, mut f: F) -> bool
    where
        F: FnMut(&mut ConversationViewModel) -> bool,
    {
        self.conversations
            .values_mut()
            .fold(false, |changed, c| f(c) || changed)
    }
}

pub struct ChatSession {
    me: UserId,
    society_id: SocietyId,
    api: ApiClient,
    bus: EventBus,
    supervisor: Supervisor,
    state: Arc<Mutex<SessionState>>,
    revision: Arc<watch::Sender<u64>>,
    pump: JoinHandle<()>,
    _subscriptions: Vec<Subscription>,
}

impl ChatSession {
    /// Connect as `me` and start applying relay events. Must be called from
    /// within a tokio runtime.
    pub fn start(config: &ClientConfig, me: UserId, society_id: SocietyId) -> Result<Self, ClientError> {
        let api = ApiClient::new(config)?;
        let bus = EventBus::new();

        let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
        let subscriptions = EventKind::ALL
            .iter()
            .map(|kind| {
                let tx = tx.clone();
                bus.subscribe(*kind, SESSION_KEY, move |event| {
                    let _ = tx.send(event.clone());
                })
            })
            .collect();
        drop(tx);

        let state = Arc::new(Mutex::new(SessionState {
            me: me.clone(),
            society_id: society_id.clone(),
            conversations: HashMap::new(),
            seen: SeenTracker::new(me.clone()),
            presence: BTreeMap::new(),
            last_error: None,
        }));
        let (revision, _) = watch::channel(0u64);
        let revision = Arc::new(revision);

        let pump = {
            let state = state.clone();
            let revision = revision.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let name = event.name();
                    if state.lock().await.apply(event) {
                        revision.send_modify(|r| *r += 1);
                    } else {
                        debug!(event = name, "Event changed nothing");
                    }
                }
            })
        };

        let supervisor = Supervisor::spawn(config, me.clone(), bus.clone());

        Ok(Self {
            me,
            society_id,
            api,
            bus,
            supervisor,
            state,
            revision,
            pump,
            _subscriptions: subscriptions,
        })
    }

    pub fn me(&self) -> &UserId {
        &self.me
    }

    pub fn society_id(&self) -> &SocietyId {
        &self.society_id
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.watch_state()
    }

    pub async fn wait_connected(&self) -> bool {
        self.supervisor
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Failed))
            .await
            == Some(ConnectionState::Connected)
    }

    /// Bumped every time session state changes.
    pub fn updates(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn touch(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    fn emit(&self, event: ClientEvent) -> Result<(), ClientError> {
        self.supervisor.send(event)
    }

    // -----------------------------------------------------------------------
    // Conversations
    // -----------------------------------------------------------------------

    /// Open the conversation with `peer`: load history, then mark it seen.
    pub async fn select_peer(&self, peer: &UserId) -> Result<(), ClientError> {
        {
            let mut state = self.state.lock().await;
            state.seen.select(Some(peer.clone()));
            state.conversation(peer).begin_load();
        }
        self.touch();

        let history = self.api.history(&self.me, peer, None, None).await;

        let mark = {
            let mut state = self.state.lock().await;
            match history {
                Ok(messages) => {
                    state.conversation(peer).finish_load(messages);
                    state.seen.on_history_loaded(peer)
                }
                Err(e) => {
                    state.conversation(peer).fail_load();
                    drop(state);
                    self.touch();
                    return Err(e);
                }
            }
        };
        self.touch();

        if let Some(mark) = mark {
            self.emit(ClientEvent::MarkAsSeen(mark))?;
        }
        Ok(())
    }

    pub async fn close_conversation(&self) {
        self.state.lock().await.seen.select(None);
    }

    pub async fn conversation(&self, peer: &UserId) -> Option<ConversationViewModel> {
        self.state.lock().await.conversations.get(peer).cloned()
    }

    pub async fn presence_of(&self, user: &UserId) -> Option<PresenceSnapshot> {
        self.state.lock().await.presence.get(user).cloned()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.lock().await.last_error.clone()
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Append optimistically, then hand the event to the socket.
    pub async fn send_text(&self, peer: &UserId, text: &str) -> Result<ClientRef, ClientError> {
        let outgoing = self
            .state
            .lock()
            .await
            .conversation(peer)
            .compose_text(text, Utc::now())?;
        let client_ref = outgoing.client_ref;
        self.touch();

        if let Err(e) = self.emit(ClientEvent::SendMessage(outgoing)) {
            self.mark_failed(peer, client_ref, &e).await;
            return Err(e);
        }
        Ok(client_ref)
    }

    /// Upload over REST. The optimistic entry is confirmed from the response.
    pub async fn send_file(
        &self,
        peer: &UserId,
        upload: Upload,
        caption: Option<&str>,
    ) -> Result<ChatMessage, ClientError> {
        let client_ref = self.state.lock().await.conversation(peer).compose_file(
            &upload.mime_type,
            caption,
            Utc::now(),
        );
        self.touch();

        let result = self
            .api
            .submit_file(&self.me, peer, &self.society_id, caption, Some(client_ref), upload)
            .await;

        match result {
            Ok(message) => {
                self.state
                    .lock()
                    .await
                    .conversation(peer)
                    .confirm(client_ref, message.clone());
                self.touch();
                Ok(message)
            }
            Err(e) => {
                self.mark_failed(peer, client_ref, &e).await;
                Err(e)
            }
        }
    }

    async fn mark_failed(&self, peer: &UserId, client_ref: ClientRef, error: &ClientError) {
        self.state
            .lock()
            .await
            .conversation(peer)
            .on_failed(client_ref, &error.to_string());
        self.touch();
    }

    pub async fn retry(&self, peer: &UserId, client_ref: ClientRef) -> Result<(), ClientError> {
        let outgoing = self
            .state
            .lock()
            .await
            .conversation(peer)
            .retry(client_ref)
            .ok_or(ClientError::NothingToRetry(client_ref))?;
        self.touch();

        if let Err(e) = self.emit(ClientEvent::SendMessage(outgoing)) {
            self.mark_failed(peer, client_ref, &e).await;
            return Err(e);
        }
        Ok(())
    }

    pub async fn discard(&self, peer: &UserId, client_ref: ClientRef) -> bool {
        let removed = self
            .state
            .lock()
            .await
            .conversations
            .get_mut(peer)
            .is_some_and(|c| c.discard(client_ref));
        if removed {
            self.touch();
        }
        removed
    }

    /// Ask the relay to delete `id` and apply the result locally right away.
    /// Deleting for everyone is refused up front for messages sent by the
    /// peer, since the relay would reject it after the local redaction.
    pub async fn delete_message(
        &self,
        peer: &UserId,
        id: &MessageId,
        scope: DeleteScope,
    ) -> Result<(), ClientError> {
        if scope == DeleteScope::ForAll {
            let state = self.state.lock().await;
            let sender = state
                .conversations
                .get(peer)
                .and_then(|c| c.entry(id))
                .map(|e| e.sender.clone());
            if sender.is_some_and(|sender| sender != self.me) {
                return Err(ClientError::NotSender(id.clone()));
            }
        }

        self.emit(ClientEvent::DeleteMessage(DeleteRequest {
            message_id: id.clone(),
            peer_id: peer.clone(),
            scope,
        }))?;

        let mut state = self.state.lock().await;
        if let Some(conversation) = state.conversations.get_mut(peer) {
            match scope {
                DeleteScope::ForMe => conversation.remove(id),
                DeleteScope::ForAll => conversation.redact(id),
            };
        }
        drop(state);
        self.touch();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Seen triggers and presence
    // -----------------------------------------------------------------------

    pub async fn set_focus(&self, focused: bool) -> Result<(), ClientError> {
        let mark = self.state.lock().await.seen.on_focus(focused);
        match mark {
            Some(mark) => self.emit(ClientEvent::MarkAsSeen(mark)),
            None => Ok(()),
        }
    }

    /// Report how much of the newest message element is on screen.
    pub async fn last_message_visibility(&self, ratio: f64) -> Result<(), ClientError> {
        let mark = self.state.lock().await.seen.on_visibility(ratio);
        match mark {
            Some(mark) => self.emit(ClientEvent::MarkAsSeen(mark)),
            None => Ok(()),
        }
    }

    pub fn request_online_status(&self) -> Result<(), ClientError> {
        self.emit(ClientEvent::RequestOnlineStatus)
    }

    /// Close the socket, drop every handler and stop the event pump.
    pub async fn shutdown(self) {
        self.supervisor.shutdown().await;
        drop(self._subscriptions);
        if let Err(e) = self.pump.await {
            debug!(error = %e, "Event pump ended abnormally");
        }
    }
}
