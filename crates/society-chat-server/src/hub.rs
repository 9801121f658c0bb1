use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

use society_chat_shared::{ConnectionId, ServerEvent, UserId};

/// Sender half of a connection's outbound queue. The socket writer task owns
/// the receiver.
pub type ConnectionSender = mpsc::Sender<ServerEvent>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BindError {
    #[error("unknown connection")]
    UnknownConnection,
    #[error("connection already registered for another user")]
    AlreadyBound,
}

struct Session {
    user: Option<UserId>,
    tx: ConnectionSender,
}

#[derive(Default)]
struct HubInner {
    sessions: HashMap<ConnectionId, Session>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

/// Live connections and the users they belong to. Fan-out never blocks: a
/// full queue drops the frame for that connection only.
#[derive(Clone, Default)]
pub struct ConnectionHub {
    inner: Arc<RwLock<HubInner>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection that has not sent `setup` yet.
    pub async fn register(&self, conn: ConnectionId, tx: ConnectionSender) {
        self.inner
            .write()
            .await
            .sessions
            .insert(conn, Session { user: None, tx });
        debug!(conn = %conn, "Connection registered");
    }

    /// Attach a user to a connection. Rebinding to the same user is a no-op.
    /// Returns `true` when the binding is new.
    pub async fn bind(&self, conn: ConnectionId, user: &UserId) -> Result<bool, BindError> {
        let mut inner = self.inner.write().await;
        let session = inner
            .sessions
            .get_mut(&conn)
            .ok_or(BindError::UnknownConnection)?;

        match &session.user {
            Some(existing) if existing == user => return Ok(false),
            Some(_) => return Err(BindError::AlreadyBound),
            None => session.user = Some(user.clone()),
        }

        inner.by_user.entry(user.clone()).or_default().insert(conn);
        info!(conn = %conn, user = %user.short(), "Connection bound to user");
        Ok(true)
    }

    /// Remove a connection, returning the user it was bound to.
    pub async fn unregister(&self, conn: ConnectionId) -> Option<UserId> {
        let mut inner = self.inner.write().await;
        let session = inner.sessions.remove(&conn)?;
        let user = session.user?;

        if let Some(conns) = inner.by_user.get_mut(&user) {
            conns.remove(&conn);
            if conns.is_empty() {
                inner.by_user.remove(&user);
            }
        }
        debug!(conn = %conn, user = %user.short(), "Connection unregistered");
        Some(user)
    }

    pub async fn user_of(&self, conn: ConnectionId) -> Option<UserId> {
        self.inner
            .read()
            .await
            .sessions
            .get(&conn)
            .and_then(|s| s.user.clone())
    }

    pub async fn send_to_connection(&self, conn: ConnectionId, event: ServerEvent) -> bool {
        let inner = self.inner.read().await;
        match inner.sessions.get(&conn) {
            Some(session) => deliver(conn, &session.tx, event),
            None => false,
        }
    }

    /// Deliver to every connection of `user`, optionally skipping one.
    /// Returns how many connections accepted the frame.
    pub async fn send_to_user(
        &self,
        user: &UserId,
        event: &ServerEvent,
        except: Option<ConnectionId>,
    ) -> usize {
        let inner = self.inner.read().await;
        let Some(conns) = inner.by_user.get(user) else {
            return 0;
        };

        conns
            .iter()
            .filter(|conn| Some(**conn) != except)
            .filter_map(|conn| inner.sessions.get(conn).map(|s| (*conn, s)))
            .filter(|(conn, session)| deliver(*conn, &session.tx, event.clone()))
            .count()
    }

    /// Deliver to every bound connection except those of `skip_user`.
    pub async fn broadcast(&self, event: &ServerEvent, skip_user: Option<&UserId>) -> usize {
        let inner = self.inner.read().await;
        inner
            .sessions
            .iter()
            .filter(|(_, s)| match (&s.user, skip_user) {
                (None, _) => false,
                (Some(u), Some(skip)) => u != skip,
                (Some(_), None) => true,
            })
            .filter(|(conn, session)| deliver(**conn, &session.tx, event.clone()))
            .count()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }
}

fn deliver(conn: ConnectionId, tx: &ConnectionSender, event: ServerEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(event)) => {
            debug!(conn = %conn, event = event.name(), "Dropping frame for slow connection");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}
