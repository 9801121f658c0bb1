//! Presence registry: which users currently hold at least one live
//! connection, and when each one was last seen.
//!
//! Online-ness is derived from the connection set, never stored on its own.
//! Only the 0 -> 1 and 1 -> 0 edges of that set produce a transition, so
//! several tabs connecting or dropping together yield a single broadcast.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use society_chat_shared::{ConnectionId, PresenceSnapshot, UserId, UserStatus};

#[derive(Debug, Clone, Default)]
struct PresenceRecord {
    connections: HashSet<ConnectionId>,
    last_seen_at: Option<DateTime<Utc>>,
}

impl PresenceRecord {
    fn is_online(&self) -> bool {
        !self.connections.is_empty()
    }

    fn snapshot(&self) -> PresenceSnapshot {
        PresenceSnapshot {
            is_online: self.is_online(),
            last_seen: self.last_seen_at,
        }
    }
}

#[derive(Clone, Default)]
pub struct PresenceRegistry {
    records: Arc<RwLock<HashMap<UserId, PresenceRecord>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection. Returns the status to broadcast when this is
    /// the user's first live connection.
    pub async fn on_connect(&self, user: &UserId, conn: ConnectionId) -> Option<UserStatus> {
        let mut records = self.records.write().await;
        let record = records.entry(user.clone()).or_default();

        let was_online = record.is_online();
        record.connections.insert(conn);

        debug!(
            user = %user.short(),
            conn = %conn,
            connections = record.connections.len(),
            "Presence: connection added"
        );

        if was_online {
            return None;
        }

        Some(UserStatus {
            user_id: user.clone(),
            is_online: true,
            last_seen: record.last_seen_at,
        })
    }

    /// Forget a connection. Returns the offline status to broadcast when the
    /// user's last connection went away. Unknown connections are ignored, so
    /// duplicate or late disconnects never count below zero.
    pub async fn on_disconnect(&self, user: &UserId, conn: ConnectionId) -> Option<UserStatus> {
        self.on_disconnect_at(user, conn, Utc::now()).await
    }

    async fn on_disconnect_at(
        &self,
        user: &UserId,
        conn: ConnectionId,
        now: DateTime<Utc>,
    ) -> Option<UserStatus> {
        let mut records = self.records.write().await;
        let record = records.get_mut(user)?;

        if !record.connections.remove(&conn) {
            return None;
        }

        debug!(
            user = %user.short(),
            conn = %conn,
            connections = record.connections.len(),
            "Presence: connection removed"
        );

        if record.is_online() {
            return None;
        }

        // last seen only moves forward
        let stamped = match record.last_seen_at {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        record.last_seen_at = Some(stamped);

        Some(UserStatus {
            user_id: user.clone(),
            is_online: false,
            last_seen: Some(stamped),
        })
    }

    pub async fn snapshot(&self) -> BTreeMap<UserId, PresenceSnapshot> {
        self.records
            .read()
            .await
            .iter()
            .map(|(user, record)| (user.clone(), record.snapshot()))
            .collect()
    }

    pub async fn get(&self, user: &UserId) -> PresenceSnapshot {
        self.records
            .read()
            .await
            .get(user)
            .map(PresenceRecord::snapshot)
            .unwrap_or(PresenceSnapshot {
                is_online: false,
                last_seen: None,
            })
    }

    pub async fn connection_count(&self, user: &UserId) -> usize {
        self.records
            .read()
            .await
            .get(user)
            .map(|r| r.connections.len())
            .unwrap_or(0)
    }

    pub async fn online_count(&self) -> usize {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.is_online())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[tokio::test]
    async fn test_first_connection_goes_online_once() {
        let registry = PresenceRegistry::new();
        let user = UserId::from("u1");

        let first = registry.on_connect(&user, ConnectionId::new()).await;
        assert!(matches!(first, Some(UserStatus { is_online: true, .. })));

        let second = registry.on_connect(&user, ConnectionId::new()).await;
        assert!(second.is_none());
        assert_eq!(registry.connection_count(&user).await, 2);
    }

    #[tokio::test]
    async fn test_last_connection_goes_offline_once() {
        let registry = PresenceRegistry::new();
        let user = UserId::from("u1");
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        let connected_at = Utc::now();

        registry.on_connect(&user, a).await;
        registry.on_connect(&user, b).await;

        assert!(registry.on_disconnect(&user, a).await.is_none());
        let offline = registry.on_disconnect(&user, b).await.unwrap();
        assert!(!offline.is_online);
        assert!(offline.last_seen.unwrap() >= connected_at);

        // a late duplicate disconnect neither underflows nor re-broadcasts
        assert!(registry.on_disconnect(&user, b).await.is_none());
        assert_eq!(registry.connection_count(&user).await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_disconnects_emit_one_offline() {
        let registry = PresenceRegistry::new();
        let user = UserId::from("u1");
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        registry.on_connect(&user, a).await;
        registry.on_connect(&user, b).await;

        let (ra, rb) = tokio::join!(
            registry.on_disconnect(&user, a),
            registry.on_disconnect(&user, b)
        );
        let offline = [ra, rb].into_iter().flatten().count();
        assert_eq!(offline, 1);
    }

    #[tokio::test]
    async fn test_last_seen_is_monotonic() {
        let registry = PresenceRegistry::new();
        let user = UserId::from("u1");
        let later = Utc::now() + Duration::hours(1);

        let a = ConnectionId::new();
        registry.on_connect(&user, a).await;
        registry.on_disconnect_at(&user, a, later).await;

        let b = ConnectionId::new();
        registry.on_connect(&user, b).await;
        let status = registry
            .on_disconnect_at(&user, b, later - Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(status.last_seen, Some(later));
    }

    #[tokio::test]
    async fn test_snapshot_keeps_offline_users() {
        let registry = PresenceRegistry::new();
        let a = ConnectionId::new();
        registry.on_connect(&"u1".into(), a).await;
        registry.on_connect(&"u2".into(), ConnectionId::new()).await;
        registry.on_disconnect(&"u1".into(), a).await;

        let snapshot = registry.snapshot().await;
        assert!(!snapshot[&UserId::from("u1")].is_online);
        assert!(snapshot[&UserId::from("u1")].last_seen.is_some());
        assert!(snapshot[&UserId::from("u2")].is_online);
        assert_eq!(registry.online_count().await, 1);
        assert!(!registry.get(&"nobody".into()).await.is_online);
    }
}
