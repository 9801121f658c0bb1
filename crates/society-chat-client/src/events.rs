//! Subscription registry for inbound server events.
//!
//! Handlers are keyed by `(event kind, subscriber key)`. Registering the same
//! key again replaces the earlier handler, so a view that re-subscribes on
//! every render never receives an event twice.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::debug;

use society_chat_shared::ServerEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ReceiveMessage,
    MessageAck,
    MessageFailed,
    MessagesSeen,
    UserStatus,
    OnlineStatus,
    DeletedForMe,
    DeletedForAll,
    MessageDeleted,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::ReceiveMessage,
        EventKind::MessageAck,
        EventKind::MessageFailed,
        EventKind::MessagesSeen,
        EventKind::UserStatus,
        EventKind::OnlineStatus,
        EventKind::DeletedForMe,
        EventKind::DeletedForAll,
        EventKind::MessageDeleted,
        EventKind::Error,
    ];

    pub fn of(event: &ServerEvent) -> Self {
        match event {
            ServerEvent::ReceiveMessage(_) => EventKind::ReceiveMessage,
            ServerEvent::MessageAck(_) => EventKind::MessageAck,
            ServerEvent::MessageFailed(_) => EventKind::MessageFailed,
            ServerEvent::MessagesSeen(_) => EventKind::MessagesSeen,
            ServerEvent::UserStatus(_) => EventKind::UserStatus,
            ServerEvent::OnlineStatus(_) => EventKind::OnlineStatus,
            ServerEvent::DeletedForMe(_) => EventKind::DeletedForMe,
            ServerEvent::DeletedForAll(_) => EventKind::DeletedForAll,
            ServerEvent::MessageDeleted(_) => EventKind::MessageDeleted,
            ServerEvent::Error(_) => EventKind::Error,
        }
    }
}

pub type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

type Key = (EventKind, String);

struct Slot {
    generation: u64,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    slots: HashMap<Key, Slot>,
    next_generation: u64,
}

#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` for `kind` under `key`, replacing any handler the
    /// same key held. Dropping the returned [`Subscription`] deregisters it.
    pub fn subscribe<F>(&self, kind: EventKind, key: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        let key = (kind, key.into());
        let mut registry = self.lock();
        let generation = registry.next_generation;
        registry.next_generation += 1;

        let replaced = registry
            .slots
            .insert(
                key.clone(),
                Slot {
                    generation,
                    handler: Arc::new(handler),
                },
            )
            .is_some();
        if replaced {
            debug!(kind = ?key.0, key = %key.1, "Handler replaced");
        }

        Subscription {
            registry: Arc::downgrade(&self.registry),
            key: Some(key),
            generation,
        }
    }

    pub fn unsubscribe(&self, kind: EventKind, key: &str) -> bool {
        self.lock().slots.remove(&(kind, key.to_string())).is_some()
    }

    /// Drop every handler. Called when the connection they belong to ends.
    pub fn clear(&self) {
        let mut registry = self.lock();
        if !registry.slots.is_empty() {
            debug!(handlers = registry.slots.len(), "Clearing event handlers");
        }
        registry.slots.clear();
    }

    /// Run every handler registered for the event's kind. Handlers run
    /// outside the registry lock, so they may subscribe or unsubscribe.
    pub fn dispatch(&self, event: &ServerEvent) -> usize {
        let kind = EventKind::of(event);
        let handlers: Vec<Handler> = self
            .lock()
            .slots
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, slot)| slot.handler.clone())
            .collect();

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keeps a handler registered until dropped. A subscription whose handler was
/// replaced under the same key does not remove the replacement.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    key: Option<Key>,
    generation: u64,
}

impl Subscription {
    /// Leave the handler registered for the lifetime of the bus.
    pub fn detach(mut self) {
        self.key = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let (Some(key), Some(registry)) = (self.key.take(), self.registry.upgrade()) else {
            return;
        };
        let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
        if registry
            .slots
            .get(&key)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            registry.slots.remove(&key);
        }
    }
}
