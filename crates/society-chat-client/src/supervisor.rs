//! Reconnecting wrapper around [`ConnectionManager`].
//!
//! Every successful (re)connect replays `setup`, so presence heals on its own.
//! Sends attempted while the socket is down wait in a bounded outbox and are
//! flushed, oldest first, right after `setup`.

use std::collections::VecDeque;
use std::time::Duration;

use futures::SinkExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use society_chat_shared::{ClientEvent, UserId};

use crate::config::ClientConfig;
use crate::connection::{pump, ConnectionManager, InFlight, PumpExit, WsStream};
use crate::error::ClientError;
use crate::events::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// Waiting before reconnect attempt `n` (1-based).
    Reconnecting(u32),
    Disconnected,
    /// Gave up after the configured number of attempts.
    Failed,
}

/// Exponential backoff with +/-12.5% jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.initial.as_secs_f64() * 2f64.powi(self.attempt.min(30) as i32);
        let capped = base.min(self.max.as_secs_f64());
        let jitter = (rand::random::<f64>() - 0.5) * capped * 0.25;
        self.attempt += 1;
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

/// Bounded FIFO of events waiting for a connection.
#[derive(Debug)]
pub(crate) struct Outbox {
    queue: VecDeque<ClientEvent>,
    capacity: usize,
}

impl Outbox {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub(crate) fn push(&mut self, event: ClientEvent) {
        if self.capacity == 0 {
            warn!(event = event.name(), "Outbox disabled, dropping event");
            return;
        }
        if self.queue.len() >= self.capacity {
            if let Some(dropped) = self.queue.pop_front() {
                warn!(event = dropped.name(), "Outbox full, dropping oldest event");
            }
        }
        self.queue.push_back(event);
    }

    /// Put an event back at the head (it was being written when the socket died).
    pub(crate) fn requeue(&mut self, event: ClientEvent) {
        self.queue.push_front(event);
        if self.queue.len() > self.capacity {
            self.queue.pop_back();
        }
    }

    pub(crate) fn pop(&mut self) -> Option<ClientEvent> {
        self.queue.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }
}

pub struct Supervisor {
    user: UserId,
    tx: mpsc::Sender<ClientEvent>,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
}

impl Supervisor {
    /// Start connecting in the background. Inbound events go to `bus`, which
    /// keeps its handlers across reconnects and is cleared on shutdown.
    pub fn spawn(config: &ClientConfig, user: UserId, bus: EventBus) -> Self {
        let (tx, rx) = mpsc::channel(config.outbound_queue);
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);

        let worker = Worker {
            manager: ConnectionManager::new(config),
            user: user.clone(),
            bus,
            rx,
            state: state_tx,
            backoff: Backoff::new(config.initial_backoff, config.max_backoff),
            max_attempts: config.max_attempts,
            outbox: Outbox::new(config.outbox_capacity),
            inflight: InFlight::default(),
        };
        let task = tokio::spawn(worker.run());

        Self {
            user,
            tx,
            state,
            task,
        }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Queue an event. While disconnected it waits in the outbox.
    pub fn send(&self, event: ClientEvent) -> Result<(), ClientError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ClientError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ClientError::Closed,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the state satisfies `pred`, or the supervisor stops.
    pub async fn wait_for<F>(&self, pred: F) -> Option<ConnectionState>
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut state = self.state.clone();
        let result = state.wait_for(pred).await.ok().map(|s| *s);
        result
    }

    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            debug!(error = %e, "Supervisor task ended abnormally");
        }
    }
}

struct Worker {
    manager: ConnectionManager,
    user: UserId,
    bus: EventBus,
    rx: mpsc::Receiver<ClientEvent>,
    state: watch::Sender<ConnectionState>,
    backoff: Backoff,
    max_attempts: u32,
    outbox: Outbox,
    inflight: InFlight,
}

impl Worker {
    async fn run(mut self) {
        loop {
            match self.manager.open(&self.user).await {
                Ok(ws) => {
                    self.backoff.reset();
                    self.state.send_replace(ConnectionState::Connected);

                    match self.session(ws).await {
                        PumpExit::LocalClose => break,
                        PumpExit::Dropped(unsent) => {
                            if let Some(event) = unsent {
                                self.outbox.requeue(event);
                            }
                            warn!(
                                user = %self.user.short(),
                                unanswered = self.inflight.len(),
                                "Connection lost"
                            );
                            self.fail_unanswered();
                        }
                    }
                }
                Err(e) => {
                    warn!(user = %self.user.short(), error = %e, "Connect failed");
                    if !e.is_transient() {
                        error!(error = %e, "Giving up on relay connection");
                        self.state.send_replace(ConnectionState::Failed);
                        break;
                    }
                }
            }

            if self.max_attempts > 0 && self.backoff.attempt() >= self.max_attempts {
                error!(attempts = self.backoff.attempt(), "Reconnect attempts exhausted");
                self.state.send_replace(ConnectionState::Failed);
                break;
            }

            let delay = self.backoff.next_delay();
            self.state
                .send_replace(ConnectionState::Reconnecting(self.backoff.attempt()));
            info!(
                attempt = self.backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );

            if !self.wait_offline(delay).await {
                break;
            }
            self.state.send_replace(ConnectionState::Connecting);
        }

        if *self.state.borrow() != ConnectionState::Failed {
            self.state.send_replace(ConnectionState::Disconnected);
        }
        self.bus.clear();
        debug!(user = %self.user.short(), pending = self.outbox.len(), "Supervisor stopped");
    }

    /// Flush the outbox behind the `setup` already sent, then pump.
    async fn session(&mut self, mut ws: WsStream) -> PumpExit {
        let flushed = self.outbox.len();
        while let Some(event) = self.outbox.pop() {
            let frame = match event.to_json() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Dropping unencodable event");
                    continue;
                }
            };
            if ws.send(Message::Text(frame)).await.is_err() {
                return PumpExit::Dropped(Some(event));
            }
            self.inflight.written(&event);
        }
        if flushed > 0 {
            info!(flushed, "Outbox flushed after reconnect");
        }

        pump(ws, &mut self.rx, &self.bus, &mut self.inflight).await
    }

    /// Sends the dead socket accepted but never answered may or may not have
    /// been stored. They are reported failed so the user decides whether to
    /// retry, instead of staying pending forever.
    fn fail_unanswered(&mut self) {
        for event in self.inflight.drain_lost() {
            self.bus.dispatch(&event);
        }
    }

    /// Sleep out the backoff while collecting sends into the outbox.
    /// Returns `false` when every sender is gone.
    async fn wait_offline(&mut self, delay: Duration) -> bool {
        let deadline = sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return true,
                event = self.rx.recv() => match event {
                    Some(event) => self.outbox.push(event),
                    None => return false,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use society_chat_shared::MarkAsSeen;

    use super::*;

    fn seen(n: usize) -> ClientEvent {
        ClientEvent::MarkAsSeen(MarkAsSeen {
            user_id: format!("u{n}").as_str().into(),
            peer_id: "p".into(),
        })
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(87) && first <= Duration::from_millis(113));

        for _ in 0..10 {
            backoff.next_delay();
        }
        let capped = backoff.next_delay();
        assert!(capped <= Duration::from_millis(1125));
        assert_eq!(backoff.attempt(), 12);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }

    #[test]
    fn test_outbox_drops_oldest() {
        let mut outbox = Outbox::new(2);
        outbox.push(seen(1));
        outbox.push(seen(2));
        outbox.push(seen(3));
        assert_eq!(outbox.len(), 2);
        assert_eq!(outbox.pop(), Some(seen(2)));
        assert_eq!(outbox.pop(), Some(seen(3)));
    }

    #[test]
    fn test_requeue_goes_first() {
        let mut outbox = Outbox::new(2);
        outbox.push(seen(1));
        outbox.requeue(seen(0));
        assert_eq!(outbox.pop(), Some(seen(0)));
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let config = ClientConfig {
            ws_url: "ws://127.0.0.1:1/ws".into(),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(20),
            max_attempts: 2,
            connect_timeout: Duration::from_secs(2),
            ..ClientConfig::default()
        };
        let supervisor = Supervisor::spawn(&config, "u1".into(), EventBus::new());
        assert!(supervisor.send(seen(1)).is_ok());

        let state = tokio::time::timeout(
            Duration::from_secs(10),
            supervisor.wait_for(|s| *s == ConnectionState::Failed),
        )
        .await
        .unwrap();
        assert_eq!(state, Some(ConnectionState::Failed));
    }
}
