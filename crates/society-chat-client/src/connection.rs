//! One logical socket to the relay.
//!
//! [`ConnectionManager::connect`] performs the handshake, sends `setup`
//! before anything else, then hands the socket to a background task that
//! writes queued [`ClientEvent`]s and dispatches inbound [`ServerEvent`]s to
//! the [`EventBus`].

use std::collections::HashSet;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use society_chat_shared::{ClientEvent, ClientRef, MessageFailed, ServerEvent, UserId};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::EventBus;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Reason attached to sends the socket took but never answered.
pub const CONNECTION_LOST: &str = "connection lost";

#[derive(Debug, Clone)]
pub struct ConnectionManager {
    ws_url: String,
    token: Option<String>,
    connect_timeout: Duration,
    outbound_queue: usize,
}

impl ConnectionManager {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            ws_url: config.ws_url.clone(),
            token: config.token.clone(),
            connect_timeout: config.connect_timeout,
            outbound_queue: config.outbound_queue,
        }
    }

    /// Open the socket and register `user`. Handlers on `bus` are cleared
    /// when this connection ends, whether closed locally or dropped by the
    /// transport.
    pub async fn connect(&self, user: &UserId, bus: &EventBus) -> Result<ConnectionHandle, ClientError> {
        let ws = self.open(user).await?;
        let (tx, mut rx) = mpsc::channel(self.outbound_queue);
        let bus = bus.clone();
        let task_user = user.clone();

        let task = tokio::spawn(async move {
            let exit = pump(ws, &mut rx, &bus, &mut InFlight::default()).await;
            debug!(user = %task_user.short(), ?exit, "Connection ended");
            bus.clear();
        });

        Ok(ConnectionHandle {
            user: user.clone(),
            tx,
            task,
        })
    }

    /// Handshake plus `setup`. Shared with the reconnecting supervisor.
    pub(crate) async fn open(&self, user: &UserId) -> Result<WsStream, ClientError> {
        let url = self.socket_url()?;
        debug!(url = %self.ws_url, user = %user.short(), "Connecting to relay");

        let (mut ws, _) = timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| ClientError::Timeout)??;

        let setup = ClientEvent::Setup(user.clone()).to_json()?;
        ws.send(Message::Text(setup)).await?;

        info!(user = %user.short(), "Connected to relay");
        Ok(ws)
    }

    fn socket_url(&self) -> Result<reqwest::Url, ClientError> {
        let mut url = reqwest::Url::parse(&self.ws_url)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {e}", self.ws_url)))?;
        if let Some(token) = &self.token {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url)
    }
}

/// Fire-and-forget sender for one live connection.
pub struct ConnectionHandle {
    user: UserId,
    tx: mpsc::Sender<ClientEvent>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// Queue an event. There is no retry: once the connection is gone the
    /// event is refused.
    pub fn send(&self, event: ClientEvent) -> Result<(), ClientError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ClientError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ClientError::Closed,
        })
    }

    pub fn is_open(&self) -> bool {
        !self.task.is_finished()
    }

    /// Close the socket and wait for the background task to finish.
    pub async fn disconnect(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            debug!(error = %e, "Connection task ended abnormally");
        }
    }
}

#[derive(Debug)]
pub(crate) enum PumpExit {
    /// Every local sender was dropped.
    LocalClose,
    /// The relay closed the socket or the transport failed. Carries the event
    /// that was being written, if any, so the caller can requeue it.
    Dropped(Option<ClientEvent>),
}

/// Sends written to the socket whose `message ack` or `message failed` has
/// not come back yet.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    refs: HashSet<ClientRef>,
}

impl InFlight {
    pub(crate) fn written(&mut self, event: &ClientEvent) {
        if let ClientEvent::SendMessage(message) = event {
            self.refs.insert(message.client_ref);
        }
    }

    pub(crate) fn answered(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::MessageAck(ack) => {
                self.refs.remove(&ack.client_ref);
            }
            ServerEvent::MessageFailed(failed) => {
                self.refs.remove(&failed.client_ref);
            }
            _ => {}
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.refs.len()
    }

    /// One `message failed` per unanswered send. Leaves the set empty.
    pub(crate) fn drain_lost(&mut self) -> Vec<ServerEvent> {
        self.refs
            .drain()
            .map(|client_ref| {
                ServerEvent::MessageFailed(MessageFailed {
                    client_ref,
                    reason: CONNECTION_LOST.to_string(),
                })
            })
            .collect()
    }
}

/// Drive one socket until either side closes it.
pub(crate) async fn pump(
    mut ws: WsStream,
    outbound: &mut mpsc::Receiver<ClientEvent>,
    bus: &EventBus,
    inflight: &mut InFlight,
) -> PumpExit {
    loop {
        tokio::select! {
            event = outbound.recv() => {
                let Some(event) = event else {
                    let _ = ws.close(None).await;
                    return PumpExit::LocalClose;
                };
                let frame = match event.to_json() {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(event = event.name(), error = %e, "Dropping unencodable event");
                        continue;
                    }
                };
                if let Err(e) = ws.send(Message::Text(frame)).await {
                    warn!(event = event.name(), error = %e, "Socket write failed");
                    return PumpExit::Dropped(Some(event));
                }
                inflight.written(&event);
            }

            frame = ws.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => match ServerEvent::from_json(&text) {
                        Ok(event) => {
                            inflight.answered(&event);
                            let handled = bus.dispatch(&event);
                            debug!(event = event.name(), handled, "Event received");
                        }
                        Err(e) => warn!(error = %e, "Malformed frame from relay"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Relay closed the connection");
                        return PumpExit::Dropped(None);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Socket read failed");
                        return PumpExit::Dropped(None);
                    }
                }
            }
        }
    }
}
