//! WebSocket endpoint. One reader loop and one writer task per connection.
//!
//! Inbound events from a connection are handled strictly in arrival order.
//! Everything destined for the connection goes through its bounded queue in
//! the hub, so a slow client can only lose its own frames.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use society_chat_shared::constants::MAX_FRAME_SIZE;
use society_chat_shared::{ClientEvent, ConnectionId, MessageFailed, ServerEvent, UserId};

use crate::api::AppState;
use crate::auth::{verify_session_token, TokenQuery};
use crate::error::ServerError;
use crate::relay::Relay;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<Response, ServerError> {
    verify_session_token(&headers, query.token.as_deref(), &state.config)?;

    Ok(ws
        .max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state)))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn = ConnectionId::new();
    let relay = state.relay.clone();
    let (mut sink, mut stream) = socket.split();

    let (tx, mut rx) = mpsc::channel::<ServerEvent>(state.config.outbound_queue);
    relay.hub().register(conn, tx).await;
    info!(conn = %conn, "Socket connected");

    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = match event.to_json() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(conn = %conn, event = event.name(), error = %e, "Failed to encode event");
                    continue;
                }
            };
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut user: Option<UserId> = None;

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                reply_error(&relay, conn, "binary frames are not supported").await;
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!(conn = %conn, error = %e, "Socket read failed");
                break;
            }
        };

        let event = match ClientEvent::from_json(&text) {
            Ok(event) => event,
            Err(e) => {
                debug!(conn = %conn, error = %e, "Malformed frame");
                reply_error(&relay, conn, &e.to_string()).await;
                continue;
            }
        };

        if let Err(e) = dispatch(&relay, conn, &mut user, event).await {
            debug!(conn = %conn, error = %e, "Event rejected");
            reply_error(&relay, conn, &e.to_string()).await;
        }
    }

    relay.disconnect(conn).await;
    writer.abort();
    info!(
        conn = %conn,
        user = user.as_ref().map(UserId::short).unwrap_or("-"),
        "Socket closed"
    );
}

async fn dispatch(
    relay: &Relay,
    conn: ConnectionId,
    user: &mut Option<UserId>,
    event: ClientEvent,
) -> Result<(), ServerError> {
    if let ClientEvent::Setup(id) = &event {
        relay.setup(conn, id).await?;
        *user = Some(id.clone());
        return Ok(());
    }

    let Some(current) = user.clone() else {
        return Err(ServerError::BadRequest(format!(
            "'{}' sent before setup",
            event.name()
        )));
    };

    if !relay.allow_event(&current).await {
        warn!(user = %current.short(), event = event.name(), "Socket event rate limit exceeded");
        if let ClientEvent::SendMessage(message) = &event {
            relay
                .hub()
                .send_to_connection(
                    conn,
                    ServerEvent::MessageFailed(MessageFailed {
                        client_ref: message.client_ref,
                        reason: ServerError::RateLimited.to_string(),
                    }),
                )
                .await;
            return Ok(());
        }
        return Err(ServerError::RateLimited);
    }

    match event {
        ClientEvent::Setup(_) => {}
        ClientEvent::SendMessage(message) => {
            relay.send_message(conn, &current, message).await;
        }
        ClientEvent::MarkAsSeen(req) => {
            relay.mark_as_seen(&current, req).await?;
        }
        ClientEvent::DeleteMessage(req) => {
            relay.delete_message(conn, &current, req).await?;
        }
        ClientEvent::RequestOnlineStatus => relay.online_status(conn).await,
    }
    Ok(())
}

async fn reply_error(relay: &Relay, conn: ConnectionId, message: &str) {
    relay
        .hub()
        .send_to_connection(conn, ServerEvent::error(message))
        .await;
}
