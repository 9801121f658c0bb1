use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, Method},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use society_chat_shared::constants::{DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT, PROTOCOL_VERSION};
use society_chat_shared::{
    ChatMessage, ClientRef, MessageAck, MessageContent, PresenceScope, PresenceSnapshot,
    ServerEvent, SocietyId, UserId,
};
use society_chat_store::{Database, NewMessage};

use crate::attachments::AttachmentStore;
use crate::auth::verify_session_token;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::relay::Relay;
use crate::socket::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub rate_limiter: RateLimiter<IpAddr>,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

/// Open the store and attachment directory and assemble the shared state.
pub async fn build_state(config: ServerConfig) -> anyhow::Result<AppState> {
    let db = Database::open_at(&config.database_path)?;
    let attachments = Arc::new(
        AttachmentStore::new(
            config.attachment_storage_path.clone(),
            config.max_attachment_size,
            config.public_base_url.clone(),
        )
        .await?,
    );

    Ok(AppState {
        relay: Relay::new(db, attachments, &config),
        rate_limiter: RateLimiter::default(),
        config: Arc::new(config),
        started_at: Instant::now(),
    })
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    // multipart framing on top of the largest attachment
    let body_limit = state.config.max_attachment_size + 64 * 1024;

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/ws", get(ws_handler))
        .route("/presence", get(presence))
        .route("/messages", post(submit_text))
        .route("/messages/file", post(submit_file))
        .route("/messages/:user_id/:peer_id", get(history))
        .route("/attachments/:id", get(download_attachment))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerInfoResponse {
    version: &'static str,
    protocol: &'static str,
    presence_scope: PresenceScope,
    online_users: usize,
    connections: usize,
    max_attachment_size: usize,
    uptime_secs: u64,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
    offset: Option<u32>,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PresenceQuery {
    user: Option<UserId>,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitTextRequest {
    sender: UserId,
    receiver: UserId,
    society_id: SocietyId,
    text: String,
    #[serde(default)]
    client_ref: Option<ClientRef>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        version: env!("CARGO_PKG_VERSION"),
        protocol: PROTOCOL_VERSION,
        presence_scope: state.config.presence_scope,
        online_users: state.relay.presence().online_count().await,
        connections: state.relay.hub().connection_count().await,
        max_attachment_size: state.config.max_attachment_size,
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn presence(
    headers: HeaderMap,
    State(state): State<AppState>,
    Query(query): Query<PresenceQuery>,
) -> Result<Json<std::collections::BTreeMap<UserId, PresenceSnapshot>>, ServerError> {
    verify_session_token(&headers, query.token.as_deref(), &state.config)?;
    if state.config.presence_scope == PresenceScope::Conversations && query.user.is_none() {
        return Err(ServerError::BadRequest(
            "presence is scoped to conversations, pass ?user=".into(),
        ));
    }
    Ok(Json(state.relay.presence_for(query.user.as_ref()).await?))
}

async fn history(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path((user_id, peer_id)): Path<(String, String)>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ChatMessage>>, ServerError> {
    verify_session_token(&headers, query.token.as_deref(), &state.config)?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let messages = state
        .relay
        .history(
            &UserId::new(user_id),
            &UserId::new(peer_id),
            limit,
            query.offset.unwrap_or(0),
        )
        .await?;

    Ok(Json(messages))
}

async fn submit_text(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<SubmitTextRequest>,
) -> Result<Json<ChatMessage>, ServerError> {
    verify_session_token(&headers, None, &state.config)?;

    let draft = NewMessage {
        sender: req.sender,
        receiver: req.receiver,
        society_id: req.society_id,
        content: MessageContent::text(req.text),
        created_at: req.created_at.unwrap_or_else(Utc::now),
    };
    let stored = state.relay.submit(draft).await?;
    acknowledge(&state, req.client_ref, &stored).await;

    info!(id = %stored.id, sender = %stored.sender.short(), "Message submitted via API");
    Ok(Json(stored))
}

/// Multipart fields: `sender`, `receiver`, `societyId`, optional `text`,
/// optional `clientRef`, and `file`.
async fn submit_file(
    headers: HeaderMap,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ChatMessage>, ServerError> {
    verify_session_token(&headers, None, &state.config)?;

    let mut sender = None;
    let mut receiver = None;
    let mut society_id = None;
    let mut text = None;
    let mut client_ref = None;
    let mut file: Option<(Vec<u8>, Option<String>)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        if name == "file" {
            let mime = field.content_type().map(str::to_string);
            let data = field
                .bytes()
                .await
                .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))?;
            file = Some((data.to_vec(), mime));
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))?;
        match name.as_str() {
            "sender" => sender = Some(UserId::new(value)),
            "receiver" => receiver = Some(UserId::new(value)),
            "societyId" => society_id = Some(SocietyId::new(value)),
            "text" if !value.trim().is_empty() => text = Some(value),
            "clientRef" => {
                client_ref = Some(
                    Uuid::parse_str(value.trim())
                        .map(ClientRef)
                        .map_err(|_| ServerError::BadRequest("Invalid clientRef".into()))?,
                )
            }
            _ => {}
        }
    }

    let missing = |field: &str| ServerError::BadRequest(format!("Missing '{field}' field"));
    let sender = sender.ok_or_else(|| missing("sender"))?;
    let receiver = receiver.ok_or_else(|| missing("receiver"))?;
    let society_id = society_id.ok_or_else(|| missing("societyId"))?;
    let (data, mime) = file.ok_or_else(|| missing("file"))?;

    let attachments = state.relay.attachments();
    let stored_file = attachments.store(&data, mime.as_deref()).await?;

    let mut content = MessageContent::file(stored_file.url.clone(), stored_file.mime_type.clone());
    if stored_file.mime_type.starts_with("audio/") {
        content.audio_url = Some(stored_file.url.clone());
    }
    content.text = text;

    let draft = NewMessage {
        sender,
        receiver,
        society_id,
        content,
        created_at: Utc::now(),
    };

    let stored = match state.relay.submit(draft).await {
        Ok(stored) => stored,
        Err(e) => {
            let _ = attachments.delete(stored_file.id).await;
            return Err(e);
        }
    };
    acknowledge(&state, client_ref, &stored).await;

    info!(
        id = %stored.id,
        attachment = %stored_file.id,
        size = stored_file.size,
        "File message submitted via API"
    );
    Ok(Json(stored))
}

/// A REST submission carrying a client reference also confirms it on the
/// sender's live sockets.
async fn acknowledge(state: &AppState, client_ref: Option<ClientRef>, message: &ChatMessage) {
    let Some(client_ref) = client_ref else {
        return;
    };
    let ack = ServerEvent::MessageAck(MessageAck {
        client_ref,
        message: message.clone(),
    });
    state.relay.hub().send_to_user(&message.sender, &ack, None).await;
}

async fn download_attachment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServerError> {
    let (data, mime) = state.relay.attachments().get(id).await?;
    Ok(([(header::CONTENT_TYPE, mime)], data))
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve_on(state, listener).await
}

/// Serve on an already-bound listener (ephemeral ports in tests).
pub async fn serve_on(state: AppState, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %listener.local_addr()?, "Starting HTTP API server");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
