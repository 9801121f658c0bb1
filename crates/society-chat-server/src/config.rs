//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the relay can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

use society_chat_shared::constants::{DEFAULT_HTTP_PORT, MAX_ATTACHMENT_SIZE};
use society_chat_shared::PresenceScope;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite file holding persisted messages (`:memory:` for ephemeral).
    /// Env: `DATABASE_PATH`
    /// Default: `./society-chat.db`
    pub database_path: PathBuf,

    /// Directory where uploaded attachments are stored.
    /// Env: `ATTACHMENT_STORAGE_PATH`
    /// Default: `./attachments`
    pub attachment_storage_path: PathBuf,

    /// Maximum attachment size in bytes.
    /// Env: `MAX_ATTACHMENT_SIZE`
    /// Default: 25 MiB
    pub max_attachment_size: usize,

    /// Base URL used when building attachment links handed to clients.
    /// Env: `PUBLIC_BASE_URL`
    /// Default: `http://localhost:8080`
    pub public_base_url: String,

    /// Shared session token required on the socket upgrade and REST calls.
    /// Env: `SESSION_TOKEN`
    /// Default: unset (any token accepted, development only).
    pub session_token: Option<String>,

    /// Who receives presence transitions.
    /// Env: `PRESENCE_SCOPE` (`everyone` | `conversations`)
    /// Default: `everyone`
    pub presence_scope: PresenceScope,

    /// Sustained socket events per second per user.
    /// Env: `EVENT_RATE`
    pub event_rate: f64,

    /// Socket event burst per user.
    /// Env: `EVENT_BURST`
    pub event_burst: f64,

    /// Outbound frames buffered per connection before frames are dropped.
    pub outbound_queue: usize,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("attachment_storage_path", &self.attachment_storage_path)
            .field("max_attachment_size", &self.max_attachment_size)
            .field("public_base_url", &self.public_base_url)
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("presence_scope", &self.presence_scope)
            .field("event_rate", &self.event_rate)
            .field("event_burst", &self.event_burst)
            .field("outbound_queue", &self.outbound_queue)
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: PathBuf::from("./society-chat.db"),
            attachment_storage_path: PathBuf::from("./attachments"),
            max_attachment_size: MAX_ATTACHMENT_SIZE,
            public_base_url: format!("http://localhost:{DEFAULT_HTTP_PORT}"),
            session_token: None,
            presence_scope: PresenceScope::Everyone,
            event_rate: 20.0,
            event_burst: 60.0,
            outbound_queue: 256,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = lookup("DATABASE_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if let Some(path) = lookup("ATTACHMENT_STORAGE_PATH") {
            config.attachment_storage_path = PathBuf::from(path);
        }

        if let Some(val) = lookup("MAX_ATTACHMENT_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_attachment_size = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_ATTACHMENT_SIZE, using default"),
            }
        }

        if let Some(url) = lookup("PUBLIC_BASE_URL") {
            config.public_base_url = url.trim_end_matches('/').to_string();
        }

        if let Some(token) = lookup("SESSION_TOKEN") {
            if !token.is_empty() {
                config.session_token = Some(token);
            }
        }

        if let Some(val) = lookup("PRESENCE_SCOPE") {
            match PresenceScope::parse(&val) {
                Some(scope) => config.presence_scope = scope,
                None => tracing::warn!(value = %val, "Invalid PRESENCE_SCOPE, using default"),
            }
        }

        if let Some(val) = lookup("EVENT_RATE") {
            match val.parse::<f64>() {
                Ok(rate) if rate > 0.0 => config.event_rate = rate,
                _ => tracing::warn!(value = %val, "Invalid EVENT_RATE, using default"),
            }
        }

        if let Some(val) = lookup("EVENT_BURST") {
            match val.parse::<f64>() {
                Ok(burst) if burst >= 1.0 => config.event_burst = burst,
                _ => tracing::warn!(value = %val, "Invalid EVENT_BURST, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}
