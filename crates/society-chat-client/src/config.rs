//! Client configuration loaded from environment variables.

use std::time::Duration;

use society_chat_shared::constants::DEFAULT_HTTP_PORT;

#[derive(Clone)]
pub struct ClientConfig {
    /// Relay socket endpoint.
    /// Env: `SOCIETY_CHAT_WS_URL`
    /// Default: `ws://localhost:8080/ws`
    pub ws_url: String,

    /// Relay REST base URL (history, submissions, attachments).
    /// Env: `SOCIETY_CHAT_API_URL`
    /// Default: `http://localhost:8080`
    pub api_url: String,

    /// Session token issued by the auth service.
    /// Env: `SOCIETY_CHAT_TOKEN`
    pub token: Option<String>,

    /// Env: `SOCIETY_CHAT_CONNECT_TIMEOUT_SECS`
    pub connect_timeout: Duration,

    /// First reconnect delay; doubles per failed attempt.
    /// Env: `SOCIETY_CHAT_BACKOFF_INITIAL_MS`
    pub initial_backoff: Duration,

    /// Env: `SOCIETY_CHAT_BACKOFF_MAX_MS`
    pub max_backoff: Duration,

    /// Reconnect attempts before giving up (0 = unlimited).
    /// Env: `SOCIETY_CHAT_MAX_RECONNECTS`
    pub max_attempts: u32,

    /// Sends held while disconnected. Oldest are dropped beyond this.
    /// Env: `SOCIETY_CHAT_OUTBOX`
    pub outbox_capacity: usize,

    /// Buffered outbound events between the app and the socket task.
    pub outbound_queue: usize,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("ws_url", &self.ws_url)
            .field("api_url", &self.api_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout", &self.connect_timeout)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("max_attempts", &self.max_attempts)
            .field("outbox_capacity", &self.outbox_capacity)
            .field("outbound_queue", &self.outbound_queue)
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: format!("ws://localhost:{DEFAULT_HTTP_PORT}/ws"),
            api_url: format!("http://localhost:{DEFAULT_HTTP_PORT}"),
            token: None,
            connect_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_attempts: 0,
            outbox_capacity: 100,
            outbound_queue: 64,
        }
    }
}

impl ClientConfig {
    /// Point both endpoints at one relay, e.g. `http://127.0.0.1:8080`.
    pub fn for_server(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        Self {
            ws_url: format!("{ws_base}/ws"),
            api_url: base.to_string(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("SOCIETY_CHAT_WS_URL") {
            config.ws_url = url;
        }
        if let Some(url) = lookup("SOCIETY_CHAT_API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }
        if let Some(token) = lookup("SOCIETY_CHAT_TOKEN").filter(|t| !t.is_empty()) {
            config.token = Some(token);
        }
        if let Some(secs) = parse(&lookup, "SOCIETY_CHAT_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse(&lookup, "SOCIETY_CHAT_BACKOFF_INITIAL_MS") {
            config.initial_backoff = Duration::from_millis(ms);
        }
        if let Some(ms) = parse(&lookup, "SOCIETY_CHAT_BACKOFF_MAX_MS") {
            config.max_backoff = Duration::from_millis(ms);
        }
        if let Some(n) = parse(&lookup, "SOCIETY_CHAT_MAX_RECONNECTS") {
            config.max_attempts = n;
        }
        if let Some(n) = parse(&lookup, "SOCIETY_CHAT_OUTBOX") {
            config.outbox_capacity = n;
        }

        config
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
