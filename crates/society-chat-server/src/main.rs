use std::time::Duration;

use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use society_chat_server::{api, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,society_chat_server=debug")),
        )
        .init();

    info!("Starting society chat relay v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    if config.session_token.is_none() {
        tracing::warn!("SESSION_TOKEN not set, the relay accepts any client");
    }
    let http_addr = config.http_addr;

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems (store, attachments, relay)
    // -----------------------------------------------------------------------
    let app_state = api::build_state(config).await?;

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Evict REST buckets idle >10 min, every 5 minutes
    let rl = app_state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let clients = rl.purge_stale(600.0).await;
            debug!(clients, "REST rate-limit buckets purged");
        }
    });

    // Same for per-user socket event buckets
    let relay = app_state.relay.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            let users = relay.purge_rate_limits(600.0).await;
            debug!(users, "Socket rate-limit buckets purged");
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP + WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
