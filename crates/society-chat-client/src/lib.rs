//! # society-chat-client
//!
//! Client runtime for society direct messages: a reconnecting socket to the
//! relay, an explicit event subscription registry, per-peer conversation
//! view models with optimistic sends, and the seen-receipt triggers.

pub mod api_client;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod error;
pub mod events;
pub mod seen;
pub mod session;
pub mod supervisor;

pub use api_client::{ApiClient, Upload};
pub use config::ClientConfig;
pub use connection::{ConnectionHandle, ConnectionManager};
pub use conversation::{ConversationViewModel, Entry, LoadState, SendStatus};
pub use error::ClientError;
pub use events::{EventBus, EventKind, Subscription};
pub use seen::{SeenTracker, SeenTrigger};
pub use session::ChatSession;
pub use supervisor::{Backoff, ConnectionState, Supervisor};

/// Initialise `tracing` for binaries embedding the client. Respects `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("society_chat_client=debug,warn"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
