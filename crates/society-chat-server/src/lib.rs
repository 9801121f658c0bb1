//! # society-chat-server
//!
//! Real-time relay for society direct messages.
//!
//! This crate provides:
//! - **WebSocket relay** that persists each message before pushing it to the
//!   receiver's live connections
//! - **Presence registry** counting live connections per user and
//!   broadcasting online/offline edges
//! - **Seen receipts and deletion** relayed between conversation participants
//! - **REST API** (axum) for history, text/file submission and attachments
//! - **Rate limiting** per client IP (REST) and per user (socket events)

pub mod api;
pub mod attachments;
pub mod auth;
pub mod config;
pub mod error;
pub mod hub;
pub mod presence;
pub mod rate_limit;
pub mod relay;
pub mod socket;

pub use api::{build_router, build_state, serve, serve_on, AppState};
pub use config::ServerConfig;
pub use error::ServerError;
