//! # society-chat-store
//!
//! Durable message storage for the society chat relay, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection`. It is the only place that mints message ids:
//! a message becomes durable (and gets its id) on its first successful
//! write here.

pub mod database;
pub mod messages;
pub mod migrations;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use messages::NewMessage;
