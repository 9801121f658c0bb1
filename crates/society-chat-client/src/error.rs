use thiserror::Error;

use society_chat_shared::{ClientRef, MessageId, ProtocolError, ValidationError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server rejected request ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] ValidationError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection timed out")]
    Timeout,

    #[error("Connection closed")]
    Closed,

    #[error("Outbound queue full")]
    QueueFull,

    #[error("Only the sender can delete message {0} for everyone")]
    NotSender(MessageId),

    #[error("No failed message {0} to retry")]
    NothingToRetry(ClientRef),
}

impl ClientError {
    /// Transport-level failures worth a reconnect, as opposed to bad input.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ClientError::WebSocket(_) | ClientError::Timeout | ClientError::Closed
        )
    }
}
