use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use uuid::Uuid;

use society_chat_shared::ValidationError;
use society_chat_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Attachment not found: {0}")]
    AttachmentNotFound(Uuid),

    #[error("Attachment too large: {size} bytes (max {max})")]
    AttachmentTooLarge { size: usize, max: usize },

    #[error("Attachment storage error: {0}")]
    AttachmentStorage(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] ValidationError),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Missing or invalid session token")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Storage error: {0}")]
    Store(StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ServerError::NotFound("message".into()),
            StoreError::Invalid(v) => ServerError::InvalidMessage(v),
            other => ServerError::Store(other),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::NotFound(_) | ServerError::AttachmentNotFound(_) => {
                (StatusCode::NOT_FOUND, self.to_string())
            }
            ServerError::AttachmentTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, self.to_string())
            }
            ServerError::AttachmentStorage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Attachment storage error".to_string(),
            ),
            ServerError::InvalidMessage(_) | ServerError::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            ServerError::Store(_) | ServerError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ServerError::from(StoreError::NotFound).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServerError::from(StoreError::Invalid(ValidationError::Empty))
                .into_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServerError::Unauthorized.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ServerError::AttachmentTooLarge { size: 2, max: 1 }
                .into_response()
                .status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
    }
}
