use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] ValidationError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message has neither text nor attachment")]
    Empty,

    #[error("text too long: {len} bytes (max {max})")]
    TextTooLong { len: usize, max: usize },

    #[error("file type given without a file url")]
    FileTypeWithoutUrl,

    #[error("sender and receiver are the same user")]
    SelfAddressed,

    #[error("missing field: {0}")]
    MissingField(&'static str),
}
