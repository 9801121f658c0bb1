/// Protocol version advertised by `/info`
pub const PROTOCOL_VERSION: &str = "/society-chat/1.0.0";

/// Application name
pub const APP_NAME: &str = "Society Chat";

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Maximum text body length in bytes (8 KiB)
pub const MAX_TEXT_LENGTH: usize = 8 * 1024;

/// Maximum size of a single socket frame in bytes (64 KiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Maximum attachment size in bytes (25 MiB)
pub const MAX_ATTACHMENT_SIZE: usize = 25 * 1024 * 1024;

/// Content shown in place of a message deleted for everyone
pub const REDACTED_TEXT: &str = "This message was deleted";

/// Fraction of the last timeline element that must be visible to count as seen
pub const SEEN_VISIBILITY_THRESHOLD: f64 = 0.8;

/// Default page size for history fetches
pub const DEFAULT_HISTORY_LIMIT: u32 = 200;

/// Upper bound on a single history page
pub const MAX_HISTORY_LIMIT: u32 = 1000;
