//! Types and wire protocol shared by the society chat server and client.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{ProtocolError, ValidationError};
pub use protocol::*;
pub use types::*;
