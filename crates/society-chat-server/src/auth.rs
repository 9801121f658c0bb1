//! Session token check at the edge of the relay.
//!
//! Session issuance belongs to the auth service. The relay only checks that
//! the caller presents the configured shared token, either as
//! `Authorization: Bearer <token>` or as a `token` query parameter (browsers
//! cannot set headers on a WebSocket upgrade).

use axum::http::HeaderMap;
use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::config::ServerConfig;
use crate::error::ServerError;

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

pub fn verify_session_token(
    headers: &HeaderMap,
    query_token: Option<&str>,
    config: &ServerConfig,
) -> Result<(), ServerError> {
    let Some(ref expected) = config.session_token else {
        return Ok(());
    };

    let header_token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|auth| auth.strip_prefix("Bearer ").unwrap_or(auth));

    let token = header_token.or(query_token).unwrap_or("");

    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Unauthorized);
    }

    Ok(())
}
