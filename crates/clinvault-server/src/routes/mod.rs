//! HTTP route modules for the `clinvault` server.
//!
//! Every module exposes a `router()` mounted under `/v1` by
//! [`build_router`](crate::build_router).

pub mod audit;
pub mod credentials;
pub mod crypto;
pub mod leases;
pub mod metrics;
pub mod policies;
pub mod records;
pub mod rotation;
pub mod secrets;
pub mod sys;
pub mod tokens;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::AppError;

/// Decode a base64 request field.
pub(crate) fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>, AppError> {
    STANDARD
        .decode(value)
        .map_err(|e| AppError::BadRequest(format!("{field} is not valid base64: {e}")))
}

pub(crate) fn encode_b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
