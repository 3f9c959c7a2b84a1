//! HTTP error type for `clinvault` server.
//!
//! Maps [`VaultError`] into responses by its [`ErrorKind`]. Every response
//! carries a JSON body with a machine-readable `error` and a human-readable
//! `message`. Integrity and internal failures are logged and replaced by a
//! generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use clinvault_core::error::TokenError;
use clinvault_core::{ErrorKind, VaultError};

/// Error returned from HTTP handlers.
#[derive(Debug)]
pub enum AppError {
    /// No usable token was presented.
    Unauthorized(String),
    /// The request could not be decoded.
    BadRequest(String),
    /// A core operation failed.
    Vault(VaultError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

/// HTTP status for each error kind.
#[must_use]
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Sealed => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Authorization => StatusCode::FORBIDDEN,
        ErrorKind::ExpiredOrRevoked => StatusCode::GONE,
        ErrorKind::ProviderUnavailable => StatusCode::BAD_GATEWAY,
        ErrorKind::Integrity => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl AppError {
    /// Map a failed authentication. Token problems are 401; a sealed vault
    /// or storage failure keeps its own status.
    #[must_use]
    pub fn from_auth(err: VaultError) -> Self {
        match &err {
            VaultError::Token(TokenError::Barrier(_)) => Self::Vault(err),
            VaultError::Token(e) => Self::Unauthorized(e.to_string()),
            _ => Self::Vault(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg),
            Self::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorKind::InvalidRequest.as_str(),
                msg,
            ),
            Self::Vault(err) => {
                let kind = err.kind();
                let message = match kind {
                    ErrorKind::Integrity => {
                        error!(error = %err, "integrity check failed");
                        "ciphertext failed authentication".to_owned()
                    }
                    ErrorKind::Internal => {
                        error!(error = %err, "internal error");
                        "internal error".to_owned()
                    }
                    ErrorKind::Sealed => "vault is sealed".to_owned(),
                    _ => err.to_string(),
                };
                (status_for(kind), kind.as_str(), message)
            }
        };

        (status, axum::Json(ErrorBody { error, message })).into_response()
    }
}

impl From<VaultError> for AppError {
    fn from(err: VaultError) -> Self {
        Self::Vault(err)
    }
}
