//! Request middleware: client address capture and token authentication.
//!
//! [`client_ip`] runs on every request and records the caller's address for
//! the audit trail. [`auth_middleware`] guards every non-public route: it
//! reads `X-Vault-Token`, resolves it through the vault, and injects the
//! resulting [`Caller`] for handlers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use clinvault_core::Caller;
use clinvault_core::audit::AuditActor;

use crate::error::AppError;
use crate::state::AppState;

/// Header carrying the client token.
pub const TOKEN_HEADER: &str = "x-vault-token";

/// Client address as seen by the server, if known.
#[derive(Debug, Clone, Default)]
pub struct ClientIp(pub Option<String>);

impl ClientIp {
    /// Audit actor for an unauthenticated request.
    #[must_use]
    pub fn anonymous(&self) -> AuditActor {
        AuditActor {
            user_id: None,
            ip_address: self.0.clone(),
        }
    }
}

/// Record the client address. The first `X-Forwarded-For` hop wins over the
/// socket peer.
pub async fn client_ip(mut req: Request, next: Next) -> Response {
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned);
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string());

    req.extensions_mut().insert(ClientIp(forwarded.or(peer)));
    next.run(req).await
}

/// Resolve `X-Vault-Token` into a [`Caller`].
///
/// Missing, unknown, expired and revoked tokens are rejected with 401. A
/// sealed vault answers 503.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(token) = req
        .headers()
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
    else {
        return AppError::Unauthorized("missing X-Vault-Token header".to_owned()).into_response();
    };

    let ip = req
        .extensions()
        .get::<ClientIp>()
        .and_then(|c| c.0.clone());

    match state.vault.authenticate(&token, ip).await {
        Ok(caller) => {
            debug!(accessor = %caller.accessor, path = %req.uri().path(), "request authenticated");
            req.extensions_mut().insert::<Caller>(caller);
            next.run(req).await
        }
        Err(e) => AppError::from_auth(e).into_response(),
    }
}
