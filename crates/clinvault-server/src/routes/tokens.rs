//! Token routes: `/v1/tokens/*`
//!
//! Tokens are addressed by accessor. The plaintext token is returned once,
//! by `POST /v1/tokens`.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};

use clinvault_core::Caller;
use clinvault_core::token::{CreateToken, CreatedToken, TokenInfo};

use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_tokens).post(create_token))
        .route("/self", get(lookup_self))
        .route("/{accessor}/revoke", post(revoke_token))
}

async fn create_token(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<CreateToken>,
) -> Result<(StatusCode, Json<CreatedToken>), AppError> {
    let created = state.vault.create_token(&caller, body).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_tokens(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Vec<TokenInfo>>, AppError> {
    Ok(Json(state.vault.list_tokens(&caller).await?))
}

async fn lookup_self(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<TokenInfo>, AppError> {
    Ok(Json(state.vault.lookup_self(&caller).await?))
}

async fn revoke_token(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(accessor): Path<String>,
) -> Result<Json<TokenInfo>, AppError> {
    Ok(Json(state.vault.revoke_token(&caller, &accessor).await?))
}
