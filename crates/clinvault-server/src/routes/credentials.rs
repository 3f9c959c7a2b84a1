//! Dynamic database credential routes: `/v1/credentials/*`
//!
//! The generated password appears only in the create response.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};

use clinvault_core::Caller;
use clinvault_core::credentials::{CredentialInfo, CredentialRequest, IssuedCredential};

use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_credentials).post(create_credential))
        .route("/{id}", get(get_credential))
        .route("/{id}/revoke", post(revoke_credential))
}

async fn create_credential(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<CredentialRequest>,
) -> Result<(StatusCode, Json<IssuedCredential>), AppError> {
    let issued = state.vault.create_credential(&caller, body).await?;
    Ok((StatusCode::CREATED, Json(issued)))
}

async fn list_credentials(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Vec<CredentialInfo>>, AppError> {
    Ok(Json(state.vault.list_credentials(&caller).await?))
}

async fn get_credential(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<CredentialInfo>, AppError> {
    Ok(Json(state.vault.get_credential(&caller, &id).await?))
}

async fn revoke_credential(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<CredentialInfo>, AppError> {
    Ok(Json(state.vault.revoke_credential(&caller, &id).await?))
}
