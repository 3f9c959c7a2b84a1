//! Lease routes: `/v1/leases/*`

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;

use clinvault_core::Caller;
use clinvault_core::lease::Lease;
use clinvault_core::vault::LeasedSecret;

use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_leases).post(create_lease))
        .route("/{id}", get(lookup_lease))
        .route("/{id}/secret", get(leased_secret))
        .route("/{id}/renew", post(renew_lease))
        .route("/{id}/revoke", post(revoke_lease))
}

#[derive(Debug, Deserialize)]
pub struct CreateLeaseRequest {
    pub path: String,
    pub ttl_secs: u64,
    #[serde(default = "default_renewable")]
    pub renewable: bool,
}

fn default_renewable() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct RenewRequest {
    pub increment_secs: u64,
}

async fn create_lease(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<CreateLeaseRequest>,
) -> Result<(StatusCode, Json<Lease>), AppError> {
    let lease = state
        .vault
        .create_lease(&caller, &body.path, body.ttl_secs, body.renewable)
        .await?;
    Ok((StatusCode::CREATED, Json(lease)))
}

async fn list_leases(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Vec<Lease>>, AppError> {
    Ok(Json(state.vault.list_leases(&caller).await?))
}

async fn lookup_lease(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<Lease>, AppError> {
    Ok(Json(state.vault.lookup_lease(&caller, &id).await?))
}

/// Read the leased secret. Gone once the lease has expired or been revoked.
async fn leased_secret(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<LeasedSecret>, AppError> {
    Ok(Json(state.vault.leased_secret(&caller, &id).await?))
}

async fn renew_lease(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    Json(body): Json<RenewRequest>,
) -> Result<Json<Lease>, AppError> {
    Ok(Json(
        state
            .vault
            .renew_lease(&caller, &id, body.increment_secs)
            .await?,
    ))
}

async fn revoke_lease(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<Json<Lease>, AppError> {
    Ok(Json(state.vault.revoke_lease(&caller, &id).await?))
}
