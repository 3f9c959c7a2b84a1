//! System routes: `/v1/sys/*`
//!
//! Health, initialization and unsealing are public. Sealing and unseal
//! provider management need a token.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use clinvault_core::Caller;
use clinvault_core::seal::{ConfiguredProvider, SealStatus, UnsealOutcome};
use clinvault_core::unseal::{ProviderSpec, ProviderStatus, UnsealInput};
use clinvault_core::vault::InitResult;

use crate::error::AppError;
use crate::middleware::ClientIp;
use crate::state::AppState;

/// Routes reachable without a token.
pub fn public_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/sys/health", get(health))
        .route("/v1/sys/seal-status", get(seal_status))
        .route("/v1/sys/init", post(init))
        .route("/v1/sys/unseal", post(unseal))
}

/// Token-protected system routes.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/v1/sys/seal", post(seal))
        .route(
            "/v1/sys/unseal-providers",
            get(list_providers).post(configure_provider),
        )
        .route("/v1/sys/unseal-providers/{id}", delete(remove_provider))
}

// ── Request / response types ─────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub initialized: bool,
    pub sealed: bool,
    pub version: &'static str,
}

#[derive(Deserialize)]
pub struct InitRequest {
    #[serde(alias = "masterPassword")]
    pub master_password: String,
    #[serde(alias = "userId")]
    pub user_id: String,
}

#[derive(Deserialize, Default)]
pub struct UnsealRequest {
    #[serde(default, alias = "providerId")]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub shares: Vec<String>,
}

#[derive(Deserialize)]
pub struct ConfigureProviderRequest {
    #[serde(alias = "providerId")]
    pub provider_id: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(flatten)]
    pub spec: ProviderSpec,
}

fn default_priority() -> u32 {
    100
}

#[derive(Debug, Serialize)]
pub struct SealResponse {
    pub sealed: bool,
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, AppError> {
    let status = state.vault.status().await?;
    Ok(Json(HealthResponse {
        initialized: status.initialized,
        sealed: status.sealed,
        version: env!("CARGO_PKG_VERSION"),
    }))
}

async fn seal_status(State(state): State<Arc<AppState>>) -> Result<Json<SealStatus>, AppError> {
    Ok(Json(state.vault.status().await?))
}

/// Create the master key and the root token. The root token is only ever
/// returned here.
async fn init(
    State(state): State<Arc<AppState>>,
    Extension(ip): Extension<ClientIp>,
    Json(body): Json<InitRequest>,
) -> Result<(StatusCode, Json<InitResult>), AppError> {
    let result = state
        .vault
        .initialize(&body.master_password, &body.user_id, &ip.anonymous())
        .await?;
    Ok((StatusCode::CREATED, Json(result)))
}

/// Try the named provider, or every provider by priority. A failed attempt
/// is reported in the body, not as an error status.
async fn unseal(
    State(state): State<Arc<AppState>>,
    Extension(ip): Extension<ClientIp>,
    Json(body): Json<UnsealRequest>,
) -> Result<Json<UnsealOutcome>, AppError> {
    let input = UnsealInput {
        password: body.password.as_deref(),
        shares: &body.shares,
    };
    let outcome = state
        .vault
        .unseal(body.provider_id.as_deref(), input, &ip.anonymous())
        .await?;
    Ok(Json(outcome))
}

async fn seal(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<SealResponse>, AppError> {
    let sealed = state.vault.seal(&caller).await?;
    Ok(Json(SealResponse { sealed }))
}

async fn list_providers(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Vec<ProviderStatus>>, AppError> {
    Ok(Json(state.vault.list_providers(&caller).await?))
}

/// Shamir shares in the response are shown once and never stored.
async fn configure_provider(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<ConfigureProviderRequest>,
) -> Result<(StatusCode, Json<ConfiguredProvider>), AppError> {
    let configured = state
        .vault
        .configure_provider(&caller, &body.provider_id, body.priority, body.spec)
        .await?;
    Ok((StatusCode::CREATED, Json(configured)))
}

async fn remove_provider(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.vault.remove_provider(&caller, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
