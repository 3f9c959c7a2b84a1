//! Secret routes: `/v1/secrets/*`
//!
//! Paths are normalized and validated by the core secret store. Values are
//! returned in plaintext only on an explicit read.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::Deserialize;

use clinvault_core::Caller;
use clinvault_core::secrets::{Secret, SecretEntry, SecretWrite};

use crate::error::AppError;
use crate::state::AppState;

/// Paths:
/// - `GET    /v1/secrets?prefix=` list one level
/// - `GET    /v1/secrets/data/{*path}` read
/// - `PUT    /v1/secrets/data/{*path}` create or update
/// - `DELETE /v1/secrets/data/{*path}` delete
/// - `GET    /v1/secrets/previous/{*path}` value replaced by the last
///   rotation, during its grace period
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_secrets))
        .route(
            "/data/{*path}",
            get(read_secret).put(write_secret).delete(delete_secret),
        )
        .route("/previous/{*path}", get(read_previous))
}

#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    #[serde(default)]
    pub prefix: String,
}

#[derive(Deserialize)]
pub struct WriteSecretRequest {
    pub value: String,
}

async fn list_secrets(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SecretEntry>>, AppError> {
    Ok(Json(state.vault.list_secrets(&caller, &query.prefix).await?))
}

async fn read_secret(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(path): Path<String>,
) -> Result<Json<Secret>, AppError> {
    Ok(Json(state.vault.read_secret(&caller, &path).await?))
}

async fn read_previous(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(path): Path<String>,
) -> Result<Json<Secret>, AppError> {
    Ok(Json(state.vault.read_previous_secret(&caller, &path).await?))
}

async fn write_secret(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(path): Path<String>,
    Json(body): Json<WriteSecretRequest>,
) -> Result<(StatusCode, Json<SecretWrite>), AppError> {
    let written = state.vault.write_secret(&caller, &path, &body.value).await?;
    let status = if written.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(written)))
}

async fn delete_secret(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(path): Path<String>,
) -> Result<StatusCode, AppError> {
    state.vault.delete_secret(&caller, &path).await?;
    Ok(StatusCode::NO_CONTENT)
}
