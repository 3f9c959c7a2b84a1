//! Protected record routes: encryption configs (`/v1/encryption-configs`),
//! the schema view (`/v1/schema`) and records (`/v1/records`).
//!
//! Reads come back masked per the caller's role.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Extension, Json, Router};
use serde_json::{Map, Value};

use clinvault_core::Caller;
use clinvault_core::records::{
    EncryptionConfig, EncryptionConfigInput, RecordView, RecordWrite, TableSchema,
};

use crate::error::AppError;
use crate::state::AppState;

/// Mounted at `/v1/encryption-configs`.
pub fn config_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_configs).post(put_config))
        .route("/{table}", delete(delete_config))
}

/// Mounted at `/v1/records`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/{table}/{id}", get(get_record).put(put_record))
}

async fn list_configs(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Vec<EncryptionConfig>>, AppError> {
    Ok(Json(state.vault.list_encryption_configs(&caller).await?))
}

async fn put_config(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<EncryptionConfigInput>,
) -> Result<Json<EncryptionConfig>, AppError> {
    Ok(Json(state.vault.put_encryption_config(&caller, body).await?))
}

async fn delete_config(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(table): Path<String>,
) -> Result<StatusCode, AppError> {
    state.vault.delete_encryption_config(&caller, &table).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn schema(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Vec<TableSchema>>, AppError> {
    Ok(Json(state.vault.schema(&caller).await?))
}

async fn put_record(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path((table, id)): Path<(String, String)>,
    Json(fields): Json<Map<String, Value>>,
) -> Result<Json<RecordWrite>, AppError> {
    Ok(Json(state.vault.put_record(&caller, &table, &id, fields).await?))
}

async fn get_record(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path((table, id)): Path<(String, String)>,
) -> Result<Json<RecordView>, AppError> {
    Ok(Json(state.vault.get_record(&caller, &table, &id).await?))
}
