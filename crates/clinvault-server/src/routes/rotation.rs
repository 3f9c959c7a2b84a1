//! Rotation routes: secret schedules (`/v1/rotation`), DEKs (`/v1/dek`) and
//! the A/B database credential (`/v1/db-credential`).

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;

use clinvault_core::Caller;
use clinvault_core::db_rotation::{
    ActiveCredentials, DbRotationConfig, DbRotationResult, DbRotationStatus,
};
use clinvault_core::dek::{DekPurpose, DekRotation, DekStatus};
use clinvault_core::records::{ReEncryptProgress, ReEncryptReport};
use clinvault_core::rotation::{RotationHistoryEntry, RotationSchedule, ScheduleInput};

use crate::error::AppError;
use crate::state::AppState;

/// Mounted at `/v1/rotation`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/schedules",
            get(list_schedules)
                .post(upsert_schedule)
                .delete(remove_schedule),
        )
        .route("/overdue", get(overdue))
        .route("/rotate-now", post(rotate_now))
        .route("/history", get(history))
}

/// Mounted at `/v1/dek`.
pub fn dek_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/rotate", post(rotate_dek))
        .route("/status", get(dek_status))
        .route("/re-encrypt", post(re_encrypt))
        .route("/re-encrypt/progress", get(reencrypt_progress))
}

/// Mounted at `/v1/db-credential`.
pub fn db_credential_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/configure", post(configure_db))
        .route("/rotate", post(rotate_db))
        .route("/status", get(db_status))
        .route("/active", get(db_active))
}

// ── Request types ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct RotateNowRequest {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct RotateDekRequest {
    pub purpose: DekPurpose,
}

#[derive(Debug, Deserialize)]
pub struct ReEncryptRequest {
    pub purpose: DekPurpose,
    pub table: String,
}

// ── Secret schedules ─────────────────────────────────────────────────

async fn list_schedules(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Vec<RotationSchedule>>, AppError> {
    Ok(Json(state.vault.list_schedules(&caller).await?))
}

async fn upsert_schedule(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<ScheduleInput>,
) -> Result<Json<RotationSchedule>, AppError> {
    Ok(Json(state.vault.upsert_schedule(&caller, body).await?))
}

/// Deactivates the schedule; history is kept.
async fn remove_schedule(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<PathQuery>,
) -> Result<Json<RotationSchedule>, AppError> {
    Ok(Json(state.vault.remove_schedule(&caller, &query.path).await?))
}

async fn overdue(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Vec<RotationSchedule>>, AppError> {
    Ok(Json(state.vault.overdue_rotations(&caller).await?))
}

async fn rotate_now(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<RotateNowRequest>,
) -> Result<Json<RotationHistoryEntry>, AppError> {
    Ok(Json(state.vault.rotate_secret(&caller, &body.path).await?))
}

async fn history(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Vec<RotationHistoryEntry>>, AppError> {
    Ok(Json(state.vault.rotation_history(&caller, &query.path).await?))
}

// ── DEKs ─────────────────────────────────────────────────────────────

async fn rotate_dek(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<RotateDekRequest>,
) -> Result<Json<DekRotation>, AppError> {
    Ok(Json(state.vault.rotate_dek(&caller, body.purpose).await?))
}

async fn dek_status(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Vec<DekStatus>>, AppError> {
    Ok(Json(state.vault.dek_status(&caller).await?))
}

/// Runs to completion and returns the final counters. Safe to repeat.
async fn re_encrypt(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<ReEncryptRequest>,
) -> Result<Json<ReEncryptReport>, AppError> {
    Ok(Json(
        state
            .vault
            .re_encrypt(&caller, body.purpose, &body.table)
            .await?,
    ))
}

async fn reencrypt_progress(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Vec<ReEncryptProgress>>, AppError> {
    Ok(Json(state.vault.reencrypt_progress(&caller).await?))
}

// ── A/B database credential ──────────────────────────────────────────

async fn configure_db(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<DbRotationConfig>,
) -> Result<Json<DbRotationStatus>, AppError> {
    Ok(Json(state.vault.configure_db_rotation(&caller, body).await?))
}

async fn rotate_db(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<DbRotationResult>, AppError> {
    Ok(Json(state.vault.rotate_db_credential(&caller).await?))
}

async fn db_status(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<DbRotationStatus>, AppError> {
    Ok(Json(state.vault.db_rotation_status(&caller).await?))
}

async fn db_active(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<ActiveCredentials>, AppError> {
    Ok(Json(state.vault.db_active_credentials(&caller).await?))
}
