//! Access policy routes: path policies (`/v1/policies`), user assignments
//! (`/v1/policy-assignments`) and field access rules (`/v1/field-access`).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get};
use axum::{Extension, Json, Router};
use serde::Deserialize;

use clinvault_core::Caller;
use clinvault_core::field_access::{FieldAccessInput, FieldAccessPolicy};
use clinvault_core::policy::{Policy, PolicyAssignment, PolicyInput};

use crate::error::AppError;
use crate::state::AppState;

/// Mounted at `/v1/policies`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_policies).post(put_policy))
        .route("/{name}", get(get_policy).delete(delete_policy))
}

/// Mounted at `/v1/policy-assignments`.
pub fn assignment_router() -> Router<Arc<AppState>> {
    Router::new().route(
        "/{user_id}",
        get(get_assignment)
            .put(set_assignment)
            .delete(delete_assignment),
    )
}

/// Mounted at `/v1/field-access`.
pub fn field_access_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_field_access).post(put_field_access))
        .route("/{table}/{field}/{role}", delete(delete_field_access))
}

#[derive(Debug, Deserialize)]
pub struct AssignmentRequest {
    pub policies: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct TableQuery {
    #[serde(default)]
    pub table: Option<String>,
}

// ── Policies ─────────────────────────────────────────────────────────

async fn list_policies(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Vec<Policy>>, AppError> {
    Ok(Json(state.vault.list_policies(&caller).await?))
}

async fn put_policy(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<PolicyInput>,
) -> Result<Json<Policy>, AppError> {
    Ok(Json(state.vault.put_policy(&caller, body).await?))
}

async fn get_policy(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
) -> Result<Json<Policy>, AppError> {
    Ok(Json(state.vault.get_policy(&caller, &name).await?))
}

async fn delete_policy(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state.vault.delete_policy(&caller, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Assignments ──────────────────────────────────────────────────────

async fn get_assignment(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(user_id): Path<String>,
) -> Result<Json<PolicyAssignment>, AppError> {
    Ok(Json(state.vault.get_assignment(&caller, &user_id).await?))
}

async fn set_assignment(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(user_id): Path<String>,
    Json(body): Json<AssignmentRequest>,
) -> Result<Json<PolicyAssignment>, AppError> {
    Ok(Json(
        state
            .vault
            .set_assignment(&caller, &user_id, body.policies)
            .await?,
    ))
}

async fn delete_assignment(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(user_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.vault.delete_assignment(&caller, &user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Field access ─────────────────────────────────────────────────────

async fn list_field_access(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<TableQuery>,
) -> Result<Json<Vec<FieldAccessPolicy>>, AppError> {
    Ok(Json(
        state
            .vault
            .list_field_access(&caller, query.table.as_deref())
            .await?,
    ))
}

async fn put_field_access(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<FieldAccessInput>,
) -> Result<Json<FieldAccessPolicy>, AppError> {
    Ok(Json(state.vault.put_field_access(&caller, body).await?))
}

async fn delete_field_access(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path((table, field, role)): Path<(String, String, String)>,
) -> Result<StatusCode, AppError> {
    state
        .vault
        .delete_field_access(&caller, &table, &field, &role)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
