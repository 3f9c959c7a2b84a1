//! Audit and compliance routes: `/v1/audit`, `/v1/compliance`.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::{Extension, Json};

use clinvault_core::Caller;
use clinvault_core::audit::{AuditPage, AuditQuery};
use clinvault_core::compliance::ComplianceReport;

use crate::error::AppError;
use crate::state::AppState;

/// `GET /v1/audit?action=&from=&to=&page=&page_size=`
///
/// `action` matches exactly or as a dotted prefix (`secret` matches
/// `secret.read`).
pub(crate) async fn query_audit(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<AuditQuery>,
) -> Result<Json<AuditPage>, AppError> {
    Ok(Json(state.vault.query_audit(&caller, &query).await?))
}

pub(crate) async fn compliance(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<ComplianceReport>, AppError> {
    Ok(Json(state.vault.compliance(&caller).await?))
}
