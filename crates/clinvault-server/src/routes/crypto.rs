//! Envelope encryption routes: `/v1/crypto/*`
//!
//! Payloads travel as standard base64. Envelopes are returned and accepted
//! in their stored form (`ciphertext`, `iv`, `dek_version`, `purpose`).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use clinvault_core::Caller;
use clinvault_core::dek::{DekPurpose, Envelope};

use super::{decode_b64, encode_b64};
use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/encrypt", post(encrypt))
        .route("/decrypt", post(decrypt))
        .route("/wrap", post(wrap))
        .route("/unwrap", post(unwrap))
}

#[derive(Deserialize)]
pub struct EncryptRequest {
    #[serde(default = "default_purpose")]
    pub purpose: DekPurpose,
    /// Base64 plaintext.
    pub plaintext: String,
}

fn default_purpose() -> DekPurpose {
    DekPurpose::Data
}

#[derive(Deserialize)]
pub struct WrapRequest {
    pub key_name: String,
    /// Base64 key material.
    pub material: String,
}

#[derive(Deserialize)]
pub struct UnwrapRequest {
    pub key_name: String,
    pub envelope: Envelope,
}

#[derive(Serialize)]
pub struct PlaintextResponse {
    pub plaintext: String,
}

#[derive(Serialize)]
pub struct MaterialResponse {
    pub material: String,
}

async fn encrypt(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<EncryptRequest>,
) -> Result<Json<Envelope>, AppError> {
    let plaintext = decode_b64("plaintext", &body.plaintext)?;
    Ok(Json(state.vault.encrypt(&caller, body.purpose, &plaintext).await?))
}

async fn decrypt(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(envelope): Json<Envelope>,
) -> Result<Json<PlaintextResponse>, AppError> {
    let plaintext = state.vault.decrypt(&caller, &envelope).await?;
    Ok(Json(PlaintextResponse {
        plaintext: encode_b64(&plaintext),
    }))
}

async fn wrap(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<WrapRequest>,
) -> Result<Json<Envelope>, AppError> {
    let material = decode_b64("material", &body.material)?;
    Ok(Json(
        state.vault.wrap_key(&caller, &material, &body.key_name).await?,
    ))
}

async fn unwrap(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(body): Json<UnwrapRequest>,
) -> Result<Json<MaterialResponse>, AppError> {
    let material = state
        .vault
        .unwrap_key(&caller, &body.envelope, &body.key_name)
        .await?;
    Ok(Json(MaterialResponse {
        material: encode_b64(&material),
    }))
}
