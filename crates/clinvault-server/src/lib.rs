//! `clinvault` HTTP server.
//!
//! Exposes the [`Vault`](clinvault_core::Vault) facade as a JSON API under
//! `/v1`. The binary in `main.rs` adds storage selection, process hardening,
//! logging and the maintenance scheduler.

pub mod config;
pub mod error;
pub mod hardening;
pub mod middleware;
pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderName, HeaderValue, Method, header};
use axum::middleware as axum_mw;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::middleware::{TOKEN_HEADER, auth_middleware, client_ip};
use crate::state::AppState;

/// Build the router with every route and layer.
pub fn build_router(state: Arc<AppState>) -> Router {
    let authenticated = Router::new()
        .merge(routes::sys::router())
        .nest("/v1/secrets", routes::secrets::router())
        .nest("/v1/crypto", routes::crypto::router())
        .nest("/v1/leases", routes::leases::router())
        .nest("/v1/credentials", routes::credentials::router())
        .nest("/v1/tokens", routes::tokens::router())
        .nest("/v1/rotation", routes::rotation::router())
        .nest("/v1/dek", routes::rotation::dek_router())
        .nest("/v1/db-credential", routes::rotation::db_credential_router())
        .nest("/v1/policies", routes::policies::router())
        .nest(
            "/v1/policy-assignments",
            routes::policies::assignment_router(),
        )
        .nest("/v1/field-access", routes::policies::field_access_router())
        .nest("/v1/encryption-configs", routes::records::config_router())
        .nest("/v1/records", routes::records::router())
        .route("/v1/schema", get(routes::records::schema))
        .route("/v1/audit", get(routes::audit::query_audit))
        .route("/v1/compliance", get(routes::audit::compliance))
        .route_layer(axum_mw::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ));

    // init and unseal run the KDF; cap how many run at once.
    let public = routes::sys::public_router().layer(tower::limit::ConcurrencyLimitLayer::new(10));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(TOKEN_HEADER),
        ]);

    Router::new()
        .merge(public)
        .merge(routes::metrics::router())
        .merge(authenticated)
        .layer(axum_mw::from_fn(client_ip))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .with_state(state)
}
