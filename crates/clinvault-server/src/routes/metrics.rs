//! Prometheus metrics endpoint: `/v1/sys/metrics`
//!
//! Seal state gauges and the vault's operation counters in Prometheus text
//! format. No authentication, so scrapers need no token.

use std::fmt::Write as _;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;

use crate::state::AppState;

/// Build the `/v1/sys/metrics` router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/v1/sys/metrics", get(prometheus_metrics))
}

/// `GET /v1/sys/metrics`
///
/// Gauges: `clinvault_initialized`, `clinvault_sealed`, `clinvault_info`.
/// Counters: unseal attempts, DEK rotations, leases issued and revoked,
/// credential provisioning failures, policy denials, rejected tokens and
/// rotations by result.
async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (initialized, sealed) = match state.vault.status().await {
        Ok(s) => (s.initialized, s.sealed),
        Err(_) => (false, true),
    };
    let m = state.vault.metrics();

    let mut body = String::with_capacity(2048);
    gauge(&mut body, "clinvault_initialized", "Whether the vault has been initialized.", u64::from(initialized));
    gauge(&mut body, "clinvault_sealed", "Whether the vault is currently sealed.", u64::from(sealed));

    labelled_counter(
        &mut body,
        "clinvault_unseal_attempts_total",
        "Unseal provider attempts by result.",
        &[("success", m.unseal_succeeded), ("failure", m.unseal_failed)],
    );
    counter(&mut body, "clinvault_dek_rotations_total", "DEK rotations.", m.dek_rotations);
    counter(&mut body, "clinvault_leases_issued_total", "Leases issued.", m.leases_issued);
    counter(&mut body, "clinvault_leases_revoked_total", "Leases revoked.", m.leases_revoked);
    counter(
        &mut body,
        "clinvault_credential_provision_failures_total",
        "Dynamic credential provisioning failures.",
        m.credential_provision_failures,
    );
    counter(&mut body, "clinvault_policy_denials_total", "Requests denied by policy.", m.policy_denials);
    counter(
        &mut body,
        "clinvault_token_rejections_total",
        "Presented tokens that were unknown or no longer usable.",
        m.token_rejections,
    );
    labelled_counter(
        &mut body,
        "clinvault_rotations_total",
        "Secret and database credential rotations by result.",
        &[("success", m.rotations_succeeded), ("failure", m.rotations_failed)],
    );

    let _ = writeln!(body, "# HELP clinvault_info clinvault build information.");
    let _ = writeln!(body, "# TYPE clinvault_info gauge");
    let _ = writeln!(body, "clinvault_info{{version=\"{}\"}} 1", env!("CARGO_PKG_VERSION"));

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

fn gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn labelled_counter(out: &mut String, name: &str, help: &str, results: &[(&str, u64)]) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    for (result, value) in results {
        let _ = writeln!(out, "{name}{{result=\"{result}\"}} {value}");
    }
}
