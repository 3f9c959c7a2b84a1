//! `clinvault` server entry point.
//!
//! Hardens the process, opens storage, builds the vault, optionally
//! auto-unseals it, then serves the HTTP API with graceful shutdown. The
//! maintenance scheduler runs alongside and stops on the same signal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::TimeDelta;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use clinvault_core::audit::AuditActor;
use clinvault_core::audit_file::FileAuditBackend;
use clinvault_core::credentials::{CredentialBackend, MemoryCredentialBackend};
use clinvault_core::maintenance::{
    DbCredentialJob, DekRotationJob, LeaseSweepJob, SecretRotationJob, TokenSweepJob,
};
use clinvault_core::scheduler::Scheduler;
use clinvault_core::unseal::{KmsClient, SoftwareKms, UnsealInput};
use clinvault_core::{Vault, VaultPlugins};
use clinvault_storage::{MemoryBackend, StorageBackend};

use clinvault_server::config::{ServerConfig, StorageBackendType};
use clinvault_server::hardening;
use clinvault_server::state::AppState;

/// Rotate the A/B database credential when the active one has less than this
/// left.
const DB_ROTATION_THRESHOLD_MINUTES: i64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    // Before any key material exists and before logging is up.
    apply_hardening(&config);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    info!(config = ?config, "clinvault starting");

    let vault = Arc::new(build_vault(&config).await?);
    auto_unseal(&vault, &config).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = tokio::spawn(build_scheduler(&vault, &config).run(shutdown_rx));

    let app = clinvault_server::build_router(Arc::new(AppState::new(Arc::clone(&vault))));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "clinvault listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await
    .context("server error")?;

    info!("waiting for maintenance scheduler to stop");
    if tokio::time::timeout(Duration::from_secs(10), scheduler_handle)
        .await
        .is_err()
    {
        warn!("maintenance scheduler did not stop within 10s");
    }

    info!("clinvault stopped");
    Ok(())
}

async fn build_vault(config: &ServerConfig) -> anyhow::Result<Vault> {
    let storage: Arc<dyn StorageBackend> = match &config.storage_backend {
        StorageBackendType::Memory => {
            warn!("using in-memory storage, all data is lost on restart");
            Arc::new(MemoryBackend::new()) as Arc<dyn StorageBackend>
        }
        #[cfg(feature = "redb-backend")]
        StorageBackendType::Redb { path } => {
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let redb = clinvault_storage::RedbBackend::open(path)
                .with_context(|| format!("failed to open redb storage at {path}"))?;
            Arc::new(redb) as Arc<dyn StorageBackend>
        }
        #[cfg(not(feature = "redb-backend"))]
        StorageBackendType::Redb { .. } => {
            anyhow::bail!("redb storage requested but the redb-backend feature is disabled");
        }
    };

    let mut plugins = VaultPlugins::default();

    if let Some(hex_key) = &config.kms_key_hex {
        let kms = SoftwareKms::from_hex(hex_key).context("invalid CLINVAULT_KMS_KEY")?;
        plugins.kms = Some(Arc::new(kms) as Arc<dyn KmsClient>);
    }

    // The in-memory credential backend is a development stand-in for a real
    // database and only makes sense next to in-memory storage.
    if config.storage_backend == StorageBackendType::Memory {
        plugins
            .credential_backends
            .push(Arc::new(MemoryCredentialBackend::new("memory")) as Arc<dyn CredentialBackend>);
    }

    #[cfg(feature = "postgres")]
    plugins.credential_backends.push(Arc::new(
        clinvault_core::postgres_credentials::PostgresCredentialBackend::new("postgres"),
    ) as Arc<dyn CredentialBackend>);

    let vault = Vault::new(storage, config.vault_options(), plugins);

    if let Some(path) = &config.audit_file_path {
        vault
            .audit_log()
            .add_backend(Arc::new(FileAuditBackend::new(path)))
            .await;
        info!(path = %path, "file audit backend enabled");
    }

    Ok(vault)
}

/// Unseal with `CLINVAULT_UNSEAL_PASSWORD` if the vault is initialized. A
/// failure leaves the vault sealed for a manual unseal.
async fn auto_unseal(vault: &Vault, config: &ServerConfig) {
    let Some(password) = config.unseal_password.as_deref() else {
        return;
    };

    match vault.status().await {
        Ok(status) if status.initialized && status.sealed => {}
        Ok(_) => return,
        Err(e) => {
            warn!(error = %e, "could not read seal status, skipping auto-unseal");
            return;
        }
    }

    let input = UnsealInput {
        password: Some(password),
        ..UnsealInput::default()
    };
    match vault.unseal(None, input, &AuditActor::system()).await {
        Ok(outcome) if outcome.success => {
            info!(provider_id = ?outcome.provider_id, "auto-unseal succeeded");
        }
        Ok(outcome) => {
            warn!(attempts = outcome.attempts_total, "auto-unseal failed, vault stays sealed");
        }
        Err(e) => warn!(error = %e, "auto-unseal failed, vault stays sealed"),
    }
}

fn build_scheduler(vault: &Arc<Vault>, config: &ServerConfig) -> Scheduler {
    let mut scheduler = Scheduler::new(config.scheduler_tick)
        .with_job(Arc::new(LeaseSweepJob::new(
            Arc::clone(vault),
            config.lease_sweep_interval,
        )))
        .with_job(Arc::new(TokenSweepJob::new(
            Arc::clone(vault),
            config.lease_sweep_interval,
        )))
        .with_job(Arc::new(SecretRotationJob::new(
            Arc::clone(vault),
            config.rotation_interval,
        )))
        .with_job(Arc::new(DbCredentialJob::new(
            Arc::clone(vault),
            config.rotation_interval,
            TimeDelta::minutes(DB_ROTATION_THRESHOLD_MINUTES),
        )));

    if let Some(days) = config.dek_rotation_days {
        scheduler = scheduler.with_job(Arc::new(DekRotationJob::new(
            Arc::clone(vault),
            config.rotation_interval,
            TimeDelta::days(i64::from(days)),
        )));
    }

    info!(jobs = ?scheduler.job_names(), "maintenance scheduler configured");
    scheduler
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}

/// Runs before logging is initialized, hence `eprintln`.
#[allow(clippy::print_stderr)]
fn apply_hardening(config: &ServerConfig) {
    if let Err(e) = hardening::disable_core_dumps() {
        eprintln!("WARNING: failed to disable core dumps: {e}");
    }

    if config.disable_mlock {
        eprintln!("WARNING: mlock disabled via CLINVAULT_DISABLE_MLOCK, secrets may be swapped to disk");
    } else if let Err(e) = hardening::lock_memory() {
        eprintln!("WARNING: {e}");
    }
}
