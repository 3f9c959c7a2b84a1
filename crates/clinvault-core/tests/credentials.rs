//! Dynamic credential expiry and A/B database credential rotation through
//! the `Vault` facade, against the in-memory credential backend.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use clinvault_core::audit::AuditActor;
use clinvault_core::credentials::{
    AdminCredentials, CredentialBackend, CredentialRequest, DbTarget, MemoryCredentialBackend,
};
use clinvault_core::crypto::KdfParams;
use clinvault_core::db_rotation::{DbRotationConfig, Slot};
use clinvault_core::error::ErrorKind;
use clinvault_core::{Caller, Vault, VaultOptions, VaultPlugins};
use clinvault_storage::MemoryBackend;

async fn vault_with(backend: Arc<MemoryCredentialBackend>) -> (Vault, Caller) {
    let options = VaultOptions {
        kdf: KdfParams::minimal(),
        provision_timeout: Duration::from_millis(500),
        ..VaultOptions::default()
    };
    let plugins = VaultPlugins {
        credential_backends: vec![backend as Arc<dyn CredentialBackend>],
        ..VaultPlugins::default()
    };
    let vault = Vault::new(Arc::new(MemoryBackend::new()), options, plugins);
    let init = vault
        .initialize("pw", "admin", &AuditActor::default())
        .await
        .unwrap();
    let root = vault.authenticate(&init.root_token, None).await.unwrap();
    (vault, root)
}

fn admin() -> AdminCredentials {
    AdminCredentials {
        username: "postgres".to_owned(),
        password: "admin-pass".to_owned(),
    }
}

fn target() -> DbTarget {
    DbTarget {
        host: "db.internal".to_owned(),
        port: 5432,
        database: "ehr".to_owned(),
    }
}

fn request(ttl_secs: u64) -> CredentialRequest {
    CredentialRequest {
        backend: "postgres".to_owned(),
        admin: admin(),
        target: target(),
        ttl_secs,
        read_only: true,
    }
}

// ── dynamic credentials ──────────────────────────────────────────────

#[tokio::test]
async fn expired_credentials_are_swept_from_the_database() {
    let backend = Arc::new(MemoryCredentialBackend::new("postgres"));
    let (vault, root) = vault_with(Arc::clone(&backend)).await;

    let short = vault.create_credential(&root, request(1)).await.unwrap();
    let long = vault.create_credential(&root, request(3600)).await.unwrap();
    assert!(backend.has_account(&short.username).await);
    assert!(short.username.starts_with("v_postgres_"));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let swept = vault.sweep_leases().await.unwrap();
    assert_eq!(swept, 1);

    assert!(!backend.has_account(&short.username).await);
    assert!(backend.has_account(&long.username).await);

    let info = vault.get_credential(&root, &short.credential_id).await.unwrap();
    assert!(info.revoked);
    let lease = vault.lookup_lease(&root, &short.lease_id).await.unwrap();
    assert!(lease.revoked);
}

#[tokio::test]
async fn failed_provisioning_leaves_no_account_behind() {
    let backend = Arc::new(MemoryCredentialBackend::new("postgres"));
    let (vault, root) = vault_with(Arc::clone(&backend)).await;
    backend.set_fail_provision(true).await;

    let err = vault.create_credential(&root, request(60)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProviderUnavailable);
    assert!(backend.accounts().await.is_empty());
    assert!(vault.list_credentials(&root).await.unwrap().is_empty());
}

#[tokio::test]
async fn revoking_the_lease_drops_the_account() {
    let backend = Arc::new(MemoryCredentialBackend::new("postgres"));
    let (vault, root) = vault_with(Arc::clone(&backend)).await;
    let issued = vault.create_credential(&root, request(600)).await.unwrap();

    let lease = vault.revoke_lease(&root, &issued.lease_id).await.unwrap();
    assert!(lease.revoked);
    assert!(!backend.has_account(&issued.username).await);

    let leased = vault.leased_secret(&root, &issued.lease_id).await.unwrap_err();
    assert_eq!(leased.kind(), ErrorKind::ExpiredOrRevoked);
}

// ── A/B rotation ─────────────────────────────────────────────────────

#[tokio::test]
async fn ab_rotation_keeps_exactly_one_slot_active() {
    let backend = Arc::new(MemoryCredentialBackend::new("postgres"));
    let (vault, root) = vault_with(Arc::clone(&backend)).await;
    vault
        .configure_db_rotation(
            &root,
            DbRotationConfig {
                backend: "postgres".to_owned(),
                admin: admin(),
                target: target(),
                ttl_secs: 3600,
                grace_period_secs: 0,
                read_only: false,
            },
        )
        .await
        .unwrap();

    let first = vault.rotate_db_credential(&root).await.unwrap();
    let second = vault.rotate_db_credential(&root).await.unwrap();
    assert_ne!(first.active_slot, second.active_slot);
    assert_eq!(second.rotation_count, 2);

    let status = vault.db_rotation_status(&root).await.unwrap();
    assert!(status.slot_a_active ^ status.slot_b_active);
    assert_eq!(status.pending_revocations.len(), 1);

    let active = vault.db_active_credentials(&root).await.unwrap();
    assert_eq!(active.username, second.username);
    assert!(!active.password.is_empty());
    assert!(backend.has_account(&active.username).await);

    // Zero grace: the retired credential goes on the next maintenance pass.
    let done = vault.maintain_db_credentials(TimeDelta::minutes(5)).await.unwrap();
    assert_eq!(done.revoked, 1);
    assert!(done.rotation.is_none());
    assert!(!backend.has_account(&first.username).await);
    assert!(backend.has_account(&second.username).await);

    let status = vault.db_rotation_status(&root).await.unwrap();
    assert!(status.pending_revocations.is_empty());
    let inactive = if status.active_slot == Slot::A { Slot::B } else { Slot::A };
    assert!(
        status
            .slots
            .iter()
            .find(|s| s.slot == inactive)
            .unwrap()
            .username
            .is_none()
    );
}

#[tokio::test]
async fn maintenance_rotates_credential_nearing_expiry() {
    let backend = Arc::new(MemoryCredentialBackend::new("postgres"));
    let (vault, root) = vault_with(Arc::clone(&backend)).await;
    vault
        .configure_db_rotation(
            &root,
            DbRotationConfig {
                backend: "postgres".to_owned(),
                admin: admin(),
                target: target(),
                ttl_secs: 600,
                grace_period_secs: 300,
                read_only: true,
            },
        )
        .await
        .unwrap();

    // Empty active slot counts as due.
    let first = vault.maintain_db_credentials(TimeDelta::minutes(1)).await.unwrap();
    assert!(first.rotation.is_some());

    let quiet = vault.maintain_db_credentials(TimeDelta::minutes(1)).await.unwrap();
    assert!(quiet.rotation.is_none());

    let due = vault.maintain_db_credentials(TimeDelta::hours(1)).await.unwrap();
    assert_eq!(due.rotation.unwrap().rotation_count, 2);
}
