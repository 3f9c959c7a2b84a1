//! End-to-end tests of the seal lifecycle, secrets, tokens and audit through
//! the `Vault` facade.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use clinvault_core::audit::{AuditActor, AuditQuery};
use clinvault_core::crypto::KdfParams;
use clinvault_core::dek::DekPurpose;
use clinvault_core::error::ErrorKind;
use clinvault_core::records::EncryptionConfigInput;
use clinvault_core::token::CreateToken;
use clinvault_core::unseal::{ProviderSpec, UnsealInput};
use clinvault_core::{Caller, Vault, VaultOptions, VaultPlugins};
use clinvault_storage::{MemoryBackend, StorageBackend};
use serde_json::{Map, Value, json};

const PASSWORD: &str = "hunter2-but-longer";

fn options() -> VaultOptions {
    VaultOptions {
        kdf: KdfParams::minimal(),
        audit_hmac_key: Some(b"test-audit-key".to_vec()),
        ..VaultOptions::default()
    }
}

async fn initialized(storage: Arc<dyn StorageBackend>) -> (Vault, Caller) {
    let vault = Vault::new(storage, options(), VaultPlugins::default());
    let init = vault
        .initialize(PASSWORD, "admin", &AuditActor::default())
        .await
        .unwrap();
    let root = vault.authenticate(&init.root_token, None).await.unwrap();
    (vault, root)
}

// ── seal lifecycle ───────────────────────────────────────────────────

#[tokio::test]
async fn secrets_survive_restart_and_password_unseal() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let (vault, root) = initialized(Arc::clone(&storage)).await;
    vault.write_secret(&root, "ehr/db/password", "pg-pass").await.unwrap();
    vault.write_secret(&root, "ehr/db/password", "pg-pass-2").await.unwrap();
    drop(vault);

    let restarted = Vault::new(Arc::clone(&storage), options(), VaultPlugins::default());
    let status = restarted.status().await.unwrap();
    assert!(status.initialized);
    assert!(status.sealed);

    let failed = restarted
        .unseal(
            None,
            UnsealInput {
                password: Some("wrong"),
                ..UnsealInput::default()
            },
            &AuditActor::default(),
        )
        .await
        .unwrap();
    assert!(!failed.success);
    assert!(!restarted.is_unsealed().await);

    let outcome = restarted
        .unseal(
            None,
            UnsealInput {
                password: Some(PASSWORD),
                ..UnsealInput::default()
            },
            &AuditActor::default(),
        )
        .await
        .unwrap();
    assert!(outcome.success);

    let page = restarted
        .audit_log()
        .query(&AuditQuery {
            action: Some("vault.unseal".to_owned()),
            ..AuditQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 2, "one failed and one successful unseal");

    let secret = restarted.read_secret(&root, "ehr/db/password").await.unwrap();
    assert_eq!(secret.value, "pg-pass-2");
    assert_eq!(secret.version, 2);
}

#[tokio::test]
async fn shamir_shares_unseal_at_threshold() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let (vault, root) = initialized(Arc::clone(&storage)).await;
    let configured = vault
        .configure_provider(
            &root,
            "shamir",
            10,
            ProviderSpec::Shamir {
                shares: 5,
                threshold: 3,
            },
        )
        .await
        .unwrap();
    assert_eq!(configured.shares.len(), 5);
    assert_eq!(vault.list_providers(&root).await.unwrap().len(), 2);

    vault.seal(&root).await.unwrap();

    let too_few = vault
        .unseal(
            Some("shamir"),
            UnsealInput {
                shares: &configured.shares[..2],
                ..UnsealInput::default()
            },
            &AuditActor::default(),
        )
        .await
        .unwrap();
    assert!(!too_few.success);

    let outcome = vault
        .unseal(
            Some("shamir"),
            UnsealInput {
                shares: &configured.shares[1..4],
                ..UnsealInput::default()
            },
            &AuditActor::default(),
        )
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.provider_id.as_deref(), Some("shamir"));
}

#[tokio::test]
async fn sealed_vault_refuses_every_protected_operation() {
    let (vault, root) = initialized(Arc::new(MemoryBackend::new())).await;
    vault.write_secret(&root, "a/b", "c").await.unwrap();
    let envelope = vault.encrypt(&root, DekPurpose::Data, b"phi").await.unwrap();
    vault.seal(&root).await.unwrap();

    assert_eq!(vault.read_secret(&root, "a/b").await.unwrap_err().kind(), ErrorKind::Sealed);
    assert_eq!(
        vault.write_secret(&root, "a/b", "d").await.unwrap_err().kind(),
        ErrorKind::Sealed
    );
    assert_eq!(
        vault.encrypt(&root, DekPurpose::Data, b"x").await.unwrap_err().kind(),
        ErrorKind::Sealed
    );
    assert_eq!(vault.decrypt(&root, &envelope).await.unwrap_err().kind(), ErrorKind::Sealed);
    assert_eq!(
        vault.create_lease(&root, "a/b", 60, true).await.unwrap_err().kind(),
        ErrorKind::Sealed
    );
    assert_eq!(vault.list_tokens(&root).await.unwrap_err().kind(), ErrorKind::Sealed);
}

#[tokio::test]
async fn initialize_twice_is_rejected() {
    let (vault, _root) = initialized(Arc::new(MemoryBackend::new())).await;
    let err = vault
        .initialize(PASSWORD, "admin", &AuditActor::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

// ── tokens & audit ───────────────────────────────────────────────────

#[tokio::test]
async fn token_plaintext_is_only_returned_at_creation() {
    let (vault, root) = initialized(Arc::new(MemoryBackend::new())).await;
    let created = vault
        .create_token(
            &root,
            CreateToken {
                display_name: "billing".to_owned(),
                ttl_secs: Some(3600),
                ..CreateToken::default()
            },
        )
        .await
        .unwrap();

    let listed = serde_json::to_string(&vault.list_tokens(&root).await.unwrap()).unwrap();
    assert!(!listed.contains(&created.token));
    assert!(listed.contains(&created.info.accessor));

    let audit = serde_json::to_string(
        &vault
            .query_audit(&root, &AuditQuery::default())
            .await
            .unwrap()
            .entries,
    )
    .unwrap();
    assert!(!audit.contains(&created.token));

    vault.revoke_token(&root, &created.info.accessor).await.unwrap();
    let err = vault.authenticate(&created.token, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExpiredOrRevoked);
}

#[tokio::test]
async fn audit_never_records_secret_plaintext() {
    let (vault, root) = initialized(Arc::new(MemoryBackend::new())).await;
    vault
        .write_secret(&root, "labs/api-key", "very-secret-value")
        .await
        .unwrap();
    vault.read_secret(&root, "labs/api-key").await.unwrap();

    let page = vault
        .query_audit(
            &root,
            &AuditQuery {
                action: Some("secret".to_owned()),
                ..AuditQuery::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.total, 2);
    let text = serde_json::to_string(&page.entries).unwrap();
    assert!(!text.contains("very-secret-value"));
    assert!(text.contains("value_hmac"));
}

#[tokio::test]
async fn envelope_survives_dek_rotation() {
    let (vault, root) = initialized(Arc::new(MemoryBackend::new())).await;
    let before = vault.encrypt(&root, DekPurpose::Session, b"session-1").await.unwrap();
    let rotation = vault.rotate_dek(&root, DekPurpose::Session).await.unwrap();
    assert_eq!(rotation.new_version, before.dek_version + 1);

    let after = vault.encrypt(&root, DekPurpose::Session, b"session-2").await.unwrap();
    assert_eq!(after.dek_version, rotation.new_version);
    assert_eq!(vault.decrypt(&root, &before).await.unwrap(), b"session-1");
    assert_eq!(vault.decrypt(&root, &after).await.unwrap(), b"session-2");
}

#[tokio::test]
async fn data_rotation_then_re_encrypt_moves_rows_to_new_version() {
    let (vault, root) = initialized(Arc::new(MemoryBackend::new())).await;
    vault
        .put_encryption_config(
            &root,
            EncryptionConfigInput {
                table_name: "patients".to_owned(),
                encrypted_fields: vec!["ssn".to_owned()],
                dek_purpose: DekPurpose::Data,
                is_enabled: true,
                is_default: false,
                description: String::new(),
            },
        )
        .await
        .unwrap();

    let mut row = Map::new();
    row.insert("name".to_owned(), json!("Jane Roe"));
    row.insert("ssn".to_owned(), json!("123-45-6789"));
    let written = vault.put_record(&root, "patients", "p-1", row).await.unwrap();
    assert_eq!(written.encrypted_fields, vec!["ssn".to_owned()]);
    assert_eq!(written.dek_version, Some(1));
    let envelope = vault.encrypt(&root, DekPurpose::Data, b"lab result").await.unwrap();
    assert_eq!(envelope.dek_version, 1);

    let rotation = vault.rotate_dek(&root, DekPurpose::Data).await.unwrap();
    assert_eq!(rotation.new_version, 2);
    assert_eq!(
        vault.get_record(&root, "patients", "p-1").await.unwrap().dek_version,
        Some(1)
    );

    let report = vault.re_encrypt(&root, DekPurpose::Data, "patients").await.unwrap();
    assert_eq!(report.target_version, 2);
    assert_eq!(report.rewritten_rows, 1);
    assert_eq!(report.failed_rows, 0);
    assert!(report.is_complete);

    let view = vault.get_record(&root, "patients", "p-1").await.unwrap();
    assert_eq!(view.dek_version, Some(2));
    assert_eq!(view.fields["ssn"], Value::from("123-45-6789"));
    assert_eq!(view.fields["name"], Value::from("Jane Roe"));

    let progress = vault.reencrypt_progress(&root).await.unwrap();
    let patients = progress.iter().find(|p| p.table == "patients").unwrap();
    assert_eq!(patients.target_version, 2);
    assert!(patients.is_complete);

    // Envelopes made before the rotation still open under the retired version.
    assert_eq!(vault.decrypt(&root, &envelope).await.unwrap(), b"lab result");
    let again = vault.re_encrypt(&root, DekPurpose::Data, "patients").await.unwrap();
    assert_eq!(again.rewritten_rows, 0);
}
