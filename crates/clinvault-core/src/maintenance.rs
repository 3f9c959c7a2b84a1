//! Background maintenance jobs run by the [`Scheduler`](crate::scheduler::Scheduler).
//!
//! Every job holds the shared [`Vault`] and skips its run while sealed.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;

use crate::error::VaultError;
use crate::scheduler::{Job, JobReport};
use crate::vault::Vault;

const SEALED: &str = "vault is sealed";

/// Revokes expired leases and expired dynamic credentials.
pub struct LeaseSweepJob {
    vault: Arc<Vault>,
    interval: Duration,
}

impl LeaseSweepJob {
    #[must_use]
    pub fn new(vault: Arc<Vault>, interval: Duration) -> Self {
        Self { vault, interval }
    }
}

#[async_trait::async_trait]
impl Job for LeaseSweepJob {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "lease_sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<JobReport, VaultError> {
        if !self.vault.is_unsealed().await {
            return Ok(JobReport::skipped(SEALED));
        }
        let revoked = self.vault.sweep_leases().await?;
        Ok(JobReport::processed(revoked, "expired leases revoked"))
    }
}

/// Deletes expired and exhausted tokens.
pub struct TokenSweepJob {
    vault: Arc<Vault>,
    interval: Duration,
}

impl TokenSweepJob {
    #[must_use]
    pub fn new(vault: Arc<Vault>, interval: Duration) -> Self {
        Self { vault, interval }
    }
}

#[async_trait::async_trait]
impl Job for TokenSweepJob {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "token_sweep"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<JobReport, VaultError> {
        if !self.vault.is_unsealed().await {
            return Ok(JobReport::skipped(SEALED));
        }
        let removed = self.vault.sweep_tokens().await?;
        Ok(JobReport::processed(removed, "stale tokens removed"))
    }
}

/// Rotates overdue secrets that have automatic rotation on.
pub struct SecretRotationJob {
    vault: Arc<Vault>,
    interval: Duration,
}

impl SecretRotationJob {
    #[must_use]
    pub fn new(vault: Arc<Vault>, interval: Duration) -> Self {
        Self { vault, interval }
    }
}

#[async_trait::async_trait]
impl Job for SecretRotationJob {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "secret_rotation"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<JobReport, VaultError> {
        if !self.vault.is_unsealed().await {
            return Ok(JobReport::skipped(SEALED));
        }
        let summary = self.vault.run_due_rotations().await?;
        Ok(JobReport::processed(
            summary.total,
            format!("{} rotated, {} failed", summary.succeeded, summary.failed),
        ))
    }
}

/// Revokes A/B credentials past their grace period and rotates the active
/// one when it is about to expire.
pub struct DbCredentialJob {
    vault: Arc<Vault>,
    interval: Duration,
    threshold: TimeDelta,
}

impl DbCredentialJob {
    /// `threshold` is how close to expiry the active credential may get
    /// before it is rotated.
    #[must_use]
    pub fn new(vault: Arc<Vault>, interval: Duration, threshold: TimeDelta) -> Self {
        Self {
            vault,
            interval,
            threshold,
        }
    }
}

#[async_trait::async_trait]
impl Job for DbCredentialJob {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "db_credential"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<JobReport, VaultError> {
        if !self.vault.is_unsealed().await {
            return Ok(JobReport::skipped(SEALED));
        }
        let done = self.vault.maintain_db_credentials(self.threshold).await?;
        let rotated = usize::from(done.rotation.is_some());
        Ok(JobReport::processed(
            done.revoked + rotated,
            format!("{} revoked, {rotated} rotated", done.revoked),
        ))
    }
}

/// Rotates DEKs older than `max_age` and re-encrypts the tables using them.
pub struct DekRotationJob {
    vault: Arc<Vault>,
    interval: Duration,
    max_age: TimeDelta,
}

impl DekRotationJob {
    #[must_use]
    pub fn new(vault: Arc<Vault>, interval: Duration, max_age: TimeDelta) -> Self {
        Self {
            vault,
            interval,
            max_age,
        }
    }
}

#[async_trait::async_trait]
impl Job for DekRotationJob {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "dek_rotation"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> Result<JobReport, VaultError> {
        if !self.vault.is_unsealed().await {
            return Ok(JobReport::skipped(SEALED));
        }
        let done = self.vault.rotate_stale_deks(self.max_age).await?;
        let rewritten: u64 = done.reencrypted.iter().map(|r| r.rewritten_rows).sum();
        Ok(JobReport::processed(
            done.rotated.len(),
            format!("{} purposes rotated, {rewritten} rows rewritten", done.rotated.len()),
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use clinvault_storage::MemoryBackend;
    use serde_json::json;

    use super::*;
    use crate::audit::AuditActor;
    use crate::crypto::KdfParams;
    use crate::records::EncryptionConfigInput;
    use crate::scheduler::Scheduler;
    use crate::vault::{VaultOptions, VaultPlugins};
    use crate::dek::DekPurpose;

    async fn vault() -> (Arc<Vault>, crate::vault::Caller) {
        let options = VaultOptions {
            kdf: KdfParams::minimal(),
            ..VaultOptions::default()
        };
        let vault = Arc::new(Vault::new(
            Arc::new(MemoryBackend::new()),
            options,
            VaultPlugins::default(),
        ));
        let init = vault
            .initialize("pw", "admin", &AuditActor::default())
            .await
            .unwrap();
        let root = vault.authenticate(&init.root_token, None).await.unwrap();
        (vault, root)
    }

    // ── sealed ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn every_job_skips_while_sealed() {
        let (vault, root) = vault().await;
        vault.seal(&root).await.unwrap();

        let minute = Duration::from_secs(60);
        let jobs: Vec<Arc<dyn Job>> = vec![
            Arc::new(LeaseSweepJob::new(vault.clone(), minute)),
            Arc::new(TokenSweepJob::new(vault.clone(), minute)),
            Arc::new(SecretRotationJob::new(vault.clone(), minute)),
            Arc::new(DbCredentialJob::new(vault.clone(), minute, TimeDelta::hours(1))),
            Arc::new(DekRotationJob::new(vault.clone(), minute, TimeDelta::days(90))),
        ];
        for job in jobs {
            let report = job.run().await.unwrap();
            assert!(report.skipped, "{} ran while sealed", job.name());
        }
    }

    // ── sweeps ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn lease_sweep_revokes_expired_lease() {
        let (vault, root) = vault().await;
        vault.write_secret(&root, "app/key", "v").await.unwrap();
        let lease = vault.create_lease(&root, "app/key", 1, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let job = LeaseSweepJob::new(vault.clone(), Duration::from_secs(60));
        let report = job.run().await.unwrap();
        assert_eq!(report.processed, 1);
        assert!(vault.lookup_lease(&root, &lease.lease_id).await.unwrap().revoked);

        let again = job.run().await.unwrap();
        assert_eq!(again.processed, 0);
    }

    #[tokio::test]
    async fn dek_job_rotates_and_reencrypts() {
        let (vault, root) = vault().await;
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
        let row = json!({ "ssn": "123-45-6789" }).as_object().unwrap().clone();
        vault.put_record(&root, "patients", "p1", row).await.unwrap();

        let job = DekRotationJob::new(vault.clone(), Duration::from_secs(60), TimeDelta::zero());
        let report = job.run().await.unwrap();
        assert_eq!(report.processed, DekPurpose::ALL.len());

        let progress = vault.reencrypt_progress(&root).await.unwrap();
        assert!(progress.iter().any(|p| p.table == "patients" && p.is_complete && p.rewritten_rows == 1));
    }

    #[tokio::test]
    async fn scheduler_runs_registered_jobs() {
        let (vault, _root) = vault().await;
        let mut scheduler = Scheduler::new(Duration::from_secs(1))
            .with_job(Arc::new(TokenSweepJob::new(vault.clone(), Duration::from_secs(60))))
            .with_job(Arc::new(DbCredentialJob::new(
                vault.clone(),
                Duration::from_secs(60),
                TimeDelta::hours(1),
            )));
        let outcomes = scheduler.tick_once(Utc::now()).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.succeeded));
    }
}
