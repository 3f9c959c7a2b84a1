//! Dynamic credential issuer.
//!
//! Creates short-lived database accounts on demand through a
//! [`CredentialBackend`], ties each to a lease and revokes them on expiry.
//! The generated password is returned once and never stored. The admin
//! password needed for later revocation is stored only as a `Data` DEK
//! envelope.
//!
//! Backend calls run under a timeout and no lock is held across them. A
//! failed or timed out provisioning triggers a compensating revoke and
//! leaves nothing behind in storage.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::barrier::Barrier;
use crate::crypto;
use crate::dek::{DekManager, DekPurpose, Envelope};
use crate::error::{CredentialError, LeaseError};
use crate::lease::{LeaseManager, LeaseResource};
use crate::metrics::VaultMetrics;

const CREDENTIAL_PREFIX: &str = "sys/credentials/";

/// Administrative login used to create and drop accounts.
#[derive(Clone, Deserialize)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// The database the account is created in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbTarget {
    pub host: String,
    pub port: u16,
    pub database: String,
}

/// The account a backend should create.
#[derive(Clone)]
pub struct AccountSpec {
    pub username: String,
    pub password: String,
    pub valid_until: DateTime<Utc>,
    pub read_only: bool,
}

impl fmt::Debug for AccountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountSpec")
            .field("username", &self.username)
            .field("valid_until", &self.valid_until)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

/// What a backend found when asked to drop an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    Dropped,
    NotFound,
}

/// A system that can create and drop login accounts.
#[async_trait::async_trait]
pub trait CredentialBackend: Send + Sync {
    /// Registry name, also embedded in generated usernames.
    fn name(&self) -> &str;

    /// Create the account.
    async fn provision(
        &self,
        admin: &AdminCredentials,
        target: &DbTarget,
        account: &AccountSpec,
    ) -> Result<(), CredentialError>;

    /// Drop the account if it exists.
    async fn revoke(
        &self,
        admin: &AdminCredentials,
        target: &DbTarget,
        username: &str,
    ) -> Result<RevokeOutcome, CredentialError>;
}

/// In-process backend that records accounts in a map.
///
/// Used in development and tests. Provisioning can be made to fail or stall
/// to exercise the compensation path.
#[derive(Default)]
pub struct MemoryCredentialBackend {
    name: String,
    accounts: Mutex<HashMap<String, AccountSpec>>,
    fail_provision: Mutex<bool>,
    provision_delay: Mutex<Option<Duration>>,
}

impl MemoryCredentialBackend {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Usernames that currently exist.
    pub async fn accounts(&self) -> Vec<String> {
        let mut names: Vec<String> = self.accounts.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `username` currently exists.
    pub async fn has_account(&self, username: &str) -> bool {
        self.accounts.lock().await.contains_key(username)
    }

    /// Make every following provision fail after creating the account.
    pub async fn set_fail_provision(&self, fail: bool) {
        *self.fail_provision.lock().await = fail;
    }

    /// Sleep this long inside every following provision.
    pub async fn set_provision_delay(&self, delay: Option<Duration>) {
        *self.provision_delay.lock().await = delay;
    }
}

#[async_trait::async_trait]
impl CredentialBackend for MemoryCredentialBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn provision(
        &self,
        _admin: &AdminCredentials,
        _target: &DbTarget,
        account: &AccountSpec,
    ) -> Result<(), CredentialError> {
        self.accounts
            .lock()
            .await
            .insert(account.username.clone(), account.clone());
        let delay = *self.provision_delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_provision.lock().await {
            return Err(CredentialError::Backend {
                backend: self.name.clone(),
                reason: "grant failed".to_owned(),
            });
        }
        Ok(())
    }

    async fn revoke(
        &self,
        _admin: &AdminCredentials,
        _target: &DbTarget,
        username: &str,
    ) -> Result<RevokeOutcome, CredentialError> {
        Ok(match self.accounts.lock().await.remove(username) {
            Some(_) => RevokeOutcome::Dropped,
            None => RevokeOutcome::NotFound,
        })
    }
}

impl fmt::Debug for MemoryCredentialBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryCredentialBackend")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Request to issue a credential.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialRequest {
    pub backend: String,
    pub admin: AdminCredentials,
    pub target: DbTarget,
    pub ttl_secs: u64,
    #[serde(default)]
    pub read_only: bool,
}

/// Returned once by [`CredentialIssuer::create`].
#[derive(Clone, Serialize)]
pub struct IssuedCredential {
    pub credential_id: String,
    pub lease_id: String,
    pub username: String,
    pub password: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for IssuedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCredential")
            .field("credential_id", &self.credential_id)
            .field("username", &self.username)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Persisted credential record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicCredential {
    pub id: String,
    pub lease_id: String,
    pub backend: String,
    pub username: String,
    pub target: DbTarget,
    pub read_only: bool,
    pub admin_username: String,
    pub admin_password: Envelope,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Public view of a credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialInfo {
    pub id: String,
    pub lease_id: String,
    pub backend: String,
    pub username: String,
    pub target: DbTarget,
    pub read_only: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub is_expired: bool,
}

impl From<&DynamicCredential> for CredentialInfo {
    fn from(c: &DynamicCredential) -> Self {
        Self {
            id: c.id.clone(),
            lease_id: c.lease_id.clone(),
            backend: c.backend.clone(),
            username: c.username.clone(),
            target: c.target.clone(),
            read_only: c.read_only,
            created_at: c.created_at,
            expires_at: c.expires_at,
            revoked: c.revoked,
            revoked_at: c.revoked_at,
            is_expired: Utc::now() >= c.expires_at,
        }
    }
}

/// Issues and revokes dynamic credentials.
pub struct CredentialIssuer {
    barrier: Arc<Barrier>,
    dek: Arc<DekManager>,
    leases: Arc<LeaseManager>,
    backends: HashMap<String, Arc<dyn CredentialBackend>>,
    provision_timeout: Duration,
    metrics: Arc<VaultMetrics>,
}

impl CredentialIssuer {
    #[must_use]
    pub fn new(
        barrier: Arc<Barrier>,
        dek: Arc<DekManager>,
        leases: Arc<LeaseManager>,
        backends: Vec<Arc<dyn CredentialBackend>>,
        provision_timeout: Duration,
    ) -> Self {
        let backends = backends
            .into_iter()
            .map(|b| (b.name().to_owned(), b))
            .collect();
        Self {
            barrier,
            dek,
            leases,
            backends,
            provision_timeout,
            metrics: Arc::new(VaultMetrics::new()),
        }
    }

    /// Count provisioning failures in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<VaultMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Registered backend names.
    #[must_use]
    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Provision a new account and lease it.
    ///
    /// # Errors
    ///
    /// - [`CredentialError::UnknownBackend`] if the backend is not registered.
    /// - [`CredentialError::InvalidRequest`] for a zero TTL or empty target.
    /// - [`CredentialError::Timeout`] / [`CredentialError::Backend`] if
    ///   provisioning fails. The account is revoked again in that case.
    pub async fn create(&self, request: CredentialRequest) -> Result<IssuedCredential, CredentialError> {
        let backend = self.backend(&request.backend)?;
        if request.ttl_secs == 0 {
            return Err(CredentialError::InvalidRequest {
                reason: "ttl_secs must be positive".to_owned(),
            });
        }
        if request.target.host.is_empty() || request.target.database.is_empty() {
            return Err(CredentialError::InvalidRequest {
                reason: "target host and database are required".to_owned(),
            });
        }

        let now = Utc::now();
        let expires_at = i64::try_from(request.ttl_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| CredentialError::InvalidRequest {
                reason: format!("ttl_secs {} is out of range", request.ttl_secs),
            })?;
        let account = AccountSpec {
            username: generate_username(backend.name()),
            password: BASE64.encode(crypto::random_bytes(24)),
            valid_until: expires_at,
            read_only: request.read_only,
        };

        let provisioned = tokio::time::timeout(
            self.provision_timeout,
            backend.provision(&request.admin, &request.target, &account),
        )
        .await;
        let provisioned = match provisioned {
            Ok(result) => result,
            Err(_) => Err(CredentialError::Timeout {
                backend: request.backend.clone(),
                timeout_secs: self.provision_timeout.as_secs(),
            }),
        };
        if let Err(e) = provisioned {
            self.metrics.record_provision_failure();
            warn!(backend = %request.backend, username = %account.username, error = %e, "provisioning failed, compensating");
            self.compensate(backend.as_ref(), &request, &account.username).await;
            return Err(e);
        }

        match self.record(&request, &account, now).await {
            Ok(issued) => {
                info!(
                    credential_id = %issued.credential_id,
                    lease_id = %issued.lease_id,
                    backend = %request.backend,
                    username = %issued.username,
                    "dynamic credential issued"
                );
                Ok(issued)
            }
            Err(e) => {
                self.metrics.record_provision_failure();
                warn!(backend = %request.backend, username = %account.username, error = %e, "failed to record credential, compensating");
                self.compensate(backend.as_ref(), &request, &account.username).await;
                Err(e)
            }
        }
    }

    async fn record(
        &self,
        request: &CredentialRequest,
        account: &AccountSpec,
        now: DateTime<Utc>,
    ) -> Result<IssuedCredential, CredentialError> {
        let id = uuid::Uuid::new_v4().to_string();
        let admin_password = self
            .dek
            .encrypt(DekPurpose::Data, request.admin.password.as_bytes())
            .await?;
        let lease = self
            .leases
            .create(
                LeaseResource::DynamicCredential {
                    credential_id: id.clone(),
                },
                request.ttl_secs,
                false,
            )
            .await?;

        let credential = DynamicCredential {
            id: id.clone(),
            lease_id: lease.lease_id.clone(),
            backend: request.backend.clone(),
            username: account.username.clone(),
            target: request.target.clone(),
            read_only: account.read_only,
            admin_username: request.admin.username.clone(),
            admin_password,
            created_at: now,
            expires_at: lease.expires_at,
            revoked: false,
            revoked_at: None,
        };
        if let Err(e) = self.save(&credential).await {
            if let Err(revoke_err) = self.leases.revoke(&lease.lease_id).await {
                warn!(
                    lease_id = %lease.lease_id,
                    credential_id = %id,
                    error = %revoke_err,
                    "failed to revoke lease of unrecorded credential"
                );
            }
            return Err(e);
        }

        Ok(IssuedCredential {
            credential_id: id,
            lease_id: lease.lease_id,
            username: account.username.clone(),
            password: account.password.clone(),
            expires_at: lease.expires_at,
        })
    }

    async fn compensate(&self, backend: &dyn CredentialBackend, request: &CredentialRequest, username: &str) {
        let result = tokio::time::timeout(
            self.provision_timeout,
            backend.revoke(&request.admin, &request.target, username),
        )
        .await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(username = %username, error = %e, "compensating revoke failed"),
            Err(_) => warn!(username = %username, "compensating revoke timed out"),
        }
    }

    /// Look up a credential.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::NotFound`] if it does not exist.
    pub async fn get(&self, credential_id: &str) -> Result<CredentialInfo, CredentialError> {
        Ok(CredentialInfo::from(&self.load(credential_id).await?))
    }

    /// Every credential record.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Barrier`] if sealed or storage fails.
    pub async fn list(&self) -> Result<Vec<CredentialInfo>, CredentialError> {
        let mut out = Vec::new();
        for key in self.barrier.list(CREDENTIAL_PREFIX).await? {
            if let Some(c) = self.barrier.get_json::<DynamicCredential>(&key).await? {
                out.push(CredentialInfo::from(&c));
            }
        }
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }

    /// Drop the account and revoke its lease. A no-op when already revoked.
    ///
    /// # Errors
    ///
    /// - [`CredentialError::NotFound`] if the record does not exist.
    /// - [`CredentialError::Backend`] / [`CredentialError::Timeout`] if the
    ///   account could not be dropped; the record stays unrevoked for retry.
    pub async fn revoke(&self, credential_id: &str) -> Result<CredentialInfo, CredentialError> {
        let mut credential = self.load(credential_id).await?;
        if credential.revoked {
            return Ok(CredentialInfo::from(&credential));
        }

        let backend = self.backend(&credential.backend)?;
        let admin_password = self.dek.decrypt(&credential.admin_password).await?;
        let admin = AdminCredentials {
            username: credential.admin_username.clone(),
            password: String::from_utf8_lossy(&admin_password).into_owned(),
        };

        let outcome = tokio::time::timeout(
            self.provision_timeout,
            backend.revoke(&admin, &credential.target, &credential.username),
        )
        .await
        .map_err(|_| CredentialError::Timeout {
            backend: credential.backend.clone(),
            timeout_secs: self.provision_timeout.as_secs(),
        })??;

        credential.revoked = true;
        credential.revoked_at = Some(Utc::now());
        self.save(&credential).await?;
        match self.leases.revoke(&credential.lease_id).await {
            Ok(_) | Err(LeaseError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        info!(
            credential_id = %credential.id,
            username = %credential.username,
            outcome = ?outcome,
            "dynamic credential revoked"
        );
        Ok(CredentialInfo::from(&credential))
    }

    /// Revoke every unrevoked credential past its expiry. Returns how many
    /// were revoked; failures are logged and retried on the next sweep.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Barrier`] if the records cannot be listed.
    pub async fn revoke_expired(&self) -> Result<usize, CredentialError> {
        let now = Utc::now();
        let mut revoked = 0usize;
        for info in self.list().await? {
            if info.revoked || info.expires_at > now {
                continue;
            }
            match self.revoke(&info.id).await {
                Ok(_) => revoked += 1,
                Err(e) => warn!(credential_id = %info.id, error = %e, "failed to revoke expired credential"),
            }
        }
        Ok(revoked)
    }

    async fn load(&self, credential_id: &str) -> Result<DynamicCredential, CredentialError> {
        self.barrier
            .get_json(&credential_key(credential_id))
            .await?
            .ok_or_else(|| CredentialError::NotFound {
                credential_id: credential_id.to_owned(),
            })
    }

    async fn save(&self, credential: &DynamicCredential) -> Result<(), CredentialError> {
        self.barrier
            .put_json(&credential_key(&credential.id), credential)
            .await?;
        Ok(())
    }

    fn backend(&self, name: &str) -> Result<Arc<dyn CredentialBackend>, CredentialError> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| CredentialError::UnknownBackend {
                name: name.to_owned(),
            })
    }
}

impl fmt::Debug for CredentialIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialIssuer")
            .field("backends", &self.backend_names())
            .field("provision_timeout", &self.provision_timeout)
            .finish_non_exhaustive()
    }
}

fn credential_key(id: &str) -> String {
    format!("{CREDENTIAL_PREFIX}{id}")
}

/// `v_<backend>_<12 hex>`, restricted to identifier-safe characters.
fn generate_username(backend: &str) -> String {
    format!(
        "v_{}_{}",
        sanitize_identifier(backend),
        hex::encode(crypto::random_bytes(6))
    )
}

/// Keep only `[A-Za-z0-9_.]`.
#[must_use]
pub fn sanitize_identifier(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.'))
        .collect()
}
