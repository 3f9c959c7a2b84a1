//! The `Vault` facade.
//!
//! Owns every component and is the only API the server calls. Each
//! operation authorizes the caller's policies for an ACL path, runs the
//! component, and appends an audit entry before returning. A failed audit
//! append fails the operation.
//!
//! ACL paths used for authorization:
//!
//! | operation | path | capability |
//! |---|---|---|
//! | secrets | `secret/<path>` | read, create/update, delete, list |
//! | envelope crypto | `crypto/<op>/<purpose>`, `crypto/keys/<name>` | update |
//! | leases | `sys/leases`, `sys/leases/<id>` | create, list, read, update |
//! | credentials | `sys/credentials/create/<backend>`, `sys/credentials/<id>` | create, read, update |
//! | tokens | `auth/token/create`, `auth/token/self`, `auth/token/accessors` | create, read, list |
//! | everything else | `sys/...` | per operation |

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use clinvault_storage::StorageBackend;

use crate::audit::{AuditActor, AuditLog, AuditPage, AuditQuery};
use crate::barrier::Barrier;
use crate::compliance::{self, ComplianceReport, ComplianceSnapshot};
use crate::credentials::{
    CredentialBackend, CredentialInfo, CredentialIssuer, CredentialRequest, IssuedCredential,
};
use crate::crypto::{self, KdfParams};
use crate::db_rotation::{ActiveCredentials, DbCredentialRotator, DbRotationConfig, DbRotationResult, DbRotationStatus};
use crate::dek::{DekManager, DekPurpose, DekRotation, DekStatus, Envelope};
use crate::error::{LeaseError, PolicyError, RotationError, SecretError, TokenError, VaultError};
use crate::field_access::{FieldAccessInput, FieldAccessPolicy, FieldAccessStore};
use crate::lease::{Lease, LeaseManager, LeaseResource};
use crate::metrics::{MetricsSnapshot, VaultMetrics};
use crate::policy::{Capability, DEFAULT_POLICY, Policy, PolicyAssignment, PolicyInput, PolicyStore};
use crate::records::{
    EncryptionConfig, EncryptionConfigInput, ReEncryptProgress, ReEncryptReport, RecordStore,
    RecordView, RecordWrite, TableSchema,
};
use crate::rotation::{
    RotationCallback, RotationEngine, RotationHistoryEntry, RotationSchedule, RotationTrigger,
    ScheduleInput,
};
use crate::seal::{ConfiguredProvider, PendingInit, SealManager, SealStatus, UnsealOutcome};
use crate::secrets::{Secret, SecretEntry, SecretStore, SecretWrite, normalize_path};
use crate::token::{CreateToken, CreatedToken, TokenInfo, TokenStore};
use crate::unseal::{KmsClient, ProviderRegistry, ProviderSpec, ProviderStatus, UnsealInput};

const TOKEN_CREATE_PATH: &str = "auth/token/create";

/// Tunables for the core components.
#[derive(Clone)]
pub struct VaultOptions {
    /// Per-provider bound on an unseal attempt.
    pub unseal_timeout: Duration,
    /// Bound on a credential backend call.
    pub provision_timeout: Duration,
    /// Argon2id cost for password-derived providers.
    pub kdf: KdfParams,
    /// Rows per re-encryption batch.
    pub reencrypt_batch_size: usize,
    /// Longest lifetime of any lease, renewals included.
    pub max_lease_ttl: Duration,
    /// Key for hashing sensitive audit fields. Random per process when unset.
    pub audit_hmac_key: Option<Vec<u8>>,
}

impl Default for VaultOptions {
    fn default() -> Self {
        Self {
            unseal_timeout: Duration::from_secs(10),
            provision_timeout: Duration::from_secs(30),
            kdf: KdfParams::default(),
            reencrypt_batch_size: crate::records::DEFAULT_BATCH_SIZE,
            max_lease_ttl: Duration::from_secs(30 * 24 * 60 * 60),
            audit_hmac_key: None,
        }
    }
}

impl std::fmt::Debug for VaultOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultOptions")
            .field("unseal_timeout", &self.unseal_timeout)
            .field("provision_timeout", &self.provision_timeout)
            .field("kdf", &self.kdf)
            .field("reencrypt_batch_size", &self.reencrypt_batch_size)
            .field("max_lease_ttl", &self.max_lease_ttl)
            .finish_non_exhaustive()
    }
}

/// Implementations registered at construction.
#[derive(Default)]
pub struct VaultPlugins {
    pub kms: Option<Arc<dyn KmsClient>>,
    pub credential_backends: Vec<Arc<dyn CredentialBackend>>,
    pub rotation_callbacks: Vec<Arc<dyn RotationCallback>>,
}

/// An authenticated caller.
#[derive(Debug, Clone)]
pub struct Caller {
    pub accessor: String,
    pub display_name: String,
    pub user_id: Option<String>,
    pub role: Option<String>,
    /// Token policies plus the user's assignment.
    pub policies: Vec<String>,
    pub ip_address: Option<String>,
}

impl Caller {
    #[must_use]
    pub fn actor(&self) -> AuditActor {
        AuditActor {
            user_id: self
                .user_id
                .clone()
                .or_else(|| Some(format!("token:{}", self.accessor))),
            ip_address: self.ip_address.clone(),
        }
    }
}

/// Returned once by [`Vault::initialize`].
#[derive(Clone, Serialize)]
pub struct InitResult {
    pub root_token: String,
    pub root_accessor: String,
    pub provider_id: String,
}

impl std::fmt::Debug for InitResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitResult")
            .field("root_accessor", &self.root_accessor)
            .field("provider_id", &self.provider_id)
            .finish_non_exhaustive()
    }
}

/// A secret read through a live lease.
#[derive(Clone, Serialize)]
pub struct LeasedSecret {
    pub lease_id: String,
    pub path: String,
    pub value: String,
    pub version: u64,
    pub remaining_secs: u64,
}

impl std::fmt::Debug for LeasedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeasedSecret")
            .field("lease_id", &self.lease_id)
            .field("path", &self.path)
            .field("remaining_secs", &self.remaining_secs)
            .finish_non_exhaustive()
    }
}

/// What a DEK maintenance pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DekMaintenance {
    pub rotated: Vec<DekRotation>,
    pub reencrypted: Vec<ReEncryptReport>,
}

/// What a database credential maintenance pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DbMaintenance {
    pub revoked: usize,
    pub rotation: Option<DbRotationResult>,
}

/// The secrets management engine.
pub struct Vault {
    barrier: Arc<Barrier>,
    seal: SealManager,
    dek: Arc<DekManager>,
    secrets: Arc<SecretStore>,
    leases: Arc<LeaseManager>,
    credentials: Arc<CredentialIssuer>,
    tokens: TokenStore,
    policies: PolicyStore,
    field_access: Arc<FieldAccessStore>,
    records: RecordStore,
    rotation: RotationEngine,
    db_rotation: DbCredentialRotator,
    audit: Arc<AuditLog>,
    metrics: Arc<VaultMetrics>,
}

impl Vault {
    /// Wire every component over `storage`. The vault starts sealed.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, options: VaultOptions, plugins: VaultPlugins) -> Self {
        let hmac_key = options
            .audit_hmac_key
            .unwrap_or_else(|| crypto::random_bytes(32));
        let audit = Arc::new(AuditLog::with_storage(Arc::clone(&storage), hmac_key));

        let metrics = Arc::new(VaultMetrics::new());
        let barrier = Arc::new(Barrier::new(storage));
        let registry = ProviderRegistry::new(Arc::clone(&barrier), plugins.kms, options.kdf);
        let seal = SealManager::new(Arc::clone(&barrier), registry, options.unseal_timeout);
        let dek = Arc::new(DekManager::new(Arc::clone(&barrier)));
        let secrets = Arc::new(SecretStore::new(Arc::clone(&barrier), Arc::clone(&dek)));
        let leases = Arc::new(
            LeaseManager::new(Arc::clone(&barrier), options.max_lease_ttl)
                .with_metrics(Arc::clone(&metrics)),
        );
        let credentials = Arc::new(
            CredentialIssuer::new(
                Arc::clone(&barrier),
                Arc::clone(&dek),
                Arc::clone(&leases),
                plugins.credential_backends,
                options.provision_timeout,
            )
            .with_metrics(Arc::clone(&metrics)),
        );
        let field_access = Arc::new(FieldAccessStore::new(Arc::clone(&barrier)));
        let records = RecordStore::new(
            Arc::clone(&barrier),
            Arc::clone(&dek),
            Arc::clone(&field_access),
            options.reencrypt_batch_size,
        );
        let rotation = RotationEngine::new(
            Arc::clone(&barrier),
            Arc::clone(&secrets),
            plugins.rotation_callbacks,
        );
        let db_rotation =
            DbCredentialRotator::new(Arc::clone(&barrier), Arc::clone(&dek), Arc::clone(&credentials));

        Self {
            tokens: TokenStore::new(Arc::clone(&barrier)),
            policies: PolicyStore::new(Arc::clone(&barrier)),
            barrier,
            seal,
            dek,
            secrets,
            leases,
            credentials,
            field_access,
            records,
            rotation,
            db_rotation,
            audit,
            metrics,
        }
    }

    /// The audit log, for registering extra backends.
    #[must_use]
    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Current operation counters. Needs no authentication and holds no
    /// secret material, so it is readable while sealed.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn is_unsealed(&self) -> bool {
        self.barrier.is_unsealed().await
    }

    // ── authentication & authorization ─────────────────────────────

    /// Resolve a presented token into a [`Caller`]. Counts one token use.
    ///
    /// # Errors
    ///
    /// - [`VaultError::Token`] for an unknown, expired, revoked or exhausted token.
    /// - [`VaultError::Barrier`] wrapped errors while sealed.
    pub async fn authenticate(
        &self,
        token: &str,
        ip_address: Option<String>,
    ) -> Result<Caller, VaultError> {
        let entry = match self.tokens.validate(token).await {
            Ok(entry) => entry,
            Err(e) => {
                if !matches!(e, TokenError::Barrier(_)) {
                    self.metrics.record_token_rejection();
                }
                return Err(e.into());
            }
        };
        let mut policies = entry.policies.clone();
        if let Some(user_id) = &entry.user_id {
            policies.extend(self.policies.assigned_policies(user_id).await?);
        }
        policies.sort();
        policies.dedup();
        Ok(Caller {
            accessor: entry.accessor,
            display_name: entry.display_name,
            user_id: entry.user_id,
            role: entry.role,
            policies,
            ip_address,
        })
    }

    async fn authorize(
        &self,
        caller: &Caller,
        path: &str,
        capability: Capability,
    ) -> Result<(), VaultError> {
        match self
            .policies
            .authorize(&caller.policies, path, capability)
            .await
        {
            Ok(()) => Ok(()),
            Err(e @ PolicyError::Denied { .. }) => {
                self.metrics.record_policy_denial();
                warn!(accessor = %caller.accessor, path = %path, capability = %capability, "request denied");
                self.audit
                    .record(
                        "auth.denied",
                        "path",
                        path,
                        &caller.actor(),
                        json!({ "capability": capability.as_str(), "accessor": caller.accessor }),
                    )
                    .await?;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn audit(
        &self,
        caller: &Caller,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        details: Value,
    ) -> Result<(), VaultError> {
        self.audit
            .record(action, resource_type, resource_id, &caller.actor(), details)
            .await?;
        Ok(())
    }

    async fn audit_system(
        &self,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        details: Value,
    ) -> Result<(), VaultError> {
        self.audit
            .record(action, resource_type, resource_id, &AuditActor::system(), details)
            .await?;
        Ok(())
    }

    // ── seal lifecycle ─────────────────────────────────────────────

    /// Seal status. Needs no authentication.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Seal`] if storage fails.
    pub async fn status(&self) -> Result<SealStatus, VaultError> {
        Ok(self.seal.status().await?)
    }

    /// Initialize, create the root token and every DEK, and leave the vault
    /// unsealed. The root token is only ever returned here.
    ///
    /// Concurrent calls are serialized and only the first succeeds. The init
    /// marker is written after the DEKs and root token exist; any failure
    /// before that leaves the vault uninitialized so the call can be retried.
    ///
    /// # Errors
    ///
    /// - [`VaultError::Seal`] if already initialized or the password is empty.
    /// - [`VaultError::Audit`] if the event cannot be recorded.
    pub async fn initialize(
        &self,
        master_password: &str,
        user_id: &str,
        actor: &AuditActor,
    ) -> Result<InitResult, VaultError> {
        let pending = self.seal.begin_initialize(master_password, user_id).await?;
        let root = match self.provision_initial(&pending, user_id, actor).await {
            Ok(root) => root,
            Err(e) => {
                pending.abort().await;
                return Err(e);
            }
        };
        let provider_id = pending.commit().await?;
        info!(user_id = %user_id, provider_id = %provider_id, "vault initialized");
        Ok(InitResult {
            root_token: root.token,
            root_accessor: root.info.accessor,
            provider_id,
        })
    }

    async fn provision_initial(
        &self,
        pending: &PendingInit<'_>,
        user_id: &str,
        actor: &AuditActor,
    ) -> Result<CreatedToken, VaultError> {
        self.dek.ensure_all().await?;
        let root = self.tokens.create_root(user_id).await?;
        self.audit
            .record(
                "vault.initialize",
                "vault",
                "-",
                actor,
                json!({ "provider_id": pending.provider_id(), "root_accessor": root.info.accessor }),
            )
            .await?;
        Ok(root)
    }

    /// Try providers in priority order, or only `provider_id`. A run in which
    /// every provider fails is an unsuccessful outcome, not an error.
    ///
    /// # Errors
    ///
    /// - [`VaultError::Seal`] if uninitialized, already unsealed, or another
    ///   attempt is running.
    /// - [`VaultError::Audit`] if the attempt cannot be recorded.
    pub async fn unseal(
        &self,
        provider_id: Option<&str>,
        input: UnsealInput<'_>,
        actor: &AuditActor,
    ) -> Result<UnsealOutcome, VaultError> {
        let outcome = self.seal.unseal(provider_id, input).await?;
        for attempt in &outcome.attempts {
            self.metrics.record_unseal_attempt(attempt.success);
        }
        let action = if outcome.success {
            "vault.unseal"
        } else {
            "vault.unseal.failed"
        };
        self.audit
            .record(
                action,
                "vault",
                outcome.provider_id.as_deref().unwrap_or("-"),
                actor,
                json!({ "attempts_total": outcome.attempts_total, "attempts": outcome.attempts }),
            )
            .await?;
        Ok(outcome)
    }

    /// Drop the master key. Returns whether the vault was unsealed.
    ///
    /// # Errors
    ///
    /// Authorization or audit failures.
    pub async fn seal(&self, caller: &Caller) -> Result<bool, VaultError> {
        self.authorize(caller, "sys/seal", Capability::Update).await?;
        let was_unsealed = self.seal.seal().await;
        self.audit(caller, "vault.seal", "vault", "-", json!({ "was_unsealed": was_unsealed }))
            .await?;
        Ok(was_unsealed)
    }

    /// # Errors
    ///
    /// Authorization, seal or audit failures.
    pub async fn list_providers(&self, caller: &Caller) -> Result<Vec<ProviderStatus>, VaultError> {
        self.authorize(caller, "sys/unseal-providers", Capability::List)
            .await?;
        let providers = self.seal.providers().await?;
        self.audit(caller, "unseal.provider.list", "unseal_provider", "-", json!({ "count": providers.len() }))
            .await?;
        Ok(providers)
    }

    /// Register or replace an unseal provider. Shamir shares are returned once.
    ///
    /// # Errors
    ///
    /// Authorization, seal or audit failures.
    pub async fn configure_provider(
        &self,
        caller: &Caller,
        provider_id: &str,
        priority: u32,
        spec: ProviderSpec,
    ) -> Result<ConfiguredProvider, VaultError> {
        self.authorize(caller, &format!("sys/unseal-providers/{provider_id}"), Capability::Create)
            .await?;
        let configured = self.seal.configure_provider(provider_id, priority, spec).await?;
        self.audit(
            caller,
            "unseal.provider.configured",
            "unseal_provider",
            provider_id,
            json!({ "kind": configured.provider.kind, "priority": priority }),
        )
        .await?;
        Ok(configured)
    }

    /// # Errors
    ///
    /// Authorization, seal (including removal of the last provider) or audit failures.
    pub async fn remove_provider(&self, caller: &Caller, provider_id: &str) -> Result<(), VaultError> {
        self.authorize(caller, &format!("sys/unseal-providers/{provider_id}"), Capability::Delete)
            .await?;
        self.seal.remove_provider(provider_id).await?;
        self.audit(caller, "unseal.provider.removed", "unseal_provider", provider_id, json!({}))
            .await
    }

    // ── secrets ────────────────────────────────────────────────────

    /// # Errors
    ///
    /// Path, authorization, sealed, not-found or audit failures.
    pub async fn read_secret(&self, caller: &Caller, path: &str) -> Result<Secret, VaultError> {
        let path = normalize_path(path)?;
        self.authorize(caller, &secret_acl(&path), Capability::Read)
            .await?;
        let secret = self.secrets.get(&path).await?;
        self.audit(caller, "secret.read", "secret", &path, json!({ "version": secret.version }))
            .await?;
        Ok(secret)
    }

    /// The value the last rotation replaced, while the schedule's grace
    /// period lasts. Needs `read` on the secret.
    ///
    /// # Errors
    ///
    /// - [`SecretError::NotFound`] if no replaced value is being kept.
    /// - Path, authorization, sealed or audit failures.
    pub async fn read_previous_secret(&self, caller: &Caller, path: &str) -> Result<Secret, VaultError> {
        let path = normalize_path(path)?;
        self.authorize(caller, &secret_acl(&path), Capability::Read)
            .await?;
        let secret = self
            .rotation
            .previous(&path)
            .await?
            .ok_or_else(|| SecretError::NotFound { path: path.clone() })?;
        self.audit(
            caller,
            "secret.read_previous",
            "secret",
            &path,
            json!({ "version": secret.version }),
        )
        .await?;
        Ok(secret)
    }

    /// Create (capability `create`) or overwrite (`update`) a secret.
    ///
    /// # Errors
    ///
    /// Path, authorization, sealed or audit failures.
    pub async fn write_secret(
        &self,
        caller: &Caller,
        path: &str,
        value: &str,
    ) -> Result<SecretWrite, VaultError> {
        let path = normalize_path(path)?;
        let capability = if self.secrets.exists(&path).await? {
            Capability::Update
        } else {
            Capability::Create
        };
        self.authorize(caller, &secret_acl(&path), capability).await?;
        let written = self.secrets.put(&path, value).await?;
        self.audit(
            caller,
            "secret.write",
            "secret",
            &path,
            json!({
                "version": written.version,
                "dek_version": written.dek_version,
                "created": written.created,
                "value_hmac": self.audit.hmac_field(value),
            }),
        )
        .await?;
        Ok(written)
    }

    /// Hard-delete a secret and its rotation schedule.
    ///
    /// # Errors
    ///
    /// Path, authorization, sealed, not-found or audit failures.
    pub async fn delete_secret(&self, caller: &Caller, path: &str) -> Result<(), VaultError> {
        let path = normalize_path(path)?;
        self.authorize(caller, &secret_acl(&path), Capability::Delete)
            .await?;
        self.secrets.delete(&path).await?;
        self.rotation.forget(&path).await?;
        self.audit(caller, "secret.delete", "secret", &path, json!({}))
            .await
    }

    /// Immediate children of `prefix`.
    ///
    /// # Errors
    ///
    /// Path, authorization, sealed or audit failures.
    pub async fn list_secrets(
        &self,
        caller: &Caller,
        prefix: &str,
    ) -> Result<Vec<SecretEntry>, VaultError> {
        let trimmed = prefix.trim_matches('/');
        let acl = if trimmed.is_empty() {
            "secret".to_owned()
        } else {
            secret_acl(&normalize_path(trimmed)?)
        };
        self.authorize(caller, &acl, Capability::List).await?;
        let entries = self.secrets.list(trimmed).await?;
        self.audit(caller, "secret.list", "secret", trimmed, json!({ "count": entries.len() }))
            .await?;
        Ok(entries)
    }

    // ── envelope crypto ────────────────────────────────────────────

    /// # Errors
    ///
    /// Authorization, sealed, crypto or audit failures.
    pub async fn encrypt(
        &self,
        caller: &Caller,
        purpose: DekPurpose,
        plaintext: &[u8],
    ) -> Result<Envelope, VaultError> {
        self.authorize(caller, &format!("crypto/encrypt/{purpose}"), Capability::Update)
            .await?;
        let envelope = self.dek.encrypt(purpose, plaintext).await?;
        self.audit(
            caller,
            "dek.encrypt",
            "dek",
            purpose.as_str(),
            json!({ "dek_version": envelope.dek_version, "bytes": plaintext.len() }),
        )
        .await?;
        Ok(envelope)
    }

    /// # Errors
    ///
    /// Authorization, sealed, unknown version, integrity or audit failures.
    pub async fn decrypt(&self, caller: &Caller, envelope: &Envelope) -> Result<Vec<u8>, VaultError> {
        let purpose = envelope.purpose;
        self.authorize(caller, &format!("crypto/decrypt/{purpose}"), Capability::Update)
            .await?;
        let plaintext = self.dek.decrypt(envelope).await?;
        self.audit(
            caller,
            "dek.decrypt",
            "dek",
            purpose.as_str(),
            json!({ "dek_version": envelope.dek_version }),
        )
        .await?;
        Ok(plaintext)
    }

    /// Wrap caller key material under the `api` DEK, bound to `key_name`.
    ///
    /// # Errors
    ///
    /// Authorization, sealed, crypto or audit failures.
    pub async fn wrap_key(
        &self,
        caller: &Caller,
        material: &[u8],
        key_name: &str,
    ) -> Result<Envelope, VaultError> {
        self.authorize(caller, &format!("crypto/keys/{key_name}"), Capability::Update)
            .await?;
        let envelope = self.dek.wrap_key(material, key_name).await?;
        self.audit(caller, "dek.wrap", "key", key_name, json!({ "dek_version": envelope.dek_version }))
            .await?;
        Ok(envelope)
    }

    /// # Errors
    ///
    /// Authorization, sealed, integrity (including a mismatched name) or audit failures.
    pub async fn unwrap_key(
        &self,
        caller: &Caller,
        envelope: &Envelope,
        key_name: &str,
    ) -> Result<Vec<u8>, VaultError> {
        self.authorize(caller, &format!("crypto/keys/{key_name}"), Capability::Update)
            .await?;
        let material = self.dek.unwrap_key(envelope, key_name).await?;
        self.audit(caller, "dek.unwrap", "key", key_name, json!({ "dek_version": envelope.dek_version }))
            .await?;
        Ok(material)
    }

    // ── leases ─────────────────────────────────────────────────────

    /// Lease an existing secret. Needs `create` on `sys/leases` and `read`
    /// on the secret.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::ResourceNotFound`] if the secret does not exist.
    /// - [`LeaseError::InvalidTtl`] for a zero or too-long TTL.
    pub async fn create_lease(
        &self,
        caller: &Caller,
        path: &str,
        ttl_secs: u64,
        renewable: bool,
    ) -> Result<Lease, VaultError> {
        let path = normalize_path(path)?;
        self.authorize(caller, "sys/leases", Capability::Create).await?;
        self.authorize(caller, &secret_acl(&path), Capability::Read)
            .await?;
        if !self.secrets.exists(&path).await? {
            return Err(LeaseError::ResourceNotFound {
                resource: format!("secret/{path}"),
            }
            .into());
        }
        let lease = self
            .leases
            .create(LeaseResource::Secret { path }, ttl_secs, renewable)
            .await?;
        self.audit(
            caller,
            "lease.create",
            "lease",
            &lease.lease_id,
            json!({ "resource": lease.resource.describe(), "ttl_secs": ttl_secs, "renewable": renewable }),
        )
        .await?;
        Ok(lease)
    }

    /// # Errors
    ///
    /// Authorization, sealed, not-found or audit failures.
    pub async fn lookup_lease(&self, caller: &Caller, lease_id: &str) -> Result<Lease, VaultError> {
        self.authorize(caller, &lease_acl(lease_id), Capability::Read)
            .await?;
        let lease = self.leases.lookup(lease_id).await?;
        self.audit(caller, "lease.lookup", "lease", lease_id, json!({}))
            .await?;
        Ok(lease)
    }

    /// Live leases.
    ///
    /// # Errors
    ///
    /// Authorization, sealed or audit failures.
    pub async fn list_leases(&self, caller: &Caller) -> Result<Vec<Lease>, VaultError> {
        self.authorize(caller, "sys/leases", Capability::List).await?;
        let leases = self.leases.active().await?;
        self.audit(caller, "lease.list", "lease", "-", json!({ "count": leases.len() }))
            .await?;
        Ok(leases)
    }

    /// # Errors
    ///
    /// - [`LeaseError::NotRenewable`], [`LeaseError::Expired`] or
    ///   [`LeaseError::Revoked`] when the lease cannot be extended.
    pub async fn renew_lease(
        &self,
        caller: &Caller,
        lease_id: &str,
        increment_secs: u64,
    ) -> Result<Lease, VaultError> {
        self.authorize(caller, &lease_acl(lease_id), Capability::Update)
            .await?;
        let lease = self.leases.renew(lease_id, increment_secs).await?;
        self.audit(
            caller,
            "lease.renew",
            "lease",
            lease_id,
            json!({ "increment_secs": increment_secs, "expires_at": lease.expires_at }),
        )
        .await?;
        Ok(lease)
    }

    /// Revoke a lease. A dynamic credential lease also drops the account.
    /// Revoking twice succeeds.
    ///
    /// # Errors
    ///
    /// Authorization, not-found, credential backend or audit failures.
    pub async fn revoke_lease(&self, caller: &Caller, lease_id: &str) -> Result<Lease, VaultError> {
        self.authorize(caller, &lease_acl(lease_id), Capability::Update)
            .await?;
        let lease = self.revoke_lease_inner(lease_id).await?;
        self.audit(
            caller,
            "lease.revoke",
            "lease",
            lease_id,
            json!({ "resource": lease.resource.describe() }),
        )
        .await?;
        Ok(lease)
    }

    async fn revoke_lease_inner(&self, lease_id: &str) -> Result<Lease, VaultError> {
        let lease = self.leases.lookup(lease_id).await?;
        match &lease.resource {
            LeaseResource::DynamicCredential { credential_id } => {
                self.credentials.revoke(credential_id).await?;
                Ok(self.leases.lookup(lease_id).await?)
            }
            LeaseResource::Secret { .. } => Ok(self.leases.revoke(lease_id).await?),
        }
    }

    /// The leased secret, only while the lease is live.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::Expired`] / [`LeaseError::Revoked`] once the lease is over.
    /// - [`LeaseError::ResourceNotFound`] for a lease that is not on a secret.
    pub async fn leased_secret(
        &self,
        caller: &Caller,
        lease_id: &str,
    ) -> Result<LeasedSecret, VaultError> {
        self.authorize(caller, &lease_acl(lease_id), Capability::Read)
            .await?;
        let lease = self.leases.ensure_active(lease_id).await?;
        let LeaseResource::Secret { path } = &lease.resource else {
            return Err(LeaseError::ResourceNotFound {
                resource: lease.resource.describe(),
            }
            .into());
        };
        let secret = self.secrets.get(path).await?;
        self.audit(
            caller,
            "secret.read",
            "secret",
            path,
            json!({ "version": secret.version, "lease_id": lease_id }),
        )
        .await?;
        Ok(LeasedSecret {
            lease_id: lease.lease_id.clone(),
            path: secret.path,
            value: secret.value,
            version: secret.version,
            remaining_secs: lease.remaining_secs(Utc::now()),
        })
    }

    // ── dynamic credentials ────────────────────────────────────────

    /// Provision an ephemeral account. The password is returned once.
    ///
    /// # Errors
    ///
    /// Authorization, unknown backend, provisioning, timeout or audit failures.
    pub async fn create_credential(
        &self,
        caller: &Caller,
        request: CredentialRequest,
    ) -> Result<IssuedCredential, VaultError> {
        self.authorize(
            caller,
            &format!("sys/credentials/create/{}", request.backend),
            Capability::Create,
        )
        .await?;
        let backend = request.backend.clone();
        let read_only = request.read_only;
        let issued = self.credentials.create(request).await?;
        self.audit(
            caller,
            "credential.create",
            "credential",
            &issued.credential_id,
            json!({
                "backend": backend,
                "username": issued.username,
                "lease_id": issued.lease_id,
                "expires_at": issued.expires_at,
                "read_only": read_only,
            }),
        )
        .await?;
        Ok(issued)
    }

    /// # Errors
    ///
    /// Authorization, not-found or audit failures.
    pub async fn get_credential(
        &self,
        caller: &Caller,
        credential_id: &str,
    ) -> Result<CredentialInfo, VaultError> {
        self.authorize(caller, &credential_acl(credential_id), Capability::Read)
            .await?;
        let info = self.credentials.get(credential_id).await?;
        self.audit(caller, "credential.read", "credential", credential_id, json!({}))
            .await?;
        Ok(info)
    }

    /// # Errors
    ///
    /// Authorization, sealed or audit failures.
    pub async fn list_credentials(&self, caller: &Caller) -> Result<Vec<CredentialInfo>, VaultError> {
        self.authorize(caller, "sys/credentials", Capability::List)
            .await?;
        let list = self.credentials.list().await?;
        self.audit(caller, "credential.list", "credential", "-", json!({ "count": list.len() }))
            .await?;
        Ok(list)
    }

    /// # Errors
    ///
    /// Authorization, not-found, backend or audit failures.
    pub async fn revoke_credential(
        &self,
        caller: &Caller,
        credential_id: &str,
    ) -> Result<CredentialInfo, VaultError> {
        self.authorize(caller, &credential_acl(credential_id), Capability::Update)
            .await?;
        let info = self.credentials.revoke(credential_id).await?;
        self.audit(
            caller,
            "credential.revoke",
            "credential",
            credential_id,
            json!({ "username": info.username }),
        )
        .await?;
        Ok(info)
    }

    // ── tokens ─────────────────────────────────────────────────────

    /// Create a token. Granting a policy the caller does not hold needs
    /// `sudo` on `auth/token/create`. Every token also gets `default`.
    ///
    /// # Errors
    ///
    /// Authorization, invalid request or audit failures.
    pub async fn create_token(
        &self,
        caller: &Caller,
        mut params: CreateToken,
    ) -> Result<CreatedToken, VaultError> {
        self.authorize(caller, TOKEN_CREATE_PATH, Capability::Create)
            .await?;
        let escalates = params
            .policies
            .iter()
            .any(|p| p != DEFAULT_POLICY && !caller.policies.contains(p));
        if escalates {
            self.authorize(caller, TOKEN_CREATE_PATH, Capability::Sudo)
                .await?;
        }
        if !params.policies.iter().any(|p| p == DEFAULT_POLICY) {
            params.policies.push(DEFAULT_POLICY.to_owned());
        }

        let created = self.tokens.create(params).await?;
        self.audit(
            caller,
            "token.create",
            "token",
            &created.info.accessor,
            json!({
                "policies": created.info.policies,
                "token_type": created.info.token_type,
                "expires_at": created.info.expires_at,
            }),
        )
        .await?;
        Ok(created)
    }

    /// # Errors
    ///
    /// Authorization, sealed or audit failures.
    pub async fn list_tokens(&self, caller: &Caller) -> Result<Vec<TokenInfo>, VaultError> {
        self.authorize(caller, "auth/token/accessors", Capability::List)
            .await?;
        let tokens = self.tokens.list().await?;
        self.audit(caller, "token.list", "token", "-", json!({ "count": tokens.len() }))
            .await?;
        Ok(tokens)
    }

    /// The caller's own token.
    ///
    /// # Errors
    ///
    /// Authorization or storage failures.
    pub async fn lookup_self(&self, caller: &Caller) -> Result<TokenInfo, VaultError> {
        self.authorize(caller, "auth/token/self", Capability::Read)
            .await?;
        let entry = self.tokens.get_by_accessor(&caller.accessor).await?;
        Ok(TokenInfo::from(&entry))
    }

    /// # Errors
    ///
    /// Authorization, not-found or audit failures.
    pub async fn revoke_token(&self, caller: &Caller, accessor: &str) -> Result<TokenInfo, VaultError> {
        self.authorize(caller, "auth/token/revoke", Capability::Update)
            .await?;
        let info = self.tokens.revoke(accessor).await?;
        self.audit(caller, "token.revoke", "token", accessor, json!({}))
            .await?;
        Ok(info)
    }

    // ── secret rotation ────────────────────────────────────────────

    /// # Errors
    ///
    /// Authorization, invalid schedule, missing secret or audit failures.
    pub async fn upsert_schedule(
        &self,
        caller: &Caller,
        input: ScheduleInput,
    ) -> Result<RotationSchedule, VaultError> {
        let path = normalize_path(&input.secret_path)?;
        self.authorize(caller, &schedule_acl(&path), Capability::Create)
            .await?;
        let schedule = self.rotation.upsert(input).await?;
        self.audit(
            caller,
            "rotation.schedule.upsert",
            "rotation_schedule",
            &path,
            json!({
                "interval_days": schedule.rotation_interval_days,
                "strategy": schedule.rotation_strategy,
                "next_rotation_at": schedule.next_rotation_at,
            }),
        )
        .await?;
        Ok(schedule)
    }

    /// # Errors
    ///
    /// Authorization, sealed or audit failures.
    pub async fn list_schedules(&self, caller: &Caller) -> Result<Vec<RotationSchedule>, VaultError> {
        self.authorize(caller, "sys/rotation/schedules", Capability::List)
            .await?;
        let schedules = self.rotation.list().await?;
        self.audit(caller, "rotation.schedule.list", "rotation_schedule", "-", json!({ "count": schedules.len() }))
            .await?;
        Ok(schedules)
    }

    /// Deactivate a schedule.
    ///
    /// # Errors
    ///
    /// Authorization, not-found or audit failures.
    pub async fn remove_schedule(
        &self,
        caller: &Caller,
        path: &str,
    ) -> Result<RotationSchedule, VaultError> {
        let path = normalize_path(path)?;
        self.authorize(caller, &schedule_acl(&path), Capability::Delete)
            .await?;
        let schedule = self.rotation.remove(&path).await?;
        self.audit(caller, "rotation.schedule.remove", "rotation_schedule", &path, json!({}))
            .await?;
        Ok(schedule)
    }

    /// # Errors
    ///
    /// Authorization, sealed or audit failures.
    pub async fn overdue_rotations(&self, caller: &Caller) -> Result<Vec<RotationSchedule>, VaultError> {
        self.authorize(caller, "sys/rotation/schedules", Capability::List)
            .await?;
        let overdue = self.rotation.overdue().await?;
        self.audit(caller, "rotation.overdue", "rotation_schedule", "-", json!({ "count": overdue.len() }))
            .await?;
        Ok(overdue)
    }

    /// Rotate a secret now. A failed rotation is reported in the entry.
    ///
    /// # Errors
    ///
    /// Authorization, sealed or audit failures.
    pub async fn rotate_secret(
        &self,
        caller: &Caller,
        path: &str,
    ) -> Result<RotationHistoryEntry, VaultError> {
        let path = normalize_path(path)?;
        self.authorize(caller, &format!("sys/rotation/rotate/{path}"), Capability::Update)
            .await?;
        let entry = self
            .rotation
            .rotate_now(&path, RotationTrigger::Manual)
            .await?;
        self.metrics.record_rotation(entry.success);
        self.audit(caller, rotation_action(&entry), "secret", &path, rotation_details(&entry))
            .await?;
        Ok(entry)
    }

    /// # Errors
    ///
    /// Authorization, sealed or audit failures.
    pub async fn rotation_history(
        &self,
        caller: &Caller,
        path: &str,
    ) -> Result<Vec<RotationHistoryEntry>, VaultError> {
        let path = normalize_path(path)?;
        self.authorize(caller, &format!("sys/rotation/history/{path}"), Capability::Read)
            .await?;
        let history = self.rotation.history(&path).await?;
        self.audit(caller, "rotation.history", "secret", &path, json!({ "count": history.len() }))
            .await?;
        Ok(history)
    }

    // ── DEK lifecycle ──────────────────────────────────────────────

    /// # Errors
    ///
    /// Authorization, sealed or audit failures.
    pub async fn rotate_dek(&self, caller: &Caller, purpose: DekPurpose) -> Result<DekRotation, VaultError> {
        self.authorize(caller, &format!("sys/dek/{purpose}"), Capability::Update)
            .await?;
        let rotation = self.dek.rotate(purpose).await?;
        self.metrics.record_dek_rotation();
        self.audit(
            caller,
            "dek.rotate",
            "dek",
            purpose.as_str(),
            json!({ "previous_version": rotation.previous_version, "new_version": rotation.new_version }),
        )
        .await?;
        Ok(rotation)
    }

    /// # Errors
    ///
    /// Authorization, sealed or audit failures.
    pub async fn dek_status(&self, caller: &Caller) -> Result<Vec<DekStatus>, VaultError> {
        self.authorize(caller, "sys/dek", Capability::Read).await?;
        let status = self.dek.status().await?;
        self.audit(caller, "dek.status", "dek", "-", json!({})).await?;
        Ok(status)
    }

    /// Rewrite stale rows of `table` under the current `purpose` DEK.
    ///
    /// # Errors
    ///
    /// Authorization, missing or disabled config, sealed or audit failures.
    pub async fn re_encrypt(
        &self,
        caller: &Caller,
        purpose: DekPurpose,
        table: &str,
    ) -> Result<ReEncryptReport, VaultError> {
        self.authorize(caller, &format!("sys/dek/re-encrypt/{table}"), Capability::Update)
            .await?;
        let report = self.records.re_encrypt(purpose, table).await?;
        self.audit(caller, "dek.reencrypt", "table", table, reencrypt_details(&report))
            .await?;
        Ok(report)
    }

    /// # Errors
    ///
    /// Authorization, sealed or audit failures.
    pub async fn reencrypt_progress(&self, caller: &Caller) -> Result<Vec<ReEncryptProgress>, VaultError> {
        self.authorize(caller, "sys/dek/re-encrypt", Capability::Read)
            .await?;
        let progress = self.records.progress().await?;
        self.audit(caller, "dek.reencrypt.progress", "dek", "-", json!({ "count": progress.len() }))
            .await?;
        Ok(progress)
    }

    // ── A/B database credentials ───────────────────────────────────

    /// # Errors
    ///
    /// Authorization, unknown backend, invalid config or audit failures.
    pub async fn configure_db_rotation(
        &self,
        caller: &Caller,
        config: DbRotationConfig,
    ) -> Result<DbRotationStatus, VaultError> {
        self.authorize(caller, "sys/db-credential/config", Capability::Update)
            .await?;
        let details = json!({
            "backend": config.backend,
            "host": config.target.host,
            "database": config.target.database,
            "ttl_secs": config.ttl_secs,
            "grace_period_secs": config.grace_period_secs,
        });
        let status = self.db_rotation.configure(config).await?;
        self.audit(caller, "db.credential.configure", "db_credential", "-", details)
            .await?;
        Ok(status)
    }

    /// # Errors
    ///
    /// Authorization, not configured, in progress, provisioning or audit failures.
    pub async fn rotate_db_credential(&self, caller: &Caller) -> Result<DbRotationResult, VaultError> {
        self.authorize(caller, "sys/db-credential/rotate", Capability::Update)
            .await?;
        let result = self
            .db_rotation
            .rotate()
            .await
            .inspect_err(|e| {
                if !matches!(e, RotationError::InProgress) {
                    self.metrics.record_rotation(false);
                }
            })?;
        self.metrics.record_rotation(true);
        self.audit(caller, "db.credential.rotate", "db_credential", &result.username, db_rotation_details(&result))
            .await?;
        Ok(result)
    }

    /// # Errors
    ///
    /// Authorization, not configured or audit failures.
    pub async fn db_rotation_status(&self, caller: &Caller) -> Result<DbRotationStatus, VaultError> {
        self.authorize(caller, "sys/db-credential", Capability::Read)
            .await?;
        let status = self.db_rotation.status().await?;
        self.audit(caller, "db.credential.status", "db_credential", "-", json!({}))
            .await?;
        Ok(status)
    }

    /// Plaintext credentials of the active slot, for the connection pool owner.
    ///
    /// # Errors
    ///
    /// Authorization, not configured or audit failures.
    pub async fn db_active_credentials(&self, caller: &Caller) -> Result<ActiveCredentials, VaultError> {
        self.authorize(caller, "sys/db-credential/active", Capability::Read)
            .await?;
        let active = self.db_rotation.active_credentials().await?;
        self.audit(
            caller,
            "db.credential.read",
            "db_credential",
            &active.username,
            json!({ "slot": active.slot }),
        )
        .await?;
        Ok(active)
    }

    // ── policies & field access ────────────────────────────────────

    /// # Errors
    ///
    /// Authorization, invalid or built-in policy, or audit failures.
    pub async fn put_policy(&self, caller: &Caller, input: PolicyInput) -> Result<Policy, VaultError> {
        self.authorize(caller, &format!("sys/policies/{}", input.name), Capability::Update)
            .await?;
        let policy = self.policies.put(input).await?;
        self.audit(
            caller,
            "policy.write",
            "policy",
            &policy.name,
            json!({ "path_pattern": policy.path_pattern, "capabilities": policy.capabilities }),
        )
        .await?;
        Ok(policy)
    }

    /// # Errors
    ///
    /// Authorization, not-found or audit failures.
    pub async fn get_policy(&self, caller: &Caller, name: &str) -> Result<Policy, VaultError> {
        self.authorize(caller, &format!("sys/policies/{name}"), Capability::Read)
            .await?;
        let policy = self.policies.get(name).await?;
        self.audit(caller, "policy.read", "policy", name, json!({}))
            .await?;
        Ok(policy)
    }

    /// # Errors
    ///
    /// Authorization, not-found, built-in or audit failures.
    pub async fn delete_policy(&self, caller: &Caller, name: &str) -> Result<(), VaultError> {
        self.authorize(caller, &format!("sys/policies/{name}"), Capability::Delete)
            .await?;
        self.policies.delete(name).await?;
        self.audit(caller, "policy.delete", "policy", name, json!({}))
            .await
    }

    /// # Errors
    ///
    /// Authorization, sealed or audit failures.
    pub async fn list_policies(&self, caller: &Caller) -> Result<Vec<Policy>, VaultError> {
        self.authorize(caller, "sys/policies", Capability::List).await?;
        let policies = self.policies.list().await?;
        self.audit(caller, "policy.list", "policy", "-", json!({ "count": policies.len() }))
            .await?;
        Ok(policies)
    }

    /// # Errors
    ///
    /// Authorization, missing assignment or audit failures.
    pub async fn get_assignment(&self, caller: &Caller, user_id: &str) -> Result<PolicyAssignment, VaultError> {
        self.authorize(caller, &assignment_acl(user_id), Capability::Read)
            .await?;
        let assignment = self.policies.get_assignment(user_id).await?;
        self.audit(caller, "policy.assignment.read", "policy_assignment", user_id, json!({}))
            .await?;
        Ok(assignment)
    }

    /// # Errors
    ///
    /// Authorization, unknown policy name or audit failures.
    pub async fn set_assignment(
        &self,
        caller: &Caller,
        user_id: &str,
        policies: Vec<String>,
    ) -> Result<PolicyAssignment, VaultError> {
        self.authorize(caller, &assignment_acl(user_id), Capability::Update)
            .await?;
        let assignment = self.policies.set_assignment(user_id, policies).await?;
        self.audit(
            caller,
            "policy.assign",
            "policy_assignment",
            user_id,
            json!({ "policies": assignment.policies }),
        )
        .await?;
        Ok(assignment)
    }

    /// # Errors
    ///
    /// Authorization, missing assignment or audit failures.
    pub async fn delete_assignment(&self, caller: &Caller, user_id: &str) -> Result<(), VaultError> {
        self.authorize(caller, &assignment_acl(user_id), Capability::Delete)
            .await?;
        self.policies.delete_assignment(user_id).await?;
        self.audit(caller, "policy.unassign", "policy_assignment", user_id, json!({}))
            .await
    }

    /// # Errors
    ///
    /// Authorization, invalid rule or audit failures.
    pub async fn put_field_access(
        &self,
        caller: &Caller,
        input: FieldAccessInput,
    ) -> Result<FieldAccessPolicy, VaultError> {
        self.authorize(caller, &format!("sys/field-access/{}", input.table_name), Capability::Update)
            .await?;
        let policy = self.field_access.put(input).await?;
        self.audit(
            caller,
            "field_access.write",
            "field_access",
            &format!("{}/{}/{}", policy.table_name, policy.field_name, policy.role),
            json!({ "access_level": policy.access_level }),
        )
        .await?;
        Ok(policy)
    }

    /// Every rule, or only those of `table`.
    ///
    /// # Errors
    ///
    /// Authorization, sealed or audit failures.
    pub async fn list_field_access(
        &self,
        caller: &Caller,
        table: Option<&str>,
    ) -> Result<Vec<FieldAccessPolicy>, VaultError> {
        self.authorize(caller, "sys/field-access", Capability::List)
            .await?;
        let policies = match table {
            Some(t) => self.field_access.list_for_table(t).await?,
            None => self.field_access.list().await?,
        };
        self.audit(
            caller,
            "field_access.list",
            "field_access",
            table.unwrap_or("-"),
            json!({ "count": policies.len() }),
        )
        .await?;
        Ok(policies)
    }

    /// # Errors
    ///
    /// Authorization, missing rule or audit failures.
    pub async fn delete_field_access(
        &self,
        caller: &Caller,
        table: &str,
        field: &str,
        role: &str,
    ) -> Result<(), VaultError> {
        self.authorize(caller, &format!("sys/field-access/{table}"), Capability::Delete)
            .await?;
        self.field_access.delete(table, field, role).await?;
        self.audit(
            caller,
            "field_access.delete",
            "field_access",
            &format!("{table}/{field}/{role}"),
            json!({}),
        )
        .await
    }

    // ── encryption configs & protected records ─────────────────────

    /// # Errors
    ///
    /// Authorization, invalid config or audit failures.
    pub async fn put_encryption_config(
        &self,
        caller: &Caller,
        input: EncryptionConfigInput,
    ) -> Result<EncryptionConfig, VaultError> {
        self.authorize(caller, &encryption_config_acl(&input.table_name), Capability::Update)
            .await?;
        let config = self.records.put_config(input).await?;
        self.audit(
            caller,
            "encryption_config.write",
            "table",
            &config.table_name,
            json!({
                "encrypted_fields": config.encrypted_fields,
                "dek_purpose": config.dek_purpose,
                "is_enabled": config.is_enabled,
            }),
        )
        .await?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Authorization, sealed or audit failures.
    pub async fn list_encryption_configs(&self, caller: &Caller) -> Result<Vec<EncryptionConfig>, VaultError> {
        self.authorize(caller, "sys/encryption-configs", Capability::List)
            .await?;
        let configs = self.records.list_configs().await?;
        self.audit(caller, "encryption_config.list", "table", "-", json!({ "count": configs.len() }))
            .await?;
        Ok(configs)
    }

    /// # Errors
    ///
    /// Authorization, missing config or audit failures.
    pub async fn delete_encryption_config(&self, caller: &Caller, table: &str) -> Result<(), VaultError> {
        self.authorize(caller, &encryption_config_acl(table), Capability::Delete)
            .await?;
        self.records.delete_config(table).await?;
        self.audit(caller, "encryption_config.delete", "table", table, json!({}))
            .await
    }

    /// # Errors
    ///
    /// Authorization, sealed or audit failures.
    pub async fn schema(&self, caller: &Caller) -> Result<Vec<TableSchema>, VaultError> {
        self.authorize(caller, "sys/schema", Capability::Read).await?;
        let schema = self.records.schema().await?;
        self.audit(caller, "schema.read", "table", "-", json!({ "tables": schema.len() }))
            .await?;
        Ok(schema)
    }

    /// # Errors
    ///
    /// Authorization, invalid record, sealed or audit failures.
    pub async fn put_record(
        &self,
        caller: &Caller,
        table: &str,
        row_id: &str,
        fields: Map<String, Value>,
    ) -> Result<RecordWrite, VaultError> {
        self.authorize(caller, &record_acl(table, row_id), Capability::Update)
            .await?;
        let written = self.records.put_record(table, row_id, fields).await?;
        self.audit(
            caller,
            "record.write",
            "record",
            &format!("{table}/{row_id}"),
            json!({ "encrypted_fields": written.encrypted_fields, "dek_version": written.dek_version }),
        )
        .await?;
        Ok(written)
    }

    /// Decrypt a row and apply the caller role's field access.
    ///
    /// # Errors
    ///
    /// Authorization, not-found, integrity or audit failures.
    pub async fn get_record(&self, caller: &Caller, table: &str, row_id: &str) -> Result<RecordView, VaultError> {
        self.authorize(caller, &record_acl(table, row_id), Capability::Read)
            .await?;
        let role = caller.role.as_deref().unwrap_or_default();
        let view = self.records.get_record(table, row_id, role).await?;
        self.audit(
            caller,
            "record.read",
            "record",
            &format!("{table}/{row_id}"),
            json!({ "role": role, "fields": view.fields.len() }),
        )
        .await?;
        Ok(view)
    }

    // ── audit & compliance ─────────────────────────────────────────

    /// # Errors
    ///
    /// Authorization or audit failures.
    pub async fn query_audit(&self, caller: &Caller, query: &AuditQuery) -> Result<AuditPage, VaultError> {
        self.authorize(caller, "sys/audit", Capability::Read).await?;
        let page = self.audit.query(query).await?;
        self.audit(
            caller,
            "audit.query",
            "audit",
            "-",
            json!({ "action": query.action, "returned": page.entries.len() }),
        )
        .await?;
        Ok(page)
    }

    /// Score the current state against HIPAA, SOC 2 and GDPR.
    ///
    /// # Errors
    ///
    /// Authorization, sealed or audit failures.
    pub async fn compliance(&self, caller: &Caller) -> Result<ComplianceReport, VaultError> {
        self.authorize(caller, "sys/compliance", Capability::Read)
            .await?;
        let snapshot = self.compliance_snapshot().await?;
        let report = compliance::evaluate(&snapshot);
        self.audit(
            caller,
            "compliance.report",
            "compliance",
            "-",
            json!({ "grade": report.grade, "percentage": report.percentage }),
        )
        .await?;
        Ok(report)
    }

    async fn compliance_snapshot(&self) -> Result<ComplianceSnapshot, VaultError> {
        self.barrier.ensure_unsealed().await?;
        let now = Utc::now();

        let providers = self.seal.providers().await?;
        let deks = self.dek.status().await?;
        let mut versioned_secret_count = 0;
        let paths = self.secrets.all_paths().await?;
        for path in &paths {
            if self.secrets.load(path).await?.is_some_and(|s| s.version > 1) {
                versioned_secret_count += 1;
            }
        }
        let schedules = self.rotation.list().await?;
        let leases = self.leases.list().await?;
        let tokens = self.tokens.list().await?;
        let policies = self.policies.list().await?;
        let audit_total = self
            .audit
            .query(&AuditQuery {
                page_size: Some(1),
                ..AuditQuery::default()
            })
            .await?
            .total;
        let db_state = if self.db_rotation.is_configured().await? {
            Some(self.db_rotation.status().await?)
        } else {
            None
        };

        Ok(ComplianceSnapshot {
            taken_at: now,
            provider_count: providers.len(),
            non_password_providers: providers.iter().filter(|p| p.kind != "local").count(),
            oldest_dek_age_days: deks
                .iter()
                .map(|d| (now - d.created_at).num_days())
                .max()
                .unwrap_or(0),
            rotated_dek_purposes: deks.iter().filter(|d| d.current_version > 1).count(),
            secret_count: paths.len(),
            versioned_secret_count,
            active_rotation_schedules: schedules.iter().filter(|s| s.is_active).count(),
            overdue_rotations: schedules.iter().filter(|s| s.is_overdue_at(now)).count(),
            active_leases: leases.iter().filter(|l| l.is_live_at(now)).count(),
            expired_unrevoked_leases: leases
                .iter()
                .filter(|l| !l.revoked && l.is_expired_at(now))
                .count(),
            active_tokens: tokens.iter().filter(|t| !t.revoked && !token_stale(t, now)).count(),
            stale_tokens: tokens.iter().filter(|t| !t.revoked && token_stale(t, now)).count(),
            custom_policy_count: policies.iter().filter(|p| !p.is_builtin()).count(),
            policy_assignment_count: self.policies.list_assignments().await?.len(),
            audit_entry_count: audit_total,
            audit_backend_count: self.audit.backend_count().await,
            field_policy_count: self.field_access.list().await?.len(),
            enabled_encryption_configs: self
                .records
                .list_configs()
                .await?
                .iter()
                .filter(|c| c.is_enabled)
                .count(),
            incomplete_reencryptions: self
                .records
                .progress()
                .await?
                .iter()
                .filter(|p| !p.is_complete)
                .count(),
            db_rotation_configured: db_state.is_some(),
            db_rotation_count: db_state.map_or(0, |s| s.rotation_count),
        })
    }

    // ── maintenance (background jobs, system actor) ────────────────

    /// Revoke expired leases and expired dynamic credentials.
    ///
    /// # Errors
    ///
    /// Sealed, listing or audit failures. Individual revocation failures are
    /// logged and retried on the next sweep.
    pub async fn sweep_leases(&self) -> Result<usize, VaultError> {
        let mut revoked = 0usize;
        for lease in self.leases.find_expired().await? {
            match self.revoke_lease_inner(&lease.lease_id).await {
                Ok(_) => revoked += 1,
                Err(e) => warn!(lease_id = %lease.lease_id, error = %e, "failed to revoke expired lease"),
            }
        }
        revoked += self.credentials.revoke_expired().await?;
        self.audit_sweep("lease", revoked).await?;
        Ok(revoked)
    }

    /// Delete expired and exhausted tokens.
    ///
    /// # Errors
    ///
    /// Sealed, storage or audit failures.
    pub async fn sweep_tokens(&self) -> Result<usize, VaultError> {
        let removed = self.tokens.sweep().await?;
        self.audit_sweep("token", removed).await?;
        Ok(removed)
    }

    /// Rotate every automatic schedule that is overdue.
    ///
    /// # Errors
    ///
    /// Sealed, storage or audit failures.
    pub async fn run_due_rotations(&self) -> Result<crate::rotation::RotationRunSummary, VaultError> {
        let summary = self.rotation.run_due().await?;
        for entry in &summary.entries {
            self.metrics.record_rotation(entry.success);
            self.audit_system(rotation_action(entry), "secret", &entry.secret_path, rotation_details(entry))
                .await?;
        }
        self.audit_sweep("rotation", summary.total).await?;
        Ok(summary)
    }

    /// Revoke A/B credentials past their grace period, then rotate if the
    /// active credential expires within `threshold`. A no-op until configured.
    ///
    /// # Errors
    ///
    /// Sealed, storage, provisioning or audit failures.
    pub async fn maintain_db_credentials(&self, threshold: TimeDelta) -> Result<DbMaintenance, VaultError> {
        if !self.db_rotation.is_configured().await? {
            return Ok(DbMaintenance::default());
        }
        let revoked = self.db_rotation.process_pending().await?;
        let rotation = if self.db_rotation.needs_rotation(threshold).await? {
            match self.db_rotation.rotate().await {
                Ok(result) => {
                    self.metrics.record_rotation(true);
                    self.audit_system("db.credential.rotate", "db_credential", &result.username, db_rotation_details(&result))
                        .await?;
                    Some(result)
                }
                Err(RotationError::InProgress) => None,
                Err(e) => {
                    self.metrics.record_rotation(false);
                    return Err(e.into());
                }
            }
        } else {
            None
        };
        self.audit_sweep("db_credential", revoked).await?;
        Ok(DbMaintenance { revoked, rotation })
    }

    /// Rotate every purpose whose current DEK is older than `max_age`, then
    /// re-encrypt each enabled table that uses a rotated purpose.
    ///
    /// # Errors
    ///
    /// Sealed, storage or audit failures. A table that fails to re-encrypt is
    /// logged and picked up again by the next pass.
    pub async fn rotate_stale_deks(&self, max_age: TimeDelta) -> Result<DekMaintenance, VaultError> {
        let now = Utc::now();
        let mut out = DekMaintenance::default();
        for status in self.dek.status().await? {
            if now - status.created_at < max_age {
                continue;
            }
            let rotation = self.dek.rotate(status.purpose).await?;
            self.metrics.record_dek_rotation();
            self.audit_system(
                "dek.rotate",
                "dek",
                rotation.purpose.as_str(),
                json!({ "previous_version": rotation.previous_version, "new_version": rotation.new_version }),
            )
            .await?;
            out.rotated.push(rotation);
        }

        let pending: Vec<(DekPurpose, String)> = self
            .records
            .progress()
            .await?
            .into_iter()
            .filter(|p| !p.is_complete)
            .map(|p| (p.purpose, p.table))
            .collect();
        for config in self.records.list_configs().await? {
            let rotated = out.rotated.iter().any(|r| r.purpose == config.dek_purpose);
            let unfinished = pending
                .iter()
                .any(|(p, t)| *p == config.dek_purpose && *t == config.table_name);
            if !config.is_enabled || !(rotated || unfinished) {
                continue;
            }
            match self.records.re_encrypt(config.dek_purpose, &config.table_name).await {
                Ok(report) => {
                    self.audit_system("dek.reencrypt", "table", &config.table_name, reencrypt_details(&report))
                        .await?;
                    out.reencrypted.push(report);
                }
                Err(e) => warn!(table = %config.table_name, error = %e, "re-encryption sweep failed"),
            }
        }
        Ok(out)
    }

    async fn audit_sweep(&self, kind: &str, processed: usize) -> Result<(), VaultError> {
        if processed == 0 {
            return Ok(());
        }
        self.audit_system("maintenance.sweep", "maintenance", kind, json!({ "processed": processed }))
            .await
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

fn token_stale(t: &TokenInfo, now: chrono::DateTime<Utc>) -> bool {
    t.expires_at.is_some_and(|e| now >= e) || t.num_uses.is_some_and(|n| t.uses_count >= n)
}

fn rotation_action(entry: &RotationHistoryEntry) -> &'static str {
    if entry.success {
        "rotation.executed"
    } else {
        "rotation.failed"
    }
}

fn rotation_details(entry: &RotationHistoryEntry) -> Value {
    json!({
        "old_version": entry.old_version,
        "new_version": entry.new_version,
        "trigger": entry.trigger,
        "error": entry.error,
    })
}

fn reencrypt_details(report: &ReEncryptReport) -> Value {
    json!({
        "purpose": report.purpose,
        "target_version": report.target_version,
        "processed_rows": report.processed_rows,
        "rewritten_rows": report.rewritten_rows,
        "failed_rows": report.failed_rows,
        "is_complete": report.is_complete,
    })
}

fn db_rotation_details(result: &DbRotationResult) -> Value {
    json!({
        "active_slot": result.active_slot,
        "rotation_count": result.rotation_count,
        "expires_at": result.expires_at,
    })
}

fn secret_acl(path: &str) -> String {
    format!("secret/{path}")
}

fn lease_acl(lease_id: &str) -> String {
    format!("sys/leases/{lease_id}")
}

fn credential_acl(credential_id: &str) -> String {
    format!("sys/credentials/{credential_id}")
}

fn schedule_acl(path: &str) -> String {
    format!("sys/rotation/schedules/{path}")
}

fn assignment_acl(user_id: &str) -> String {
    format!("sys/policy-assignments/{user_id}")
}

fn encryption_config_acl(table: &str) -> String {
    format!("sys/encryption-configs/{table}")
}

fn record_acl(table: &str, row_id: &str) -> String {
    format!("records/{table}/{row_id}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use clinvault_storage::{MemoryBackend, StorageError};

    use super::*;
    use crate::error::ErrorKind;

    fn options() -> VaultOptions {
        VaultOptions {
            kdf: KdfParams::minimal(),
            ..VaultOptions::default()
        }
    }

    /// Memory storage that rejects writes under `prefix` while armed.
    struct RejectWrites {
        inner: MemoryBackend,
        prefix: &'static str,
        armed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl StorageBackend for RejectWrites {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
            if self.armed.load(Ordering::SeqCst) && key.starts_with(self.prefix) {
                return Err(StorageError::Write {
                    key: key.to_owned(),
                    reason: "rejected".to_owned(),
                });
            }
            self.inner.put(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.inner.delete(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
            self.inner.list(prefix).await
        }
    }

    async fn initialized() -> (Vault, Caller) {
        let vault = Vault::new(Arc::new(MemoryBackend::new()), options(), VaultPlugins::default());
        let init = vault
            .initialize("correct horse", "admin", &AuditActor::default())
            .await
            .unwrap();
        let root = vault.authenticate(&init.root_token, None).await.unwrap();
        (vault, root)
    }

    async fn limited(vault: &Vault, root: &Caller, policy: PolicyInput) -> Caller {
        let name = policy.name.clone();
        vault.put_policy(root, policy).await.unwrap();
        let created = vault
            .create_token(
                root,
                CreateToken {
                    display_name: "app".to_owned(),
                    role: Some("Nurse".to_owned()),
                    policies: vec![name],
                    ..CreateToken::default()
                },
            )
            .await
            .unwrap();
        vault.authenticate(&created.token, None).await.unwrap()
    }

    // ── authorization ────────────────────────────────────────────────

    #[tokio::test]
    async fn denial_is_audited_and_returned() {
        let (vault, root) = initialized().await;
        let reader = limited(
            &vault,
            &root,
            PolicyInput {
                name: "reader".to_owned(),
                path_pattern: "secret/app/*".to_owned(),
                capabilities: vec![Capability::Read],
                description: String::new(),
            },
        )
        .await;

        vault.write_secret(&root, "app/db", "s3cret").await.unwrap();
        assert_eq!(vault.read_secret(&reader, "app/db").await.unwrap().value, "s3cret");

        let err = vault.write_secret(&reader, "app/db", "x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        let page = vault
            .query_audit(
                &root,
                &AuditQuery {
                    action: Some("auth.denied".to_owned()),
                    ..AuditQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.entries[0].resource_id, "secret/app/db");
    }

    #[tokio::test]
    async fn granting_unheld_policy_needs_sudo() {
        let (vault, root) = initialized().await;
        let issuer = limited(
            &vault,
            &root,
            PolicyInput {
                name: "issuer".to_owned(),
                path_pattern: "auth/token/create".to_owned(),
                capabilities: vec![Capability::Create],
                description: String::new(),
            },
        )
        .await;

        let err = vault
            .create_token(
                &issuer,
                CreateToken {
                    display_name: "escalated".to_owned(),
                    policies: vec!["root".to_owned()],
                    ..CreateToken::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authorization);

        let ok = vault
            .create_token(
                &issuer,
                CreateToken {
                    display_name: "same".to_owned(),
                    policies: vec!["issuer".to_owned()],
                    ..CreateToken::default()
                },
            )
            .await
            .unwrap();
        assert!(ok.info.policies.contains(&DEFAULT_POLICY.to_owned()));
    }

    #[tokio::test]
    async fn assignment_policies_join_token_policies() {
        let (vault, root) = initialized().await;
        vault
            .put_policy(
                &root,
                PolicyInput {
                    name: "records".to_owned(),
                    path_pattern: "records/**".to_owned(),
                    capabilities: vec![Capability::Read, Capability::Update],
                    description: String::new(),
                },
            )
            .await
            .unwrap();
        vault
            .set_assignment(&root, "dr-who", vec!["records".to_owned()])
            .await
            .unwrap();
        let created = vault
            .create_token(
                &root,
                CreateToken {
                    display_name: "doctor".to_owned(),
                    user_id: Some("dr-who".to_owned()),
                    ..CreateToken::default()
                },
            )
            .await
            .unwrap();
        let doctor = vault.authenticate(&created.token, None).await.unwrap();
        assert!(doctor.policies.contains(&"records".to_owned()));

        let fields = json!({ "name": "A" }).as_object().unwrap().clone();
        vault.put_record(&doctor, "patients", "1", fields).await.unwrap();
    }

    // ── secrets & leases ─────────────────────────────────────────────

    #[tokio::test]
    async fn lease_on_missing_secret_is_rejected() {
        let (vault, root) = initialized().await;
        let err = vault.create_lease(&root, "nope", 60, true).await.unwrap_err();
        assert!(matches!(
            err,
            VaultError::Lease(LeaseError::ResourceNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn leased_secret_stops_after_revoke() {
        let (vault, root) = initialized().await;
        vault.write_secret(&root, "clinic/api", "v1").await.unwrap();
        let lease = vault.create_lease(&root, "clinic/api", 60, true).await.unwrap();

        let leased = vault.leased_secret(&root, &lease.lease_id).await.unwrap();
        assert_eq!(leased.value, "v1");
        assert!(leased.remaining_secs <= 60);

        vault.revoke_lease(&root, &lease.lease_id).await.unwrap();
        vault.revoke_lease(&root, &lease.lease_id).await.unwrap();
        let err = vault.leased_secret(&root, &lease.lease_id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExpiredOrRevoked);
    }

    #[tokio::test]
    async fn deleting_secret_drops_its_schedule() {
        let (vault, root) = initialized().await;
        vault.write_secret(&root, "svc/key", "k").await.unwrap();
        vault
            .upsert_schedule(
                &root,
                ScheduleInput {
                    secret_path: "svc/key".to_owned(),
                    rotation_interval_days: 30,
                    grace_period_hours: 24,
                    automatically_rotate: true,
                    rotation_strategy: crate::rotation::RotationStrategy::Generate,
                },
            )
            .await
            .unwrap();
        vault.delete_secret(&root, "svc/key").await.unwrap();
        assert!(vault.list_schedules(&root).await.unwrap().is_empty());
    }

    // ── sealed & audit fail-closed ───────────────────────────────────

    #[tokio::test]
    async fn sealed_vault_rejects_operations() {
        let (vault, root) = initialized().await;
        assert!(vault.seal(&root).await.unwrap());
        let err = vault.read_secret(&root, "any").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Sealed);
        assert!(vault.status().await.unwrap().sealed);
    }

    #[tokio::test]
    async fn compliance_reports_every_framework() {
        let (vault, root) = initialized().await;
        let report = vault.compliance(&root).await.unwrap();
        assert_eq!(report.frameworks.len(), 3);
        assert!(report.percentage < 100.0);
    }

    // ── initialization ───────────────────────────────────────────────

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_initialize_issues_one_root_token() {
        let vault = Vault::new(Arc::new(MemoryBackend::new()), options(), VaultPlugins::default());
        let actor = AuditActor::default();
        let (a, b) = tokio::join!(
            vault.initialize("pw-a", "alice", &actor),
            vault.initialize("pw-b", "bob", &actor)
        );

        let (won, password, lost) = if a.is_ok() {
            (a.unwrap(), "pw-a", b.unwrap_err())
        } else {
            (b.unwrap(), "pw-b", a.unwrap_err())
        };
        assert_eq!(lost.kind(), ErrorKind::Conflict);

        let root = vault.authenticate(&won.root_token, None).await.unwrap();
        assert!(vault.seal(&root).await.unwrap());
        let input = UnsealInput {
            password: Some(password),
            shares: &[],
        };
        let outcome = vault
            .unseal(None, input, &AuditActor::default())
            .await
            .unwrap();
        assert!(outcome.success);
        vault.authenticate(&won.root_token, None).await.unwrap();
    }

    #[tokio::test]
    async fn failed_initialize_leaves_vault_retryable() {
        let storage = Arc::new(RejectWrites {
            inner: MemoryBackend::new(),
            prefix: "sys/tokens/",
            armed: AtomicBool::new(true),
        });
        let vault = Vault::new(
            Arc::clone(&storage) as Arc<dyn StorageBackend>,
            options(),
            VaultPlugins::default(),
        );

        assert!(
            vault
                .initialize("pw", "admin", &AuditActor::default())
                .await
                .is_err()
        );
        let status = vault.status().await.unwrap();
        assert!(!status.initialized);
        assert!(status.sealed);
        assert_eq!(status.provider_count, 0);

        storage.armed.store(false, Ordering::SeqCst);
        let init = vault
            .initialize("pw", "admin", &AuditActor::default())
            .await
            .unwrap();
        let root = vault.authenticate(&init.root_token, None).await.unwrap();
        assert_eq!(vault.dek_status(&root).await.unwrap().len(), DekPurpose::ALL.len());
    }

    // ── metrics ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn operations_move_their_counters() {
        let (vault, root) = initialized().await;
        assert_eq!(vault.metrics().leases_issued, 0);

        vault.write_secret(&root, "app/db", "pw").await.unwrap();
        let lease = vault.create_lease(&root, "app/db", 60, true).await.unwrap();
        vault.revoke_lease(&root, &lease.lease_id).await.unwrap();
        vault.revoke_lease(&root, &lease.lease_id).await.unwrap();
        vault.rotate_dek(&root, DekPurpose::Data).await.unwrap();
        assert!(vault.authenticate("cvt.unknown", None).await.is_err());

        let reader = limited(
            &vault,
            &root,
            PolicyInput {
                name: "reader".to_owned(),
                path_pattern: "secret/app/*".to_owned(),
                capabilities: vec![Capability::Read],
                description: String::new(),
            },
        )
        .await;
        assert!(vault.delete_secret(&reader, "app/db").await.is_err());

        assert!(vault.seal(&root).await.unwrap());
        let wrong = UnsealInput {
            password: Some("wrong"),
            shares: &[],
        };
        let right = UnsealInput {
            password: Some("correct horse"),
            shares: &[],
        };
        assert!(!vault.unseal(None, wrong, &AuditActor::default()).await.unwrap().success);
        assert!(vault.unseal(None, right, &AuditActor::default()).await.unwrap().success);

        let snap = vault.metrics();
        assert_eq!(snap.leases_issued, 1);
        assert_eq!(snap.leases_revoked, 1);
        assert_eq!(snap.dek_rotations, 1);
        assert_eq!(snap.token_rejections, 1);
        assert_eq!(snap.policy_denials, 1);
        assert_eq!(snap.unseal_failed, 1);
        assert_eq!(snap.unseal_succeeded, 1);
    }
}
