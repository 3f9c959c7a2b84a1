//! Seal lifecycle: initialize, unseal across providers, reseal.
//!
//! Initialization generates the master key once, registers the `local`
//! provider for it and writes the init marker. The marker carries an AEAD
//! check value so any candidate master key recovered by a provider can be
//! verified before it is installed in the barrier.
//!
//! Initialization is two-phase. [`SealManager::begin_initialize`] takes the
//! init lock and installs the new key, the caller provisions whatever must
//! exist from the start, and [`PendingInit::commit`] writes the marker last.
//! Until then the vault reads as uninitialized, and [`PendingInit::abort`]
//! throws the attempt away.
//!
//! Unseal tries providers in priority order. A provider that lacks input,
//! fails, or runs past the timeout is recorded as a failed attempt and the
//! next one is tried. Exhausting every provider is reported as an
//! unsuccessful [`UnsealOutcome`], not an error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::barrier::{Barrier, SealPhase};
use crate::crypto::{self, EncryptionKey};
use crate::error::SealError;
use crate::unseal::{
    ProviderRegistry, ProviderSpec, ProviderStatus, UnsealInput, UnsealProvider,
};

/// Raw storage key of the init marker.
const INIT_PATH: &str = "sys/seal/init";

/// Everything written during initialization lives under this prefix.
const SYSTEM_PREFIX: &str = "sys/";

/// Plaintext sealed into the init marker's check value.
const CHECK_MARKER: &[u8] = b"clinvault-master-key-check-v1";

/// Id of the provider created at initialization.
pub const LOCAL_PROVIDER_ID: &str = "local";

/// Priority of the provider created at initialization.
const LOCAL_PROVIDER_PRIORITY: u32 = 100;

/// Persisted once by [`SealManager::initialize`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultInit {
    pub initialized_at: DateTime<Utc>,
    pub initialized_by: String,
    /// Base64 of `encrypt(master, CHECK_MARKER)`.
    pub master_key_check: String,
}

/// One provider attempt during unseal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsealAttempt {
    pub provider_id: String,
    pub success: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Result of [`SealManager::unseal`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsealOutcome {
    pub success: bool,
    pub provider_id: Option<String>,
    pub attempts_total: usize,
    pub attempts: Vec<UnsealAttempt>,
    pub error: Option<String>,
}

/// Seal status, safe to expose without authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealStatus {
    pub initialized: bool,
    pub sealed: bool,
    pub phase: SealPhase,
    pub unseal_provider_id: Option<String>,
    pub unsealed_at: Option<DateTime<Utc>>,
    pub provider_count: usize,
}

/// Result of configuring a provider. `shares` is only non-empty for Shamir.
#[derive(Debug, Clone, Serialize)]
pub struct ConfiguredProvider {
    pub provider: ProviderStatus,
    pub shares: Vec<String>,
}

/// Owns the seal lifecycle over a shared [`Barrier`].
pub struct SealManager {
    barrier: Arc<Barrier>,
    providers: ProviderRegistry,
    unseal_timeout: Duration,
    init_lock: Mutex<()>,
}

/// An initialization that has installed its master key but not yet written
/// the init marker. Holds the init lock until committed or aborted.
pub struct PendingInit<'a> {
    manager: &'a SealManager,
    _guard: MutexGuard<'a, ()>,
    init: VaultInit,
    provider_id: String,
}

impl PendingInit<'_> {
    /// Id of the provider created for the master password.
    #[must_use]
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Write the init marker. Returns the provider id.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Barrier`] if the marker cannot be written. The
    /// attempt is rolled back first.
    pub async fn commit(self) -> Result<String, SealError> {
        if let Err(e) = self.manager.barrier.put_raw_json(INIT_PATH, &self.init).await {
            self.manager.discard_partial_init().await;
            return Err(e.into());
        }
        info!(initialized_by = %self.init.initialized_by, "vault initialized");
        Ok(self.provider_id)
    }

    /// Seal and drop everything the attempt wrote.
    pub async fn abort(self) {
        warn!(initialized_by = %self.init.initialized_by, "vault initialization rolled back");
        self.manager.discard_partial_init().await;
    }
}

impl std::fmt::Debug for PendingInit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingInit")
            .field("provider_id", &self.provider_id)
            .finish_non_exhaustive()
    }
}

impl SealManager {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>, providers: ProviderRegistry, unseal_timeout: Duration) -> Self {
        Self {
            barrier,
            providers,
            unseal_timeout,
            init_lock: Mutex::new(()),
        }
    }

    /// The provider registry.
    #[must_use]
    pub fn providers_registry(&self) -> &ProviderRegistry {
        &self.providers
    }

    /// Whether the init marker exists.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Barrier`] if storage fails.
    pub async fn is_initialized(&self) -> Result<bool, SealError> {
        Ok(self.load_init().await?.is_some())
    }

    /// Initialize a new vault and leave it unsealed.
    ///
    /// Returns the id of the provider created for `master_password`.
    ///
    /// # Errors
    ///
    /// - [`SealError::AlreadyInitialized`] if an init marker already exists.
    /// - [`SealError::InvalidConfig`] if the password is empty.
    pub async fn initialize(&self, master_password: &str, user_id: &str) -> Result<String, SealError> {
        self.begin_initialize(master_password, user_id)
            .await?
            .commit()
            .await
    }

    /// Generate and install a master key and register the `local` provider,
    /// without writing the init marker. Concurrent callers queue on the init
    /// lock and see [`SealError::AlreadyInitialized`] once one commits.
    ///
    /// Leftovers of an attempt that never committed are discarded first.
    ///
    /// # Errors
    ///
    /// - [`SealError::AlreadyInitialized`] if an init marker already exists.
    /// - [`SealError::InvalidConfig`] if the password is empty.
    pub async fn begin_initialize(
        &self,
        master_password: &str,
        user_id: &str,
    ) -> Result<PendingInit<'_>, SealError> {
        let guard = self.init_lock.lock().await;
        if self.is_initialized().await? {
            return Err(SealError::AlreadyInitialized);
        }
        self.discard_partial_init().await;

        let master = EncryptionKey::generate();
        let (provider, _) = self
            .providers
            .wrap_master(
                LOCAL_PROVIDER_ID,
                LOCAL_PROVIDER_PRIORITY,
                ProviderSpec::Local {
                    password: master_password.to_owned(),
                },
                &master,
            )
            .await?;
        let init = VaultInit {
            initialized_at: Utc::now(),
            initialized_by: user_id.to_owned(),
            master_key_check: BASE64.encode(crypto::encrypt(&master, CHECK_MARKER)?),
        };
        self.providers.save(&provider).await?;
        self.barrier.install(master, LOCAL_PROVIDER_ID).await;

        Ok(PendingInit {
            manager: self,
            _guard: guard,
            init,
            provider_id: provider.provider_id,
        })
    }

    /// Seal and delete every system record. Only called without an init
    /// marker, when nothing under the system prefix can be worth keeping.
    async fn discard_partial_init(&self) {
        self.barrier.seal().await;
        let keys = match self.barrier.list_raw(SYSTEM_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                error!(error = %e, "failed to list partial initialization");
                return;
            }
        };
        for key in keys {
            if let Err(e) = self.barrier.delete_raw(&key).await {
                error!(key = %key, error = %e, "failed to discard partial initialization");
            }
        }
    }

    /// Try providers until one yields a verified master key.
    ///
    /// # Errors
    ///
    /// - [`SealError::NotInitialized`] before initialization.
    /// - [`SealError::AlreadyUnsealed`] if already unsealed.
    /// - [`SealError::UnsealInProgress`] if another attempt is running.
    /// - [`SealError::ProviderNotFound`] if `provider_id` names no provider.
    pub async fn unseal(
        &self,
        provider_id: Option<&str>,
        input: UnsealInput<'_>,
    ) -> Result<UnsealOutcome, SealError> {
        let init = self.load_init().await?.ok_or(SealError::NotInitialized)?;
        if self.barrier.is_unsealed().await {
            return Err(SealError::AlreadyUnsealed);
        }
        let _guard = self
            .barrier
            .try_begin_unseal()
            .ok_or(SealError::UnsealInProgress)?;

        let candidates = match provider_id {
            Some(id) => vec![self.providers.get(id).await?],
            None => self.providers.list().await?,
        };
        let check = BASE64
            .decode(&init.master_key_check)
            .map_err(|e| SealError::InvalidConfig {
                reason: format!("corrupt init marker: {e}"),
            })?;

        let mut attempts = Vec::with_capacity(candidates.len());
        for mut provider in candidates {
            let started = Instant::now();
            let result = self.attempt(&provider, input, &check).await;
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            match result {
                Ok(master) => {
                    self.barrier.install(master, &provider.provider_id).await;
                    provider.last_used_at = Some(Utc::now());
                    if let Err(e) = self.providers.save(&provider).await {
                        warn!(provider_id = %provider.provider_id, error = %e, "failed to record provider use");
                    }
                    info!(provider_id = %provider.provider_id, duration_ms, "vault unsealed");
                    attempts.push(UnsealAttempt {
                        provider_id: provider.provider_id.clone(),
                        success: true,
                        duration_ms,
                        error: None,
                    });
                    return Ok(UnsealOutcome {
                        success: true,
                        provider_id: Some(provider.provider_id),
                        attempts_total: attempts.len(),
                        attempts,
                        error: None,
                    });
                }
                Err(e) => {
                    warn!(provider_id = %provider.provider_id, duration_ms, error = %e, "unseal attempt failed");
                    attempts.push(UnsealAttempt {
                        provider_id: provider.provider_id,
                        success: false,
                        duration_ms,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let message = format!("all {} providers failed", attempts.len());
        error!(attempts_total = attempts.len(), "vault unseal failed: {message}");
        Ok(UnsealOutcome {
            success: false,
            provider_id: None,
            attempts_total: attempts.len(),
            attempts,
            error: Some(message),
        })
    }

    async fn attempt(
        &self,
        provider: &UnsealProvider,
        input: UnsealInput<'_>,
        check: &[u8],
    ) -> Result<EncryptionKey, SealError> {
        let candidate = tokio::time::timeout(self.unseal_timeout, self.providers.recover(provider, input))
            .await
            .map_err(|_| SealError::ProviderUnavailable {
                provider_id: provider.provider_id.clone(),
                reason: format!("timed out after {}ms", self.unseal_timeout.as_millis()),
            })??;

        let opened = crypto::decrypt(&candidate, check).unwrap_or_default();
        if bool::from(opened.as_slice().ct_eq(CHECK_MARKER)) {
            Ok(candidate)
        } else {
            Err(SealError::ProviderUnavailable {
                provider_id: provider.provider_id.clone(),
                reason: "recovered key failed verification".to_owned(),
            })
        }
    }

    /// Drop the master key. Returns whether the vault was unsealed.
    pub async fn seal(&self) -> bool {
        let was_unsealed = self.barrier.seal().await;
        if was_unsealed {
            info!("vault sealed");
        }
        was_unsealed
    }

    /// Current seal status.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Barrier`] if storage fails.
    pub async fn status(&self) -> Result<SealStatus, SealError> {
        let initialized = self.is_initialized().await?;
        let state = self.barrier.state().await;
        let provider_count = self.providers.list().await?.len();
        Ok(SealStatus {
            initialized,
            sealed: state.sealed,
            phase: state.phase,
            unseal_provider_id: state.unseal_provider_id,
            unsealed_at: state.unsealed_at,
            provider_count,
        })
    }

    /// Register or replace a provider. Requires the vault to be unsealed.
    ///
    /// # Errors
    ///
    /// - [`SealError::Barrier`] with `Sealed` while sealed.
    /// - [`SealError::InvalidConfig`] for bad parameters.
    /// - [`SealError::ProviderUnavailable`] if the KMS refuses.
    pub async fn configure_provider(
        &self,
        provider_id: &str,
        priority: u32,
        spec: ProviderSpec,
    ) -> Result<ConfiguredProvider, SealError> {
        let master = self.barrier.master_key().await?;
        let (provider, shares) = self
            .providers
            .wrap_master(provider_id, priority, spec, &master)
            .await?;
        self.providers.save(&provider).await?;
        info!(provider_id = %provider_id, kind = provider.kind.label(), priority, "unseal provider configured");
        Ok(ConfiguredProvider {
            provider: self.providers.status(&provider).await,
            shares,
        })
    }

    /// Remove a provider unless it is the last one.
    ///
    /// # Errors
    ///
    /// - [`SealError::Barrier`] with `Sealed` while sealed.
    /// - [`SealError::ProviderNotFound`] if it does not exist.
    /// - [`SealError::LastProvider`] if it is the only provider.
    pub async fn remove_provider(&self, provider_id: &str) -> Result<(), SealError> {
        self.barrier.ensure_unsealed().await?;
        self.providers.get(provider_id).await?;
        if self.providers.list().await?.len() <= 1 {
            return Err(SealError::LastProvider {
                provider_id: provider_id.to_owned(),
            });
        }
        self.providers.delete(provider_id).await?;
        info!(provider_id = %provider_id, "unseal provider removed");
        Ok(())
    }

    /// Status of every provider in priority order.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Barrier`] if storage fails.
    pub async fn providers(&self) -> Result<Vec<ProviderStatus>, SealError> {
        let mut out = Vec::new();
        for provider in self.providers.list().await? {
            out.push(self.providers.status(&provider).await);
        }
        Ok(out)
    }

    async fn load_init(&self) -> Result<Option<VaultInit>, SealError> {
        Ok(self.barrier.get_raw_json(INIT_PATH).await?)
    }
}

impl std::fmt::Debug for SealManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealManager")
            .field("barrier", &self.barrier)
            .field("unseal_timeout", &self.unseal_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clinvault_storage::{MemoryBackend, StorageBackend};

    use super::*;
    use crate::crypto::KdfParams;
    use crate::error::BarrierError;
    use crate::unseal::{KmsClient, SoftwareKms};

    fn manager_with(kms: Option<Arc<dyn KmsClient>>) -> (Arc<Barrier>, SealManager) {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let barrier = Arc::new(Barrier::new(storage));
        let registry = ProviderRegistry::new(Arc::clone(&barrier), kms, KdfParams::minimal());
        let manager = SealManager::new(Arc::clone(&barrier), registry, Duration::from_secs(5));
        (barrier, manager)
    }

    fn password(p: &str) -> UnsealInput<'_> {
        UnsealInput {
            password: Some(p),
            shares: &[],
        }
    }

    // ── initialize ───────────────────────────────────────────────────

    #[tokio::test]
    async fn initialize_leaves_vault_unsealed_once() {
        let (barrier, mgr) = manager_with(None);
        let provider = mgr.initialize("pw", "admin").await.unwrap();
        assert_eq!(provider, LOCAL_PROVIDER_ID);
        assert!(barrier.is_unsealed().await);

        let status = mgr.status().await.unwrap();
        assert!(status.initialized);
        assert_eq!(status.provider_count, 1);

        assert!(matches!(
            mgr.initialize("pw", "admin").await,
            Err(SealError::AlreadyInitialized)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_initialize_has_one_winner() {
        let (barrier, mgr) = manager_with(None);
        let (a, b) = tokio::join!(mgr.initialize("pw-a", "alice"), mgr.initialize("pw-b", "bob"));

        assert_eq!(usize::from(a.is_ok()) + usize::from(b.is_ok()), 1);
        assert!(
            matches!(a, Err(SealError::AlreadyInitialized))
                || matches!(b, Err(SealError::AlreadyInitialized))
        );
        let winner = if a.is_ok() { "pw-a" } else { "pw-b" };
        assert_eq!(mgr.status().await.unwrap().provider_count, 1);

        mgr.seal().await;
        let outcome = mgr.unseal(None, password(winner)).await.unwrap();
        assert!(outcome.success);
        assert!(barrier.is_unsealed().await);
    }

    #[tokio::test]
    async fn aborted_initialize_can_be_retried() {
        let (barrier, mgr) = manager_with(None);
        let pending = mgr.begin_initialize("first", "admin").await.unwrap();
        assert!(barrier.is_unsealed().await);
        assert!(!mgr.is_initialized().await.unwrap());
        barrier.put("sys/dek/data/00000001", b"stale").await.unwrap();
        pending.abort().await;

        assert!(!barrier.is_unsealed().await);
        let status = mgr.status().await.unwrap();
        assert!(!status.initialized);
        assert_eq!(status.provider_count, 0);
        assert!(barrier.list_raw("sys/").await.unwrap().is_empty());

        mgr.initialize("second", "admin").await.unwrap();
        mgr.seal().await;
        assert!(!mgr.unseal(None, password("first")).await.unwrap().success);
        assert!(mgr.unseal(None, password("second")).await.unwrap().success);
    }

    // ── unseal ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn unseal_with_password_restores_same_key() {
        let (barrier, mgr) = manager_with(None);
        mgr.initialize("pw", "admin").await.unwrap();
        barrier.put("secret/x", b"v").await.unwrap();
        assert!(mgr.seal().await);
        assert!(matches!(barrier.get("secret/x").await, Err(BarrierError::Sealed)));

        let outcome = mgr.unseal(None, password("pw")).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.provider_id.as_deref(), Some("local"));
        assert_eq!(barrier.get("secret/x").await.unwrap().unwrap(), b"v");

        let provider = mgr.providers().await.unwrap().remove(0);
        assert!(provider.last_used_at.is_some());
    }

    #[tokio::test]
    async fn unseal_failure_is_an_outcome_not_an_error() {
        let (barrier, mgr) = manager_with(None);
        mgr.initialize("pw", "admin").await.unwrap();
        mgr.seal().await;

        let outcome = mgr.unseal(None, password("nope")).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.attempts_total, 1);
        assert_eq!(outcome.error.as_deref(), Some("all 1 providers failed"));
        assert!(!barrier.is_unsealed().await);
    }

    #[tokio::test]
    async fn unseal_falls_through_to_next_provider() {
        let kms: Arc<dyn KmsClient> = Arc::new(SoftwareKms::new(EncryptionKey::generate()));
        let (_, mgr) = manager_with(Some(kms));
        mgr.initialize("pw", "admin").await.unwrap();
        mgr.configure_provider(
            "kms",
            200,
            ProviderSpec::CloudKms {
                key_identifier: "clinic".to_owned(),
            },
        )
        .await
        .unwrap();
        mgr.seal().await;

        // No password: local (priority 100) fails, kms (200) succeeds.
        let outcome = mgr.unseal(None, UnsealInput::default()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.provider_id.as_deref(), Some("kms"));
        assert_eq!(outcome.attempts_total, 2);
        assert!(!outcome.attempts[0].success);
    }

    #[tokio::test]
    async fn unseal_rejects_wrong_states() {
        let (_, mgr) = manager_with(None);
        assert!(matches!(
            mgr.unseal(None, password("pw")).await,
            Err(SealError::NotInitialized)
        ));
        mgr.initialize("pw", "admin").await.unwrap();
        assert!(matches!(
            mgr.unseal(None, password("pw")).await,
            Err(SealError::AlreadyUnsealed)
        ));
        mgr.seal().await;
        assert!(matches!(
            mgr.unseal(Some("missing"), password("pw")).await,
            Err(SealError::ProviderNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_unseal_is_a_conflict() {
        let (barrier, mgr) = manager_with(None);
        mgr.initialize("pw", "admin").await.unwrap();
        mgr.seal().await;
        let _held = barrier.try_begin_unseal().unwrap();
        let err = mgr.unseal(None, password("pw")).await.unwrap_err();
        assert!(matches!(err, SealError::UnsealInProgress));
    }

    // ── providers ────────────────────────────────────────────────────

    #[tokio::test]
    async fn shamir_provider_unseals_and_last_provider_is_kept() {
        let (_, mgr) = manager_with(None);
        mgr.initialize("pw", "admin").await.unwrap();
        let configured = mgr
            .configure_provider(
                "board",
                10,
                ProviderSpec::Shamir {
                    shares: 3,
                    threshold: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(configured.shares.len(), 3);

        mgr.remove_provider("local").await.unwrap();
        assert!(matches!(
            mgr.remove_provider("board").await,
            Err(SealError::LastProvider { .. })
        ));

        mgr.seal().await;
        let outcome = mgr
            .unseal(
                Some("board"),
                UnsealInput {
                    password: None,
                    shares: &configured.shares[1..],
                },
            )
            .await
            .unwrap();
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn provider_changes_require_unsealed_vault() {
        let (_, mgr) = manager_with(None);
        mgr.initialize("pw", "admin").await.unwrap();
        mgr.seal().await;
        let err = mgr
            .configure_provider("x", 1, ProviderSpec::Shamir { shares: 2, threshold: 2 })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Sealed);
        assert_eq!(
            mgr.remove_provider("local").await.unwrap_err().kind(),
            crate::error::ErrorKind::Sealed
        );
    }
}
