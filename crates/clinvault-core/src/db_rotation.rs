//! A/B slot rotation of the application's database credential.
//!
//! Two slots hold dynamic credentials; exactly one is active. A rotation
//! provisions a fresh credential in the inactive slot, flips the active slot,
//! and queues the previously active credential for revocation once its grace
//! period has passed, so connections opened with it can drain.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::barrier::Barrier;
use crate::credentials::{AdminCredentials, CredentialIssuer, CredentialRequest, DbTarget};
use crate::dek::{DekManager, DekPurpose, Envelope};
use crate::error::{CredentialError, RotationError};

const STATE_PATH: &str = "sys/db-rotation/state";
const DEFAULT_GRACE_SECS: u64 = 300;
const MAX_GRACE_SECS: u64 = 7 * 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slot {
    A,
    B,
}

impl Slot {
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::A => "A",
            Self::B => "B",
        })
    }
}

/// A credential held in a slot. The password is a `Data` envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotCredential {
    pub credential_id: String,
    pub lease_id: String,
    pub username: String,
    pub password: Envelope,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingRevocation {
    pub credential_id: String,
    pub username: String,
    pub revoke_after: DateTime<Utc>,
}

/// Persisted rotation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbCredentialState {
    pub backend: String,
    pub target: DbTarget,
    pub admin_username: String,
    pub admin_password: Envelope,
    pub ttl_secs: u64,
    pub grace_period_secs: u64,
    pub read_only: bool,
    pub active_slot: Slot,
    pub slot_a: Option<SlotCredential>,
    pub slot_b: Option<SlotCredential>,
    pub pending_revocations: Vec<PendingRevocation>,
    pub last_rotated_at: Option<DateTime<Utc>>,
    pub rotation_count: u64,
}

impl DbCredentialState {
    fn slot(&self, slot: Slot) -> Option<&SlotCredential> {
        match slot {
            Slot::A => self.slot_a.as_ref(),
            Slot::B => self.slot_b.as_ref(),
        }
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut Option<SlotCredential> {
        match slot {
            Slot::A => &mut self.slot_a,
            Slot::B => &mut self.slot_b,
        }
    }
}

/// Input for [`DbCredentialRotator::configure`].
#[derive(Debug, Clone, Deserialize)]
pub struct DbRotationConfig {
    pub backend: String,
    pub admin: AdminCredentials,
    pub target: DbTarget,
    pub ttl_secs: u64,
    #[serde(default = "default_grace")]
    pub grace_period_secs: u64,
    #[serde(default)]
    pub read_only: bool,
}

fn default_grace() -> u64 {
    DEFAULT_GRACE_SECS
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub slot: Slot,
    pub active: bool,
    pub credential_id: Option<String>,
    pub username: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DbRotationStatus {
    pub active_slot: Slot,
    pub slot_a_active: bool,
    pub slot_b_active: bool,
    pub slots: Vec<SlotStatus>,
    pub last_rotated_at: Option<DateTime<Utc>>,
    pub rotation_count: u64,
    pub pending_revocations: Vec<PendingRevocation>,
}

impl From<&DbCredentialState> for DbRotationStatus {
    fn from(state: &DbCredentialState) -> Self {
        let slots = [Slot::A, Slot::B]
            .into_iter()
            .map(|slot| {
                let cred = state.slot(slot);
                SlotStatus {
                    slot,
                    active: slot == state.active_slot,
                    credential_id: cred.map(|c| c.credential_id.clone()),
                    username: cred.map(|c| c.username.clone()),
                    expires_at: cred.map(|c| c.expires_at),
                }
            })
            .collect();
        Self {
            active_slot: state.active_slot,
            slot_a_active: state.active_slot == Slot::A,
            slot_b_active: state.active_slot == Slot::B,
            slots,
            last_rotated_at: state.last_rotated_at,
            rotation_count: state.rotation_count,
            pending_revocations: state.pending_revocations.clone(),
        }
    }
}

/// Result of [`DbCredentialRotator::rotate`].
#[derive(Debug, Clone, Serialize)]
pub struct DbRotationResult {
    pub active_slot: Slot,
    pub username: String,
    pub expires_at: DateTime<Utc>,
    pub rotation_count: u64,
}

/// Plaintext credentials of the active slot, for the connection pool owner.
#[derive(Clone, Serialize)]
pub struct ActiveCredentials {
    pub slot: Slot,
    pub username: String,
    pub password: String,
    pub target: DbTarget,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for ActiveCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveCredentials")
            .field("slot", &self.slot)
            .field("username", &self.username)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives A/B rotation over a [`CredentialIssuer`].
pub struct DbCredentialRotator {
    barrier: Arc<Barrier>,
    dek: Arc<DekManager>,
    issuer: Arc<CredentialIssuer>,
    busy: AtomicBool,
}

impl DbCredentialRotator {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>, dek: Arc<DekManager>, issuer: Arc<CredentialIssuer>) -> Self {
        Self {
            barrier,
            dek,
            issuer,
            busy: AtomicBool::new(false),
        }
    }

    fn try_busy(&self) -> Option<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| BusyGuard(&self.busy))
    }

    /// Set the backend, admin account and target. Existing slots are kept.
    ///
    /// # Errors
    ///
    /// - [`RotationError::Credential`] for an unknown backend.
    /// - [`RotationError::InvalidSchedule`] for a zero TTL or a grace period over a week.
    /// - [`RotationError::InProgress`] while a rotation runs.
    pub async fn configure(&self, config: DbRotationConfig) -> Result<DbRotationStatus, RotationError> {
        if !self.issuer.backend_names().contains(&config.backend) {
            return Err(CredentialError::UnknownBackend {
                name: config.backend,
            }
            .into());
        }
        if config.ttl_secs == 0 {
            return Err(RotationError::InvalidSchedule {
                reason: "ttl_secs must be positive".to_owned(),
            });
        }
        if config.grace_period_secs > MAX_GRACE_SECS {
            return Err(RotationError::InvalidSchedule {
                reason: format!("grace_period_secs must not exceed {MAX_GRACE_SECS}"),
            });
        }
        let _busy = self.try_busy().ok_or(RotationError::InProgress)?;

        let admin_password = self
            .dek
            .encrypt(DekPurpose::Data, config.admin.password.as_bytes())
            .await?;
        let previous = self.load().await?;
        let state = DbCredentialState {
            backend: config.backend,
            target: config.target,
            admin_username: config.admin.username,
            admin_password,
            ttl_secs: config.ttl_secs,
            grace_period_secs: config.grace_period_secs,
            read_only: config.read_only,
            active_slot: previous.as_ref().map_or(Slot::A, |p| p.active_slot),
            slot_a: previous.as_ref().and_then(|p| p.slot_a.clone()),
            slot_b: previous.as_ref().and_then(|p| p.slot_b.clone()),
            pending_revocations: previous
                .as_ref()
                .map(|p| p.pending_revocations.clone())
                .unwrap_or_default(),
            last_rotated_at: previous.as_ref().and_then(|p| p.last_rotated_at),
            rotation_count: previous.map_or(0, |p| p.rotation_count),
        };
        self.save(&state).await?;
        info!(
            backend = %state.backend,
            database = %state.target.database,
            ttl_secs = state.ttl_secs,
            "database credential rotation configured"
        );
        Ok(DbRotationStatus::from(&state))
    }

    /// Provision into the inactive slot and make it active.
    ///
    /// # Errors
    ///
    /// - [`RotationError::NotConfigured`] before [`configure`](Self::configure).
    /// - [`RotationError::InProgress`] if another rotation is running.
    /// - [`RotationError::Credential`] if provisioning fails; the state is unchanged.
    pub async fn rotate(&self) -> Result<DbRotationResult, RotationError> {
        let _busy = self.try_busy().ok_or(RotationError::InProgress)?;
        let mut state = self.load().await?.ok_or(RotationError::NotConfigured)?;
        let target_slot = state.active_slot.other();

        // A credential left in the inactive slot must go before the slot is reused.
        if let Some(stale) = state.slot(target_slot).cloned() {
            match self.issuer.revoke(&stale.credential_id).await {
                Ok(_) | Err(CredentialError::NotFound { .. }) => {
                    state
                        .pending_revocations
                        .retain(|p| p.credential_id != stale.credential_id);
                }
                Err(e) => {
                    warn!(slot = %target_slot, username = %stale.username, error = %e, "failed to revoke stale slot credential");
                }
            }
        }

        let admin_password = self.dek.decrypt(&state.admin_password).await?;
        let issued = self
            .issuer
            .create(CredentialRequest {
                backend: state.backend.clone(),
                admin: AdminCredentials {
                    username: state.admin_username.clone(),
                    password: String::from_utf8_lossy(&admin_password).into_owned(),
                },
                target: state.target.clone(),
                ttl_secs: state.ttl_secs,
                read_only: state.read_only,
            })
            .await?;
        let password = self
            .dek
            .encrypt(DekPurpose::Data, issued.password.as_bytes())
            .await?;

        let now = Utc::now();
        let grace = Duration::seconds(
            i64::try_from(state.grace_period_secs.min(MAX_GRACE_SECS)).unwrap_or_default(),
        );
        if let Some(previous) = state.slot(state.active_slot).cloned() {
            state.pending_revocations.push(PendingRevocation {
                credential_id: previous.credential_id,
                username: previous.username,
                revoke_after: now + grace,
            });
        }
        *state.slot_mut(target_slot) = Some(SlotCredential {
            credential_id: issued.credential_id,
            lease_id: issued.lease_id,
            username: issued.username.clone(),
            password,
            created_at: now,
            expires_at: issued.expires_at,
        });
        state.active_slot = target_slot;
        state.last_rotated_at = Some(now);
        state.rotation_count += 1;
        self.save(&state).await?;

        info!(
            slot = %target_slot,
            username = %issued.username,
            rotation = state.rotation_count,
            "database credential rotated"
        );
        Ok(DbRotationResult {
            active_slot: target_slot,
            username: issued.username,
            expires_at: issued.expires_at,
            rotation_count: state.rotation_count,
        })
    }

    /// Revoke queued credentials whose grace period has passed. Skips the
    /// pass while a rotation runs. Returns how many were revoked.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::Barrier`] if sealed or storage fails.
    pub async fn process_pending(&self) -> Result<usize, RotationError> {
        let Some(_busy) = self.try_busy() else {
            return Ok(0);
        };
        let Some(mut state) = self.load().await? else {
            return Ok(0);
        };

        let now = Utc::now();
        let mut revoked = Vec::new();
        let mut remaining = Vec::with_capacity(state.pending_revocations.len());
        for pending in std::mem::take(&mut state.pending_revocations) {
            if pending.revoke_after > now {
                remaining.push(pending);
                continue;
            }
            match self.issuer.revoke(&pending.credential_id).await {
                Ok(_) | Err(CredentialError::NotFound { .. }) => {
                    info!(username = %pending.username, "retired database credential revoked");
                    revoked.push(pending.credential_id);
                }
                Err(e) => {
                    warn!(username = %pending.username, error = %e, "pending revocation failed");
                    remaining.push(pending);
                }
            }
        }
        state.pending_revocations = remaining;

        let inactive = state.active_slot.other();
        if state
            .slot(inactive)
            .is_some_and(|c| revoked.contains(&c.credential_id))
        {
            *state.slot_mut(inactive) = None;
        }
        self.save(&state).await?;
        Ok(revoked.len())
    }

    /// True when configured and the active slot is empty or within
    /// `threshold` of expiry.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::Barrier`] if sealed or storage fails.
    pub async fn needs_rotation(&self, threshold: Duration) -> Result<bool, RotationError> {
        let Some(state) = self.load().await? else {
            return Ok(false);
        };
        Ok(state
            .slot(state.active_slot)
            .is_none_or(|c| c.expires_at - Utc::now() <= threshold))
    }

    /// # Errors
    ///
    /// Returns [`RotationError::NotConfigured`] before configuration.
    pub async fn status(&self) -> Result<DbRotationStatus, RotationError> {
        let state = self.load().await?.ok_or(RotationError::NotConfigured)?;
        Ok(DbRotationStatus::from(&state))
    }

    /// Decrypt the active slot's credentials.
    ///
    /// # Errors
    ///
    /// - [`RotationError::NotConfigured`] before the first rotation.
    /// - [`RotationError::Dek`] if decryption fails.
    pub async fn active_credentials(&self) -> Result<ActiveCredentials, RotationError> {
        let state = self.load().await?.ok_or(RotationError::NotConfigured)?;
        let cred = state
            .slot(state.active_slot)
            .ok_or(RotationError::NotConfigured)?;
        let password = self.dek.decrypt(&cred.password).await?;
        Ok(ActiveCredentials {
            slot: state.active_slot,
            username: cred.username.clone(),
            password: String::from_utf8_lossy(&password).into_owned(),
            target: state.target.clone(),
            expires_at: cred.expires_at,
        })
    }

    /// Whether [`configure`](Self::configure) has been called.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::Barrier`] if sealed or storage fails.
    pub async fn is_configured(&self) -> Result<bool, RotationError> {
        Ok(self.barrier.exists(STATE_PATH).await?)
    }

    async fn load(&self) -> Result<Option<DbCredentialState>, RotationError> {
        Ok(self.barrier.get_json(STATE_PATH).await?)
    }

    async fn save(&self, state: &DbCredentialState) -> Result<(), RotationError> {
        self.barrier.put_json(STATE_PATH, state).await?;
        Ok(())
    }
}

impl fmt::Debug for DbCredentialRotator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbCredentialRotator")
            .field("busy", &self.busy.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
