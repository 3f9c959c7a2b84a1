//! Time-bounded leases over secrets and dynamic credentials.
//!
//! Leases are stored through the barrier at `sys/leases/<id>`. Expiry is
//! enforced twice: lazily whenever a lease is used ([`LeaseManager::ensure_active`])
//! and by the sweep job, which collects [`LeaseManager::find_expired`].
//! Revoked leases are kept as tombstones so revocation stays idempotent.
//!
//! Renew and revoke are read-modify-write over the same record, so both run
//! under a lock striped by lease id and re-read the lease once they hold it.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::barrier::Barrier;
use crate::error::LeaseError;
use crate::metrics::VaultMetrics;

/// Storage prefix for lease entries.
const LEASE_PREFIX: &str = "sys/leases/";

/// Number of mutation locks leases are spread over.
const LOCK_STRIPES: usize = 64;

/// What a lease grants access to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LeaseResource {
    Secret { path: String },
    DynamicCredential { credential_id: String },
}

impl LeaseResource {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Secret { path } => format!("secret/{path}"),
            Self::DynamicCredential { credential_id } => format!("credential/{credential_id}"),
        }
    }
}

/// A lease record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: String,
    pub resource: LeaseResource,
    pub ttl_secs: u64,
    pub renewable: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Renewals never extend past this point.
    pub max_expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Lease {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Not revoked and not expired.
    #[must_use]
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && !self.is_expired_at(now)
    }

    /// Whole seconds left, zero once expired.
    #[must_use]
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from((self.expires_at - now).num_seconds()).unwrap_or(0)
    }
}

/// Creates, renews, revokes and scans leases.
pub struct LeaseManager {
    barrier: Arc<Barrier>,
    max_ttl: Duration,
    locks: [Mutex<()>; LOCK_STRIPES],
    metrics: Arc<VaultMetrics>,
}

impl LeaseManager {
    /// `max_ttl` caps both the initial TTL and total lifetime under renewal.
    #[must_use]
    pub fn new(barrier: Arc<Barrier>, max_ttl: std::time::Duration) -> Self {
        Self {
            barrier,
            max_ttl: Duration::from_std(max_ttl).unwrap_or(Duration::days(30)),
            locks: std::array::from_fn(|_| Mutex::new(())),
            metrics: Arc::new(VaultMetrics::new()),
        }
    }

    /// Count issued and revoked leases in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<VaultMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Issue a lease on `resource`.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::InvalidTtl`] if `ttl_secs` is zero or above the maximum.
    /// - [`LeaseError::Barrier`] if sealed or storage fails.
    pub async fn create(
        &self,
        resource: LeaseResource,
        ttl_secs: u64,
        renewable: bool,
    ) -> Result<Lease, LeaseError> {
        let ttl = self.checked_ttl(ttl_secs)?;
        let now = Utc::now();
        let lease = Lease {
            lease_id: uuid::Uuid::new_v4().to_string(),
            resource,
            ttl_secs,
            renewable,
            created_at: now,
            expires_at: now + ttl,
            max_expires_at: now + self.max_ttl,
            revoked: false,
            revoked_at: None,
        };
        self.save(&lease).await?;
        self.metrics.record_lease_issued();
        info!(
            lease_id = %lease.lease_id,
            resource = %lease.resource.describe(),
            ttl_secs,
            renewable,
            "lease created"
        );
        Ok(lease)
    }

    /// Look up a lease by id.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotFound`] if the lease doesn't exist.
    /// - [`LeaseError::Barrier`] if sealed or storage fails.
    pub async fn lookup(&self, lease_id: &str) -> Result<Lease, LeaseError> {
        self.barrier
            .get_json(&lease_key(lease_id))
            .await?
            .ok_or_else(|| LeaseError::NotFound {
                lease_id: lease_id.to_owned(),
            })
    }

    /// Extend a live, renewable lease. The expiry never moves backwards and
    /// never passes `max_expires_at`.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotFound`] if the lease doesn't exist.
    /// - [`LeaseError::NotRenewable`] if it was issued non-renewable.
    /// - [`LeaseError::Revoked`] or [`LeaseError::Expired`] if it is no longer live.
    pub async fn renew(&self, lease_id: &str, increment_secs: u64) -> Result<Lease, LeaseError> {
        let _lock = self.lock(lease_id).lock().await;
        let mut lease = self.lookup(lease_id).await?;
        let now = Utc::now();

        if !lease.renewable {
            return Err(LeaseError::NotRenewable {
                lease_id: lease_id.to_owned(),
            });
        }
        if lease.revoked {
            return Err(LeaseError::Revoked {
                lease_id: lease_id.to_owned(),
            });
        }
        if lease.is_expired_at(now) {
            return Err(LeaseError::Expired {
                lease_id: lease_id.to_owned(),
            });
        }

        let increment = self.checked_ttl(increment_secs)?;
        let requested = (now + increment).min(lease.max_expires_at);
        lease.expires_at = lease.expires_at.max(requested);
        self.save(&lease).await?;

        info!(lease_id = %lease.lease_id, expires_at = %lease.expires_at, "lease renewed");
        Ok(lease)
    }

    /// Revoke a lease. Revoking an already revoked lease returns it unchanged.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotFound`] if the lease doesn't exist.
    /// - [`LeaseError::Barrier`] if sealed or storage fails.
    pub async fn revoke(&self, lease_id: &str) -> Result<Lease, LeaseError> {
        let _lock = self.lock(lease_id).lock().await;
        let mut lease = self.lookup(lease_id).await?;
        if lease.revoked {
            return Ok(lease);
        }
        lease.revoked = true;
        lease.revoked_at = Some(Utc::now());
        self.save(&lease).await?;
        self.metrics.record_lease_revoked();
        info!(lease_id = %lease_id, "lease revoked");
        Ok(lease)
    }

    /// The lease if it is still live, otherwise why not.
    ///
    /// # Errors
    ///
    /// [`LeaseError::NotFound`], [`LeaseError::Revoked`] or [`LeaseError::Expired`].
    pub async fn ensure_active(&self, lease_id: &str) -> Result<Lease, LeaseError> {
        let lease = self.lookup(lease_id).await?;
        if lease.revoked {
            return Err(LeaseError::Revoked {
                lease_id: lease_id.to_owned(),
            });
        }
        if lease.is_expired_at(Utc::now()) {
            return Err(LeaseError::Expired {
                lease_id: lease_id.to_owned(),
            });
        }
        Ok(lease)
    }

    /// Every stored lease, including tombstones.
    ///
    /// Unreadable records are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Barrier`] if sealed or listing fails.
    pub async fn list(&self) -> Result<Vec<Lease>, LeaseError> {
        let mut leases = Vec::new();
        for key in self.barrier.list(LEASE_PREFIX).await? {
            match self.barrier.get_json::<Lease>(&key).await {
                Ok(Some(lease)) => leases.push(lease),
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "failed to read lease"),
            }
        }
        leases.sort_by_key(|l| l.created_at);
        Ok(leases)
    }

    /// Live leases.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Barrier`] if sealed or listing fails.
    pub async fn active(&self) -> Result<Vec<Lease>, LeaseError> {
        let now = Utc::now();
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|l| l.is_live_at(now))
            .collect())
    }

    /// Unrevoked leases past their expiry, for the sweep.
    ///
    /// # Errors
    ///
    /// Returns [`LeaseError::Barrier`] if sealed or listing fails.
    pub async fn find_expired(&self) -> Result<Vec<Lease>, LeaseError> {
        let now = Utc::now();
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|l| !l.revoked && l.is_expired_at(now))
            .collect())
    }

    pub(crate) async fn save(&self, lease: &Lease) -> Result<(), LeaseError> {
        self.barrier
            .put_json(&lease_key(&lease.lease_id), lease)
            .await?;
        Ok(())
    }

    fn checked_ttl(&self, secs: u64) -> Result<Duration, LeaseError> {
        let ttl = i64::try_from(secs)
            .ok()
            .and_then(Duration::try_seconds)
            .ok_or_else(|| LeaseError::InvalidTtl {
                reason: format!("{secs}s is out of range"),
            })?;
        if secs == 0 {
            return Err(LeaseError::InvalidTtl {
                reason: "ttl must be positive".to_owned(),
            });
        }
        if ttl > self.max_ttl {
            return Err(LeaseError::InvalidTtl {
                reason: format!(
                    "{secs}s exceeds the maximum lease ttl of {}s",
                    self.max_ttl.num_seconds()
                ),
            });
        }
        Ok(ttl)
    }

    fn lock(&self, lease_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        lease_id.hash(&mut hasher);
        let stripe = usize::try_from(hasher.finish() % LOCK_STRIPES as u64).unwrap_or(0);
        &self.locks[stripe]
    }
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("max_ttl_secs", &self.max_ttl.num_seconds())
            .finish_non_exhaustive()
    }
}

fn lease_key(lease_id: &str) -> String {
    format!("{LEASE_PREFIX}{lease_id}")
}
