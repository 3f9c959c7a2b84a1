//! Operational counters.
//!
//! One [`VaultMetrics`] is shared by every component of a [`Vault`](crate::Vault).
//! Counters only ever increase and are read through [`VaultMetrics::snapshot`];
//! rendering them for a scraper is left to the server.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Process-lifetime counters for vault operations.
#[derive(Debug, Default)]
pub struct VaultMetrics {
    unseal_succeeded: AtomicU64,
    unseal_failed: AtomicU64,
    dek_rotations: AtomicU64,
    leases_issued: AtomicU64,
    leases_revoked: AtomicU64,
    credential_provision_failures: AtomicU64,
    policy_denials: AtomicU64,
    token_rejections: AtomicU64,
    rotations_succeeded: AtomicU64,
    rotations_failed: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub unseal_succeeded: u64,
    pub unseal_failed: u64,
    pub dek_rotations: u64,
    pub leases_issued: u64,
    pub leases_revoked: u64,
    pub credential_provision_failures: u64,
    pub policy_denials: u64,
    pub token_rejections: u64,
    pub rotations_succeeded: u64,
    pub rotations_failed: u64,
}

impl VaultMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// One provider attempt during unseal.
    pub fn record_unseal_attempt(&self, success: bool) {
        if success {
            bump(&self.unseal_succeeded);
        } else {
            bump(&self.unseal_failed);
        }
    }

    pub fn record_dek_rotation(&self) {
        bump(&self.dek_rotations);
    }

    pub fn record_lease_issued(&self) {
        bump(&self.leases_issued);
    }

    /// Only the transition to revoked counts, not idempotent repeats.
    pub fn record_lease_revoked(&self) {
        bump(&self.leases_revoked);
    }

    pub fn record_provision_failure(&self) {
        bump(&self.credential_provision_failures);
    }

    pub fn record_policy_denial(&self) {
        bump(&self.policy_denials);
    }

    /// A presented token that did not resolve to a caller.
    pub fn record_token_rejection(&self) {
        bump(&self.token_rejections);
    }

    /// A secret or A/B database credential rotation.
    pub fn record_rotation(&self, success: bool) {
        if success {
            bump(&self.rotations_succeeded);
        } else {
            bump(&self.rotations_failed);
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            unseal_succeeded: read(&self.unseal_succeeded),
            unseal_failed: read(&self.unseal_failed),
            dek_rotations: read(&self.dek_rotations),
            leases_issued: read(&self.leases_issued),
            leases_revoked: read(&self.leases_revoked),
            credential_provision_failures: read(&self.credential_provision_failures),
            policy_denials: read(&self.policy_denials),
            token_rejections: read(&self.token_rejections),
            rotations_succeeded: read(&self.rotations_succeeded),
            rotations_failed: read(&self.rotations_failed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_only_grow() {
        let metrics = VaultMetrics::new();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());

        metrics.record_unseal_attempt(false);
        metrics.record_unseal_attempt(true);
        metrics.record_unseal_attempt(true);
        metrics.record_rotation(false);
        metrics.record_policy_denial();

        let snap = metrics.snapshot();
        assert_eq!(snap.unseal_succeeded, 2);
        assert_eq!(snap.unseal_failed, 1);
        assert_eq!(snap.rotations_failed, 1);
        assert_eq!(snap.rotations_succeeded, 0);
        assert_eq!(snap.policy_denials, 1);
    }
}
