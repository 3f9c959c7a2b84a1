//! Server configuration for `clinvault`.
//!
//! Loaded from `CLINVAULT_*` environment variables with development-friendly
//! defaults. Unparseable values fall back to the default.

use std::net::SocketAddr;
use std::time::Duration;

use clinvault_core::VaultOptions;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    pub storage_backend: StorageBackendType,
    /// Fallback log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// JSON-lines audit file, in addition to the storage audit backend.
    pub audit_file_path: Option<String>,
    /// Unseal with the local provider at boot.
    pub unseal_password: Option<String>,
    /// Hex root key for the software KMS client.
    pub kms_key_hex: Option<String>,
    pub scheduler_tick: Duration,
    pub lease_sweep_interval: Duration,
    pub rotation_interval: Duration,
    /// Rotate DEKs older than this many days. Off when unset.
    pub dek_rotation_days: Option<u32>,
    pub max_lease_ttl: Duration,
    /// Skip `mlockall`, for development without `CAP_IPC_LOCK`.
    pub disable_mlock: bool,
}

/// Supported storage backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendType {
    /// In-memory. Development only, data is lost on restart.
    Memory,
    Redb { path: String },
}

impl ServerConfig {
    /// Load configuration from the environment.
    ///
    /// - `CLINVAULT_BIND_ADDR` (default `127.0.0.1:8200`)
    /// - `CLINVAULT_STORAGE`: `memory` or `redb` (default `memory`)
    /// - `CLINVAULT_STORAGE_PATH` (default `./data/clinvault.redb`)
    /// - `CLINVAULT_LOG_LEVEL` (default `info`)
    /// - `CLINVAULT_AUDIT_FILE`
    /// - `CLINVAULT_UNSEAL_PASSWORD`
    /// - `CLINVAULT_KMS_KEY`
    /// - `CLINVAULT_SCHEDULER_TICK` seconds (default `5`)
    /// - `CLINVAULT_LEASE_SWEEP_INTERVAL` seconds (default `60`)
    /// - `CLINVAULT_ROTATION_INTERVAL` seconds (default `300`)
    /// - `CLINVAULT_DEK_ROTATION_DAYS`
    /// - `CLINVAULT_MAX_LEASE_TTL` seconds (default 30 days)
    /// - `CLINVAULT_DISABLE_MLOCK` (default `false`)
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let bind_addr = lookup("CLINVAULT_BIND_ADDR")
            .and_then(|a| a.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8200)));

        let storage_path =
            lookup("CLINVAULT_STORAGE_PATH").unwrap_or_else(|| "./data/clinvault.redb".to_owned());
        let storage_backend = match lookup("CLINVAULT_STORAGE")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "redb" => StorageBackendType::Redb { path: storage_path },
            _ => StorageBackendType::Memory,
        };

        let secs = |key: &str, default: u64| {
            Duration::from_secs(
                lookup(key)
                    .and_then(|v| v.parse().ok())
                    .filter(|v| *v > 0)
                    .unwrap_or(default),
            )
        };
        let defaults = VaultOptions::default();

        Self {
            bind_addr,
            storage_backend,
            log_level: lookup("CLINVAULT_LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
            audit_file_path: lookup("CLINVAULT_AUDIT_FILE").filter(|p| !p.is_empty()),
            unseal_password: lookup("CLINVAULT_UNSEAL_PASSWORD").filter(|p| !p.is_empty()),
            kms_key_hex: lookup("CLINVAULT_KMS_KEY").filter(|k| !k.is_empty()),
            scheduler_tick: secs("CLINVAULT_SCHEDULER_TICK", 5),
            lease_sweep_interval: secs("CLINVAULT_LEASE_SWEEP_INTERVAL", 60),
            rotation_interval: secs("CLINVAULT_ROTATION_INTERVAL", 300),
            dek_rotation_days: lookup("CLINVAULT_DEK_ROTATION_DAYS")
                .and_then(|v| v.parse().ok())
                .filter(|d| *d > 0),
            max_lease_ttl: secs("CLINVAULT_MAX_LEASE_TTL", defaults.max_lease_ttl.as_secs()),
            disable_mlock: lookup("CLINVAULT_DISABLE_MLOCK")
                .is_some_and(|v| v == "true" || v == "1"),
        }
    }

    /// Core options derived from this configuration.
    #[must_use]
    pub fn vault_options(&self) -> VaultOptions {
        VaultOptions {
            max_lease_ttl: self.max_lease_ttl,
            ..VaultOptions::default()
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("storage_backend", &self.storage_backend)
            .field("log_level", &self.log_level)
            .field("audit_file_path", &self.audit_file_path)
            .field("auto_unseal", &self.unseal_password.is_some())
            .field("kms", &self.kms_key_hex.is_some())
            .field("scheduler_tick", &self.scheduler_tick)
            .field("dek_rotation_days", &self.dek_rotation_days)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> ServerConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        ServerConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_are_local_and_in_memory() {
        let c = config(&[]);
        assert_eq!(c.bind_addr, SocketAddr::from(([127, 0, 0, 1], 8200)));
        assert_eq!(c.storage_backend, StorageBackendType::Memory);
        assert_eq!(c.lease_sweep_interval, Duration::from_secs(60));
        assert!(c.dek_rotation_days.is_none());
        assert!(!c.disable_mlock);
    }

    #[test]
    fn redb_and_intervals_are_read() {
        let c = config(&[
            ("CLINVAULT_STORAGE", "REDB"),
            ("CLINVAULT_STORAGE_PATH", "/var/lib/clinvault.redb"),
            ("CLINVAULT_SCHEDULER_TICK", "2"),
            ("CLINVAULT_DEK_ROTATION_DAYS", "90"),
            ("CLINVAULT_MAX_LEASE_TTL", "3600"),
        ]);
        assert_eq!(
            c.storage_backend,
            StorageBackendType::Redb {
                path: "/var/lib/clinvault.redb".to_owned()
            }
        );
        assert_eq!(c.scheduler_tick, Duration::from_secs(2));
        assert_eq!(c.dek_rotation_days, Some(90));
        assert_eq!(c.vault_options().max_lease_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn bad_values_fall_back() {
        let c = config(&[
            ("CLINVAULT_BIND_ADDR", "not-an-addr"),
            ("CLINVAULT_LEASE_SWEEP_INTERVAL", "0"),
            ("CLINVAULT_UNSEAL_PASSWORD", ""),
        ]);
        assert_eq!(c.bind_addr.port(), 8200);
        assert_eq!(c.lease_sweep_interval, Duration::from_secs(60));
        assert!(c.unseal_password.is_none());
    }
}
