//! Fail-closed audit log.
//!
//! Every operation that touches key material, secrets, credentials, tokens or
//! policy appends an entry before its result is returned. The append goes to
//! every configured backend and succeeds if at least one of them persisted
//! the entry. With no backend, or all of them failing, the append returns
//! [`AuditError::AllBackendsFailed`] and the triggering operation fails.
//!
//! Entries are written to raw storage, outside the barrier, so seal and
//! unseal events can be recorded while no master key is loaded. Sensitive
//! values are HMAC'd with [`AuditLog::hmac_field`] before they reach `details`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use clinvault_storage::StorageBackend;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::AuditError;

type HmacSha256 = Hmac<Sha256>;

const AUDIT_PREFIX: &str = "audit/";
const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 500;

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    /// Dotted action name, e.g. `secret.read` or `vault.unseal.failed`.
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Extra context. Never plaintext secrets.
    pub details: serde_json::Value,
}

/// Who performed an audited action, and from where.
#[derive(Debug, Clone, Default)]
pub struct AuditActor {
    pub user_id: Option<String>,
    pub ip_address: Option<String>,
}

impl AuditActor {
    /// Background work with no caller.
    #[must_use]
    pub fn system() -> Self {
        Self {
            user_id: Some("system".to_owned()),
            ip_address: None,
        }
    }
}

/// A place audit entries are persisted.
#[async_trait::async_trait]
pub trait AuditBackend: Send + Sync {
    /// The backend's name, for error reporting.
    fn name(&self) -> &str;

    /// Persist an entry. Must not silently drop it.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry could not be persisted.
    async fn log(&self, entry: &AuditLogEntry) -> Result<(), AuditError>;
}

/// Filters for [`AuditLog::query`]. `page` starts at 1.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    /// Exact action, or a prefix such as `secret` matching `secret.read`.
    pub action: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

/// One page of query results, newest first.
#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    pub entries: Vec<AuditLogEntry>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

/// Writes entries as raw JSON under `audit/<millis>-<id>`. Queryable.
pub struct StorageAuditBackend {
    storage: Arc<dyn StorageBackend>,
}

impl StorageAuditBackend {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    async fn query(&self, query: &AuditQuery) -> Result<AuditPage, AuditError> {
        let from_ms = query.from.map(|t| t.timestamp_millis());
        let to_ms = query.to.map(|t| t.timestamp_millis());

        let mut matched = Vec::new();
        for key in self.storage.list(AUDIT_PREFIX).await?.into_iter().rev() {
            // The key carries the timestamp, so the range check needs no read.
            if let Some(ms) = key_millis(&key) {
                if from_ms.is_some_and(|f| ms < f) || to_ms.is_some_and(|t| ms > t) {
                    continue;
                }
            }
            let Some(bytes) = self.storage.get(&key).await? else {
                continue;
            };
            let entry: AuditLogEntry =
                serde_json::from_slice(&bytes).map_err(|e| AuditError::Serialization {
                    reason: format!("{key}: {e}"),
                })?;
            if let Some(action) = &query.action {
                if !action_matches(action, &entry.action) {
                    continue;
                }
            }
            matched.push(entry);
        }

        let page_size = query
            .page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        let page = query.page.unwrap_or(1).max(1);
        let total = matched.len();
        let entries = matched
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .collect();
        Ok(AuditPage {
            entries,
            total,
            page,
            page_size,
        })
    }
}

#[async_trait::async_trait]
impl AuditBackend for StorageAuditBackend {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "storage"
    }

    async fn log(&self, entry: &AuditLogEntry) -> Result<(), AuditError> {
        let bytes = serde_json::to_vec(entry).map_err(|e| AuditError::Serialization {
            reason: e.to_string(),
        })?;
        let key = format!(
            "{AUDIT_PREFIX}{:016}-{}",
            entry.created_at.timestamp_millis(),
            entry.id
        );
        self.storage
            .put(&key, &bytes)
            .await
            .map_err(|e| AuditError::BackendFailure {
                name: "storage".to_owned(),
                reason: e.to_string(),
            })
    }
}

impl std::fmt::Debug for StorageAuditBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageAuditBackend").finish_non_exhaustive()
    }
}

/// Fans entries out to every backend with fail-closed semantics.
pub struct AuditLog {
    backends: RwLock<Vec<Arc<dyn AuditBackend>>>,
    store: Option<Arc<StorageAuditBackend>>,
    hmac_key: Vec<u8>,
}

impl AuditLog {
    /// An audit log with no backends. Every append fails until one is added.
    #[must_use]
    pub fn new(hmac_key: Vec<u8>) -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            store: None,
            hmac_key,
        }
    }

    /// An audit log writing to `storage`, which also serves queries.
    #[must_use]
    pub fn with_storage(storage: Arc<dyn StorageBackend>, hmac_key: Vec<u8>) -> Self {
        let store = Arc::new(StorageAuditBackend::new(storage));
        Self {
            backends: RwLock::new(vec![Arc::clone(&store) as Arc<dyn AuditBackend>]),
            store: Some(store),
            hmac_key,
        }
    }

    /// Register an additional backend.
    pub async fn add_backend(&self, backend: Arc<dyn AuditBackend>) {
        self.backends.write().await.push(backend);
    }

    /// Write `entry` to every backend.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::AllBackendsFailed`] if no backend persisted it.
    pub async fn append(&self, entry: &AuditLogEntry) -> Result<(), AuditError> {
        let backends = self.backends.read().await;
        let mut any_success = false;
        for backend in backends.iter() {
            match backend.log(entry).await {
                Ok(()) => any_success = true,
                Err(e) => {
                    warn!(backend = backend.name(), action = %entry.action, error = %e, "audit backend failed");
                }
            }
        }
        if any_success {
            Ok(())
        } else {
            Err(AuditError::AllBackendsFailed)
        }
    }

    /// Build and append an entry. Returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::AllBackendsFailed`] if no backend persisted it.
    pub async fn record(
        &self,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        actor: &AuditActor,
        details: serde_json::Value,
    ) -> Result<String, AuditError> {
        let entry = AuditLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            action: action.to_owned(),
            resource_type: resource_type.to_owned(),
            resource_id: resource_id.to_owned(),
            user_id: actor.user_id.clone(),
            ip_address: actor.ip_address.clone(),
            created_at: Utc::now(),
            details,
        };
        self.append(&entry).await?;
        Ok(entry.id)
    }

    /// Query the storage backend, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::BackendFailure`] if there is no queryable
    /// backend, or a storage error.
    pub async fn query(&self, query: &AuditQuery) -> Result<AuditPage, AuditError> {
        let store = self.store.as_ref().ok_or_else(|| AuditError::BackendFailure {
            name: "storage".to_owned(),
            reason: "no queryable audit backend configured".to_owned(),
        })?;
        store.query(query).await
    }

    /// Hex HMAC-SHA256 of `value`, for correlating sensitive values.
    #[must_use]
    pub fn hmac_field(&self, value: &str) -> String {
        // HMAC accepts keys of any length.
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.hmac_key) else {
            return String::new();
        };
        mac.update(value.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub async fn backend_count(&self) -> usize {
        self.backends.read().await.len()
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("hmac_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

fn key_millis(key: &str) -> Option<i64> {
    key.strip_prefix(AUDIT_PREFIX)?.split('-').next()?.parse().ok()
}

fn action_matches(filter: &str, action: &str) -> bool {
    action == filter
        || action
            .strip_prefix(filter)
            .is_some_and(|rest| rest.starts_with('.'))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clinvault_storage::MemoryBackend;
    use serde_json::json;

    use super::*;

    struct FailingBackend;

    #[async_trait::async_trait]
    impl AuditBackend for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        async fn log(&self, _entry: &AuditLogEntry) -> Result<(), AuditError> {
            Err(AuditError::BackendFailure {
                name: "failing".to_owned(),
                reason: "disk full".to_owned(),
            })
        }
    }

    fn audit() -> AuditLog {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        AuditLog::with_storage(storage, b"audit-key".to_vec())
    }

    async fn record(log: &AuditLog, action: &str) {
        log.record(action, "secret", "db/pw", &AuditActor::system(), json!({}))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    // ── fail-closed ────────────────────────────────────────────────

    #[tokio::test]
    async fn no_backends_is_a_failure() {
        let log = AuditLog::new(b"k".to_vec());
        let err = log
            .record("secret.read", "secret", "x", &AuditActor::default(), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::AllBackendsFailed));
    }

    #[tokio::test]
    async fn one_surviving_backend_is_enough() {
        let log = audit();
        log.add_backend(Arc::new(FailingBackend)).await;
        record(&log, "secret.read").await;

        let only_failing = AuditLog::new(b"k".to_vec());
        only_failing.add_backend(Arc::new(FailingBackend)).await;
        assert!(
            only_failing
                .record("secret.read", "secret", "x", &AuditActor::default(), json!({}))
                .await
                .is_err()
        );
    }

    // ── query ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn query_filters_and_pages_newest_first() {
        let log = audit();
        for action in ["secret.read", "secret.write", "vault.seal", "secret.read"] {
            record(&log, action).await;
        }

        let all = log.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(all.total, 4);
        assert_eq!(all.entries[0].action, "secret.read");
        assert_eq!(all.entries[1].action, "vault.seal");

        let secrets = log
            .query(&AuditQuery {
                action: Some("secret".to_owned()),
                page: Some(2),
                page_size: Some(2),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(secrets.total, 3);
        assert_eq!(secrets.entries.len(), 1);
        assert_eq!(secrets.entries[0].action, "secret.read");

        let none = log
            .query(&AuditQuery {
                from: Some(Utc::now() + chrono::Duration::hours(1)),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(none.total, 0);
    }

    #[test]
    fn action_prefix_requires_a_dot_boundary() {
        assert!(action_matches("vault.unseal", "vault.unseal"));
        assert!(action_matches("vault.unseal", "vault.unseal.failed"));
        assert!(!action_matches("vault.un", "vault.unseal"));
    }

    #[test]
    fn hmac_is_stable_and_keyed() {
        let a = AuditLog::new(b"one".to_vec());
        let b = AuditLog::new(b"two".to_vec());
        assert_eq!(a.hmac_field("cvt.abc"), a.hmac_field("cvt.abc"));
        assert_ne!(a.hmac_field("cvt.abc"), b.hmac_field("cvt.abc"));
        assert_eq!(a.hmac_field("x").len(), 64);
    }
}
