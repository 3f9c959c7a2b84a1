//! Hierarchical secret store.
//!
//! Secrets live at `secret/<path>` and their values are sealed under the
//! current `Data` DEK, so a secret record is double-wrapped: envelope
//! ciphertext inside a barrier-encrypted record.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::barrier::Barrier;
use crate::dek::{DekManager, DekPurpose, Envelope};
use crate::error::SecretError;

const SECRET_PREFIX: &str = "secret/";

/// Deepest allowed path.
const MAX_SEGMENTS: usize = 10;

/// The persisted form of a secret.
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredSecret {
    pub path: String,
    #[serde(flatten)]
    pub envelope: Envelope,
    /// Number of value writes, starting at 1.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A decrypted secret.
#[derive(Clone, Serialize)]
pub struct Secret {
    pub path: String,
    pub value: String,
    pub version: u64,
    pub dek_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("path", &self.path)
            .field("version", &self.version)
            .field("value", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

/// Result of [`SecretStore::put`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretWrite {
    pub path: String,
    pub version: u64,
    pub dek_version: u32,
    pub created: bool,
}

/// One child in a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretEntry {
    pub name: String,
    pub path: String,
    pub is_folder: bool,
}

/// Check a path against the path rules and return it without surrounding slashes.
///
/// # Errors
///
/// Returns [`SecretError::InvalidPath`] describing the first violated rule.
pub fn normalize_path(path: &str) -> Result<String, SecretError> {
    let invalid = |reason: &str| SecretError::InvalidPath {
        path: path.to_owned(),
        reason: reason.to_owned(),
    };
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(invalid("path must not be empty"));
    }
    let segments: Vec<&str> = trimmed.split('/').collect();
    if segments.len() > MAX_SEGMENTS {
        return Err(invalid("path has more than 10 segments"));
    }
    for segment in segments {
        if segment.is_empty() {
            return Err(invalid("empty path segment"));
        }
        if segment == ".." || segment == "." {
            return Err(invalid("relative segments are not allowed"));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        {
            return Err(invalid("segments may only contain A-Z a-z 0-9 _ . -"));
        }
    }
    Ok(trimmed.to_owned())
}

/// Secret CRUD over the barrier and the `Data` DEK.
pub struct SecretStore {
    barrier: Arc<Barrier>,
    dek: Arc<DekManager>,
}

impl SecretStore {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>, dek: Arc<DekManager>) -> Self {
        Self { barrier, dek }
    }

    /// Read and decrypt a secret.
    ///
    /// # Errors
    ///
    /// - [`SecretError::InvalidPath`] for a malformed path.
    /// - [`SecretError::NotFound`] if nothing is stored there.
    /// - [`SecretError::Dek`] if decryption fails.
    pub async fn get(&self, path: &str) -> Result<Secret, SecretError> {
        let path = normalize_path(path)?;
        let stored = self.load(&path).await?.ok_or_else(|| SecretError::NotFound {
            path: path.clone(),
        })?;
        self.open(&stored).await
    }

    /// Decrypt a stored record, which need not be the current one.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::Dek`] if decryption fails.
    pub async fn open(&self, stored: &StoredSecret) -> Result<Secret, SecretError> {
        let plaintext = self.dek.decrypt(&stored.envelope).await?;
        let value = String::from_utf8_lossy(&plaintext).into_owned();
        Ok(Secret {
            path: stored.path.clone(),
            value,
            version: stored.version,
            dek_version: stored.envelope.dek_version,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
        })
    }

    /// Metadata of a secret without decrypting it.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::InvalidPath`] or [`SecretError::Barrier`].
    pub async fn load(&self, path: &str) -> Result<Option<StoredSecret>, SecretError> {
        let path = normalize_path(path)?;
        Ok(self.barrier.get_json(&secret_key(&path)).await?)
    }

    /// Whether a secret exists at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::InvalidPath`] or [`SecretError::Barrier`].
    pub async fn exists(&self, path: &str) -> Result<bool, SecretError> {
        let path = normalize_path(path)?;
        Ok(self.barrier.exists(&secret_key(&path)).await?)
    }

    /// Create or replace the value at `path`.
    ///
    /// # Errors
    ///
    /// - [`SecretError::InvalidPath`] for a malformed path.
    /// - [`SecretError::Dek`] or [`SecretError::Barrier`] on failure.
    pub async fn put(&self, path: &str, value: &str) -> Result<SecretWrite, SecretError> {
        let path = normalize_path(path)?;
        let existing = self.load(&path).await?;
        let envelope = self.dek.encrypt(DekPurpose::Data, value.as_bytes()).await?;
        let now = Utc::now();

        let stored = StoredSecret {
            path: path.clone(),
            envelope,
            version: existing.as_ref().map_or(1, |s| s.version + 1),
            created_at: existing.as_ref().map_or(now, |s| s.created_at),
            updated_at: now,
        };
        self.barrier.put_json(&secret_key(&path), &stored).await?;
        debug!(path = %path, version = stored.version, "secret written");

        Ok(SecretWrite {
            path,
            version: stored.version,
            dek_version: stored.envelope.dek_version,
            created: existing.is_none(),
        })
    }

    /// Hard-delete the secret at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::NotFound`] if nothing is stored there.
    pub async fn delete(&self, path: &str) -> Result<(), SecretError> {
        let path = normalize_path(path)?;
        let key = secret_key(&path);
        if !self.barrier.exists(&key).await? {
            return Err(SecretError::NotFound { path });
        }
        self.barrier.delete(&key).await?;
        debug!(path = %path, "secret deleted");
        Ok(())
    }

    /// Immediate children of `prefix` (empty for the root).
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::InvalidPath`] or [`SecretError::Barrier`].
    pub async fn list(&self, prefix: &str) -> Result<Vec<SecretEntry>, SecretError> {
        let base = if prefix.trim_matches('/').is_empty() {
            String::new()
        } else {
            format!("{}/", normalize_path(prefix)?)
        };
        let storage_prefix = format!("{SECRET_PREFIX}{base}");

        let mut children: BTreeMap<String, bool> = BTreeMap::new();
        for key in self.barrier.list(&storage_prefix).await? {
            let Some(rest) = key.strip_prefix(&storage_prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((name, _)) => {
                    children.insert(name.to_owned(), true);
                }
                None => {
                    children.entry(rest.to_owned()).or_insert(false);
                }
            }
        }

        Ok(children
            .into_iter()
            .map(|(name, is_folder)| SecretEntry {
                path: format!("{base}{name}"),
                name,
                is_folder,
            })
            .collect())
    }

    /// Every stored secret path.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::Barrier`] if sealed or storage fails.
    pub async fn all_paths(&self) -> Result<Vec<String>, SecretError> {
        Ok(self
            .barrier
            .list(SECRET_PREFIX)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(SECRET_PREFIX).map(str::to_owned))
            .collect())
    }
}

impl fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStore").finish_non_exhaustive()
    }
}

fn secret_key(path: &str) -> String {
    format!("{SECRET_PREFIX}{path}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clinvault_storage::{MemoryBackend, StorageBackend};

    use super::*;
    use crate::crypto::EncryptionKey;

    async fn store() -> (Arc<DekManager>, SecretStore) {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let barrier = Arc::new(Barrier::new(storage));
        barrier.install(EncryptionKey::generate(), "local").await;
        let dek = Arc::new(DekManager::new(Arc::clone(&barrier)));
        (Arc::clone(&dek), SecretStore::new(barrier, dek))
    }

    #[test]
    fn path_rules() {
        assert_eq!(normalize_path("/db/prod/").unwrap(), "db/prod");
        assert!(normalize_path("").is_err());
        assert!(normalize_path("a/../b").is_err());
        assert!(normalize_path("a//b").is_err());
        assert!(normalize_path("a b").is_err());
        assert!(normalize_path(&["s"; 10].join("/")).is_ok());
        assert!(normalize_path(&["s"; 11].join("/")).is_err());
    }

    #[tokio::test]
    async fn put_get_counts_versions() {
        let (_, store) = store().await;
        let first = store.put("db/prod/password", "one").await.unwrap();
        assert!(first.created);
        assert_eq!(first.version, 1);

        let second = store.put("db/prod/password", "two").await.unwrap();
        assert!(!second.created);
        assert_eq!(second.version, 2);

        let secret = store.get("db/prod/password").await.unwrap();
        assert_eq!(secret.value, "two");
        assert!(!format!("{secret:?}").contains("two"));
    }

    #[tokio::test]
    async fn old_secret_survives_data_key_rotation() {
        let (dek, store) = store().await;
        store.put("api/key", "v1-value").await.unwrap();
        dek.rotate(DekPurpose::Data).await.unwrap();
        let secret = store.get("api/key").await.unwrap();
        assert_eq!(secret.value, "v1-value");
        assert_eq!(secret.dek_version, 1);

        let rewritten = store.put("api/key", "v2-value").await.unwrap();
        assert_eq!(rewritten.dek_version, 2);
    }

    #[tokio::test]
    async fn list_returns_immediate_children() {
        let (_, store) = store().await;
        for path in ["db/prod/password", "db/prod/user", "db/staging", "api"] {
            store.put(path, "x").await.unwrap();
        }
        let root = store.list("").await.unwrap();
        assert_eq!(
            root,
            vec![
                SecretEntry {
                    name: "api".to_owned(),
                    path: "api".to_owned(),
                    is_folder: false
                },
                SecretEntry {
                    name: "db".to_owned(),
                    path: "db".to_owned(),
                    is_folder: true
                },
            ]
        );
        let db = store.list("db").await.unwrap();
        assert_eq!(db.len(), 2);
        assert!(db.iter().any(|e| e.name == "prod" && e.is_folder));
        assert!(db.iter().any(|e| e.path == "db/staging" && !e.is_folder));
    }

    #[tokio::test]
    async fn delete_is_hard_and_reports_missing() {
        let (_, store) = store().await;
        store.put("tmp", "x").await.unwrap();
        store.delete("tmp").await.unwrap();
        assert!(matches!(store.get("tmp").await, Err(SecretError::NotFound { .. })));
        assert!(matches!(store.delete("tmp").await, Err(SecretError::NotFound { .. })));
    }
}
