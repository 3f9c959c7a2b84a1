//! In-memory storage backend.
//!
//! Data lives in a `BTreeMap` behind a `RwLock` and is lost when the process
//! exits. Used by unit tests, integration tests, and `CLINVAULT_STORAGE=memory`.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::{BatchOp, StorageBackend, StorageError};

/// An in-memory storage backend backed by a sorted map.
///
/// Clones share the same underlying map.
///
/// # Examples
///
/// ```
/// # use clinvault_storage::{MemoryBackend, StorageBackend};
/// # #[tokio::main]
/// # async fn main() -> Result<(), clinvault_storage::StorageError> {
/// let backend = MemoryBackend::new();
/// backend.put("sys/leases/abc", b"lease").await?;
/// assert_eq!(backend.get("sys/leases/abc").await?, Some(b"lease".to_vec()));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    /// Create a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    /// Whether the backend holds no keys.
    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.data
            .write()
            .await
            .insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().await;
        Ok(data
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn scan(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().await;
        let lower = match start_after {
            Some(after) if after >= prefix => Bound::Excluded(after.to_owned()),
            _ => Bound::Included(prefix.to_owned()),
        };
        Ok(data
            .range((lower, Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
        // One write guard for the whole batch keeps readers from observing a
        // half-applied group.
        let mut data = self.data.write().await;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.read().await.contains_key(key))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn seeded() -> MemoryBackend {
        let backend = MemoryBackend::new();
        for key in ["data/patients/001", "data/patients/002", "data/patients/003", "data/visits/001", "sys/x"] {
            backend.put(key, key.as_bytes()).await.unwrap();
        }
        backend
    }

    #[tokio::test]
    async fn missing_key_reads_as_none() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("nope").await.unwrap(), None);
        assert!(!backend.exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn delete_missing_key_is_noop() {
        let backend = MemoryBackend::new();
        backend.delete("nope").await.unwrap();
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn list_stays_inside_prefix() {
        let backend = seeded().await;
        let keys = backend.list("data/patients/").await.unwrap();
        assert_eq!(
            keys,
            vec!["data/patients/001", "data/patients/002", "data/patients/003"]
        );
    }

    #[tokio::test]
    async fn scan_pages_through_prefix() {
        let backend = seeded().await;

        let first = backend.scan("data/patients/", None, 2).await.unwrap();
        assert_eq!(first, vec!["data/patients/001", "data/patients/002"]);

        let second = backend
            .scan("data/patients/", Some("data/patients/002"), 2)
            .await
            .unwrap();
        assert_eq!(second, vec!["data/patients/003"]);

        let third = backend
            .scan("data/patients/", Some("data/patients/003"), 2)
            .await
            .unwrap();
        assert!(third.is_empty());
    }

    #[tokio::test]
    async fn scan_cursor_before_prefix_starts_at_prefix() {
        let backend = seeded().await;
        let keys = backend.scan("data/visits/", Some("a"), 10).await.unwrap();
        assert_eq!(keys, vec!["data/visits/001"]);
    }

    #[tokio::test]
    async fn write_batch_applies_puts_and_deletes() {
        let backend = seeded().await;
        backend
            .write_batch(vec![
                BatchOp::Put {
                    key: "data/patients/004".to_owned(),
                    value: b"new".to_vec(),
                },
                BatchOp::Delete {
                    key: "data/patients/001".to_owned(),
                },
            ])
            .await
            .unwrap();

        assert_eq!(
            backend.get("data/patients/004").await.unwrap(),
            Some(b"new".to_vec())
        );
        assert!(!backend.exists("data/patients/001").await.unwrap());
        assert_eq!(backend.len().await, 5);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();
        backend.put("k", b"v").await.unwrap();
        assert_eq!(clone.get("k").await.unwrap(), Some(b"v".to_vec()));
    }
}
