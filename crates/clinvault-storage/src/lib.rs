//! Storage backend abstraction for `clinvault`.
//!
//! This crate defines the [`StorageBackend`] trait: a plain key-value
//! interface that knows nothing about secrets, leases, or keys. The barrier in
//! `clinvault-core` wraps a backend so that every value is encrypted before it
//! reaches this layer.
//!
//! Two implementations are provided:
//!
//! - [`RedbBackend`]: pure-Rust persistent store (feature `redb-backend`, default)
//! - [`MemoryBackend`]: in-memory, for tests and development

mod error;
mod memory;
#[cfg(feature = "redb-backend")]
mod redb_backend;

pub use error::StorageError;
pub use memory::MemoryBackend;
#[cfg(feature = "redb-backend")]
pub use redb_backend::RedbBackend;

/// One write inside an atomic [`StorageBackend::write_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite `key`.
    Put { key: String, value: Vec<u8> },
    /// Remove `key` if present.
    Delete { key: String },
}

impl BatchOp {
    /// The key this operation touches.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// A pluggable key-value storage backend.
///
/// Keys are UTF-8 strings using `/` as a separator (e.g. `sys/leases/<id>`,
/// `secret/clinic/db/password`). Values are opaque bytes. Keys are ordered
/// lexicographically, which the paged [`scan`](StorageBackend::scan) relies on.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Retrieve a value by key. Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a key-value pair, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the underlying backend fails.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Delete a key. Deleting a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the underlying backend fails.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List all keys that start with `prefix`, in key order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// List at most `limit` keys under `prefix` that sort strictly after
    /// `start_after`, in key order.
    ///
    /// Used by resumable sweeps and paginated queries. The default
    /// implementation filters [`list`](StorageBackend::list); backends with
    /// ordered range reads override it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn scan(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        let keys = self.list(prefix).await?;
        Ok(keys
            .into_iter()
            .filter(|k| start_after.is_none_or(|after| k.as_str() > after))
            .take(limit)
            .collect())
    }

    /// Apply a group of writes atomically: either all land or none do.
    ///
    /// The default implementation applies the operations one by one and is
    /// only atomic for backends that cannot fail mid-way.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`], [`StorageError::Delete`] or
    /// [`StorageError::Transaction`] if the batch cannot be applied.
    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
        for op in ops {
            match op {
                BatchOp::Put { key, value } => self.put(&key, &value).await?,
                BatchOp::Delete { key } => self.delete(&key).await?,
            }
        }
        Ok(())
    }

    /// Check whether a key exists in storage.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}
