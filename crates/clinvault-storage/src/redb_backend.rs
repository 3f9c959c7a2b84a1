//! Pure-Rust redb storage backend, the default persistent store.
//!
//! Feature-gated behind `redb-backend`. redb is a copy-on-write B-tree with
//! serializable transactions, which gives [`StorageBackend::write_batch`]
//! real atomicity. All blocking redb calls run on the Tokio blocking pool.

use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};

use crate::{BatchOp, StorageBackend, StorageError};

/// Single table holding every key. Namespacing happens above this layer.
const DATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("clinvault");

/// A storage backend backed by a redb database file.
///
/// # Examples
///
/// ```no_run
/// # use clinvault_storage::RedbBackend;
/// let backend = RedbBackend::open("/var/lib/clinvault/vault.redb")?;
/// # Ok::<(), clinvault_storage::StorageError>(())
/// ```
#[derive(Clone)]
pub struct RedbBackend {
    db: Arc<Database>,
    path: PathBuf,
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn txn_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Transaction {
        reason: e.to_string(),
    }
}

impl RedbBackend {
    /// Open or create a redb database at `path`, creating the data table.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the file cannot be opened or the
    /// table cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let open_err = |e: &dyn std::fmt::Display| StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        let db = Database::create(path).map_err(|e| open_err(&e))?;
        let txn = db.begin_write().map_err(|e| open_err(&e))?;
        txn.open_table(DATA_TABLE).map_err(|e| open_err(&e))?;
        txn.commit().map_err(|e| open_err(&e))?;

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    /// Filesystem path of the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, operation: &'static str, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StorageError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StorageError::Task {
                operation,
                reason: e.to_string(),
            })?
    }

    fn apply(db: &Database, ops: &[BatchOp]) -> Result<(), StorageError> {
        let txn = db.begin_write().map_err(txn_err)?;
        {
            let mut table = txn.open_table(DATA_TABLE).map_err(txn_err)?;
            for op in ops {
                match op {
                    BatchOp::Put { key, value } => {
                        table
                            .insert(key.as_str(), value.as_slice())
                            .map_err(|e| StorageError::Write {
                                key: key.clone(),
                                reason: e.to_string(),
                            })?;
                    }
                    BatchOp::Delete { key } => {
                        table
                            .remove(key.as_str())
                            .map_err(|e| StorageError::Delete {
                                key: key.clone(),
                                reason: e.to_string(),
                            })?;
                    }
                }
            }
        }
        txn.commit().map_err(txn_err)
    }

    fn range_keys(
        db: &Database,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        let list_err = |e: &dyn std::fmt::Display| StorageError::List {
            prefix: prefix.to_owned(),
            reason: e.to_string(),
        };

        let txn = db.begin_read().map_err(txn_err)?;
        let table = txn.open_table(DATA_TABLE).map_err(txn_err)?;
        let lower = match start_after {
            Some(after) if after >= prefix => Bound::Excluded(after),
            _ => Bound::Included(prefix),
        };
        let range = table
            .range::<&str>((lower, Bound::Unbounded))
            .map_err(|e| list_err(&e))?;

        let mut keys = Vec::new();
        for item in range {
            if keys.len() >= limit {
                break;
            }
            let (k, _) = item.map_err(|e| list_err(&e))?;
            let key = k.value();
            if !key.starts_with(prefix) {
                break;
            }
            keys.push(key.to_owned());
        }
        Ok(keys)
    }
}

#[async_trait::async_trait]
impl StorageBackend for RedbBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let key = key.to_owned();
        self.blocking("get", move |db| {
            let txn = db.begin_read().map_err(txn_err)?;
            let table = txn.open_table(DATA_TABLE).map_err(txn_err)?;
            let value = table
                .get(key.as_str())
                .map_err(|e| StorageError::Read {
                    key: key.clone(),
                    reason: e.to_string(),
                })?
                .map(|v| v.value().to_vec());
            Ok(value)
        })
        .await
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let ops = vec![BatchOp::Put {
            key: key.to_owned(),
            value: value.to_vec(),
        }];
        self.blocking("put", move |db| Self::apply(db, &ops)).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let ops = vec![BatchOp::Delete {
            key: key.to_owned(),
        }];
        self.blocking("delete", move |db| Self::apply(db, &ops)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.to_owned();
        self.blocking("list", move |db| {
            Self::range_keys(db, &prefix, None, usize::MAX)
        })
        .await
    }

    async fn scan(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.to_owned();
        let start_after = start_after.map(str::to_owned);
        self.blocking("scan", move |db| {
            Self::range_keys(db, &prefix, start_after.as_deref(), limit)
        })
        .await
    }

    async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StorageError> {
        self.blocking("write_batch", move |db| Self::apply(db, &ops))
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, RedbBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = RedbBackend::open(dir.path().join("vault.redb")).unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.redb");
        {
            let backend = RedbBackend::open(&path).unwrap();
            backend.put("sys/seal/init", b"marker").await.unwrap();
        }
        let reopened = RedbBackend::open(&path).unwrap();
        assert_eq!(
            reopened.get("sys/seal/init").await.unwrap(),
            Some(b"marker".to_vec())
        );
    }

    #[tokio::test]
    async fn scan_resumes_after_cursor() {
        let (_dir, backend) = open_temp();
        for i in 0..5 {
            backend
                .put(&format!("data/t/{i:03}"), b"row")
                .await
                .unwrap();
        }
        backend.put("data/u/000", b"other").await.unwrap();

        let page = backend.scan("data/t/", Some("data/t/001"), 2).await.unwrap();
        assert_eq!(page, vec!["data/t/002", "data/t/003"]);

        let all = backend.list("data/t/").await.unwrap();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn batch_is_applied_together() {
        let (_dir, backend) = open_temp();
        backend.put("a", b"1").await.unwrap();
        backend
            .write_batch(vec![
                BatchOp::Delete { key: "a".to_owned() },
                BatchOp::Put {
                    key: "b".to_owned(),
                    value: b"2".to_vec(),
                },
            ])
            .await
            .unwrap();
        assert_eq!(backend.get("a").await.unwrap(), None);
        assert_eq!(backend.get("b").await.unwrap(), Some(b"2".to_vec()));
    }
}
