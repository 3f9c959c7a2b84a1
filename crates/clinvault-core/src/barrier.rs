//! The barrier: sole holder of the master key and the seal choke point.
//!
//! Every record that reaches storage passes through the barrier and is
//! encrypted under the master key. DEKs are wrapped by the same key through
//! [`Barrier::wrap_key`]. When the vault is sealed, every operation except the
//! explicit `*_raw` ones returns [`BarrierError::Sealed`], so no component can
//! touch data without going through this one gate.
//!
//! # Security model
//!
//! - The master key lives only in process memory, in a zero-on-drop buffer.
//! - Values are AES-256-GCM encrypted with a fresh nonce per write.
//! - Storage keys stay in plaintext so prefix listing works.
//! - Sealing takes the write lock and drops the key before returning.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use clinvault_storage::{BatchOp, StorageBackend};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::crypto::{self, EncryptionKey};
use crate::error::BarrierError;

/// Where the vault is in its seal lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SealPhase {
    Sealed,
    Unsealing,
    Unsealed,
}

/// Snapshot of the process-wide master key state. Never contains key bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterKeyState {
    pub sealed: bool,
    pub phase: SealPhase,
    pub unseal_provider_id: Option<String>,
    pub unsealed_at: Option<DateTime<Utc>>,
}

struct LiveKey {
    key: EncryptionKey,
    provider_id: String,
    unsealed_at: DateTime<Utc>,
}

/// Marks an unseal attempt as running; clears the flag when dropped.
#[derive(Debug)]
pub struct UnsealingGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for UnsealingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// The encryption barrier wrapping a storage backend.
pub struct Barrier {
    storage: Arc<dyn StorageBackend>,
    live: RwLock<Option<LiveKey>>,
    unsealing: AtomicBool,
}

impl Barrier {
    /// Create a sealed barrier over `storage`.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            live: RwLock::new(None),
            unsealing: AtomicBool::new(false),
        }
    }

    /// The raw storage backend. Values read here are not decrypted.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Claim the `Unsealing` phase. Returns `None` if another attempt holds it.
    pub fn try_begin_unseal(&self) -> Option<UnsealingGuard<'_>> {
        self.unsealing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| UnsealingGuard {
                flag: &self.unsealing,
            })
    }

    /// Install the master key recovered by `provider_id`.
    pub async fn install(&self, key: EncryptionKey, provider_id: &str) {
        let mut guard = self.live.write().await;
        *guard = Some(LiveKey {
            key,
            provider_id: provider_id.to_owned(),
            unsealed_at: Utc::now(),
        });
    }

    /// Drop the master key. Returns whether the vault was unsealed.
    ///
    /// The key is zeroized by `ZeroizeOnDrop` when the `Option` is replaced.
    pub async fn seal(&self) -> bool {
        let mut guard = self.live.write().await;
        guard.take().is_some()
    }

    /// Whether the master key is currently loaded.
    pub async fn is_unsealed(&self) -> bool {
        self.live.read().await.is_some()
    }

    /// Current master key state.
    pub async fn state(&self) -> MasterKeyState {
        let guard = self.live.read().await;
        match guard.as_ref() {
            Some(live) => MasterKeyState {
                sealed: false,
                phase: SealPhase::Unsealed,
                unseal_provider_id: Some(live.provider_id.clone()),
                unsealed_at: Some(live.unsealed_at),
            },
            None => MasterKeyState {
                sealed: true,
                phase: if self.unsealing.load(Ordering::Acquire) {
                    SealPhase::Unsealing
                } else {
                    SealPhase::Sealed
                },
                unseal_provider_id: None,
                unsealed_at: None,
            },
        }
    }

    /// Fail with [`BarrierError::Sealed`] unless unsealed.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] while sealed.
    pub async fn ensure_unsealed(&self) -> Result<(), BarrierError> {
        if self.is_unsealed().await {
            Ok(())
        } else {
            Err(BarrierError::Sealed)
        }
    }

    /// Clone the live master key.
    pub(crate) async fn master_key(&self) -> Result<EncryptionKey, BarrierError> {
        let guard = self.live.read().await;
        guard
            .as_ref()
            .map(|live| live.key.clone())
            .ok_or(BarrierError::Sealed)
    }

    /// Wrap 32 bytes of key material under the master key.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] while sealed, or a crypto error.
    pub async fn wrap_key(&self, material: &EncryptionKey) -> Result<Vec<u8>, BarrierError> {
        let master = self.master_key().await?;
        Ok(crypto::encrypt(&master, material.as_bytes())?)
    }

    /// Unwrap key material produced by [`wrap_key`](Barrier::wrap_key).
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Sealed`] while sealed, or an integrity error
    /// if the wrapped bytes were not produced under this master key.
    pub async fn unwrap_key(&self, wrapped: &[u8]) -> Result<EncryptionKey, BarrierError> {
        let master = self.master_key().await?;
        let bytes = zeroize::Zeroizing::new(crypto::decrypt(&master, wrapped)?);
        Ok(EncryptionKey::from_slice(&bytes)?)
    }

    /// Read and decrypt a value.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Crypto`] if decryption fails.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        let master = self.master_key().await?;
        match self.storage.get(key).await? {
            None => Ok(None),
            Some(ciphertext) => Ok(Some(crypto::decrypt(&master, &ciphertext)?)),
        }
    }

    /// Encrypt and write a value.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Crypto`] if encryption fails.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        let master = self.master_key().await?;
        let ciphertext = crypto::encrypt(&master, value)?;
        self.storage.put(key, &ciphertext).await?;
        Ok(())
    }

    /// Read and deserialize a JSON record.
    ///
    /// # Errors
    ///
    /// As [`get`](Barrier::get), plus [`BarrierError::Serialization`] if the
    /// record does not parse.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, BarrierError> {
        match self.get(key).await? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| BarrierError::Serialization {
                    key: key.to_owned(),
                    reason: e.to_string(),
                }),
        }
    }

    /// Serialize a record as JSON and write it through the barrier.
    ///
    /// # Errors
    ///
    /// As [`put`](Barrier::put), plus [`BarrierError::Serialization`].
    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), BarrierError> {
        let bytes = to_json(key, value)?;
        self.put(key, &bytes).await
    }

    /// Encrypt and apply a group of writes atomically.
    ///
    /// `Put` values are plaintext and are encrypted here.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Storage`] if the batch cannot be applied.
    pub async fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), BarrierError> {
        let master = self.master_key().await?;
        let mut sealed_ops = Vec::with_capacity(ops.len());
        for op in ops {
            sealed_ops.push(match op {
                BatchOp::Put { key, value } => BatchOp::Put {
                    value: crypto::encrypt(&master, &value)?,
                    key,
                },
                delete @ BatchOp::Delete { .. } => delete,
            });
        }
        self.storage.write_batch(sealed_ops).await?;
        Ok(())
    }

    /// Delete a key.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn delete(&self, key: &str) -> Result<(), BarrierError> {
        self.ensure_unsealed().await?;
        self.storage.delete(key).await?;
        Ok(())
    }

    /// List keys under `prefix`.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, BarrierError> {
        self.ensure_unsealed().await?;
        Ok(self.storage.list(prefix).await?)
    }

    /// Page through keys under `prefix` after `start_after`.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn scan(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<String>, BarrierError> {
        self.ensure_unsealed().await?;
        Ok(self.storage.scan(prefix, start_after, limit).await?)
    }

    /// Check whether a key exists.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn exists(&self, key: &str) -> Result<bool, BarrierError> {
        self.ensure_unsealed().await?;
        Ok(self.storage.exists(key).await?)
    }

    /// Write a JSON record WITHOUT encryption.
    ///
    /// Only for records that must be readable while sealed and hold no
    /// plaintext key material: provider records (whose master key copy is
    /// already wrapped) and the init marker.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] or [`BarrierError::Serialization`].
    pub async fn put_raw_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), BarrierError> {
        let bytes = to_json(key, value)?;
        self.storage.put(key, &bytes).await?;
        Ok(())
    }

    /// Read a JSON record WITHOUT decryption.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] or [`BarrierError::Serialization`].
    pub async fn get_raw_json<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, BarrierError> {
        match self.storage.get(key).await? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| BarrierError::Serialization {
                    key: key.to_owned(),
                    reason: e.to_string(),
                }),
        }
    }

    /// List keys WITHOUT the seal check.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] if the storage backend fails.
    pub async fn list_raw(&self, prefix: &str) -> Result<Vec<String>, BarrierError> {
        Ok(self.storage.list(prefix).await?)
    }

    /// Delete a key WITHOUT the seal check.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError::Storage`] if the storage backend fails.
    pub async fn delete_raw(&self, key: &str) -> Result<(), BarrierError> {
        Ok(self.storage.delete(key).await?)
    }
}

fn to_json<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, BarrierError> {
    serde_json::to_vec(value).map_err(|e| BarrierError::Serialization {
        key: key.to_owned(),
        reason: e.to_string(),
    })
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier")
            .field("unsealing", &self.unsealing.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clinvault_storage::MemoryBackend;

    fn make_barrier() -> (Arc<MemoryBackend>, Barrier) {
        let storage = Arc::new(MemoryBackend::new());
        let barrier = Barrier::new(Arc::clone(&storage) as Arc<dyn StorageBackend>);
        (storage, barrier)
    }

    #[tokio::test]
    async fn sealed_barrier_rejects_every_guarded_call() {
        let (_, barrier) = make_barrier();
        assert!(matches!(barrier.get("k").await, Err(BarrierError::Sealed)));
        assert!(matches!(barrier.put("k", b"v").await, Err(BarrierError::Sealed)));
        assert!(matches!(barrier.delete("k").await, Err(BarrierError::Sealed)));
        assert!(matches!(barrier.list("k").await, Err(BarrierError::Sealed)));
        assert!(matches!(barrier.scan("k", None, 1).await, Err(BarrierError::Sealed)));
        assert!(matches!(barrier.exists("k").await, Err(BarrierError::Sealed)));
        assert!(matches!(
            barrier.wrap_key(&EncryptionKey::generate()).await,
            Err(BarrierError::Sealed)
        ));
        assert!(matches!(
            barrier.write_batch(Vec::new()).await,
            Err(BarrierError::Sealed)
        ));
    }

    #[tokio::test]
    async fn storage_only_sees_ciphertext() {
        let (storage, barrier) = make_barrier();
        barrier.install(EncryptionKey::generate(), "local").await;
        barrier.put("secret/db", b"hunter2").await.unwrap();

        let raw = storage.get("secret/db").await.unwrap().unwrap();
        assert!(!raw.windows(7).any(|w| w == b"hunter2"));
        assert_eq!(barrier.get("secret/db").await.unwrap().unwrap(), b"hunter2");
    }

    #[tokio::test]
    async fn seal_drops_key_and_reports_state() {
        let (_, barrier) = make_barrier();
        assert_eq!(barrier.state().await.phase, SealPhase::Sealed);

        barrier.install(EncryptionKey::generate(), "local").await;
        let state = barrier.state().await;
        assert!(!state.sealed);
        assert_eq!(state.unseal_provider_id.as_deref(), Some("local"));

        assert!(barrier.seal().await);
        assert!(!barrier.seal().await);
        assert!(matches!(barrier.get("k").await, Err(BarrierError::Sealed)));
    }

    #[tokio::test]
    async fn unsealing_flag_is_exclusive_and_released_on_drop() {
        let (_, barrier) = make_barrier();
        let guard = barrier.try_begin_unseal().unwrap();
        assert!(barrier.try_begin_unseal().is_none());
        assert_eq!(barrier.state().await.phase, SealPhase::Unsealing);
        drop(guard);
        assert!(barrier.try_begin_unseal().is_some());
    }

    #[tokio::test]
    async fn wrapped_key_only_unwraps_under_same_master() {
        let (storage, barrier) = make_barrier();
        barrier.install(EncryptionKey::generate(), "local").await;
        let dek = EncryptionKey::generate();
        let wrapped = barrier.wrap_key(&dek).await.unwrap();
        assert_eq!(
            barrier.unwrap_key(&wrapped).await.unwrap().as_bytes(),
            dek.as_bytes()
        );

        let other = Barrier::new(storage as Arc<dyn StorageBackend>);
        other.install(EncryptionKey::generate(), "local").await;
        let err = other.unwrap_key(&wrapped).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Integrity);
    }

    #[tokio::test]
    async fn batch_writes_are_encrypted() {
        let (storage, barrier) = make_barrier();
        barrier.install(EncryptionKey::generate(), "local").await;
        barrier.put("a", b"old").await.unwrap();
        barrier
            .write_batch(vec![
                BatchOp::Put {
                    key: "b".to_owned(),
                    value: b"plain".to_vec(),
                },
                BatchOp::Delete { key: "a".to_owned() },
            ])
            .await
            .unwrap();
        assert_ne!(storage.get("b").await.unwrap().unwrap(), b"plain");
        assert_eq!(barrier.get("b").await.unwrap().unwrap(), b"plain");
        assert!(!barrier.exists("a").await.unwrap());
    }

    #[tokio::test]
    async fn raw_json_is_readable_while_sealed() {
        let (_, barrier) = make_barrier();
        barrier
            .put_raw_json("sys/seal/init", &serde_json::json!({"by": "admin"}))
            .await
            .unwrap();
        let value: serde_json::Value = barrier.get_raw_json("sys/seal/init").await.unwrap().unwrap();
        assert_eq!(value["by"], "admin");
        assert_eq!(barrier.list_raw("sys/seal/").await.unwrap().len(), 1);
    }
}
