//! Versioned data encryption keys (DEKs), one series per purpose.
//!
//! Each DEK is 32 random bytes wrapped by the master key through the barrier
//! and stored at `sys/dek/<purpose>/<version:010>`. Rotation appends version
//! N+1 and retires N in one atomic batch; retired versions are never deleted,
//! so every envelope ever produced stays decryptable by its recorded version.
//!
//! Envelopes bind `purpose:version` as AEAD associated data. Wrapped caller
//! keys additionally bind their key name.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use clinvault_storage::BatchOp;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::barrier::Barrier;
use crate::crypto::{self, EncryptionKey};
use crate::error::{BarrierError, CryptoError, DekError};

const DEK_PREFIX: &str = "sys/dek/";

/// What a DEK series protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DekPurpose {
    Data,
    Session,
    Api,
    Backup,
    MasterSalt,
}

impl DekPurpose {
    pub const ALL: [Self; 5] = [
        Self::Data,
        Self::Session,
        Self::Api,
        Self::Backup,
        Self::MasterSalt,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Session => "session",
            Self::Api => "api",
            Self::Backup => "backup",
            Self::MasterSalt => "master_salt",
        }
    }
}

impl fmt::Display for DekPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DekPurpose {
    type Err = DekError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| DekError::UnknownPurpose { name: s.to_owned() })
    }
}

/// A stored DEK. Key material is only ever present wrapped.
#[derive(Clone, Serialize, Deserialize)]
pub struct DataEncryptionKey {
    pub purpose: DekPurpose,
    pub version: u32,
    pub wrapped_key_material: String,
    pub created_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for DataEncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataEncryptionKey")
            .field("purpose", &self.purpose)
            .field("version", &self.version)
            .field("retired_at", &self.retired_at)
            .finish_non_exhaustive()
    }
}

/// Ciphertext produced under a DEK, with everything needed to decrypt it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Base64 ciphertext including the GCM tag.
    pub ciphertext: String,
    /// Base64 96-bit IV.
    pub iv: String,
    pub dek_version: u32,
    pub purpose: DekPurpose,
}

/// Result of [`DekManager::rotate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DekRotation {
    pub purpose: DekPurpose,
    pub previous_version: u32,
    pub new_version: u32,
    pub rotated_at: DateTime<Utc>,
}

/// Per-purpose summary from [`DekManager::status`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DekStatus {
    pub purpose: DekPurpose,
    pub current_version: u32,
    pub created_at: DateTime<Utc>,
    pub retired_versions: Vec<u32>,
    pub last_rotated_at: Option<DateTime<Utc>>,
}

/// Creates, rotates and uses DEKs.
pub struct DekManager {
    barrier: Arc<Barrier>,
    locks: [Mutex<()>; DekPurpose::ALL.len()],
}

impl DekManager {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self {
            barrier,
            locks: std::array::from_fn(|_| Mutex::new(())),
        }
    }

    /// Make sure every purpose has a current DEK.
    ///
    /// # Errors
    ///
    /// Returns [`DekError::Barrier`] if sealed or storage fails.
    pub async fn ensure_all(&self) -> Result<(), DekError> {
        for purpose in DekPurpose::ALL {
            self.current(purpose).await?;
        }
        Ok(())
    }

    /// All stored versions of a purpose, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DekError::Barrier`] if sealed or storage fails.
    pub async fn versions(&self, purpose: DekPurpose) -> Result<Vec<DataEncryptionKey>, DekError> {
        let mut keys = Vec::new();
        for key in self.barrier.list(&series_prefix(purpose)).await? {
            if let Some(dek) = self.barrier.get_json::<DataEncryptionKey>(&key).await? {
                keys.push(dek);
            }
        }
        keys.sort_by_key(|k| k.version);
        Ok(keys)
    }

    /// The current DEK for `purpose`, creating version 1 if none exists.
    ///
    /// # Errors
    ///
    /// Returns [`DekError::Barrier`] if sealed or storage fails.
    pub async fn current(&self, purpose: DekPurpose) -> Result<DataEncryptionKey, DekError> {
        if let Some(dek) = self.latest(purpose).await? {
            return Ok(dek);
        }
        let _lock = self.lock(purpose).lock().await;
        if let Some(dek) = self.latest(purpose).await? {
            return Ok(dek);
        }
        let dek = self.new_version(purpose, 1).await?;
        self.barrier
            .put_json(&version_key(purpose, 1), &dek)
            .await?;
        info!(purpose = %purpose, version = 1, "created initial dek");
        Ok(dek)
    }

    /// Current version number of `purpose`.
    ///
    /// # Errors
    ///
    /// As [`current`](DekManager::current).
    pub async fn current_version(&self, purpose: DekPurpose) -> Result<u32, DekError> {
        Ok(self.current(purpose).await?.version)
    }

    /// Encrypt under the current DEK of `purpose` with a fresh IV.
    ///
    /// # Errors
    ///
    /// Returns [`DekError::Barrier`] if sealed or [`DekError::Crypto`] if the
    /// AEAD fails.
    pub async fn encrypt(&self, purpose: DekPurpose, plaintext: &[u8]) -> Result<Envelope, DekError> {
        let dek = self.current(purpose).await?;
        let key = self.unwrap_dek(&dek).await?;
        let sealed = crypto::seal_detached(&key, plaintext, &aad(purpose, dek.version, None))?;
        debug!(purpose = %purpose, version = dek.version, "dek encrypt");
        Ok(Envelope {
            ciphertext: BASE64.encode(sealed.ciphertext),
            iv: BASE64.encode(sealed.iv),
            dek_version: dek.version,
            purpose,
        })
    }

    /// Decrypt an envelope using exactly the DEK version it records.
    ///
    /// # Errors
    ///
    /// - [`DekError::UnknownVersion`] if that version was never created.
    /// - [`DekError::Crypto`] on tag failure or malformed base64.
    pub async fn decrypt(&self, envelope: &Envelope) -> Result<Vec<u8>, DekError> {
        self.open(envelope, None).await
    }

    /// Wrap caller key material under the current `Api` DEK, bound to `key_name`.
    ///
    /// # Errors
    ///
    /// - [`DekError::InvalidKeyMaterial`] if the material or name is empty.
    /// - [`DekError::Barrier`] if sealed.
    pub async fn wrap_key(&self, material: &[u8], key_name: &str) -> Result<Envelope, DekError> {
        if material.is_empty() || key_name.is_empty() {
            return Err(DekError::InvalidKeyMaterial {
                reason: "key material and key name must not be empty".to_owned(),
            });
        }
        let dek = self.current(DekPurpose::Api).await?;
        let key = self.unwrap_dek(&dek).await?;
        let sealed = crypto::seal_detached(
            &key,
            material,
            &aad(DekPurpose::Api, dek.version, Some(key_name)),
        )?;
        Ok(Envelope {
            ciphertext: BASE64.encode(sealed.ciphertext),
            iv: BASE64.encode(sealed.iv),
            dek_version: dek.version,
            purpose: DekPurpose::Api,
        })
    }

    /// Unwrap material produced by [`wrap_key`](DekManager::wrap_key).
    ///
    /// # Errors
    ///
    /// Returns [`DekError::Crypto`] if `key_name` differs from the one used
    /// to wrap, or the envelope was altered.
    pub async fn unwrap_key(&self, envelope: &Envelope, key_name: &str) -> Result<Vec<u8>, DekError> {
        if envelope.purpose != DekPurpose::Api {
            return Err(DekError::InvalidKeyMaterial {
                reason: format!("wrapped keys use the api purpose, got {}", envelope.purpose),
            });
        }
        self.open(envelope, Some(key_name)).await
    }

    /// Create version N+1 for `purpose` and retire version N.
    ///
    /// Both writes land in one batch. Existing ciphertext is untouched.
    ///
    /// # Errors
    ///
    /// Returns [`DekError::Barrier`] if sealed or storage fails.
    pub async fn rotate(&self, purpose: DekPurpose) -> Result<DekRotation, DekError> {
        let mut previous = self.current(purpose).await?;
        let _lock = self.lock(purpose).lock().await;
        // Re-read under the lock; another rotation may have finished first.
        if let Some(latest) = self.latest(purpose).await? {
            previous = latest;
        }

        let new_version = previous.version + 1;
        let next = self.new_version(purpose, new_version).await?;
        let rotated_at = next.created_at;
        previous.retired_at = Some(rotated_at);

        self.barrier
            .write_batch(vec![
                BatchOp::Put {
                    key: version_key(purpose, new_version),
                    value: to_json(&version_key(purpose, new_version), &next)?,
                },
                BatchOp::Put {
                    key: version_key(purpose, previous.version),
                    value: to_json(&version_key(purpose, previous.version), &previous)?,
                },
            ])
            .await?;

        info!(purpose = %purpose, previous_version = previous.version, new_version, "dek rotated");
        Ok(DekRotation {
            purpose,
            previous_version: previous.version,
            new_version,
            rotated_at,
        })
    }

    /// One summary per purpose.
    ///
    /// # Errors
    ///
    /// Returns [`DekError::Barrier`] if sealed or storage fails.
    pub async fn status(&self) -> Result<Vec<DekStatus>, DekError> {
        let mut out = Vec::with_capacity(DekPurpose::ALL.len());
        for purpose in DekPurpose::ALL {
            let current = self.current(purpose).await?;
            let retired_versions = self
                .versions(purpose)
                .await?
                .into_iter()
                .filter(|k| k.retired_at.is_some())
                .map(|k| k.version)
                .collect();
            out.push(DekStatus {
                purpose,
                current_version: current.version,
                created_at: current.created_at,
                retired_versions,
                last_rotated_at: (current.version > 1).then_some(current.created_at),
            });
        }
        Ok(out)
    }

    async fn open(&self, envelope: &Envelope, key_name: Option<&str>) -> Result<Vec<u8>, DekError> {
        let dek = self
            .barrier
            .get_json::<DataEncryptionKey>(&version_key(envelope.purpose, envelope.dek_version))
            .await?
            .ok_or_else(|| DekError::UnknownVersion {
                purpose: envelope.purpose.to_string(),
                version: envelope.dek_version,
            })?;
        let key = self.unwrap_dek(&dek).await?;
        let ciphertext = decode_b64("ciphertext", &envelope.ciphertext)?;
        let iv = decode_b64("iv", &envelope.iv)?;
        Ok(crypto::open_detached(
            &key,
            &ciphertext,
            &iv,
            &aad(envelope.purpose, envelope.dek_version, key_name),
        )?)
    }

    async fn latest(&self, purpose: DekPurpose) -> Result<Option<DataEncryptionKey>, DekError> {
        // Zero-padded versions sort lexicographically in numeric order.
        let Some(key) = self.barrier.list(&series_prefix(purpose)).await?.into_iter().max() else {
            return Ok(None);
        };
        Ok(self.barrier.get_json(&key).await?)
    }

    async fn new_version(&self, purpose: DekPurpose, version: u32) -> Result<DataEncryptionKey, DekError> {
        let material = EncryptionKey::generate();
        let wrapped = self.barrier.wrap_key(&material).await?;
        Ok(DataEncryptionKey {
            purpose,
            version,
            wrapped_key_material: BASE64.encode(wrapped),
            created_at: Utc::now(),
            retired_at: None,
        })
    }

    async fn unwrap_dek(&self, dek: &DataEncryptionKey) -> Result<EncryptionKey, DekError> {
        let wrapped = BASE64
            .decode(&dek.wrapped_key_material)
            .map_err(|e| DekError::InvalidKeyMaterial {
                reason: format!("stored dek {}:{} is corrupt: {e}", dek.purpose, dek.version),
            })?;
        Ok(self.barrier.unwrap_key(&wrapped).await?)
    }

    fn lock(&self, purpose: DekPurpose) -> &Mutex<()> {
        &self.locks[purpose as usize]
    }
}

impl fmt::Debug for DekManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DekManager").finish_non_exhaustive()
    }
}

fn series_prefix(purpose: DekPurpose) -> String {
    format!("{DEK_PREFIX}{purpose}/")
}

fn version_key(purpose: DekPurpose, version: u32) -> String {
    format!("{DEK_PREFIX}{purpose}/{version:010}")
}

fn aad(purpose: DekPurpose, version: u32, key_name: Option<&str>) -> Vec<u8> {
    match key_name {
        Some(name) => format!("{purpose}:{version}:{name}").into_bytes(),
        None => format!("{purpose}:{version}").into_bytes(),
    }
}

fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>, DekError> {
    BASE64.decode(value).map_err(|e| {
        DekError::Crypto(CryptoError::Decryption {
            reason: format!("{field} is not valid base64: {e}"),
        })
    })
}

fn to_json<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, DekError> {
    serde_json::to_vec(value).map_err(|e| {
        DekError::Barrier(BarrierError::Serialization {
            key: key.to_owned(),
            reason: e.to_string(),
        })
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clinvault_storage::{MemoryBackend, StorageBackend};

    use super::*;
    use crate::error::ErrorKind;

    async fn unsealed() -> DekManager {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let barrier = Arc::new(Barrier::new(storage));
        barrier.install(EncryptionKey::generate(), "local").await;
        DekManager::new(barrier)
    }

    #[tokio::test]
    async fn envelopes_from_every_version_stay_decryptable() {
        let dek = unsealed().await;
        let mut envelopes = Vec::new();
        for i in 0..4u32 {
            let env = dek.encrypt(DekPurpose::Data, format!("row-{i}").as_bytes()).await.unwrap();
            assert_eq!(env.dek_version, i + 1);
            envelopes.push(env);
            dek.rotate(DekPurpose::Data).await.unwrap();
        }
        for (i, env) in envelopes.iter().enumerate() {
            assert_eq!(dek.decrypt(env).await.unwrap(), format!("row-{i}").as_bytes());
        }
        assert_eq!(dek.current_version(DekPurpose::Data).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn fresh_iv_per_encryption() {
        let dek = unsealed().await;
        let a = dek.encrypt(DekPurpose::Session, b"same").await.unwrap();
        let b = dek.encrypt(DekPurpose::Session, b"same").await.unwrap();
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[tokio::test]
    async fn rotation_retires_previous_and_leaves_one_current() {
        let dek = unsealed().await;
        let rotation = dek.rotate(DekPurpose::Backup).await.unwrap();
        assert_eq!((rotation.previous_version, rotation.new_version), (1, 2));

        let versions = dek.versions(DekPurpose::Backup).await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions.iter().filter(|k| k.retired_at.is_none()).count(), 1);

        let status = dek.status().await.unwrap();
        let backup = status.iter().find(|s| s.purpose == DekPurpose::Backup).unwrap();
        assert_eq!(backup.current_version, 2);
        assert_eq!(backup.retired_versions, vec![1]);
        assert!(backup.last_rotated_at.is_some());
    }

    #[tokio::test]
    async fn concurrent_rotations_allocate_distinct_versions() {
        let dek = Arc::new(unsealed().await);
        dek.ensure_all().await.unwrap();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let dek = Arc::clone(&dek);
                tokio::spawn(async move { dek.rotate(DekPurpose::Api).await.unwrap().new_version })
            })
            .collect();
        let mut versions = Vec::new();
        for h in handles {
            versions.push(h.await.unwrap());
        }
        versions.sort_unstable();
        assert_eq!(versions, vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn unknown_version_and_tamper_are_distinguished() {
        let dek = unsealed().await;
        let mut env = dek.encrypt(DekPurpose::Data, b"x").await.unwrap();

        let mut missing = env.clone();
        missing.dek_version = 42;
        assert_eq!(dek.decrypt(&missing).await.unwrap_err().kind(), ErrorKind::NotFound);

        let mut bytes = BASE64.decode(&env.ciphertext).unwrap();
        bytes[0] ^= 0xff;
        env.ciphertext = BASE64.encode(bytes);
        assert_eq!(dek.decrypt(&env).await.unwrap_err().kind(), ErrorKind::Integrity);
    }

    #[tokio::test]
    async fn wrapped_keys_are_bound_to_their_name() {
        let dek = unsealed().await;
        let wrapped = dek.wrap_key(b"stripe-signing-key", "stripe").await.unwrap();
        assert_eq!(
            dek.unwrap_key(&wrapped, "stripe").await.unwrap(),
            b"stripe-signing-key"
        );
        assert!(dek.unwrap_key(&wrapped, "twilio").await.is_err());
        assert!(dek.wrap_key(b"", "x").await.is_err());
    }

    #[test]
    fn purposes_parse_case_insensitively() {
        assert_eq!("DATA".parse::<DekPurpose>().unwrap(), DekPurpose::Data);
        assert_eq!("master_salt".parse::<DekPurpose>().unwrap(), DekPurpose::MasterSalt);
        assert!("nope".parse::<DekPurpose>().is_err());
    }
}
