//! Unseal providers: independent ways to recover the master key.
//!
//! Each provider stores its own wrapped copy of the master key in raw storage
//! under `sys/seal/providers/<id>` so it can be read while sealed:
//!
//! - **Local**: wrapped under an Argon2id key derived from an operator password.
//! - **`CloudKms`**: wrapped by an external key service through [`KmsClient`].
//! - **Shamir**: wrapped under a random key that is split into shares. The
//!   shares are handed out once and never stored.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sharks::{Share, Sharks};

use crate::barrier::Barrier;
use crate::crypto::{self, EncryptionKey, KdfParams};
use crate::error::{KmsError, SealError};

/// Storage prefix for provider records.
pub const PROVIDER_PREFIX: &str = "sys/seal/providers/";

/// Upper bound on Shamir shares per provider.
const MAX_SHARES: u8 = 10;

/// Abstract key-management service used by `CloudKms` providers.
#[async_trait::async_trait]
pub trait KmsClient: Send + Sync {
    /// Encrypt `plaintext` under the KMS key `key_identifier`.
    async fn wrap(&self, key_identifier: &str, plaintext: &[u8]) -> Result<Vec<u8>, KmsError>;

    /// Decrypt bytes produced by [`wrap`](KmsClient::wrap).
    async fn unwrap(&self, key_identifier: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError>;

    /// Whether the key can currently be used.
    async fn is_available(&self, key_identifier: &str) -> bool;
}

/// A KMS that derives one key per identifier from a configured root key.
///
/// Stands in for a cloud KMS in development and tests.
pub struct SoftwareKms {
    root: EncryptionKey,
}

impl SoftwareKms {
    #[must_use]
    pub fn new(root: EncryptionKey) -> Self {
        Self { root }
    }

    /// Build from a hex-encoded 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns [`KmsError::Unavailable`] if the hex is malformed or the
    /// key is not 32 bytes.
    pub fn from_hex(hex_key: &str) -> Result<Self, KmsError> {
        let bytes = zeroize::Zeroizing::new(hex::decode(hex_key.trim()).map_err(|e| {
            KmsError::Unavailable {
                reason: format!("invalid kms key hex: {e}"),
            }
        })?);
        let root = EncryptionKey::from_slice(&bytes).map_err(|e| KmsError::Unavailable {
            reason: e.to_string(),
        })?;
        Ok(Self::new(root))
    }

    fn key_for(&self, key_identifier: &str) -> Result<EncryptionKey, KmsError> {
        if key_identifier.is_empty() {
            return Err(KmsError::Rejected {
                key_identifier: String::new(),
                reason: "empty key identifier".to_owned(),
            });
        }
        let info = format!("clinvault-kms-{key_identifier}");
        crypto::derive_key(&self.root, None, info.as_bytes()).map_err(|e| KmsError::Rejected {
            key_identifier: key_identifier.to_owned(),
            reason: e.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl KmsClient for SoftwareKms {
    async fn wrap(&self, key_identifier: &str, plaintext: &[u8]) -> Result<Vec<u8>, KmsError> {
        let key = self.key_for(key_identifier)?;
        crypto::encrypt(&key, plaintext).map_err(|e| KmsError::Rejected {
            key_identifier: key_identifier.to_owned(),
            reason: e.to_string(),
        })
    }

    async fn unwrap(&self, key_identifier: &str, ciphertext: &[u8]) -> Result<Vec<u8>, KmsError> {
        let key = self.key_for(key_identifier)?;
        crypto::decrypt(&key, ciphertext).map_err(|e| KmsError::Rejected {
            key_identifier: key_identifier.to_owned(),
            reason: e.to_string(),
        })
    }

    async fn is_available(&self, key_identifier: &str) -> bool {
        !key_identifier.is_empty()
    }
}

impl fmt::Debug for SoftwareKms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareKms").finish_non_exhaustive()
    }
}

/// How a provider's copy of the master key is protected. Persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderKind {
    Local { salt: String, kdf: KdfParams },
    CloudKms { key_identifier: String },
    Shamir { shares: u8, threshold: u8 },
}

impl ProviderKind {
    /// Short name used in status output and compliance.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::CloudKms { .. } => "cloud_kms",
            Self::Shamir { .. } => "shamir",
        }
    }
}

/// A registered unseal provider.
#[derive(Clone, Serialize, Deserialize)]
pub struct UnsealProvider {
    pub provider_id: String,
    pub kind: ProviderKind,
    /// Lower values are tried first.
    pub priority: u32,
    /// Base64 of the wrapped master key.
    pub wrapped_master_key: String,
    pub configured_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for UnsealProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsealProvider")
            .field("provider_id", &self.provider_id)
            .field("kind", &self.kind.label())
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Requested provider configuration.
#[derive(Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderSpec {
    Local { password: String },
    CloudKms { key_identifier: String },
    Shamir { shares: u8, threshold: u8 },
}

impl fmt::Debug for ProviderSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { .. } => f.write_str("Local { .. }"),
            Self::CloudKms { key_identifier } => f
                .debug_struct("CloudKms")
                .field("key_identifier", key_identifier)
                .finish(),
            Self::Shamir { shares, threshold } => f
                .debug_struct("Shamir")
                .field("shares", shares)
                .field("threshold", threshold)
                .finish(),
        }
    }
}

/// Inputs an operator supplies to an unseal attempt.
#[derive(Default, Clone, Copy)]
pub struct UnsealInput<'a> {
    pub password: Option<&'a str>,
    pub shares: &'a [String],
}

/// Reported state of one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub provider_id: String,
    pub kind: String,
    pub priority: u32,
    pub key_identifier: Option<String>,
    pub available: bool,
    pub configured_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub detail: String,
}

/// Provider persistence plus the per-kind wrap and recover logic.
pub struct ProviderRegistry {
    barrier: Arc<Barrier>,
    kms: Option<Arc<dyn KmsClient>>,
    kdf: KdfParams,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>, kms: Option<Arc<dyn KmsClient>>, kdf: KdfParams) -> Self {
        Self { barrier, kms, kdf }
    }

    /// All providers, sorted by priority then id.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Barrier`] on storage or parse failures.
    pub async fn list(&self) -> Result<Vec<UnsealProvider>, SealError> {
        let mut providers = Vec::new();
        for key in self.barrier.list_raw(PROVIDER_PREFIX).await? {
            if let Some(provider) = self.barrier.get_raw_json::<UnsealProvider>(&key).await? {
                providers.push(provider);
            }
        }
        providers.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.provider_id.cmp(&b.provider_id))
        });
        Ok(providers)
    }

    /// Look up one provider.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::ProviderNotFound`] if it does not exist.
    pub async fn get(&self, provider_id: &str) -> Result<UnsealProvider, SealError> {
        self.barrier
            .get_raw_json(&provider_key(provider_id))
            .await?
            .ok_or_else(|| SealError::ProviderNotFound {
                provider_id: provider_id.to_owned(),
            })
    }

    /// Persist a provider record.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Barrier`] on storage failures.
    pub async fn save(&self, provider: &UnsealProvider) -> Result<(), SealError> {
        self.barrier
            .put_raw_json(&provider_key(&provider.provider_id), provider)
            .await?;
        Ok(())
    }

    /// Delete a provider record.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Barrier`] on storage failures.
    pub async fn delete(&self, provider_id: &str) -> Result<(), SealError> {
        self.barrier.delete_raw(&provider_key(provider_id)).await?;
        Ok(())
    }

    /// Wrap `master` for a new provider. Returns the record and, for Shamir,
    /// the base64 shares (the only time they exist outside operator hands).
    ///
    /// # Errors
    ///
    /// - [`SealError::InvalidConfig`] for bad ids, empty passwords or share counts.
    /// - [`SealError::ProviderUnavailable`] if the KMS is missing or refuses.
    pub async fn wrap_master(
        &self,
        provider_id: &str,
        priority: u32,
        spec: ProviderSpec,
        master: &EncryptionKey,
    ) -> Result<(UnsealProvider, Vec<String>), SealError> {
        validate_provider_id(provider_id)?;
        let mut shares_out = Vec::new();

        let (kind, wrapped) = match spec {
            ProviderSpec::Local { password } => {
                if password.is_empty() {
                    return Err(SealError::InvalidConfig {
                        reason: "local provider password must not be empty".to_owned(),
                    });
                }
                let salt = crypto::random_bytes(16);
                let kek = derive_kek(password, salt.clone(), self.kdf).await?;
                let wrapped = crypto::encrypt(&kek, master.as_bytes())?;
                (
                    ProviderKind::Local {
                        salt: BASE64.encode(salt),
                        kdf: self.kdf,
                    },
                    wrapped,
                )
            }
            ProviderSpec::CloudKms { key_identifier } => {
                let kms = self.kms_client(provider_id)?;
                let wrapped = kms
                    .wrap(&key_identifier, master.as_bytes())
                    .await
                    .map_err(|e| SealError::ProviderUnavailable {
                        provider_id: provider_id.to_owned(),
                        reason: e.to_string(),
                    })?;
                (ProviderKind::CloudKms { key_identifier }, wrapped)
            }
            ProviderSpec::Shamir { shares, threshold } => {
                validate_shamir(shares, threshold)?;
                let share_key = EncryptionKey::generate();
                let wrapped = crypto::encrypt(&share_key, master.as_bytes())?;
                let dealer = Sharks(threshold).dealer(share_key.as_bytes());
                shares_out = dealer
                    .take(usize::from(shares))
                    .map(|s| BASE64.encode(Vec::from(&s)))
                    .collect();
                (ProviderKind::Shamir { shares, threshold }, wrapped)
            }
        };

        let provider = UnsealProvider {
            provider_id: provider_id.to_owned(),
            kind,
            priority,
            wrapped_master_key: BASE64.encode(wrapped),
            configured_at: Utc::now(),
            last_used_at: None,
        };
        Ok((provider, shares_out))
    }

    /// Recover the master key candidate from one provider.
    ///
    /// The result is not yet verified against the init check value.
    ///
    /// # Errors
    ///
    /// Returns an error describing why this provider could not produce a key:
    /// missing input, bad shares, wrong password, or KMS failure.
    pub async fn recover(
        &self,
        provider: &UnsealProvider,
        input: UnsealInput<'_>,
    ) -> Result<EncryptionKey, SealError> {
        let unavailable = |reason: String| SealError::ProviderUnavailable {
            provider_id: provider.provider_id.clone(),
            reason,
        };
        let wrapped = BASE64
            .decode(&provider.wrapped_master_key)
            .map_err(|e| unavailable(format!("corrupt wrapped key: {e}")))?;

        let master_bytes = match &provider.kind {
            ProviderKind::Local { salt, kdf } => {
                let password = input
                    .password
                    .ok_or_else(|| unavailable("no password supplied".to_owned()))?;
                let salt = BASE64
                    .decode(salt)
                    .map_err(|e| unavailable(format!("corrupt salt: {e}")))?;
                let kek = derive_kek(password.to_owned(), salt, *kdf).await?;
                crypto::decrypt(&kek, &wrapped)
                    .map_err(|_| unavailable("password does not unwrap the master key".to_owned()))?
            }
            ProviderKind::CloudKms { key_identifier } => {
                let kms = self.kms_client(&provider.provider_id)?;
                kms.unwrap(key_identifier, &wrapped)
                    .await
                    .map_err(|e| unavailable(e.to_string()))?
            }
            ProviderKind::Shamir { threshold, .. } => {
                if input.shares.len() < usize::from(*threshold) {
                    return Err(unavailable(format!(
                        "{} of {threshold} shares supplied",
                        input.shares.len()
                    )));
                }
                let share_key = recover_share_key(*threshold, input.shares)?;
                crypto::decrypt(&share_key, &wrapped)
                    .map_err(|_| unavailable("shares do not unwrap the master key".to_owned()))?
            }
        };

        let master_bytes = zeroize::Zeroizing::new(master_bytes);
        Ok(EncryptionKey::from_slice(&master_bytes)?)
    }

    /// Whether a provider could be used right now.
    pub async fn is_available(&self, provider: &UnsealProvider) -> bool {
        match &provider.kind {
            ProviderKind::Local { .. } | ProviderKind::Shamir { .. } => true,
            ProviderKind::CloudKms { key_identifier } => match &self.kms {
                Some(kms) => kms.is_available(key_identifier).await,
                None => false,
            },
        }
    }

    /// Status view of one provider.
    pub async fn status(&self, provider: &UnsealProvider) -> ProviderStatus {
        let available = self.is_available(provider).await;
        let (key_identifier, detail) = match &provider.kind {
            ProviderKind::Local { kdf, .. } => (
                None,
                format!(
                    "argon2id m={} t={} p={}",
                    kdf.memory_kib, kdf.iterations, kdf.parallelism
                ),
            ),
            ProviderKind::CloudKms { key_identifier } => (
                Some(key_identifier.clone()),
                if self.kms.is_some() {
                    "kms client configured".to_owned()
                } else {
                    "no kms client configured".to_owned()
                },
            ),
            ProviderKind::Shamir { shares, threshold } => {
                (None, format!("{threshold} of {shares} shares"))
            }
        };
        ProviderStatus {
            provider_id: provider.provider_id.clone(),
            kind: provider.kind.label().to_owned(),
            priority: provider.priority,
            key_identifier,
            available,
            configured_at: provider.configured_at,
            last_used_at: provider.last_used_at,
            detail,
        }
    }

    fn kms_client(&self, provider_id: &str) -> Result<&Arc<dyn KmsClient>, SealError> {
        self.kms
            .as_ref()
            .ok_or_else(|| SealError::ProviderUnavailable {
                provider_id: provider_id.to_owned(),
                reason: "no kms client configured".to_owned(),
            })
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kms", &self.kms.is_some())
            .field("kdf", &self.kdf)
            .finish_non_exhaustive()
    }
}

fn provider_key(provider_id: &str) -> String {
    format!("{PROVIDER_PREFIX}{provider_id}")
}

/// Argon2id is CPU bound, so it runs on the blocking pool.
async fn derive_kek(
    password: String,
    salt: Vec<u8>,
    kdf: KdfParams,
) -> Result<EncryptionKey, SealError> {
    let password = zeroize::Zeroizing::new(password);
    tokio::task::spawn_blocking(move || crypto::derive_password_key(&password, &salt, kdf))
        .await
        .map_err(|e| SealError::InvalidConfig {
            reason: format!("key derivation task failed: {e}"),
        })?
        .map_err(SealError::Crypto)
}

fn recover_share_key(threshold: u8, encoded: &[String]) -> Result<EncryptionKey, SealError> {
    let shares = encoded
        .iter()
        .map(|s| {
            let bytes = BASE64.decode(s.trim()).map_err(|e| SealError::InvalidShare {
                reason: format!("base64 decode failed: {e}"),
            })?;
            Share::try_from(bytes.as_slice()).map_err(|e| SealError::InvalidShare {
                reason: e.to_owned(),
            })
        })
        .collect::<Result<Vec<Share>, SealError>>()?;

    let secret = zeroize::Zeroizing::new(Sharks(threshold).recover(&shares).map_err(|e| {
        SealError::InvalidShare {
            reason: e.to_owned(),
        }
    })?);
    EncryptionKey::from_slice(&secret).map_err(|_| SealError::InvalidShare {
        reason: "recovered secret is not 32 bytes".to_owned(),
    })
}

fn validate_provider_id(provider_id: &str) -> Result<(), SealError> {
    let valid = !provider_id.is_empty()
        && provider_id.len() <= 64
        && provider_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(SealError::InvalidConfig {
            reason: format!("invalid provider id '{provider_id}'"),
        })
    }
}

fn validate_shamir(shares: u8, threshold: u8) -> Result<(), SealError> {
    if !(2..=MAX_SHARES).contains(&shares) {
        return Err(SealError::InvalidConfig {
            reason: format!("share count must be 2-{MAX_SHARES}, got {shares}"),
        });
    }
    if threshold < 2 {
        return Err(SealError::InvalidConfig {
            reason: format!("threshold must be at least 2, got {threshold}"),
        });
    }
    if threshold > shares {
        return Err(SealError::InvalidConfig {
            reason: format!("threshold ({threshold}) cannot exceed share count ({shares})"),
        });
    }
    Ok(())
}
