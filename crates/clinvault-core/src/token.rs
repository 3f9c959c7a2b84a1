//! Bearer token store.
//!
//! Tokens are random 192-bit values shown once at creation. Only their
//! SHA-256 hash is persisted, as an index `sys/tokens/hash/<hash>` pointing at
//! the record `sys/tokens/id/<id>`. Each token also has a public accessor
//! (`sys/tokens/accessor/<accessor>`) so it can be listed and revoked without
//! revealing the secret.
//!
//! Validation checks revocation, expiry and the use budget, then counts the
//! use. The stored hash is compared in constant time.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use clinvault_storage::BatchOp;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::info;

use crate::barrier::Barrier;
use crate::crypto;
use crate::error::{BarrierError, TokenError};

const ID_PREFIX: &str = "sys/tokens/id/";
const HASH_PREFIX: &str = "sys/tokens/hash/";
const ACCESSOR_PREFIX: &str = "sys/tokens/accessor/";

/// Prefix of every plaintext token, for recognisability in logs and config.
const TOKEN_PREFIX: &str = "cvt.";

/// Service tokens are general purpose. Batch tokens are short lived and must
/// carry a TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    #[default]
    Service,
    Batch,
}

/// A stored token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEntry {
    pub id: String,
    pub accessor: String,
    /// Hex SHA-256 of the plaintext token.
    pub token_hash: String,
    pub display_name: String,
    pub user_id: Option<String>,
    pub role: Option<String>,
    pub policies: Vec<String>,
    pub token_type: TokenType,
    pub ttl_secs: Option<u64>,
    pub num_uses: Option<u32>,
    pub uses_count: u32,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl TokenEntry {
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| now >= t)
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.num_uses.is_some_and(|n| self.uses_count >= n)
    }
}

/// Listing view: everything except the id and hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub accessor: String,
    pub display_name: String,
    pub user_id: Option<String>,
    pub role: Option<String>,
    pub policies: Vec<String>,
    pub token_type: TokenType,
    pub num_uses: Option<u32>,
    pub uses_count: u32,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl From<&TokenEntry> for TokenInfo {
    fn from(t: &TokenEntry) -> Self {
        Self {
            accessor: t.accessor.clone(),
            display_name: t.display_name.clone(),
            user_id: t.user_id.clone(),
            role: t.role.clone(),
            policies: t.policies.clone(),
            token_type: t.token_type,
            num_uses: t.num_uses,
            uses_count: t.uses_count,
            revoked: t.revoked,
            created_at: t.created_at,
            expires_at: t.expires_at,
            last_used_at: t.last_used_at,
        }
    }
}

/// Parameters for [`TokenStore::create`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateToken {
    pub display_name: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub token_type: TokenType,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    #[serde(default)]
    pub num_uses: Option<u32>,
}

/// A freshly created token. `token` exists only in this value.
#[derive(Clone, Serialize)]
pub struct CreatedToken {
    pub token: String,
    #[serde(flatten)]
    pub info: TokenInfo,
    #[serde(skip)]
    pub id: String,
}

impl fmt::Debug for CreatedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreatedToken")
            .field("accessor", &self.info.accessor)
            .field("policies", &self.info.policies)
            .finish_non_exhaustive()
    }
}

/// Manages token creation, validation and revocation.
pub struct TokenStore {
    barrier: Arc<Barrier>,
}

impl TokenStore {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self { barrier }
    }

    /// Create a token. The plaintext is returned once and never stored.
    ///
    /// # Errors
    ///
    /// - [`TokenError::Invalid`] for a batch token without TTL, a zero TTL
    ///   or zero uses, or an empty display name.
    /// - [`TokenError::Barrier`] if sealed or storage fails.
    pub async fn create(&self, params: CreateToken) -> Result<CreatedToken, TokenError> {
        if params.display_name.trim().is_empty() {
            return Err(invalid("display_name is required"));
        }
        if params.token_type == TokenType::Batch && params.ttl_secs.is_none() {
            return Err(invalid("batch tokens require a ttl"));
        }
        if params.ttl_secs == Some(0) || params.num_uses == Some(0) {
            return Err(invalid("ttl_secs and num_uses must be positive when set"));
        }

        let now = Utc::now();
        let expires_at = match params.ttl_secs {
            Some(secs) => Some(
                i64::try_from(secs)
                    .ok()
                    .and_then(Duration::try_seconds)
                    .and_then(|ttl| now.checked_add_signed(ttl))
                    .ok_or_else(|| invalid("ttl_secs is out of range"))?,
            ),
            None => None,
        };

        let plaintext = format!("{TOKEN_PREFIX}{}", hex::encode(crypto::random_bytes(24)));
        let entry = TokenEntry {
            id: uuid::Uuid::new_v4().to_string(),
            accessor: hex::encode(crypto::random_bytes(12)),
            token_hash: hash_token(&plaintext),
            display_name: params.display_name,
            user_id: params.user_id,
            role: params.role,
            policies: params.policies,
            token_type: params.token_type,
            ttl_secs: params.ttl_secs,
            num_uses: params.num_uses,
            uses_count: 0,
            revoked: false,
            created_at: now,
            expires_at,
            last_used_at: None,
        };

        self.barrier
            .write_batch(vec![
                put_json(format!("{ID_PREFIX}{}", entry.id), &entry)?,
                put_json(format!("{HASH_PREFIX}{}", entry.token_hash), &entry.id)?,
                put_json(format!("{ACCESSOR_PREFIX}{}", entry.accessor), &entry.id)?,
            ])
            .await?;

        info!(accessor = %entry.accessor, display_name = %entry.display_name, policies = ?entry.policies, "token created");
        Ok(CreatedToken {
            token: plaintext,
            info: TokenInfo::from(&entry),
            id: entry.id,
        })
    }

    /// Create the initial root token for `user_id`.
    ///
    /// # Errors
    ///
    /// As [`create`](TokenStore::create).
    pub async fn create_root(&self, user_id: &str) -> Result<CreatedToken, TokenError> {
        self.create(CreateToken {
            display_name: format!("root ({user_id})"),
            user_id: Some(user_id.to_owned()),
            role: Some("Admin".to_owned()),
            policies: vec!["root".to_owned()],
            ..CreateToken::default()
        })
        .await
    }

    /// Validate a presented token and count one use.
    ///
    /// # Errors
    ///
    /// - [`TokenError::NotFound`] for an unknown token.
    /// - [`TokenError::Revoked`], [`TokenError::Expired`] or
    ///   [`TokenError::UsesExhausted`] if it can no longer be used.
    pub async fn validate(&self, plaintext: &str) -> Result<TokenEntry, TokenError> {
        let hash = hash_token(plaintext);
        let id: String = self
            .barrier
            .get_json(&format!("{HASH_PREFIX}{hash}"))
            .await?
            .ok_or(TokenError::NotFound)?;
        let mut entry = self.load(&id).await?;
        if !bool::from(entry.token_hash.as_bytes().ct_eq(hash.as_bytes())) {
            return Err(TokenError::NotFound);
        }

        let now = Utc::now();
        if entry.revoked {
            return Err(TokenError::Revoked);
        }
        if let Some(expires_at) = entry.expires_at.filter(|t| now >= *t) {
            return Err(TokenError::Expired {
                expired_at: expires_at.to_rfc3339(),
            });
        }
        if let Some(num_uses) = entry.num_uses.filter(|_| entry.is_exhausted()) {
            return Err(TokenError::UsesExhausted { num_uses });
        }

        entry.uses_count = entry.uses_count.saturating_add(1);
        entry.last_used_at = Some(now);
        self.save(&entry).await?;
        Ok(entry)
    }

    /// Look up by accessor.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::NotFound`] if no token has this accessor.
    pub async fn get_by_accessor(&self, accessor: &str) -> Result<TokenEntry, TokenError> {
        let id: String = self
            .barrier
            .get_json(&format!("{ACCESSOR_PREFIX}{accessor}"))
            .await?
            .ok_or(TokenError::NotFound)?;
        self.load(&id).await
    }

    /// Revoke by accessor. Revoking twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::NotFound`] if no token has this accessor.
    pub async fn revoke(&self, accessor: &str) -> Result<TokenInfo, TokenError> {
        let mut entry = self.get_by_accessor(accessor).await?;
        if !entry.revoked {
            entry.revoked = true;
            self.save(&entry).await?;
            info!(accessor = %accessor, "token revoked");
        }
        Ok(TokenInfo::from(&entry))
    }

    /// Every token, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Barrier`] if sealed or storage fails.
    pub async fn list(&self) -> Result<Vec<TokenInfo>, TokenError> {
        Ok(self.entries().await?.iter().map(TokenInfo::from).collect())
    }

    /// Delete tokens that are revoked, expired or out of uses. Returns how
    /// many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Barrier`] if sealed or storage fails.
    pub async fn sweep(&self) -> Result<usize, TokenError> {
        let now = Utc::now();
        let mut removed = 0usize;
        for entry in self.entries().await? {
            if entry.revoked || entry.is_expired_at(now) || entry.is_exhausted() {
                self.barrier
                    .write_batch(vec![
                        BatchOp::Delete {
                            key: format!("{ID_PREFIX}{}", entry.id),
                        },
                        BatchOp::Delete {
                            key: format!("{HASH_PREFIX}{}", entry.token_hash),
                        },
                        BatchOp::Delete {
                            key: format!("{ACCESSOR_PREFIX}{}", entry.accessor),
                        },
                    ])
                    .await?;
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "stale tokens removed");
        }
        Ok(removed)
    }

    async fn entries(&self) -> Result<Vec<TokenEntry>, TokenError> {
        let mut out = Vec::new();
        for key in self.barrier.list(ID_PREFIX).await? {
            if let Some(entry) = self.barrier.get_json::<TokenEntry>(&key).await? {
                out.push(entry);
            }
        }
        out.sort_by_key(|e| e.created_at);
        Ok(out)
    }

    async fn load(&self, id: &str) -> Result<TokenEntry, TokenError> {
        self.barrier
            .get_json(&format!("{ID_PREFIX}{id}"))
            .await?
            .ok_or(TokenError::NotFound)
    }

    async fn save(&self, entry: &TokenEntry) -> Result<(), TokenError> {
        self.barrier
            .put_json(&format!("{ID_PREFIX}{}", entry.id), entry)
            .await?;
        Ok(())
    }
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStore").finish_non_exhaustive()
    }
}

/// Hex SHA-256 of a plaintext token.
#[must_use]
pub fn hash_token(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

fn invalid(reason: &str) -> TokenError {
    TokenError::Invalid {
        reason: reason.to_owned(),
    }
}

fn put_json<T: Serialize>(key: String, value: &T) -> Result<BatchOp, TokenError> {
    let value = serde_json::to_vec(value).map_err(|e| {
        TokenError::Barrier(BarrierError::Serialization {
            key: key.clone(),
            reason: e.to_string(),
        })
    })?;
    Ok(BatchOp::Put { key, value })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clinvault_storage::{MemoryBackend, StorageBackend};

    use super::*;
    use crate::crypto::EncryptionKey;

    async fn store() -> (Arc<MemoryBackend>, TokenStore) {
        let storage = Arc::new(MemoryBackend::new());
        let barrier = Arc::new(Barrier::new(Arc::clone(&storage) as Arc<dyn StorageBackend>));
        barrier.install(EncryptionKey::generate(), "local").await;
        (storage, TokenStore::new(barrier))
    }

    fn params(name: &str) -> CreateToken {
        CreateToken {
            display_name: name.to_owned(),
            policies: vec!["default".to_owned()],
            ..CreateToken::default()
        }
    }

    #[tokio::test]
    async fn plaintext_is_never_persisted() {
        let (storage, tokens) = store().await;
        let created = tokens.create(params("ci")).await.unwrap();
        assert!(created.token.starts_with("cvt."));

        for key in storage.list("").await.unwrap() {
            assert!(!key.contains(&created.token));
            let value = storage.get(&key).await.unwrap().unwrap();
            assert!(!value.windows(created.token.len()).any(|w| w == created.token.as_bytes()));
        }
        let listed = tokens.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].accessor, created.info.accessor);
    }

    #[tokio::test]
    async fn validate_counts_uses_until_exhausted() {
        let (_, tokens) = store().await;
        let created = tokens
            .create(CreateToken {
                num_uses: Some(2),
                ..params("once-twice")
            })
            .await
            .unwrap();
        assert_eq!(tokens.validate(&created.token).await.unwrap().uses_count, 1);
        assert_eq!(tokens.validate(&created.token).await.unwrap().uses_count, 2);
        assert!(matches!(
            tokens.validate(&created.token).await,
            Err(TokenError::UsesExhausted { num_uses: 2 })
        ));
        assert_eq!(tokens.sweep().await.unwrap(), 1);
        assert!(matches!(
            tokens.validate(&created.token).await,
            Err(TokenError::NotFound)
        ));
    }

    #[tokio::test]
    async fn revoked_and_unknown_tokens_fail() {
        let (_, tokens) = store().await;
        let created = tokens.create(params("ops")).await.unwrap();
        tokens.revoke(&created.info.accessor).await.unwrap();
        assert!(tokens.revoke(&created.info.accessor).await.unwrap().revoked);
        assert!(matches!(
            tokens.validate(&created.token).await,
            Err(TokenError::Revoked)
        ));
        assert!(matches!(
            tokens.validate("cvt.nope").await,
            Err(TokenError::NotFound)
        ));
    }

    #[tokio::test]
    async fn root_token_carries_admin_role() {
        let (_, tokens) = store().await;
        let root = tokens.create_root("alice").await.unwrap();
        let entry = tokens.validate(&root.token).await.unwrap();
        assert_eq!(entry.policies, vec!["root"]);
        assert_eq!(entry.role.as_deref(), Some("Admin"));
        assert!(entry.expires_at.is_none());
    }

    #[tokio::test]
    async fn batch_tokens_need_ttl() {
        let (_, tokens) = store().await;
        let err = tokens
            .create(CreateToken {
                token_type: TokenType::Batch,
                ..params("batch")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TokenError::Invalid { .. }));
        assert!(tokens.create(params(" ")).await.is_err());
    }
}
