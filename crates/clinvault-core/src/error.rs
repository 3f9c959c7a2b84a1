//! Error types for `clinvault-core`.
//!
//! Each subsystem has its own error enum. Variants carry enough context to
//! diagnose a failure without a debugger, but never key material or secret
//! values. Every error maps onto the stable [`ErrorKind`] taxonomy that callers
//! see; the human-readable message is the `Display` output.

use clinvault_storage::StorageError;

/// Stable error classification exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A crypto, secret, lease or credential call arrived while sealed.
    Sealed,
    /// The requested secret, lease, token, key version or record is missing.
    NotFound,
    /// A policy denied the operation.
    Authorization,
    /// The lease, token or credential is expired or revoked.
    ExpiredOrRevoked,
    /// An unseal provider or credential backend could not be reached.
    ProviderUnavailable,
    /// AEAD authentication failed: tampering or the wrong key.
    Integrity,
    /// The request itself is malformed.
    InvalidRequest,
    /// The operation conflicts with the current state.
    Conflict,
    /// Anything else. Details stay in the server log.
    Internal,
}

impl ErrorKind {
    /// Snake-case identifier used in API error bodies.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sealed => "sealed",
            Self::NotFound => "not_found",
            Self::Authorization => "authorization",
            Self::ExpiredOrRevoked => "expired_or_revoked",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::Integrity => "integrity",
            Self::InvalidRequest => "invalid_request",
            Self::Conflict => "conflict",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM authentication failed (wrong key, corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// HKDF or Argon2 derivation failed.
    #[error("key derivation failed for context '{context}': {reason}")]
    KeyDerivation { context: String, reason: String },

    /// Ciphertext is too short to contain a valid nonce and tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },

    /// The IV is not 96 bits.
    #[error("invalid nonce length: expected 12 bytes, got {actual}")]
    InvalidNonce { actual: usize },

    /// Decrypted key material has the wrong length.
    #[error("invalid key length: expected 32 bytes, got {actual}")]
    InvalidKeyLength { actual: usize },
}

impl CryptoError {
    /// Stable classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Decryption { .. }
            | Self::CiphertextTooShort { .. }
            | Self::InvalidNonce { .. }
            | Self::InvalidKeyLength { .. } => ErrorKind::Integrity,
            Self::Encryption { .. } | Self::KeyDerivation { .. } => ErrorKind::Internal,
        }
    }
}

/// Errors from the barrier (the seal choke point).
#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    /// The vault is sealed; nothing past the barrier is reachable.
    #[error("vault is sealed")]
    Sealed,

    /// A cryptographic operation within the barrier failed.
    #[error("barrier crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The underlying storage backend returned an error.
    #[error("barrier storage error: {0}")]
    Storage(#[from] StorageError),

    /// A stored record could not be encoded or decoded.
    #[error("record at '{key}' could not be (de)serialized: {reason}")]
    Serialization { key: String, reason: String },
}

impl BarrierError {
    /// Stable classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Sealed => ErrorKind::Sealed,
            Self::Crypto(e) => e.kind(),
            Self::Storage(_) | Self::Serialization { .. } => ErrorKind::Internal,
        }
    }
}

/// Errors returned by a cloud KMS client.
#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    /// The KMS could not be reached.
    #[error("kms unavailable: {reason}")]
    Unavailable { reason: String },

    /// The KMS refused the request (unknown key, permission).
    #[error("kms rejected request for key '{key_identifier}': {reason}")]
    Rejected {
        key_identifier: String,
        reason: String,
    },
}

/// Errors from seal, unseal and provider management.
#[derive(Debug, thiserror::Error)]
pub enum SealError {
    /// The vault has already been initialized.
    #[error("vault is already initialized")]
    AlreadyInitialized,

    /// The vault has not been initialized yet.
    #[error("vault is not initialized")]
    NotInitialized,

    /// The vault is already unsealed.
    #[error("vault is already unsealed")]
    AlreadyUnsealed,

    /// Another unseal attempt is running.
    #[error("an unseal attempt is already in progress")]
    UnsealInProgress,

    /// Provider or initialization parameters are invalid.
    #[error("invalid seal config: {reason}")]
    InvalidConfig { reason: String },

    /// A submitted Shamir share was malformed.
    #[error("invalid unseal share: {reason}")]
    InvalidShare { reason: String },

    /// No provider with this id is registered.
    #[error("unseal provider not found: {provider_id}")]
    ProviderNotFound { provider_id: String },

    /// Removing this provider would leave no way to unseal.
    #[error("cannot remove '{provider_id}': it is the last unseal provider")]
    LastProvider { provider_id: String },

    /// A provider could not produce the master key.
    #[error("unseal provider '{provider_id}' unavailable: {reason}")]
    ProviderUnavailable { provider_id: String, reason: String },

    /// A cryptographic operation failed.
    #[error("seal crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The barrier returned an error.
    #[error("seal barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

impl SealError {
    /// Stable classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyInitialized
            | Self::AlreadyUnsealed
            | Self::UnsealInProgress
            | Self::LastProvider { .. } => ErrorKind::Conflict,
            Self::NotInitialized | Self::InvalidConfig { .. } | Self::InvalidShare { .. } => {
                ErrorKind::InvalidRequest
            }
            Self::ProviderNotFound { .. } => ErrorKind::NotFound,
            Self::ProviderUnavailable { .. } => ErrorKind::ProviderUnavailable,
            Self::Crypto(e) => e.kind(),
            Self::Barrier(e) => e.kind(),
        }
    }
}

/// Errors from the DEK manager.
#[derive(Debug, thiserror::Error)]
pub enum DekError {
    /// No DEK exists for this purpose and version.
    #[error("no {purpose} key at version {version}")]
    UnknownVersion { purpose: String, version: u32 },

    /// The purpose name is not one of the known purposes.
    #[error("unknown key purpose '{name}'")]
    UnknownPurpose { name: String },

    /// Caller-supplied key material or key name is unusable.
    #[error("invalid key material: {reason}")]
    InvalidKeyMaterial { reason: String },

    /// A cryptographic operation failed.
    #[error("dek crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The barrier returned an error.
    #[error("dek barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

impl DekError {
    /// Stable classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownVersion { .. } => ErrorKind::NotFound,
            Self::UnknownPurpose { .. } | Self::InvalidKeyMaterial { .. } => {
                ErrorKind::InvalidRequest
            }
            Self::Crypto(e) => e.kind(),
            Self::Barrier(e) => e.kind(),
        }
    }
}

/// Errors from the secret store.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    /// The path violates the path rules.
    #[error("invalid secret path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    /// No secret at this path.
    #[error("secret not found: {path}")]
    NotFound { path: String },

    /// Envelope encryption failed.
    #[error(transparent)]
    Dek(#[from] DekError),

    /// The barrier returned an error.
    #[error("secret barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

impl SecretError {
    /// Stable classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidPath { .. } => ErrorKind::InvalidRequest,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Dek(e) => e.kind(),
            Self::Barrier(e) => e.kind(),
        }
    }
}

/// Errors from lease operations.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    /// The lease was not found.
    #[error("lease not found: {lease_id}")]
    NotFound { lease_id: String },

    /// The lease is not renewable.
    #[error("lease is not renewable: {lease_id}")]
    NotRenewable { lease_id: String },

    /// The lease has expired.
    #[error("lease has expired: {lease_id}")]
    Expired { lease_id: String },

    /// The lease has been revoked.
    #[error("lease has been revoked: {lease_id}")]
    Revoked { lease_id: String },

    /// The TTL or increment is out of range.
    #[error("invalid lease ttl: {reason}")]
    InvalidTtl { reason: String },

    /// The leased resource does not exist.
    #[error("leased resource not found: {resource}")]
    ResourceNotFound { resource: String },

    /// The barrier returned an error.
    #[error("lease barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

impl LeaseError {
    /// Stable classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } | Self::ResourceNotFound { .. } => ErrorKind::NotFound,
            Self::Expired { .. } | Self::Revoked { .. } => ErrorKind::ExpiredOrRevoked,
            Self::NotRenewable { .. } | Self::InvalidTtl { .. } => ErrorKind::InvalidRequest,
            Self::Barrier(e) => e.kind(),
        }
    }
}

/// Errors from the dynamic credential issuer and its backends.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// No backend registered under this name.
    #[error("unknown credential backend '{name}'")]
    UnknownBackend { name: String },

    /// No credential with this id.
    #[error("dynamic credential not found: {credential_id}")]
    NotFound { credential_id: String },

    /// The backend reported a failure.
    #[error("credential backend '{backend}' failed: {reason}")]
    Backend { backend: String, reason: String },

    /// The backend did not answer within the provisioning timeout.
    #[error("credential backend '{backend}' timed out after {timeout_secs}s")]
    Timeout { backend: String, timeout_secs: u64 },

    /// The request is malformed.
    #[error("invalid credential request: {reason}")]
    InvalidRequest { reason: String },

    /// Lease bookkeeping failed.
    #[error(transparent)]
    Lease(#[from] LeaseError),

    /// Envelope encryption of the admin password failed.
    #[error(transparent)]
    Dek(#[from] DekError),

    /// The barrier returned an error.
    #[error("credential barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

impl CredentialError {
    /// Stable classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownBackend { .. } | Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Backend { .. } | Self::Timeout { .. } => ErrorKind::ProviderUnavailable,
            Self::Lease(e) => e.kind(),
            Self::Dek(e) => e.kind(),
            Self::Barrier(e) => e.kind(),
        }
    }
}

/// Errors from token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// The token was not found.
    #[error("token not found")]
    NotFound,

    /// The token has expired.
    #[error("token expired at {expired_at}")]
    Expired { expired_at: String },

    /// The token has been revoked.
    #[error("token has been revoked")]
    Revoked,

    /// The token has used up its allowed uses.
    #[error("token has exhausted its {num_uses} allowed uses")]
    UsesExhausted { num_uses: u32 },

    /// Creation parameters are invalid.
    #[error("invalid token request: {reason}")]
    Invalid { reason: String },

    /// The barrier returned an error.
    #[error("token barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

impl TokenError {
    /// Stable classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound => ErrorKind::NotFound,
            Self::Expired { .. } | Self::Revoked | Self::UsesExhausted { .. } => {
                ErrorKind::ExpiredOrRevoked
            }
            Self::Invalid { .. } => ErrorKind::InvalidRequest,
            Self::Barrier(e) => e.kind(),
        }
    }
}

/// Errors from path policies, assignments and field access policies.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The requested policy was not found.
    #[error("policy not found: {name}")]
    NotFound { name: String },

    /// The policy document is invalid.
    #[error("invalid policy: {reason}")]
    Invalid { reason: String },

    /// Built-in policies cannot be changed.
    #[error("cannot modify built-in policy: {name}")]
    BuiltIn { name: String },

    /// Access denied by policy evaluation.
    #[error("permission denied on path '{path}' for capability '{capability}'")]
    Denied { path: String, capability: String },

    /// No assignment or field policy exists for the key.
    #[error("no {what} for '{key}'")]
    MissingEntry { what: &'static str, key: String },

    /// The barrier returned an error.
    #[error("policy barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

impl PolicyError {
    /// Stable classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } | Self::MissingEntry { .. } => ErrorKind::NotFound,
            Self::Invalid { .. } => ErrorKind::InvalidRequest,
            Self::BuiltIn { .. } => ErrorKind::Conflict,
            Self::Denied { .. } => ErrorKind::Authorization,
            Self::Barrier(e) => e.kind(),
        }
    }
}

/// Errors from encryption configs, protected records and re-encryption.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// No encryption config for this table.
    #[error("no encryption config for table '{table}'")]
    ConfigNotFound { table: String },

    /// The table's config is disabled or uses a different purpose.
    #[error("table '{table}' is not enabled for {purpose} encryption")]
    NotEnabled { table: String, purpose: String },

    /// No such record.
    #[error("record not found: {table}/{row_id}")]
    NotFound { table: String, row_id: String },

    /// The request is malformed.
    #[error("invalid record request: {reason}")]
    InvalidRequest { reason: String },

    /// Envelope encryption failed.
    #[error(transparent)]
    Dek(#[from] DekError),

    /// Field access lookup failed.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// The barrier returned an error.
    #[error("record barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

impl RecordError {
    /// Stable classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConfigNotFound { .. } | Self::NotFound { .. } => ErrorKind::NotFound,
            Self::NotEnabled { .. } | Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::Dek(e) => e.kind(),
            Self::Policy(e) => e.kind(),
            Self::Barrier(e) => e.kind(),
        }
    }
}

/// Errors from the rotation engine.
#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    /// No schedule for this secret path.
    #[error("no rotation schedule for '{path}'")]
    ScheduleNotFound { path: String },

    /// The schedule parameters are invalid.
    #[error("invalid rotation schedule: {reason}")]
    InvalidSchedule { reason: String },

    /// No callback registered under this name.
    #[error("no rotation callback named '{name}'")]
    UnknownCallback { name: String },

    /// The callback failed to produce a new value.
    #[error("rotation callback '{name}' failed: {reason}")]
    Callback { name: String, reason: String },

    /// A/B rotation has not been configured.
    #[error("database credential rotation is not configured")]
    NotConfigured,

    /// Another rotation is already running.
    #[error("a rotation is already in progress")]
    InProgress,

    /// The secret store failed.
    #[error(transparent)]
    Secret(#[from] SecretError),

    /// The credential issuer failed.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// Envelope encryption failed.
    #[error(transparent)]
    Dek(#[from] DekError),

    /// The barrier returned an error.
    #[error("rotation barrier error: {0}")]
    Barrier(#[from] BarrierError),
}

impl RotationError {
    /// Stable classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ScheduleNotFound { .. } => ErrorKind::NotFound,
            Self::InvalidSchedule { .. } | Self::UnknownCallback { .. } | Self::NotConfigured => {
                ErrorKind::InvalidRequest
            }
            Self::Callback { .. } => ErrorKind::ProviderUnavailable,
            Self::InProgress => ErrorKind::Conflict,
            Self::Secret(e) => e.kind(),
            Self::Credential(e) => e.kind(),
            Self::Dek(e) => e.kind(),
            Self::Barrier(e) => e.kind(),
        }
    }
}

/// Errors from the audit log.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// No backend accepted the entry; the triggering operation must fail.
    #[error("all audit backends failed")]
    AllBackendsFailed,

    /// A single backend failed to persist the entry.
    #[error("audit backend '{name}' failed: {reason}")]
    BackendFailure { name: String, reason: String },

    /// The entry could not be encoded or decoded.
    #[error("audit serialization failed: {reason}")]
    Serialization { reason: String },

    /// Reading stored entries failed.
    #[error("audit storage error: {0}")]
    Storage(#[from] StorageError),
}

impl AuditError {
    /// Stable classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

/// Error returned by the [`Vault`](crate::vault::Vault) facade.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error(transparent)]
    Seal(#[from] SealError),
    #[error(transparent)]
    Barrier(#[from] BarrierError),
    #[error(transparent)]
    Dek(#[from] DekError),
    #[error(transparent)]
    Secret(#[from] SecretError),
    #[error(transparent)]
    Lease(#[from] LeaseError),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Policy(#[from] PolicyError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Rotation(#[from] RotationError),
    #[error(transparent)]
    Audit(#[from] AuditError),
}

impl VaultError {
    /// Stable classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Seal(e) => e.kind(),
            Self::Barrier(e) => e.kind(),
            Self::Dek(e) => e.kind(),
            Self::Secret(e) => e.kind(),
            Self::Lease(e) => e.kind(),
            Self::Credential(e) => e.kind(),
            Self::Token(e) => e.kind(),
            Self::Policy(e) => e.kind(),
            Self::Record(e) => e.kind(),
            Self::Rotation(e) => e.kind(),
            Self::Audit(e) => e.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_classification_survives_wrapping() {
        let err = VaultError::Secret(SecretError::Dek(DekError::Barrier(BarrierError::Sealed)));
        assert_eq!(err.kind(), ErrorKind::Sealed);
    }

    #[test]
    fn tag_failure_is_integrity() {
        let err = DekError::Crypto(CryptoError::Decryption {
            reason: "aead::Error".to_owned(),
        });
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }

    #[test]
    fn expired_and_revoked_share_a_kind() {
        assert_eq!(
            LeaseError::Revoked { lease_id: "l".to_owned() }.kind(),
            TokenError::Expired { expired_at: "t".to_owned() }.kind()
        );
    }

    #[test]
    fn kind_strings_are_snake_case() {
        assert_eq!(ErrorKind::ProviderUnavailable.as_str(), "provider_unavailable");
        assert_eq!(ErrorKind::ExpiredOrRevoked.to_string(), "expired_or_revoked");
    }
}
