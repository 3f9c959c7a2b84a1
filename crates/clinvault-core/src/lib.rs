//! Core library for `clinvault`.
//!
//! Contains the encryption barrier, the seal state machine and its unseal
//! providers, versioned DEK envelope encryption, the secret store, leases,
//! dynamic database credentials, tokens, policies with field-level access,
//! protected records, rotation, the audit log and compliance scoring. The
//! [`Vault`] facade wires them together. Storage comes from
//! `clinvault-storage`; this crate knows nothing about HTTP.

pub mod audit;
pub mod audit_file;
pub mod barrier;
pub mod compliance;
pub mod credentials;
pub mod crypto;
pub mod db_rotation;
pub mod dek;
pub mod error;
pub mod field_access;
pub mod lease;
pub mod maintenance;
pub mod metrics;
pub mod policy;
#[cfg(feature = "postgres")]
pub mod postgres_credentials;
pub mod records;
pub mod rotation;
pub mod scheduler;
pub mod seal;
pub mod secrets;
pub mod token;
pub mod unseal;
pub mod vault;

pub use error::{ErrorKind, VaultError};
pub use vault::{Caller, Vault, VaultOptions, VaultPlugins};
