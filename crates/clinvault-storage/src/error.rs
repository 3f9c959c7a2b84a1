//! Storage error types.

/// Errors that can occur during storage operations.
///
/// Variants carry the key or prefix involved so a failure can be traced
/// without a debugger. Values are never included.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The backing database could not be opened or created.
    #[error("failed to open storage at '{path}': {reason}")]
    Open { path: String, reason: String },

    /// A read failed.
    #[error("failed to read key '{key}': {reason}")]
    Read { key: String, reason: String },

    /// A write failed.
    #[error("failed to write key '{key}': {reason}")]
    Write { key: String, reason: String },

    /// A delete failed.
    #[error("failed to delete key '{key}': {reason}")]
    Delete { key: String, reason: String },

    /// A prefix listing or scan failed.
    #[error("failed to list keys with prefix '{prefix}': {reason}")]
    List { prefix: String, reason: String },

    /// Beginning or committing a transaction failed.
    #[error("transaction failed: {reason}")]
    Transaction { reason: String },

    /// A blocking storage task was cancelled or panicked.
    #[error("storage task for '{operation}' did not complete: {reason}")]
    Task { operation: &'static str, reason: String },
}
