//! Shared application state for the `clinvault` server.

use std::sync::Arc;

use clinvault_core::Vault;

/// State handed to every handler and middleware.
pub struct AppState {
    pub vault: Arc<Vault>,
}

impl AppState {
    #[must_use]
    pub fn new(vault: Arc<Vault>) -> Self {
        Self { vault }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
