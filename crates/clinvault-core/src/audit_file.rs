//! JSON-lines audit backend.
//!
//! Appends one [`AuditLogEntry`] per line and flushes after every write. The
//! file is only ever opened for append.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::audit::{AuditBackend, AuditLogEntry};
use crate::error::AuditError;

/// Audit backend writing JSON lines to a file.
pub struct FileAuditBackend {
    path: PathBuf,
    /// Opened lazily on the first write.
    file: Mutex<Option<File>>,
}

impl FileAuditBackend {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
        }
    }

    fn failure(&self, what: &str, e: &std::io::Error) -> AuditError {
        AuditError::BackendFailure {
            name: "file".to_owned(),
            reason: format!("{what} '{}': {e}", self.path.display()),
        }
    }
}

#[async_trait::async_trait]
impl AuditBackend for FileAuditBackend {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "file"
    }

    async fn log(&self, entry: &AuditLogEntry) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(entry).map_err(|e| AuditError::Serialization {
            reason: e.to_string(),
        })?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            let opened = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| self.failure("failed to open", &e))?;
            *guard = Some(opened);
        }
        let Some(file) = guard.as_mut() else {
            return Err(AuditError::BackendFailure {
                name: "file".to_owned(),
                reason: "file handle missing after open".to_owned(),
            });
        };

        file.write_all(&line)
            .await
            .map_err(|e| self.failure("write failed for", &e))?;
        file.flush()
            .await
            .map_err(|e| self.failure("flush failed for", &e))?;
        Ok(())
    }
}

impl std::fmt::Debug for FileAuditBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAuditBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
