//! Encryption configs, protected records and the re-encryption sweep.
//!
//! An [`EncryptionConfig`] names the fields of a table that are stored as DEK
//! envelopes. [`RecordStore::put_record`] encrypts those fields on write;
//! [`RecordStore::get_record`] decrypts them and applies field access for the
//! caller's role. After a DEK rotation, [`RecordStore::re_encrypt`] walks the
//! table in key order and rewrites only rows that still reference an older
//! version, persisting a cursor after every batch so an interrupted sweep
//! resumes where it stopped.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::barrier::Barrier;
use crate::dek::{DekManager, DekPurpose, Envelope};
use crate::error::{ErrorKind, RecordError};
use crate::field_access::{AccessLevel, FieldAccessPolicy, FieldAccessStore};

const CONFIG_PREFIX: &str = "sys/encryption-configs/";
const RECORD_PREFIX: &str = "data/";
const PROGRESS_PREFIX: &str = "sys/reencrypt/";

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Which fields of a table are encrypted, and under which purpose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub table_name: String,
    pub encrypted_fields: Vec<String>,
    pub dek_purpose: DekPurpose,
    pub is_enabled: bool,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub description: String,
    pub updated_at: DateTime<Utc>,
}

impl EncryptionConfig {
    fn encrypts(&self, field: &str) -> bool {
        self.is_enabled && self.encrypted_fields.iter().any(|f| f == field)
    }
}

/// Input for [`RecordStore::put_config`].
#[derive(Debug, Clone, Deserialize)]
pub struct EncryptionConfigInput {
    pub table_name: String,
    pub encrypted_fields: Vec<String>,
    #[serde(default = "default_purpose")]
    pub dek_purpose: DekPurpose,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub description: String,
}

fn default_purpose() -> DekPurpose {
    DekPurpose::Data
}

fn default_true() -> bool {
    true
}

/// A stored field: either plain JSON or a DEK envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredField {
    Plain { value: Value },
    Encrypted(Envelope),
}

/// A protected row as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedRecord {
    pub table: String,
    pub row_id: String,
    pub fields: BTreeMap<String, StoredField>,
    pub updated_at: DateTime<Utc>,
}

impl ProtectedRecord {
    fn is_stale(&self, current: u32) -> bool {
        self.fields.values().any(|f| match f {
            StoredField::Encrypted(env) => env.dek_version < current,
            StoredField::Plain { .. } => false,
        })
    }
}

/// Result of [`RecordStore::put_record`].
#[derive(Debug, Clone, Serialize)]
pub struct RecordWrite {
    pub table: String,
    pub row_id: String,
    pub encrypted_fields: Vec<String>,
    pub dek_version: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

/// A decrypted row after field access has been applied.
#[derive(Debug, Clone, Serialize)]
pub struct RecordView {
    pub table: String,
    pub row_id: String,
    pub fields: Map<String, Value>,
    /// Oldest DEK version among the row's encrypted fields.
    pub dek_version: Option<u32>,
    pub updated_at: DateTime<Utc>,
}

/// Persisted cursor of a re-encryption sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReEncryptProgress {
    pub purpose: DekPurpose,
    pub table: String,
    pub target_version: u32,
    pub processed_rows: u64,
    pub total_rows: u64,
    pub rewritten_rows: u64,
    pub failed_rows: u64,
    pub last_row_id: Option<String>,
    pub is_complete: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of [`RecordStore::re_encrypt`].
#[derive(Debug, Clone, Serialize)]
pub struct ReEncryptReport {
    pub purpose: DekPurpose,
    pub table: String,
    pub target_version: u32,
    pub processed_rows: u64,
    pub total_rows: u64,
    pub rewritten_rows: u64,
    pub failed_rows: u64,
    pub is_complete: bool,
    pub duration_ms: u64,
}

/// One table as seen by schema introspection.
#[derive(Debug, Clone, Serialize)]
pub struct TableSchema {
    pub table_name: String,
    pub encrypted_fields: Vec<String>,
    pub dek_purpose: Option<DekPurpose>,
    pub is_enabled: bool,
    pub field_policies: Vec<FieldAccessPolicy>,
}

/// Encryption configs, protected rows and re-encryption.
pub struct RecordStore {
    barrier: Arc<Barrier>,
    dek: Arc<DekManager>,
    field_access: Arc<FieldAccessStore>,
    batch_size: usize,
    /// Serializes row writes so a sweep never overwrites a concurrent update.
    write_lock: Mutex<()>,
}

impl RecordStore {
    #[must_use]
    pub fn new(
        barrier: Arc<Barrier>,
        dek: Arc<DekManager>,
        field_access: Arc<FieldAccessStore>,
        batch_size: usize,
    ) -> Self {
        Self {
            barrier,
            dek,
            field_access,
            batch_size: batch_size.max(1),
            write_lock: Mutex::new(()),
        }
    }

    // ── encryption configs ─────────────────────────────────────────

    /// Create or replace the config for a table.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::InvalidRequest`] for a bad table or field name.
    pub async fn put_config(
        &self,
        input: EncryptionConfigInput,
    ) -> Result<EncryptionConfig, RecordError> {
        validate_name("table", &input.table_name)?;
        let mut fields = input.encrypted_fields;
        for f in &fields {
            validate_name("field", f)?;
        }
        fields.sort();
        fields.dedup();

        let config = EncryptionConfig {
            table_name: input.table_name,
            encrypted_fields: fields,
            dek_purpose: input.dek_purpose,
            is_enabled: input.is_enabled,
            is_default: input.is_default,
            description: input.description,
            updated_at: Utc::now(),
        };
        self.barrier
            .put_json(&config_key(&config.table_name), &config)
            .await?;
        info!(
            table = %config.table_name,
            purpose = %config.dek_purpose,
            fields = config.encrypted_fields.len(),
            enabled = config.is_enabled,
            "encryption config written"
        );
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`RecordError::ConfigNotFound`] if the table has no config.
    pub async fn get_config(&self, table: &str) -> Result<EncryptionConfig, RecordError> {
        self.barrier
            .get_json(&config_key(table))
            .await?
            .ok_or_else(|| RecordError::ConfigNotFound {
                table: table.to_owned(),
            })
    }

    /// # Errors
    ///
    /// Returns [`RecordError::ConfigNotFound`] if the table has no config.
    pub async fn delete_config(&self, table: &str) -> Result<(), RecordError> {
        let key = config_key(table);
        if !self.barrier.exists(&key).await? {
            return Err(RecordError::ConfigNotFound {
                table: table.to_owned(),
            });
        }
        self.barrier.delete(&key).await?;
        info!(table = %table, "encryption config deleted");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`RecordError::Barrier`] if sealed or storage fails.
    pub async fn list_configs(&self) -> Result<Vec<EncryptionConfig>, RecordError> {
        let mut out = Vec::new();
        for key in self.barrier.list(CONFIG_PREFIX).await? {
            if let Some(c) = self.barrier.get_json(&key).await? {
                out.push(c);
            }
        }
        Ok(out)
    }

    // ── records ────────────────────────────────────────────────────

    /// Write a row, encrypting the fields its table config names.
    ///
    /// # Errors
    ///
    /// - [`RecordError::InvalidRequest`] for a bad table or row id.
    /// - [`RecordError::Dek`] if encryption fails.
    pub async fn put_record(
        &self,
        table: &str,
        row_id: &str,
        fields: Map<String, Value>,
    ) -> Result<RecordWrite, RecordError> {
        validate_name("table", table)?;
        validate_name("row id", row_id)?;
        let config: Option<EncryptionConfig> = self.barrier.get_json(&config_key(table)).await?;

        let mut stored = BTreeMap::new();
        let mut encrypted_fields = Vec::new();
        let mut dek_version = None;
        for (name, value) in fields {
            let field = match &config {
                Some(cfg) if cfg.encrypts(&name) => {
                    let plaintext = serde_json::to_vec(&value).map_err(|e| {
                        RecordError::InvalidRequest {
                            reason: format!("field '{name}' is not serializable: {e}"),
                        }
                    })?;
                    let envelope = self.dek.encrypt(cfg.dek_purpose, &plaintext).await?;
                    dek_version = Some(envelope.dek_version);
                    encrypted_fields.push(name.clone());
                    StoredField::Encrypted(envelope)
                }
                _ => StoredField::Plain { value },
            };
            stored.insert(name, field);
        }

        let record = ProtectedRecord {
            table: table.to_owned(),
            row_id: row_id.to_owned(),
            fields: stored,
            updated_at: Utc::now(),
        };
        {
            let _guard = self.write_lock.lock().await;
            self.barrier
                .put_json(&record_key(table, row_id), &record)
                .await?;
        }
        debug!(table = %table, row_id = %row_id, encrypted = encrypted_fields.len(), "record written");
        Ok(RecordWrite {
            table: record.table,
            row_id: record.row_id,
            encrypted_fields,
            dek_version,
            updated_at: record.updated_at,
        })
    }

    /// Read a row as `role` sees it. Hidden fields are absent.
    ///
    /// # Errors
    ///
    /// - [`RecordError::NotFound`] if the row doesn't exist.
    /// - [`RecordError::Dek`] if a field fails to decrypt.
    pub async fn get_record(
        &self,
        table: &str,
        row_id: &str,
        role: &str,
    ) -> Result<RecordView, RecordError> {
        let record: ProtectedRecord = self
            .barrier
            .get_json(&record_key(table, row_id))
            .await?
            .ok_or_else(|| RecordError::NotFound {
                table: table.to_owned(),
                row_id: row_id.to_owned(),
            })?;

        let dek_version = record
            .fields
            .values()
            .filter_map(|f| match f {
                StoredField::Encrypted(env) => Some(env.dek_version),
                StoredField::Plain { .. } => None,
            })
            .min();
        let mut fields = Map::new();
        for (name, stored) in record.fields {
            let access = self.field_access.resolve(table, &name, role).await?;
            if access.level == AccessLevel::None {
                continue;
            }
            let value = match stored {
                StoredField::Plain { value } => value,
                StoredField::Encrypted(envelope) => {
                    let plaintext = self.dek.decrypt(&envelope).await?;
                    serde_json::from_slice(&plaintext).map_err(|e| RecordError::InvalidRequest {
                        reason: format!("field '{name}' holds malformed JSON: {e}"),
                    })?
                }
            };
            let shown = if access.level == AccessLevel::Full {
                Some(value)
            } else {
                access.apply(&display_string(&value)).map(Value::String)
            };
            if let Some(v) = shown {
                fields.insert(name, v);
            }
        }

        Ok(RecordView {
            table: record.table,
            row_id: record.row_id,
            fields,
            dek_version,
            updated_at: record.updated_at,
        })
    }

    // ── re-encryption ──────────────────────────────────────────────

    /// Rewrite every row of `table` still encrypted under an old `purpose`
    /// version. Resumes a previous incomplete sweep for the same target version.
    ///
    /// # Errors
    ///
    /// - [`RecordError::ConfigNotFound`] if the table has no config.
    /// - [`RecordError::NotEnabled`] if the config is disabled or uses another purpose.
    /// - [`RecordError::Barrier`] if the vault is sealed mid-sweep.
    pub async fn re_encrypt(
        &self,
        purpose: DekPurpose,
        table: &str,
    ) -> Result<ReEncryptReport, RecordError> {
        let started = Instant::now();
        let config = self.get_config(table).await?;
        if !config.is_enabled || config.dek_purpose != purpose {
            return Err(RecordError::NotEnabled {
                table: table.to_owned(),
                purpose: purpose.to_string(),
            });
        }

        let target_version = self.dek.current_version(purpose).await?;
        let prefix = format!("{RECORD_PREFIX}{table}/");
        let total_rows = self.barrier.list(&prefix).await?.len() as u64;
        let progress_key = progress_key(purpose, table);
        let now = Utc::now();

        let mut progress = match self
            .barrier
            .get_json::<ReEncryptProgress>(&progress_key)
            .await?
        {
            Some(p) if !p.is_complete && p.target_version == target_version => {
                info!(
                    table = %table,
                    purpose = %purpose,
                    after = ?p.last_row_id,
                    "resuming re-encryption"
                );
                p
            }
            _ => ReEncryptProgress {
                purpose,
                table: table.to_owned(),
                target_version,
                processed_rows: 0,
                total_rows,
                rewritten_rows: 0,
                failed_rows: 0,
                last_row_id: None,
                is_complete: false,
                started_at: now,
                updated_at: now,
            },
        };
        progress.total_rows = total_rows;

        loop {
            let cursor = progress.last_row_id.as_deref().map(|id| format!("{prefix}{id}"));
            let keys = self
                .barrier
                .scan(&prefix, cursor.as_deref(), self.batch_size)
                .await?;

            for key in &keys {
                match self.re_encrypt_row(key, target_version).await {
                    Ok(true) => progress.rewritten_rows += 1,
                    Ok(false) => {}
                    Err(e) if e.kind() == ErrorKind::Sealed => return Err(e),
                    Err(e) => {
                        warn!(key = %key, error = %e, "row re-encryption failed");
                        progress.failed_rows += 1;
                    }
                }
                progress.processed_rows += 1;
            }
            if let Some(last) = keys.last() {
                progress.last_row_id = last.strip_prefix(&prefix).map(str::to_owned);
            }
            progress.is_complete = keys.len() < self.batch_size;
            progress.total_rows = progress.total_rows.max(progress.processed_rows);
            progress.updated_at = Utc::now();
            self.barrier.put_json(&progress_key, &progress).await?;

            if progress.is_complete {
                break;
            }
        }

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            table = %table,
            purpose = %purpose,
            target_version,
            processed = progress.processed_rows,
            rewritten = progress.rewritten_rows,
            failed = progress.failed_rows,
            duration_ms,
            "re-encryption finished"
        );
        Ok(ReEncryptReport {
            purpose,
            table: table.to_owned(),
            target_version,
            processed_rows: progress.processed_rows,
            total_rows: progress.total_rows,
            rewritten_rows: progress.rewritten_rows,
            failed_rows: progress.failed_rows,
            is_complete: progress.is_complete,
            duration_ms,
        })
    }

    /// Returns whether the row was rewritten.
    async fn re_encrypt_row(&self, key: &str, target_version: u32) -> Result<bool, RecordError> {
        let _guard = self.write_lock.lock().await;
        let Some(mut record) = self.barrier.get_json::<ProtectedRecord>(key).await? else {
            return Ok(false);
        };
        if !record.is_stale(target_version) {
            return Ok(false);
        }
        for field in record.fields.values_mut() {
            if let StoredField::Encrypted(env) = field {
                if env.dek_version < target_version {
                    let plaintext = self.dek.decrypt(env).await?;
                    *env = self.dek.encrypt(env.purpose, &plaintext).await?;
                }
            }
        }
        record.updated_at = Utc::now();
        self.barrier.put_json(key, &record).await?;
        Ok(true)
    }

    /// Every persisted sweep cursor.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Barrier`] if sealed or storage fails.
    pub async fn progress(&self) -> Result<Vec<ReEncryptProgress>, RecordError> {
        let mut out = Vec::new();
        for key in self.barrier.list(PROGRESS_PREFIX).await? {
            if let Some(p) = self.barrier.get_json(&key).await? {
                out.push(p);
            }
        }
        Ok(out)
    }

    // ── schema ─────────────────────────────────────────────────────

    /// Per table: encrypted fields, purpose and field access policies.
    ///
    /// # Errors
    ///
    /// Returns [`RecordError::Barrier`] if sealed or storage fails.
    pub async fn schema(&self) -> Result<Vec<TableSchema>, RecordError> {
        let mut tables: BTreeMap<String, TableSchema> = BTreeMap::new();
        for config in self.list_configs().await? {
            tables.insert(
                config.table_name.clone(),
                TableSchema {
                    table_name: config.table_name,
                    encrypted_fields: config.encrypted_fields,
                    dek_purpose: Some(config.dek_purpose),
                    is_enabled: config.is_enabled,
                    field_policies: Vec::new(),
                },
            );
        }
        for policy in self.field_access.list().await? {
            tables
                .entry(policy.table_name.clone())
                .or_insert_with(|| TableSchema {
                    table_name: policy.table_name.clone(),
                    encrypted_fields: Vec::new(),
                    dek_purpose: None,
                    is_enabled: false,
                    field_policies: Vec::new(),
                })
                .field_policies
                .push(policy);
        }
        Ok(tables.into_values().collect())
    }
}

impl fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordStore")
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

fn display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn validate_name(label: &str, value: &str) -> Result<(), RecordError> {
    let ok = !value.is_empty()
        && value.len() <= 128
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(RecordError::InvalidRequest {
            reason: format!("invalid {label} '{value}'"),
        })
    }
}

fn config_key(table: &str) -> String {
    format!("{CONFIG_PREFIX}{table}")
}

fn record_key(table: &str, row_id: &str) -> String {
    format!("{RECORD_PREFIX}{table}/{row_id}")
}

fn progress_key(purpose: DekPurpose, table: &str) -> String {
    format!("{PROGRESS_PREFIX}{}/{table}", purpose.as_str())
}
