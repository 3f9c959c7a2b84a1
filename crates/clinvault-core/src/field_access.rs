//! Per-field access policies and the masking transform.
//!
//! A policy is keyed by `(table, field, role)` and decides what a caller with
//! that role sees of the field: the raw value, a partial reveal, the mask
//! pattern, or nothing at all. Absent a policy the field is hidden; the
//! `Admin` role always sees everything.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::barrier::Barrier;
use crate::error::PolicyError;

const FIELD_ACCESS_PREFIX: &str = "sys/field-access/";

pub const DEFAULT_MASK: &str = "********";
pub const DEFAULT_PARTIAL_LENGTH: usize = 4;
pub const ADMIN_ROLE: &str = "Admin";

/// How much of a field a role may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Full,
    Partial,
    Masked,
    None,
}

impl AccessLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Partial => "partial",
            Self::Masked => "masked",
            Self::None => "none",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored field access policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldAccessPolicy {
    pub table_name: String,
    pub field_name: String,
    pub role: String,
    pub access_level: AccessLevel,
    pub mask_pattern: String,
    pub partial_length: usize,
    #[serde(default)]
    pub description: String,
    pub updated_at: DateTime<Utc>,
}

/// Input for [`FieldAccessStore::put`].
#[derive(Debug, Clone, Deserialize)]
pub struct FieldAccessInput {
    pub table_name: String,
    pub field_name: String,
    pub role: String,
    pub access_level: AccessLevel,
    #[serde(default)]
    pub mask_pattern: Option<String>,
    #[serde(default)]
    pub partial_length: Option<usize>,
    #[serde(default)]
    pub description: String,
}

/// The effective rule for one field and role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedAccess {
    pub level: AccessLevel,
    pub mask_pattern: String,
    pub partial_length: usize,
}

impl ResolvedAccess {
    #[must_use]
    pub fn full() -> Self {
        Self::with_level(AccessLevel::Full)
    }

    #[must_use]
    pub fn none() -> Self {
        Self::with_level(AccessLevel::None)
    }

    fn with_level(level: AccessLevel) -> Self {
        Self {
            level,
            mask_pattern: DEFAULT_MASK.to_owned(),
            partial_length: DEFAULT_PARTIAL_LENGTH,
        }
    }

    /// Transform `value` for display. `None` means the field is removed.
    #[must_use]
    pub fn apply(&self, value: &str) -> Option<String> {
        match self.level {
            AccessLevel::Full => Some(value.to_owned()),
            AccessLevel::Partial => Some(partial_reveal(
                value,
                self.partial_length,
                &self.mask_pattern,
            )),
            AccessLevel::Masked => Some(self.mask_pattern.clone()),
            AccessLevel::None => None,
        }
    }
}

impl From<&FieldAccessPolicy> for ResolvedAccess {
    fn from(policy: &FieldAccessPolicy) -> Self {
        Self {
            level: policy.access_level,
            mask_pattern: policy.mask_pattern.clone(),
            partial_length: policy.partial_length,
        }
    }
}

/// First and last `n` characters around `mask`. Short values are fully masked
/// so the two ends never overlap or reveal the whole value.
fn partial_reveal(value: &str, n: usize, mask: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= n.saturating_mul(2) {
        return mask.to_owned();
    }
    let head: String = chars[..n].iter().collect();
    let tail: String = chars[chars.len() - n..].iter().collect();
    format!("{head}{mask}{tail}")
}

/// Field access policy CRUD and resolution.
pub struct FieldAccessStore {
    barrier: Arc<Barrier>,
}

impl FieldAccessStore {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self { barrier }
    }

    /// Create or replace the policy for `(table, field, role)`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Invalid`] for an empty or `/`-containing name,
    /// an empty mask, or a zero partial length.
    pub async fn put(&self, input: FieldAccessInput) -> Result<FieldAccessPolicy, PolicyError> {
        for (label, value) in [
            ("table_name", &input.table_name),
            ("field_name", &input.field_name),
            ("role", &input.role),
        ] {
            validate_component(label, value)?;
        }
        let mask_pattern = input.mask_pattern.unwrap_or_else(|| DEFAULT_MASK.to_owned());
        if mask_pattern.is_empty() {
            return Err(PolicyError::Invalid {
                reason: "mask_pattern must not be empty".to_owned(),
            });
        }
        let partial_length = input.partial_length.unwrap_or(DEFAULT_PARTIAL_LENGTH);
        if partial_length == 0 {
            return Err(PolicyError::Invalid {
                reason: "partial_length must be at least 1".to_owned(),
            });
        }

        let policy = FieldAccessPolicy {
            table_name: input.table_name,
            field_name: input.field_name,
            role: input.role,
            access_level: input.access_level,
            mask_pattern,
            partial_length,
            description: input.description,
            updated_at: Utc::now(),
        };
        self.barrier
            .put_json(
                &policy_key(&policy.table_name, &policy.field_name, &policy.role),
                &policy,
            )
            .await?;
        info!(
            table = %policy.table_name,
            field = %policy.field_name,
            role = %policy.role,
            level = %policy.access_level,
            "field access policy written"
        );
        Ok(policy)
    }

    /// The stored policy for `(table, field, role)`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::MissingEntry`] if there is none.
    pub async fn get(
        &self,
        table: &str,
        field: &str,
        role: &str,
    ) -> Result<FieldAccessPolicy, PolicyError> {
        self.barrier
            .get_json(&policy_key(table, field, role))
            .await?
            .ok_or_else(|| PolicyError::MissingEntry {
                what: "field access policy",
                key: format!("{table}/{field}/{role}"),
            })
    }

    /// Delete the policy for `(table, field, role)`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::MissingEntry`] if there is none.
    pub async fn delete(&self, table: &str, field: &str, role: &str) -> Result<(), PolicyError> {
        let key = policy_key(table, field, role);
        if !self.barrier.exists(&key).await? {
            return Err(PolicyError::MissingEntry {
                what: "field access policy",
                key: format!("{table}/{field}/{role}"),
            });
        }
        self.barrier.delete(&key).await?;
        Ok(())
    }

    /// Every policy, ordered by table, field and role.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Barrier`] if sealed or storage fails.
    pub async fn list(&self) -> Result<Vec<FieldAccessPolicy>, PolicyError> {
        self.load_under(FIELD_ACCESS_PREFIX).await
    }

    /// Policies for one table.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Barrier`] if sealed or storage fails.
    pub async fn list_for_table(&self, table: &str) -> Result<Vec<FieldAccessPolicy>, PolicyError> {
        self.load_under(&format!("{FIELD_ACCESS_PREFIX}{table}/")).await
    }

    /// The effective rule for `role` on `table.field`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Barrier`] if sealed or storage fails.
    pub async fn resolve(
        &self,
        table: &str,
        field: &str,
        role: &str,
    ) -> Result<ResolvedAccess, PolicyError> {
        if role.eq_ignore_ascii_case(ADMIN_ROLE) {
            return Ok(ResolvedAccess::full());
        }
        Ok(self
            .barrier
            .get_json::<FieldAccessPolicy>(&policy_key(table, field, role))
            .await?
            .map_or_else(ResolvedAccess::none, |p| ResolvedAccess::from(&p)))
    }

    async fn load_under(&self, prefix: &str) -> Result<Vec<FieldAccessPolicy>, PolicyError> {
        let mut out = Vec::new();
        for key in self.barrier.list(prefix).await? {
            if let Some(p) = self.barrier.get_json(&key).await? {
                out.push(p);
            }
        }
        Ok(out)
    }
}

impl fmt::Debug for FieldAccessStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldAccessStore").finish_non_exhaustive()
    }
}

fn validate_component(label: &str, value: &str) -> Result<(), PolicyError> {
    if value.trim().is_empty() || value.contains('/') {
        return Err(PolicyError::Invalid {
            reason: format!("{label} must be non-empty and must not contain '/'"),
        });
    }
    Ok(())
}

// Roles compare case-insensitively, so the key uses the lowercase form.
fn policy_key(table: &str, field: &str, role: &str) -> String {
    format!(
        "{FIELD_ACCESS_PREFIX}{table}/{field}/{}",
        role.to_ascii_lowercase()
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clinvault_storage::{MemoryBackend, StorageBackend};

    use super::*;
    use crate::crypto::EncryptionKey;

    fn rule(level: AccessLevel) -> ResolvedAccess {
        ResolvedAccess {
            level,
            mask_pattern: "***".to_owned(),
            partial_length: 2,
        }
    }

    async fn store() -> FieldAccessStore {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let barrier = Arc::new(Barrier::new(storage));
        barrier.install(EncryptionKey::generate(), "local").await;
        FieldAccessStore::new(barrier)
    }

    fn input(level: AccessLevel) -> FieldAccessInput {
        FieldAccessInput {
            table_name: "patients".to_owned(),
            field_name: "ssn".to_owned(),
            role: "Nurse".to_owned(),
            access_level: level,
            mask_pattern: None,
            partial_length: None,
            description: String::new(),
        }
    }

    // ── masking ────────────────────────────────────────────────────

    #[test]
    fn each_level_transforms_as_documented() {
        assert_eq!(rule(AccessLevel::Full).apply("123456").as_deref(), Some("123456"));
        assert_eq!(rule(AccessLevel::Partial).apply("123456").as_deref(), Some("12***56"));
        assert_eq!(rule(AccessLevel::Masked).apply("123456").as_deref(), Some("***"));
        assert_eq!(rule(AccessLevel::None).apply("123456"), None);
    }

    #[test]
    fn short_values_are_fully_masked() {
        let partial = rule(AccessLevel::Partial);
        assert_eq!(partial.apply("1234").as_deref(), Some("***"));
        assert_eq!(partial.apply("").as_deref(), Some("***"));
        assert_eq!(partial.apply("12345").as_deref(), Some("12***45"));
    }

    #[test]
    fn partial_counts_characters_not_bytes() {
        assert_eq!(
            rule(AccessLevel::Partial).apply("ÅngströmÖ").as_deref(),
            Some("Ån***mÖ")
        );
    }

    // ── store ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn missing_policy_resolves_to_none_and_admin_to_full() {
        let store = store().await;
        assert_eq!(
            store.resolve("patients", "ssn", "Nurse").await.unwrap().level,
            AccessLevel::None
        );
        assert_eq!(
            store.resolve("patients", "ssn", "admin").await.unwrap().level,
            AccessLevel::Full
        );
    }

    #[tokio::test]
    async fn defaults_apply_and_roles_ignore_case() {
        let store = store().await;
        let policy = store.put(input(AccessLevel::Partial)).await.unwrap();
        assert_eq!(policy.mask_pattern, DEFAULT_MASK);
        assert_eq!(policy.partial_length, DEFAULT_PARTIAL_LENGTH);

        let resolved = store.resolve("patients", "ssn", "NURSE").await.unwrap();
        assert_eq!(
            resolved.apply("123-45-6789").as_deref(),
            Some("123-********6789")
        );
    }

    #[tokio::test]
    async fn rejects_bad_input_and_deletes() {
        let store = store().await;
        let mut bad = input(AccessLevel::Masked);
        bad.table_name = "a/b".to_owned();
        assert!(matches!(store.put(bad).await, Err(PolicyError::Invalid { .. })));

        let mut zero = input(AccessLevel::Partial);
        zero.partial_length = Some(0);
        assert!(store.put(zero).await.is_err());

        store.put(input(AccessLevel::Masked)).await.unwrap();
        assert_eq!(store.list_for_table("patients").await.unwrap().len(), 1);
        store.delete("patients", "ssn", "nurse").await.unwrap();
        assert!(matches!(
            store.get("patients", "ssn", "Nurse").await,
            Err(PolicyError::MissingEntry { .. })
        ));
    }
}
