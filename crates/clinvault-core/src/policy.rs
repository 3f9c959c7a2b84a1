//! Path-glob capability policies and user assignments.
//!
//! A policy grants a set of capabilities on every path its pattern matches.
//! Patterns use `glob-match`: `*` matches within one segment and `**` any
//! depth. `sudo` implies every other capability.
//!
//! Two built-in policies always exist and cannot be changed:
//! - `root`: every capability on `**`.
//! - `default`: read on `auth/token/self`.
//!
//! Evaluation skips policy names that do not exist and fails closed on any
//! other error.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::barrier::Barrier;
use crate::error::PolicyError;

const POLICY_PREFIX: &str = "sys/policies/";
const ASSIGNMENT_PREFIX: &str = "sys/policy-assignments/";

pub const ROOT_POLICY: &str = "root";
pub const DEFAULT_POLICY: &str = "default";

/// An access capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    List,
    Create,
    Update,
    Delete,
    Sudo,
}

impl Capability {
    pub const ALL: [Self; 6] = [
        Self::Read,
        Self::List,
        Self::Create,
        Self::Update,
        Self::Delete,
        Self::Sudo,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::List => "list",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Sudo => "sudo",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub name: String,
    pub path_pattern: String,
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl Policy {
    /// Whether this policy grants `capability` on `path`.
    #[must_use]
    pub fn grants(&self, path: &str, capability: Capability) -> bool {
        glob_match::glob_match(&self.path_pattern, path)
            && (self.capabilities.contains(&capability)
                || self.capabilities.contains(&Capability::Sudo))
    }

    #[must_use]
    pub fn is_builtin(&self) -> bool {
        is_builtin(&self.name)
    }
}

/// Input for [`PolicyStore::put`].
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyInput {
    pub name: String,
    pub path_pattern: String,
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub description: String,
}

/// Policies attached to a user in addition to their token's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyAssignment {
    pub user_id: String,
    pub policies: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Policy and assignment CRUD plus evaluation.
pub struct PolicyStore {
    barrier: Arc<Barrier>,
}

impl PolicyStore {
    #[must_use]
    pub fn new(barrier: Arc<Barrier>) -> Self {
        Self { barrier }
    }

    /// Create or replace a policy.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::BuiltIn`] for `root` or `default`.
    /// - [`PolicyError::Invalid`] for a bad name, empty pattern or no capabilities.
    pub async fn put(&self, input: PolicyInput) -> Result<Policy, PolicyError> {
        if is_builtin(&input.name) {
            return Err(PolicyError::BuiltIn { name: input.name });
        }
        validate_name(&input.name)?;
        if input.path_pattern.trim().is_empty() {
            return Err(PolicyError::Invalid {
                reason: "path_pattern must not be empty".to_owned(),
            });
        }
        if input.capabilities.is_empty() {
            return Err(PolicyError::Invalid {
                reason: "policy must grant at least one capability".to_owned(),
            });
        }

        let existing: Option<Policy> = self.barrier.get_json(&policy_key(&input.name)).await?;
        let mut capabilities = input.capabilities;
        capabilities.sort_by_key(|c| *c as u8);
        capabilities.dedup();

        let policy = Policy {
            id: existing
                .as_ref()
                .map_or_else(|| uuid::Uuid::new_v4().to_string(), |p| p.id.clone()),
            name: input.name,
            path_pattern: input.path_pattern,
            capabilities,
            description: input.description,
            created_at: existing.map_or_else(Utc::now, |p| p.created_at),
        };
        self.barrier.put_json(&policy_key(&policy.name), &policy).await?;
        info!(name = %policy.name, pattern = %policy.path_pattern, "policy written");
        Ok(policy)
    }

    /// Read a policy. Built-ins are served without storage.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::NotFound`] if it doesn't exist.
    pub async fn get(&self, name: &str) -> Result<Policy, PolicyError> {
        if let Some(policy) = builtin(name) {
            return Ok(policy);
        }
        self.barrier
            .get_json(&policy_key(name))
            .await?
            .ok_or_else(|| PolicyError::NotFound {
                name: name.to_owned(),
            })
    }

    /// Delete a policy.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::BuiltIn`] for `root` or `default`.
    /// - [`PolicyError::NotFound`] if it doesn't exist.
    pub async fn delete(&self, name: &str) -> Result<(), PolicyError> {
        if is_builtin(name) {
            return Err(PolicyError::BuiltIn {
                name: name.to_owned(),
            });
        }
        let key = policy_key(name);
        if !self.barrier.exists(&key).await? {
            return Err(PolicyError::NotFound {
                name: name.to_owned(),
            });
        }
        self.barrier.delete(&key).await?;
        info!(name = %name, "policy deleted");
        Ok(())
    }

    /// All policies, built-ins first.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Barrier`] if sealed or storage fails.
    pub async fn list(&self) -> Result<Vec<Policy>, PolicyError> {
        let mut policies = vec![root_policy(), default_policy()];
        let mut stored = Vec::new();
        for key in self.barrier.list(POLICY_PREFIX).await? {
            if let Some(p) = self.barrier.get_json::<Policy>(&key).await? {
                stored.push(p);
            }
        }
        stored.sort_by(|a, b| a.name.cmp(&b.name));
        policies.extend(stored);
        Ok(policies)
    }

    /// The assignment for `user_id`.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::MissingEntry`] if the user has none.
    pub async fn get_assignment(&self, user_id: &str) -> Result<PolicyAssignment, PolicyError> {
        self.barrier
            .get_json(&assignment_key(user_id))
            .await?
            .ok_or_else(|| PolicyError::MissingEntry {
                what: "policy assignment",
                key: user_id.to_owned(),
            })
    }

    /// Replace the policies assigned to `user_id`. Every name must exist.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::Invalid`] for an empty user id.
    /// - [`PolicyError::NotFound`] if a named policy doesn't exist.
    pub async fn set_assignment(
        &self,
        user_id: &str,
        policies: Vec<String>,
    ) -> Result<PolicyAssignment, PolicyError> {
        if user_id.trim().is_empty() {
            return Err(PolicyError::Invalid {
                reason: "user_id must not be empty".to_owned(),
            });
        }
        for name in &policies {
            self.get(name).await?;
        }
        let mut policies = policies;
        policies.sort();
        policies.dedup();

        let assignment = PolicyAssignment {
            user_id: user_id.to_owned(),
            policies,
            updated_at: Utc::now(),
        };
        self.barrier
            .put_json(&assignment_key(user_id), &assignment)
            .await?;
        info!(user_id = %user_id, policies = ?assignment.policies, "policy assignment updated");
        Ok(assignment)
    }

    /// Remove a user's assignment.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::MissingEntry`] if the user has none.
    pub async fn delete_assignment(&self, user_id: &str) -> Result<(), PolicyError> {
        let key = assignment_key(user_id);
        if !self.barrier.exists(&key).await? {
            return Err(PolicyError::MissingEntry {
                what: "policy assignment",
                key: user_id.to_owned(),
            });
        }
        self.barrier.delete(&key).await?;
        Ok(())
    }

    /// Every assignment, ordered by user id.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Barrier`] if sealed or storage fails.
    pub async fn list_assignments(&self) -> Result<Vec<PolicyAssignment>, PolicyError> {
        let mut out = Vec::new();
        for key in self.barrier.list(ASSIGNMENT_PREFIX).await? {
            if let Some(a) = self.barrier.get_json(&key).await? {
                out.push(a);
            }
        }
        Ok(out)
    }

    /// Policy names assigned to `user_id`, empty when there is no assignment.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Barrier`] if sealed or storage fails.
    pub async fn assigned_policies(&self, user_id: &str) -> Result<Vec<String>, PolicyError> {
        Ok(self
            .barrier
            .get_json::<PolicyAssignment>(&assignment_key(user_id))
            .await?
            .map(|a| a.policies)
            .unwrap_or_default())
    }

    /// Succeeds if any of `policy_names` grants `capability` on `path`.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::Denied`] if none does.
    /// - Any storage error, so callers deny on failure.
    pub async fn authorize(
        &self,
        policy_names: &[String],
        path: &str,
        capability: Capability,
    ) -> Result<(), PolicyError> {
        for name in policy_names {
            let policy = match self.get(name).await {
                Ok(p) => p,
                Err(PolicyError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            if policy.grants(path, capability) {
                return Ok(());
            }
        }
        Err(PolicyError::Denied {
            path: path.to_owned(),
            capability: capability.to_string(),
        })
    }
}

impl fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyStore").finish_non_exhaustive()
    }
}

/// The built-in `root` policy.
#[must_use]
pub fn root_policy() -> Policy {
    Policy {
        id: ROOT_POLICY.to_owned(),
        name: ROOT_POLICY.to_owned(),
        path_pattern: "**".to_owned(),
        capabilities: Capability::ALL.to_vec(),
        description: "full access to every path".to_owned(),
        created_at: DateTime::<Utc>::UNIX_EPOCH,
    }
}

/// The built-in `default` policy.
#[must_use]
pub fn default_policy() -> Policy {
    Policy {
        id: DEFAULT_POLICY.to_owned(),
        name: DEFAULT_POLICY.to_owned(),
        path_pattern: "auth/token/self".to_owned(),
        capabilities: vec![Capability::Read],
        description: "token self-lookup".to_owned(),
        created_at: DateTime::<Utc>::UNIX_EPOCH,
    }
}

fn builtin(name: &str) -> Option<Policy> {
    match name {
        ROOT_POLICY => Some(root_policy()),
        DEFAULT_POLICY => Some(default_policy()),
        _ => None,
    }
}

fn is_builtin(name: &str) -> bool {
    name == ROOT_POLICY || name == DEFAULT_POLICY
}

fn validate_name(name: &str) -> Result<(), PolicyError> {
    let ok = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(PolicyError::Invalid {
            reason: format!("invalid policy name '{name}'"),
        })
    }
}

fn policy_key(name: &str) -> String {
    format!("{POLICY_PREFIX}{name}")
}

fn assignment_key(user_id: &str) -> String {
    format!("{ASSIGNMENT_PREFIX}{user_id}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clinvault_storage::{MemoryBackend, StorageBackend};

    use super::*;
    use crate::crypto::EncryptionKey;

    async fn store() -> (Arc<Barrier>, PolicyStore) {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let barrier = Arc::new(Barrier::new(storage));
        barrier.install(EncryptionKey::generate(), "local").await;
        (Arc::clone(&barrier), PolicyStore::new(barrier))
    }

    fn input(name: &str, pattern: &str, caps: &[Capability]) -> PolicyInput {
        PolicyInput {
            name: name.to_owned(),
            path_pattern: pattern.to_owned(),
            capabilities: caps.to_vec(),
            description: String::new(),
        }
    }

    #[test]
    fn globs_respect_segments_and_sudo() {
        let mut p = root_policy();
        p.path_pattern = "secret/clinic/*".to_owned();
        p.capabilities = vec![Capability::Read];
        assert!(p.grants("secret/clinic/db", Capability::Read));
        assert!(!p.grants("secret/clinic/db/nested", Capability::Read));
        assert!(!p.grants("secret/clinic/db", Capability::Delete));

        p.path_pattern = "secret/**".to_owned();
        p.capabilities = vec![Capability::Sudo];
        assert!(p.grants("secret/a/b/c", Capability::Delete));
    }

    #[tokio::test]
    async fn authorize_skips_unknown_policies() {
        let (_, store) = store().await;
        store
            .put(input("readers", "secret/**", &[Capability::Read, Capability::List]))
            .await
            .unwrap();
        let names = vec!["ghost".to_owned(), "readers".to_owned()];
        store.authorize(&names, "secret/db/pw", Capability::Read).await.unwrap();
        assert!(matches!(
            store.authorize(&names, "secret/db/pw", Capability::Update).await,
            Err(PolicyError::Denied { .. })
        ));
        assert!(store.authorize(&[], "secret/x", Capability::Read).await.is_err());
    }

    #[tokio::test]
    async fn authorize_fails_closed_when_sealed() {
        let (barrier, store) = store().await;
        store.put(input("readers", "**", &[Capability::Read])).await.unwrap();
        barrier.seal().await;
        let err = store
            .authorize(&["readers".to_owned()], "secret/x", Capability::Read)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Sealed);
    }

    #[tokio::test]
    async fn builtins_are_immutable() {
        let (_, store) = store().await;
        assert!(matches!(
            store.put(input("root", "**", &[Capability::Read])).await,
            Err(PolicyError::BuiltIn { .. })
        ));
        assert!(matches!(store.delete("default").await, Err(PolicyError::BuiltIn { .. })));
        let names: Vec<_> = store.list().await.unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["root", "default"]);
    }

    #[tokio::test]
    async fn assignments_require_existing_policies() {
        let (_, store) = store().await;
        assert!(store.assigned_policies("bob").await.unwrap().is_empty());
        assert!(matches!(
            store.set_assignment("bob", vec!["ghost".to_owned()]).await,
            Err(PolicyError::NotFound { .. })
        ));
        store.put(input("billing", "data/invoices", &[Capability::Read])).await.unwrap();
        store
            .set_assignment("bob", vec!["billing".to_owned(), "billing".to_owned()])
            .await
            .unwrap();
        assert_eq!(store.assigned_policies("bob").await.unwrap(), vec!["billing"]);
        store.delete_assignment("bob").await.unwrap();
        assert!(matches!(
            store.get_assignment("bob").await,
            Err(PolicyError::MissingEntry { .. })
        ));
    }

    #[tokio::test]
    async fn rewriting_a_policy_keeps_its_identity() {
        let (_, store) = store().await;
        let first = store.put(input("ops", "sys/**", &[Capability::Read])).await.unwrap();
        let second = store
            .put(input("ops", "sys/**", &[Capability::Update, Capability::Read]))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.capabilities, vec![Capability::Read, Capability::Update]);
    }
}
