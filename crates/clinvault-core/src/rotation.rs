//! Scheduled secret rotation.
//!
//! A schedule binds a secret path to an interval and a strategy. Rotating
//! writes a new value through the secret store (bumping its version) and
//! appends a history entry whether or not the rotation succeeded.
//!
//! When the schedule has a grace period, the replaced value stays readable
//! through [`RotationEngine::previous`] until the grace period ends, so
//! consumers still holding it can finish their cut-over.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::barrier::Barrier;
use crate::crypto::random_bytes;
use crate::error::{ErrorKind, RotationError, SecretError};
use crate::secrets::{Secret, SecretStore, StoredSecret, normalize_path};

const SCHEDULE_PREFIX: &str = "sys/rotation/schedules/";
const HISTORY_PREFIX: &str = "sys/rotation/history/";
const PREVIOUS_PREFIX: &str = "sys/rotation/previous/";

const GENERATED_SECRET_LEN: usize = 32;
const DEFAULT_GRACE_HOURS: u32 = 24;
const MAX_INTERVAL_DAYS: u32 = 3650;

/// Produces the next value of a secret for the `Callback` strategy.
#[async_trait::async_trait]
pub trait RotationCallback: Send + Sync {
    /// Name schedules refer to this callback by.
    fn name(&self) -> &str;

    /// Compute the replacement for `current_value`.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::Callback`] if no new value can be produced.
    async fn next_value(
        &self,
        secret_path: &str,
        current_value: &str,
    ) -> Result<String, RotationError>;
}

/// How a new secret value is produced.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RotationStrategy {
    /// Base64 of 32 random bytes.
    #[default]
    Generate,
    /// A registered [`RotationCallback`].
    Callback { name: String },
}

/// What caused a rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationTrigger {
    Manual,
    Scheduled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationSchedule {
    pub secret_path: String,
    pub rotation_interval_days: u32,
    /// How long the replaced value stays readable after a rotation. Zero
    /// drops it immediately.
    pub grace_period_hours: u32,
    pub automatically_rotate: bool,
    pub rotation_strategy: RotationStrategy,
    pub is_active: bool,
    pub last_rotated_at: Option<DateTime<Utc>>,
    pub next_rotation_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl RotationSchedule {
    #[must_use]
    pub fn is_overdue_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && now > self.next_rotation_at
    }

    fn interval(&self) -> Duration {
        Duration::days(i64::from(self.rotation_interval_days))
    }
}

/// Input for [`RotationEngine::upsert`].
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleInput {
    pub secret_path: String,
    pub rotation_interval_days: u32,
    #[serde(default = "default_grace")]
    pub grace_period_hours: u32,
    #[serde(default = "default_true")]
    pub automatically_rotate: bool,
    #[serde(default)]
    pub rotation_strategy: RotationStrategy,
}

fn default_grace() -> u32 {
    DEFAULT_GRACE_HOURS
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotationHistoryEntry {
    pub id: String,
    pub secret_path: String,
    pub old_version: Option<u64>,
    pub new_version: Option<u64>,
    pub success: bool,
    pub error: Option<String>,
    pub rotated_at: DateTime<Utc>,
    pub trigger: RotationTrigger,
}

/// The value a rotation replaced.
#[derive(Clone, Serialize, Deserialize)]
struct PreviousValue {
    secret: StoredSecret,
    valid_until: DateTime<Utc>,
}

/// Result of [`RotationEngine::run_due`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct RotationRunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub entries: Vec<RotationHistoryEntry>,
}

/// Schedule CRUD and rotation execution.
pub struct RotationEngine {
    barrier: Arc<Barrier>,
    secrets: Arc<SecretStore>,
    callbacks: Vec<Arc<dyn RotationCallback>>,
}

impl RotationEngine {
    #[must_use]
    pub fn new(
        barrier: Arc<Barrier>,
        secrets: Arc<SecretStore>,
        callbacks: Vec<Arc<dyn RotationCallback>>,
    ) -> Self {
        Self {
            barrier,
            secrets,
            callbacks,
        }
    }

    fn callback(&self, name: &str) -> Option<&Arc<dyn RotationCallback>> {
        self.callbacks.iter().find(|c| c.name() == name)
    }

    /// Create or update the schedule for a secret. The secret must exist.
    ///
    /// # Errors
    ///
    /// - [`RotationError::InvalidSchedule`] for an interval outside 1..=3650 days.
    /// - [`RotationError::UnknownCallback`] if the callback isn't registered.
    /// - [`RotationError::Secret`] if the path is invalid or the secret is missing.
    pub async fn upsert(&self, input: ScheduleInput) -> Result<RotationSchedule, RotationError> {
        let path = normalize_path(&input.secret_path)?;
        if !(1..=MAX_INTERVAL_DAYS).contains(&input.rotation_interval_days) {
            return Err(RotationError::InvalidSchedule {
                reason: format!("rotation_interval_days must be between 1 and {MAX_INTERVAL_DAYS}"),
            });
        }
        if let RotationStrategy::Callback { name } = &input.rotation_strategy {
            if self.callback(name).is_none() {
                return Err(RotationError::UnknownCallback { name: name.clone() });
            }
        }
        if !self.secrets.exists(&path).await? {
            return Err(SecretError::NotFound { path }.into());
        }

        let now = Utc::now();
        let existing: Option<RotationSchedule> = self.barrier.get_json(&schedule_key(&path)).await?;
        let (created_at, last_rotated_at) = existing
            .map_or((now, None), |s| (s.created_at, s.last_rotated_at));

        let mut schedule = RotationSchedule {
            secret_path: path,
            rotation_interval_days: input.rotation_interval_days,
            grace_period_hours: input.grace_period_hours,
            automatically_rotate: input.automatically_rotate,
            rotation_strategy: input.rotation_strategy,
            is_active: true,
            last_rotated_at,
            next_rotation_at: now,
            created_at,
        };
        schedule.next_rotation_at = last_rotated_at.unwrap_or(now) + schedule.interval();

        self.save(&schedule).await?;
        info!(
            path = %schedule.secret_path,
            interval_days = schedule.rotation_interval_days,
            next = %schedule.next_rotation_at,
            "rotation schedule saved"
        );
        Ok(schedule)
    }

    /// # Errors
    ///
    /// Returns [`RotationError::ScheduleNotFound`] if there is none.
    pub async fn get(&self, path: &str) -> Result<RotationSchedule, RotationError> {
        let path = normalize_path(path)?;
        self.barrier
            .get_json(&schedule_key(&path))
            .await?
            .ok_or(RotationError::ScheduleNotFound { path })
    }

    /// Every schedule, active or not, in path order.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::Barrier`] if sealed or storage fails.
    pub async fn list(&self) -> Result<Vec<RotationSchedule>, RotationError> {
        let mut out = Vec::new();
        for key in self.barrier.list(SCHEDULE_PREFIX).await? {
            if let Some(s) = self.barrier.get_json(&key).await? {
                out.push(s);
            }
        }
        Ok(out)
    }

    /// Deactivate the schedule for `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::ScheduleNotFound`] if there is none.
    pub async fn remove(&self, path: &str) -> Result<RotationSchedule, RotationError> {
        let mut schedule = self.get(path).await?;
        schedule.is_active = false;
        self.save(&schedule).await?;
        info!(path = %schedule.secret_path, "rotation schedule deactivated");
        Ok(schedule)
    }

    /// Drop the schedule for a deleted secret. Missing schedules are fine.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::Barrier`] if sealed or storage fails.
    pub async fn forget(&self, path: &str) -> Result<(), RotationError> {
        let path = normalize_path(path)?;
        self.barrier.delete(&schedule_key(&path)).await?;
        self.barrier.delete(&previous_key(&path)).await?;
        Ok(())
    }

    /// Active schedules past their next rotation time.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::Barrier`] if sealed or storage fails.
    pub async fn overdue(&self) -> Result<Vec<RotationSchedule>, RotationError> {
        let now = Utc::now();
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|s| s.is_overdue_at(now))
            .collect())
    }

    /// Rotate `path` now. Failures to produce or store the new value are
    /// reported in the returned entry, not as an error.
    ///
    /// # Errors
    ///
    /// - [`RotationError::Secret`] for an invalid path.
    /// - [`RotationError::Barrier`] if sealed or the history write fails.
    pub async fn rotate_now(
        &self,
        path: &str,
        trigger: RotationTrigger,
    ) -> Result<RotationHistoryEntry, RotationError> {
        let path = normalize_path(path)?;
        let schedule: Option<RotationSchedule> = self.barrier.get_json(&schedule_key(&path)).await?;
        let strategy = schedule
            .as_ref()
            .map(|s| s.rotation_strategy.clone())
            .unwrap_or_default();
        let grace = schedule
            .as_ref()
            .map_or(Duration::zero(), |s| Duration::hours(i64::from(s.grace_period_hours)));

        let now = Utc::now();
        let mut entry = RotationHistoryEntry {
            id: uuid::Uuid::new_v4().to_string(),
            secret_path: path.clone(),
            old_version: None,
            new_version: None,
            success: false,
            error: None,
            rotated_at: now,
            trigger,
        };

        match self.execute(&path, &strategy, now + grace, &mut entry).await {
            Ok(()) => {
                entry.success = true;
                if let Some(mut s) = schedule {
                    s.last_rotated_at = Some(now);
                    s.next_rotation_at = now + s.interval();
                    self.save(&s).await?;
                }
                info!(
                    path = %path,
                    old_version = ?entry.old_version,
                    new_version = ?entry.new_version,
                    trigger = ?trigger,
                    "secret rotated"
                );
            }
            Err(e) if e.kind() == ErrorKind::Sealed => return Err(e),
            Err(e) => {
                error!(path = %path, error = %e, trigger = ?trigger, "secret rotation failed");
                entry.error = Some(e.to_string());
            }
        }

        self.barrier
            .put_json(&history_key(&path, now, &entry.id), &entry)
            .await?;
        Ok(entry)
    }

    async fn execute(
        &self,
        path: &str,
        strategy: &RotationStrategy,
        previous_until: DateTime<Utc>,
        entry: &mut RotationHistoryEntry,
    ) -> Result<(), RotationError> {
        let stored = self
            .secrets
            .load(path)
            .await?
            .ok_or_else(|| SecretError::NotFound {
                path: path.to_owned(),
            })?;
        let current = self.secrets.open(&stored).await?;
        entry.old_version = Some(current.version);

        let next = match strategy {
            RotationStrategy::Generate => BASE64.encode(random_bytes(GENERATED_SECRET_LEN)),
            RotationStrategy::Callback { name } => {
                let callback = self
                    .callback(name)
                    .ok_or_else(|| RotationError::UnknownCallback { name: name.clone() })?;
                callback.next_value(path, &current.value).await?
            }
        };

        // Kept before the write; until then it is still the current value.
        if previous_until > Utc::now() {
            let previous = PreviousValue {
                secret: stored,
                valid_until: previous_until,
            };
            self.barrier.put_json(&previous_key(path), &previous).await?;
        }

        let written = self.secrets.put(path, &next).await?;
        entry.new_version = Some(written.version);
        Ok(())
    }

    /// The value replaced by the last rotation of `path`, while its grace
    /// period lasts. An elapsed entry is deleted on read.
    ///
    /// # Errors
    ///
    /// - [`RotationError::Secret`] for an invalid path or a failed decrypt.
    /// - [`RotationError::Barrier`] if sealed or storage fails.
    pub async fn previous(&self, path: &str) -> Result<Option<Secret>, RotationError> {
        let path = normalize_path(path)?;
        let key = previous_key(&path);
        let Some(previous) = self.barrier.get_json::<PreviousValue>(&key).await? else {
            return Ok(None);
        };
        if Utc::now() >= previous.valid_until {
            self.barrier.delete(&key).await?;
            return Ok(None);
        }
        Ok(Some(self.secrets.open(&previous.secret).await?))
    }

    /// Rotate every automatic overdue schedule.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::Barrier`] if sealed or storage fails.
    pub async fn run_due(&self) -> Result<RotationRunSummary, RotationError> {
        let mut summary = RotationRunSummary::default();
        for schedule in self.overdue().await? {
            if !schedule.automatically_rotate {
                continue;
            }
            let entry = self
                .rotate_now(&schedule.secret_path, RotationTrigger::Scheduled)
                .await?;
            summary.total += 1;
            if entry.success {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            summary.entries.push(entry);
        }
        if summary.total > 0 {
            info!(
                total = summary.total,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "scheduled rotations complete"
            );
        }
        Ok(summary)
    }

    /// Rotation history for `path`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`RotationError::Barrier`] if sealed or storage fails.
    pub async fn history(&self, path: &str) -> Result<Vec<RotationHistoryEntry>, RotationError> {
        let path = normalize_path(path)?;
        let mut out = Vec::new();
        for key in self.barrier.list(&format!("{HISTORY_PREFIX}{path}/")).await? {
            if let Some(entry) = self.barrier.get_json::<RotationHistoryEntry>(&key).await? {
                // Child paths share the prefix.
                if entry.secret_path == path {
                    out.push(entry);
                }
            }
        }
        out.reverse();
        Ok(out)
    }

    async fn save(&self, schedule: &RotationSchedule) -> Result<(), RotationError> {
        self.barrier
            .put_json(&schedule_key(&schedule.secret_path), schedule)
            .await?;
        Ok(())
    }
}

impl fmt::Debug for RotationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationEngine")
            .field("callbacks", &self.callbacks.iter().map(|c| c.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn schedule_key(path: &str) -> String {
    format!("{SCHEDULE_PREFIX}{path}")
}

fn previous_key(path: &str) -> String {
    format!("{PREVIOUS_PREFIX}{path}")
}

fn history_key(path: &str, at: DateTime<Utc>, id: &str) -> String {
    format!("{HISTORY_PREFIX}{path}/{:016}-{id}", at.timestamp_millis())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use clinvault_storage::{MemoryBackend, StorageBackend};

    use super::*;
    use crate::crypto::EncryptionKey;
    use crate::dek::DekManager;

    struct Suffix;

    #[async_trait::async_trait]
    impl RotationCallback for Suffix {
        fn name(&self) -> &str {
            "suffix"
        }

        async fn next_value(&self, _path: &str, current: &str) -> Result<String, RotationError> {
            Ok(format!("{current}-next"))
        }
    }

    struct Broken;

    #[async_trait::async_trait]
    impl RotationCallback for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn next_value(&self, _path: &str, _current: &str) -> Result<String, RotationError> {
            Err(RotationError::Callback {
                name: "broken".to_owned(),
                reason: "upstream refused".to_owned(),
            })
        }
    }

    async fn engine() -> (Arc<Barrier>, Arc<SecretStore>, RotationEngine) {
        let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
        let barrier = Arc::new(Barrier::new(storage));
        barrier.install(EncryptionKey::generate(), "local").await;
        let dek = Arc::new(DekManager::new(Arc::clone(&barrier)));
        let secrets = Arc::new(SecretStore::new(Arc::clone(&barrier), dek));
        let engine = RotationEngine::new(
            Arc::clone(&barrier),
            Arc::clone(&secrets),
            vec![Arc::new(Suffix), Arc::new(Broken)],
        );
        (barrier, secrets, engine)
    }

    fn input(path: &str, strategy: RotationStrategy) -> ScheduleInput {
        ScheduleInput {
            secret_path: path.to_owned(),
            rotation_interval_days: 30,
            grace_period_hours: 24,
            automatically_rotate: true,
            rotation_strategy: strategy,
        }
    }

    // ── schedules ──────────────────────────────────────────────────

    #[tokio::test]
    async fn upsert_requires_existing_secret_and_known_callback() {
        let (_, secrets, engine) = engine().await;
        let err = engine.upsert(input("db/pw", RotationStrategy::Generate)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        secrets.put("db/pw", "hunter2").await.unwrap();
        let err = engine
            .upsert(input("db/pw", RotationStrategy::Callback { name: "nope".to_owned() }))
            .await
            .unwrap_err();
        assert!(matches!(err, RotationError::UnknownCallback { .. }));

        let schedule = engine.upsert(input("db/pw", RotationStrategy::Generate)).await.unwrap();
        assert!(schedule.is_active);
        assert!(schedule.next_rotation_at > Utc::now() + Duration::days(29));
    }

    #[tokio::test]
    async fn remove_deactivates_and_hides_from_overdue() {
        let (barrier, secrets, engine) = engine().await;
        secrets.put("db/pw", "hunter2").await.unwrap();
        let mut schedule = engine.upsert(input("db/pw", RotationStrategy::Generate)).await.unwrap();
        schedule.next_rotation_at = Utc::now() - Duration::hours(1);
        barrier.put_json("sys/rotation/schedules/db/pw", &schedule).await.unwrap();
        assert_eq!(engine.overdue().await.unwrap().len(), 1);

        engine.remove("db/pw").await.unwrap();
        assert!(engine.overdue().await.unwrap().is_empty());
        assert!(!engine.get("db/pw").await.unwrap().is_active);
    }

    // ── rotation ───────────────────────────────────────────────────

    #[tokio::test]
    async fn generate_bumps_version_and_records_history() {
        let (_, secrets, engine) = engine().await;
        secrets.put("db/pw", "hunter2").await.unwrap();
        engine.upsert(input("db/pw", RotationStrategy::Generate)).await.unwrap();

        let entry = engine.rotate_now("db/pw", RotationTrigger::Manual).await.unwrap();
        assert!(entry.success);
        assert_eq!(entry.old_version, Some(1));
        assert_eq!(entry.new_version, Some(2));

        let value = secrets.get("db/pw").await.unwrap().value;
        assert_ne!(value, "hunter2");
        assert_eq!(BASE64.decode(value).unwrap().len(), GENERATED_SECRET_LEN);

        let schedule = engine.get("db/pw").await.unwrap();
        assert!(schedule.last_rotated_at.is_some());
    }

    #[tokio::test]
    async fn callback_strategy_uses_registered_callback() {
        let (_, secrets, engine) = engine().await;
        secrets.put("api/key", "v").await.unwrap();
        engine
            .upsert(input("api/key", RotationStrategy::Callback { name: "suffix".to_owned() }))
            .await
            .unwrap();
        engine.rotate_now("api/key", RotationTrigger::Manual).await.unwrap();
        assert_eq!(secrets.get("api/key").await.unwrap().value, "v-next");
    }

    #[tokio::test]
    async fn failures_are_recorded_and_keep_the_secret() {
        let (_, secrets, engine) = engine().await;
        secrets.put("api/key", "v").await.unwrap();
        engine
            .upsert(input("api/key", RotationStrategy::Callback { name: "broken".to_owned() }))
            .await
            .unwrap();

        let entry = engine.rotate_now("api/key", RotationTrigger::Manual).await.unwrap();
        assert!(!entry.success);
        assert!(entry.error.unwrap().contains("upstream refused"));
        assert_eq!(secrets.get("api/key").await.unwrap().value, "v");
        assert!(engine.get("api/key").await.unwrap().last_rotated_at.is_none());
    }

    #[tokio::test]
    async fn run_due_rotates_only_automatic_overdue_schedules() {
        let (barrier, secrets, engine) = engine().await;
        for path in ["a", "b", "c"] {
            secrets.put(path, "v").await.unwrap();
            let mut s = engine.upsert(input(path, RotationStrategy::Generate)).await.unwrap();
            if path != "c" {
                s.next_rotation_at = Utc::now() - Duration::minutes(1);
            }
            s.automatically_rotate = path != "b";
            barrier.put_json(&schedule_key(path), &s).await.unwrap();
        }

        let summary = engine.run_due().await.unwrap();
        assert_eq!((summary.total, summary.succeeded, summary.failed), (1, 1, 0));
        assert_eq!(secrets.get("a").await.unwrap().version, 2);
        assert_eq!(secrets.get("b").await.unwrap().version, 1);
        assert!(engine.overdue().await.unwrap().iter().all(|s| s.secret_path == "b"));
    }

    #[tokio::test]
    async fn history_is_newest_first_and_excludes_children() {
        let (_, secrets, engine) = engine().await;
        secrets.put("db", "v").await.unwrap();
        secrets.put("db/child", "v").await.unwrap();
        engine.rotate_now("db", RotationTrigger::Manual).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        engine.rotate_now("db", RotationTrigger::Scheduled).await.unwrap();
        engine.rotate_now("db/child", RotationTrigger::Manual).await.unwrap();

        let history = engine.history("db").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].trigger, RotationTrigger::Scheduled);
        assert_eq!(history[0].new_version, Some(3));
    }

    // ── grace period ───────────────────────────────────────────────

    #[tokio::test]
    async fn replaced_value_readable_during_grace_period() {
        let (barrier, secrets, engine) = engine().await;
        secrets.put("db/pw", "hunter2").await.unwrap();
        engine.upsert(input("db/pw", RotationStrategy::Generate)).await.unwrap();

        engine.rotate_now("db/pw", RotationTrigger::Scheduled).await.unwrap();
        let previous = engine.previous("db/pw").await.unwrap().unwrap();
        assert_eq!(previous.value, "hunter2");
        assert_eq!(previous.version, 1);
        assert_ne!(secrets.get("db/pw").await.unwrap().value, "hunter2");

        // Once the window has passed the old value is gone for good.
        let mut stored: PreviousValue = barrier.get_json(&previous_key("db/pw")).await.unwrap().unwrap();
        stored.valid_until = Utc::now() - Duration::seconds(1);
        barrier.put_json(&previous_key("db/pw"), &stored).await.unwrap();
        assert!(engine.previous("db/pw").await.unwrap().is_none());
        assert!(!barrier.exists(&previous_key("db/pw")).await.unwrap());
    }

    #[tokio::test]
    async fn zero_grace_or_no_schedule_keeps_nothing() {
        let (_, secrets, engine) = engine().await;
        secrets.put("a", "v").await.unwrap();
        secrets.put("b", "v").await.unwrap();
        let mut no_grace = input("a", RotationStrategy::Generate);
        no_grace.grace_period_hours = 0;
        engine.upsert(no_grace).await.unwrap();

        engine.rotate_now("a", RotationTrigger::Manual).await.unwrap();
        engine.rotate_now("b", RotationTrigger::Manual).await.unwrap();
        assert!(engine.previous("a").await.unwrap().is_none());
        assert!(engine.previous("b").await.unwrap().is_none());
    }
}
