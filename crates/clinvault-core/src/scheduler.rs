//! Background job scheduler.
//!
//! A single task owns the [`Scheduler`] and ticks it on a fixed interval. Each
//! tick runs every due [`Job`] sequentially. A successful run is rescheduled
//! for `now + interval`; a failed run stays due and is retried on the next
//! tick, with log severity escalating after repeated failures.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::VaultError;

/// Consecutive failures after which a job's failures are logged at `error`.
const ESCALATE_AFTER: u32 = 5;

/// Outcome of one job run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobReport {
    /// The job had nothing to do because the vault is sealed or the feature
    /// is not configured.
    pub skipped: bool,
    /// Items handled (leases revoked, secrets rotated, rows rewritten).
    pub processed: usize,
    pub detail: String,
}

impl JobReport {
    #[must_use]
    pub fn skipped(detail: impl Into<String>) -> Self {
        Self {
            skipped: true,
            processed: 0,
            detail: detail.into(),
        }
    }

    #[must_use]
    pub fn processed(processed: usize, detail: impl Into<String>) -> Self {
        Self {
            skipped: false,
            processed,
            detail: detail.into(),
        }
    }
}

/// A unit of periodic background work.
#[async_trait::async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    /// Delay between successful runs.
    fn interval(&self) -> Duration;

    /// Run once.
    ///
    /// # Errors
    ///
    /// Any error leaves the job due so it is retried on the next tick.
    async fn run(&self) -> Result<JobReport, VaultError>;
}

struct Entry {
    job: Arc<dyn Job>,
    next_run_at: DateTime<Utc>,
    consecutive_failures: u32,
}

/// Result of running one job during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub name: String,
    pub succeeded: bool,
}

/// Ticks registered jobs until shutdown.
pub struct Scheduler {
    tick: Duration,
    entries: Vec<Entry>,
}

impl Scheduler {
    #[must_use]
    pub fn new(tick: Duration) -> Self {
        Self {
            tick,
            entries: Vec::new(),
        }
    }

    /// Register a job. It is due immediately.
    #[must_use]
    pub fn with_job(mut self, job: Arc<dyn Job>) -> Self {
        self.entries.push(Entry {
            job,
            next_run_at: DateTime::<Utc>::MIN_UTC,
            consecutive_failures: 0,
        });
        self
    }

    /// Names of registered jobs in registration order.
    #[must_use]
    pub fn job_names(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.job.name().to_owned()).collect()
    }

    /// When the named job will next run.
    #[must_use]
    pub fn next_run_at(&self, name: &str) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .find(|e| e.job.name() == name)
            .map(|e| e.next_run_at)
    }

    /// Run every job due at `now`, in registration order.
    pub async fn tick_once(&mut self, now: DateTime<Utc>) -> Vec<JobOutcome> {
        let mut outcomes = Vec::new();
        for entry in &mut self.entries {
            if entry.next_run_at > now {
                continue;
            }
            let name = entry.job.name().to_owned();
            match entry.job.run().await {
                Ok(report) => {
                    entry.consecutive_failures = 0;
                    entry.next_run_at = next_after(now, entry.job.interval());
                    if report.skipped {
                        debug!(job = %name, detail = %report.detail, "job skipped");
                    } else if report.processed > 0 {
                        info!(
                            job = %name,
                            processed = report.processed,
                            detail = %report.detail,
                            "job complete"
                        );
                    }
                    outcomes.push(JobOutcome {
                        name,
                        succeeded: true,
                    });
                }
                Err(e) => {
                    entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                    let consecutive_failures = entry.consecutive_failures;
                    if consecutive_failures >= ESCALATE_AFTER {
                        error!(
                            job = %name,
                            error = %e,
                            consecutive_failures,
                            "job persistently failing"
                        );
                    } else {
                        warn!(
                            job = %name,
                            error = %e,
                            consecutive_failures,
                            "job failed, will retry next tick"
                        );
                    }
                    outcomes.push(JobOutcome {
                        name,
                        succeeded: false,
                    });
                }
            }
        }
        outcomes
    }

    /// Tick until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            tick_secs = self.tick.as_secs(),
            jobs = ?self.job_names(),
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick_once(Utc::now()).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("scheduler shutting down");
                        return;
                    }
                }
            }
        }
    }
}

fn next_after(now: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let delta = TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX);
    now.checked_add_signed(delta)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tick", &self.tick)
            .field("jobs", &self.job_names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::error::BarrierError;

    struct CountingJob {
        name: &'static str,
        runs: AtomicUsize,
        fail: AtomicBool,
    }

    impl CountingJob {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                runs: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait::async_trait]
    impl Job for CountingJob {
        fn name(&self) -> &str {
            self.name
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(60)
        }

        async fn run(&self) -> Result<JobReport, VaultError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(BarrierError::Sealed.into());
            }
            Ok(JobReport::processed(1, "ok"))
        }
    }

    // ── scheduling ───────────────────────────────────────────────────

    #[tokio::test]
    async fn jobs_are_due_immediately_then_wait_for_interval() {
        let job = CountingJob::new("sweep");
        let mut scheduler = Scheduler::new(Duration::from_secs(1)).with_job(job.clone());
        let now = Utc::now();

        let first = scheduler.tick_once(now).await;
        assert_eq!(first.len(), 1);
        assert!(first[0].succeeded);
        assert_eq!(
            scheduler.next_run_at("sweep"),
            Some(now + TimeDelta::seconds(60))
        );

        assert!(scheduler.tick_once(now + TimeDelta::seconds(30)).await.is_empty());
        assert_eq!(scheduler.tick_once(now + TimeDelta::seconds(60)).await.len(), 1);
        assert_eq!(job.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_job_is_retried_next_tick() {
        let job = CountingJob::new("flaky");
        job.fail.store(true, Ordering::SeqCst);
        let mut scheduler = Scheduler::new(Duration::from_secs(1)).with_job(job.clone());
        let now = Utc::now();

        for i in 0..6 {
            let out = scheduler.tick_once(now + TimeDelta::seconds(i)).await;
            assert!(!out[0].succeeded);
        }
        assert_eq!(job.runs.load(Ordering::SeqCst), 6);

        job.fail.store(false, Ordering::SeqCst);
        let out = scheduler.tick_once(now + TimeDelta::seconds(10)).await;
        assert!(out[0].succeeded);
        assert!(scheduler.next_run_at("flaky").unwrap() > now + TimeDelta::seconds(10));
    }

    #[tokio::test]
    async fn run_exits_on_shutdown() {
        let job = CountingJob::new("once");
        let scheduler = Scheduler::new(Duration::from_millis(10)).with_job(job.clone());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scheduler.run(rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(job.runs.load(Ordering::SeqCst) >= 1);
    }
}
