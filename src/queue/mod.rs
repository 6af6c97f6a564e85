//! Durable job queue over the shared SQLite store.
//!
//! Jobs are keyed by build id, so enqueueing the same build twice never
//! produces two executions. A claim stamps a lease and a visibility
//! deadline; heartbeats push the deadline forward and a job whose deadline
//! passes is redelivered to the next claimer.

pub mod worker;

use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::QueueError;
use crate::orchestrator::events::{PROGRESS_ADMITTED, PROGRESS_COMPLETE};
use crate::store::{
    BuildStatus, BuildStatusView, DbHandle, EnqueueOutcome, Job, JobPayload, QueueStats,
};

pub use worker::WorkerPool;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub visibility_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Completed builds averaged for the duration statistic.
    pub duration_window: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            visibility_timeout_secs: 600,
            poll_interval_ms: 500,
            duration_window: 20,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    /// Heartbeat period: a third of the visibility timeout, at most a second.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.visibility_timeout() / 3)
            .min(Duration::from_secs(1))
            .max(Duration::from_millis(50))
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        backoff_delay(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
            attempt,
        )
    }
}

/// `min(base * 2^(attempt-1), max)` for attempt >= 1.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent).unwrap_or(max).min(max)
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Clone)]
pub struct JobQueue {
    db: DbHandle,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(db: DbHandle, config: QueueConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn enqueue(&self, payload: JobPayload) -> Result<EnqueueOutcome, QueueError> {
        let max_attempts = self.config.max_attempts.max(1);
        let build_id = payload.build_id.clone();
        let outcome = self
            .db
            .call(move |db| db.upsert_job(&payload, max_attempts, now_ms()))
            .await
            .map_err(QueueError::Store)?;
        info!(job_id = %build_id, ?outcome, "Job enqueued");
        Ok(outcome)
    }

    pub async fn claim(&self, lease: &str) -> Result<Option<Job>, QueueError> {
        let lease = lease.to_string();
        let visibility_ms = self.config.visibility_timeout().as_millis() as i64;
        let job = self
            .db
            .call(move |db| db.claim_next_job(now_ms(), visibility_ms, &lease))
            .await
            .map_err(QueueError::Store)?;
        if let Some(job) = &job {
            debug!(
                job_id = %job.job_id,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                "Job claimed"
            );
        }
        Ok(job)
    }

    /// Extend the lease and record progress.
    pub async fn heartbeat(&self, job_id: &str, lease: &str, progress: Option<u8>) -> Result<(), QueueError> {
        let (id, lease) = (job_id.to_string(), lease.to_string());
        let locked_until = now_ms() + self.config.visibility_timeout().as_millis() as i64;
        let held = self
            .db
            .call(move |db| db.heartbeat_job(&id, &lease, progress, locked_until))
            .await
            .map_err(QueueError::Store)?;
        if held {
            Ok(())
        } else {
            Err(QueueError::LeaseLost {
                job_id: job_id.to_string(),
            })
        }
    }

    pub async fn complete(&self, job_id: &str, lease: &str) -> Result<(), QueueError> {
        let (id, lease) = (job_id.to_string(), lease.to_string());
        let held = self
            .db
            .call(move |db| db.complete_job(&id, &lease))
            .await
            .map_err(QueueError::Store)?;
        lease_held(held, job_id)
    }

    /// Put the job back with exponential backoff. Returns the delay used.
    ///
    /// A `handback` (worker shutdown) is redelivered at once and gives back
    /// the attempt it used, so shutdowns never push a job past its cap.
    pub async fn retry(&self, job: &Job, lease: &str, error: &str, handback: bool) -> Result<Duration, QueueError> {
        let delay = if handback {
            Duration::ZERO
        } else {
            self.config.backoff(job.attempts)
        };
        let available_at = now_ms() + delay.as_millis() as i64;
        let (id, lease, error_owned) = (job.job_id.clone(), lease.to_string(), error.to_string());
        let held = self
            .db
            .call(move |db| db.retry_job(&id, &lease, available_at, &error_owned, handback))
            .await
            .map_err(QueueError::Store)?;
        lease_held(held, &job.job_id)?;
        warn!(
            job_id = %job.job_id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            delay_ms = delay.as_millis() as u64,
            %error,
            "Job scheduled for retry"
        );
        Ok(delay)
    }

    pub async fn fail(&self, job_id: &str, lease: &str, error: &str) -> Result<(), QueueError> {
        let (id, lease, error) = (job_id.to_string(), lease.to_string(), error.to_string());
        let held = self
            .db
            .call(move |db| db.fail_job(&id, &lease, &error))
            .await
            .map_err(QueueError::Store)?;
        lease_held(held, job_id)
    }

    pub async fn job(&self, job_id: &str) -> Result<Job, QueueError> {
        let id = job_id.to_string();
        self.db
            .call(move |db| db.get_job(&id))
            .await
            .map_err(QueueError::Store)?
            .ok_or_else(|| QueueError::JobNotFound {
                job_id: job_id.to_string(),
            })
    }

    /// Status of a build, inline or queued. `None` if it does not exist.
    pub async fn build_status(&self, build_id: &str) -> anyhow::Result<Option<BuildStatusView>> {
        let id = build_id.to_string();
        self.db
            .call(move |db| {
                let Some(build) = db.get_build(&id)? else {
                    return Ok(None);
                };
                let job = db.get_job(&id)?;
                let files_count = db.count_files_for_build(&id)?;
                let progress = match (&build.status, &job) {
                    (status, _) if status.is_terminal() => PROGRESS_COMPLETE,
                    (_, Some(job)) => job.progress,
                    (BuildStatus::Running, None) => PROGRESS_ADMITTED,
                    _ => 0,
                };
                Ok(Some(BuildStatusView {
                    status: build.status,
                    phase: build.phase,
                    progress,
                    files_count,
                    error: build.error,
                    started_at: build.started_at,
                    completed_at: build.completed_at,
                }))
            })
            .await
    }

    pub async fn stats(&self, user_id: &str) -> Result<QueueStats, QueueError> {
        let user_id = user_id.to_string();
        let window = self.config.duration_window.max(1);
        self.db
            .call(move |db| {
                let counts = db.job_counts()?;
                let user_active_builds = db.active_build_count(&user_id)?;
                let durations = db.recent_build_durations(window)?;
                let avg_duration_ms = (!durations.is_empty())
                    .then(|| durations.iter().sum::<i64>() as f64 / durations.len() as f64);
                Ok(QueueStats {
                    waiting: counts.waiting,
                    active: counts.active,
                    completed: counts.completed,
                    failed: counts.failed,
                    user_active_builds,
                    avg_duration_ms,
                    sample_size: durations.len(),
                })
            })
            .await
            .map_err(QueueError::Store)
    }
}

fn lease_held(held: bool, job_id: &str) -> Result<(), QueueError> {
    if held {
        Ok(())
    } else {
        Err(QueueError::LeaseLost {
            job_id: job_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BuildDb, JobState, NewBuild, ProviderKind};

    fn payload(build_id: &str) -> JobPayload {
        JobPayload {
            build_id: build_id.into(),
            project_id: "p1".into(),
            user_id: "u1".into(),
            prompt: "Create a button component".into(),
            model: "m".into(),
            credential_id: 1,
            provider: ProviderKind::Anthropic,
            context: vec![],
            strict_mode: false,
            max_fix_iterations: 3,
        }
    }

    fn queue(config: QueueConfig) -> JobQueue {
        JobQueue::new(DbHandle::new(BuildDb::new_in_memory().unwrap()), config)
    }

    #[test]
    fn test_backoff_curve() {
        let base = Duration::from_secs(1);
        let max = Duration::from_secs(10);
        assert_eq!(backoff_delay(base, max, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, max, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, max, 5), Duration::from_secs(10));
        assert_eq!(backoff_delay(base, max, 200), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_enqueue_same_build_is_idempotent() {
        let q = queue(QueueConfig::default());
        assert_eq!(q.enqueue(payload("b1")).await.unwrap(), EnqueueOutcome::Created);
        assert_eq!(q.enqueue(payload("b1")).await.unwrap(), EnqueueOutcome::Updated);
        let job = q.claim("l1").await.unwrap().unwrap();
        assert_eq!(job.job_id, "b1");
        assert_eq!(q.enqueue(payload("b1")).await.unwrap(), EnqueueOutcome::AlreadyActive);
        assert!(q.claim("l2").await.unwrap().is_none());
        assert_eq!(q.stats("u1").await.unwrap().active, 1);
    }

    #[tokio::test]
    async fn test_retry_respects_backoff() {
        let q = queue(QueueConfig {
            backoff_base_ms: 60_000,
            ..Default::default()
        });
        q.enqueue(payload("b1")).await.unwrap();
        let job = q.claim("l1").await.unwrap().unwrap();
        let delay = q.retry(&job, "l1", "timeout", false).await.unwrap();
        assert_eq!(delay, Duration::from_secs(60));
        assert!(q.claim("l2").await.unwrap().is_none());

        let job = q.job("b1").await.unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_handback_does_not_use_up_an_attempt() {
        let q = queue(QueueConfig {
            max_attempts: 1,
            ..Default::default()
        });
        q.enqueue(payload("b1")).await.unwrap();
        let job = q.claim("l1").await.unwrap().unwrap();
        let delay = q.retry(&job, "l1", "worker shutting down", true).await.unwrap();
        assert_eq!(delay, Duration::ZERO);
        assert_eq!(q.job("b1").await.unwrap().attempts, 0);

        let job = q.claim("l2").await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        assert!(job.attempts <= job.max_attempts);
    }

    #[tokio::test]
    async fn test_expired_lease_is_redelivered() {
        let q = queue(QueueConfig {
            visibility_timeout_secs: 1,
            ..Default::default()
        });
        q.enqueue(payload("b1")).await.unwrap();
        q.claim("dead-worker").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let job = q.claim("l2").await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        // The first worker can no longer report.
        assert!(matches!(
            q.heartbeat("b1", "dead-worker", Some(50)).await,
            Err(QueueError::LeaseLost { .. })
        ));
        q.heartbeat("b1", "l2", Some(50)).await.unwrap();
        q.complete("b1", "l2").await.unwrap();
        assert_eq!(q.job("b1").await.unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn test_build_status_uses_job_progress() {
        let q = queue(QueueConfig::default());
        let new = NewBuild {
            id: "b1".into(),
            project_id: "p1".into(),
            user_id: "u1".into(),
            prompt: "x".into(),
            model: "m".into(),
        };
        q.db.call(move |db| db.admit_build(&new, None, true)).await.unwrap();
        q.enqueue(payload("b1")).await.unwrap();
        q.claim("l1").await.unwrap().unwrap();
        q.heartbeat("b1", "l1", Some(42)).await.unwrap();

        let view = q.build_status("b1").await.unwrap().unwrap();
        assert_eq!(view.status, BuildStatus::Queued);
        assert_eq!(view.progress, 42);
        assert_eq!(view.files_count, 0);
        assert!(q.build_status("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_job_is_reported() {
        let q = queue(QueueConfig::default());
        assert!(matches!(
            q.job("nope").await,
            Err(QueueError::JobNotFound { .. })
        ));
    }
}
