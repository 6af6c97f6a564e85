//! Fixed-size pool of queue workers.
//!
//! Each worker claims one job at a time, takes the build lease over from
//! any previous (crashed) worker and runs the same pipeline as the inline
//! path, with a [`ProgressSink`] instead of a streaming sink. A heartbeat
//! task flushes progress and keeps the job lease alive; if the lease is
//! lost the run is cancelled.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::JobQueue;
use crate::errors::QueueError;
use crate::orchestrator::runner::KIND_CREDENTIAL_EXHAUSTED;
use crate::orchestrator::{BuildContext, ExecutionMode, Orchestrator, ProgressSink, RunOutcome};
use crate::store::{BuildStatus, JOB_LEASE_PREFIX, Job};

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Start `size` workers. They stop when `shutdown` is cancelled.
    pub fn spawn(
        queue: Arc<JobQueue>,
        orchestrator: Arc<Orchestrator>,
        size: usize,
        shutdown: CancellationToken,
    ) -> Self {
        let size = size.max(1);
        info!(workers = size, "Starting worker pool");
        let handles = (0..size)
            .map(|id| {
                let worker = Worker {
                    id,
                    queue: queue.clone(),
                    orchestrator: orchestrator.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();
        Self { handles, shutdown }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Cancel in-flight builds (they go back to the queue) and wait for
    /// every worker to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

struct Worker {
    id: usize,
    queue: Arc<JobQueue>,
    orchestrator: Arc<Orchestrator>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        let poll = self.queue.config().poll_interval();
        debug!(worker = self.id, "Worker started");
        while !self.shutdown.is_cancelled() {
            let lease = format!("{}{}", JOB_LEASE_PREFIX, Uuid::new_v4());
            match self.queue.claim(&lease).await {
                Ok(Some(job)) => self.process(job, lease).await,
                Ok(None) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
                Err(e) => {
                    error!(worker = self.id, error = %e, "Failed to claim job");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(poll) => {}
                    }
                }
            }
        }
        debug!(worker = self.id, "Worker stopped");
    }

    async fn process(&self, job: Job, lease: String) {
        let payload = job.payload.clone();
        let build_id = payload.build_id.clone();
        info!(
            worker = self.id,
            job_id = %job.job_id,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "Processing job"
        );

        let acquired = {
            let (id, lease) = (build_id.clone(), lease.clone());
            self.orchestrator
                .db()
                .call(move |db| db.acquire_build_lease(&id, &lease, true))
                .await
        };
        match acquired {
            Ok(true) => {}
            Ok(false) => {
                // Already terminal, or owned by an inline run that will write
                // the terminal state itself.
                info!(job_id = %job.job_id, "Build finished or owned elsewhere, acknowledging job");
                self.settle(self.queue.complete(&job.job_id, &lease).await);
                return;
            }
            Err(e) => {
                let message = format!("Failed to take build lease: {:#}", e);
                self.settle(self.queue.retry(&job, &lease, &message, false).await.map(|_| ()));
                return;
            }
        }

        let key = match self
            .orchestrator
            .keys()
            .resolve(payload.credential_id, payload.provider)
            .await
        {
            Ok(Some(key)) => key,
            Ok(None) => {
                self.no_credential(&job, &lease, format!("No usable credential for provider {}", payload.provider))
                    .await;
                return;
            }
            Err(e) => {
                self.no_credential(&job, &lease, format!("Key pool unavailable: {:#}", e))
                    .await;
                return;
            }
        };

        let (progress_tx, progress_rx) = watch::channel(0u8);
        let sink = ProgressSink::new(&build_id, progress_tx);
        let cancel = self.shutdown.child_token();
        let heartbeat_stop = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.queue.clone(),
            job.job_id.clone(),
            lease.clone(),
            progress_rx,
            cancel.clone(),
            heartbeat_stop.clone(),
        ));

        let ctx = BuildContext {
            build_id: build_id.clone(),
            project_id: payload.project_id,
            user_id: payload.user_id,
            prompt: payload.prompt,
            model: payload.model,
            context: payload.context,
            strict_mode: payload.strict_mode,
            max_fix_iterations: payload.max_fix_iterations,
            lease: lease.clone(),
            key,
            mode: ExecutionMode::Background {
                attempt: job.attempts,
                max_attempts: job.max_attempts,
            },
            cancel,
        };
        let outcome = self.orchestrator.run(&ctx, &sink).await;
        heartbeat_stop.cancel();
        if let Err(e) = heartbeat.await {
            error!(job_id = %job.job_id, error = %e, "Heartbeat task panicked");
        }

        match outcome {
            RunOutcome::Finished(BuildStatus::Failed) => {
                let message = self.build_error(&build_id).await;
                self.settle(self.queue.fail(&job.job_id, &lease, &message).await);
            }
            RunOutcome::Finished(_) => {
                self.settle(self.queue.complete(&job.job_id, &lease).await);
            }
            RunOutcome::Retry { error } => {
                let handback = self.shutdown.is_cancelled();
                self.settle(self.queue.retry(&job, &lease, &error, handback).await.map(|_| ()));
            }
            RunOutcome::LeaseLost => {
                warn!(job_id = %job.job_id, "Job taken over by another worker");
            }
        }
    }

    /// Lease held but no credential: retry later, or fail on the last attempt.
    async fn no_credential(&self, job: &Job, lease: &str, message: String) {
        warn!(job_id = %job.job_id, %message, "No credential for queued build");
        if job.attempts < job.max_attempts {
            let (id, lease_owned) = (job.job_id.clone(), lease.to_string());
            if let Err(e) = self
                .orchestrator
                .db()
                .call(move |db| db.release_build_lease(&id, &lease_owned))
                .await
            {
                error!(job_id = %job.job_id, error = %e, "Failed to release build lease");
            }
            self.settle(self.queue.retry(job, lease, &message, false).await.map(|_| ()));
            return;
        }
        if let Err(e) = self
            .orchestrator
            .fail_unstarted(
                &job.job_id,
                &job.payload.user_id,
                lease,
                KIND_CREDENTIAL_EXHAUSTED,
                &message,
            )
            .await
        {
            error!(job_id = %job.job_id, error = %e, "Failed to record build failure");
        }
        self.settle(self.queue.fail(&job.job_id, lease, &message).await);
    }

    async fn build_error(&self, build_id: &str) -> String {
        let id = build_id.to_string();
        match self.orchestrator.db().call(move |db| db.get_build(&id)).await {
            Ok(Some(build)) => build.error.unwrap_or_else(|| "Build failed".to_string()),
            _ => "Build failed".to_string(),
        }
    }

    fn settle(&self, result: Result<(), QueueError>) {
        match result {
            Ok(()) => {}
            Err(e @ QueueError::LeaseLost { .. }) => {
                warn!(worker = self.id, error = %e, "Job lease lost before acknowledgement");
            }
            Err(e) => error!(worker = self.id, error = %e, "Failed to update job"),
        }
    }
}

/// Flush progress and extend the job lease until `stop`. Losing the lease
/// cancels the run.
async fn heartbeat_loop(
    queue: Arc<JobQueue>,
    job_id: String,
    lease: String,
    progress: watch::Receiver<u8>,
    run_cancel: CancellationToken,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(queue.config().heartbeat_interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let current = *progress.borrow();
        match queue.heartbeat(&job_id, &lease, Some(current)).await {
            Ok(()) => {}
            Err(QueueError::LeaseLost { .. }) => {
                warn!(%job_id, "Job lease lost, cancelling build");
                run_cancel.cancel();
                break;
            }
            Err(e) => warn!(%job_id, error = %e, "Heartbeat failed"),
        }
    }
}
