//! Drives a build through its phases.
//!
//! The same loop serves inline requests and queue workers. Each iteration
//! asks [`Orchestrator::step`] for the next state, checks the edge against
//! [`Phase::can_transition_to`], persists the phase under the build lease
//! and emits a `phase` event. Terminal states get exactly one lease-guarded
//! write in [`Orchestrator::finish`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::{
    BuildEvent, EventSink, PROGRESS_ADMITTED, PROGRESS_COMPLETE, PROGRESS_PERSISTED,
    ValidationStage, generation_progress,
};
use super::state::{
    BuildFailure, BuildReport, BuildState, Phase, after_validation, completed_status,
};
use crate::audit::{AuditEntry, AuditSink};
use crate::autofix::{AutoFixEngine, AutoFixOptions};
use crate::errors::ProviderError;
use crate::generation::{GenerationEngine, GenerationRequest};
use crate::keypool::KeyPool;
use crate::store::{
    BuildStatus, DbHandle, GENERATED_FILE_TYPE, GeneratedFile, ProviderKey,
};
use crate::validation::{ValidationOptions, Validator};

pub const KIND_CANCELLED: &str = "cancelled";
pub const KIND_PERSISTENCE: &str = "persistence_error";
pub const KIND_CREDENTIAL_EXHAUSTED: &str = "credential_exhausted";

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Wall-clock budget per provider call on the inline path.
    pub inline_timeout: Duration,
    /// Same for queue workers.
    pub worker_timeout: Duration,
    pub stagnation_limit: u32,
    pub explain_fixes: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            inline_timeout: Duration::from_secs(120),
            worker_timeout: Duration::from_secs(300),
            stagnation_limit: 2,
            explain_fixes: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Inline,
    Background { attempt: u32, max_attempts: u32 },
}

/// Everything one run of one build needs. The lease must already be held.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub build_id: String,
    pub project_id: String,
    pub user_id: String,
    pub prompt: String,
    pub model: String,
    pub context: Vec<GeneratedFile>,
    pub strict_mode: bool,
    pub max_fix_iterations: u32,
    pub lease: String,
    pub key: ProviderKey,
    pub mode: ExecutionMode,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The terminal write happened.
    Finished(BuildStatus),
    /// Lease released; the queue should redeliver.
    Retry { error: String },
    /// Another owner holds the build now. Nothing was written.
    LeaseLost,
}

pub struct Orchestrator {
    db: DbHandle,
    generation: GenerationEngine,
    autofix: AutoFixEngine,
    validator: Validator,
    keys: Arc<KeyPool>,
    audit: AuditSink,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        db: DbHandle,
        generation: GenerationEngine,
        keys: Arc<KeyPool>,
        audit: AuditSink,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            db,
            autofix: AutoFixEngine::new(generation.clone()),
            generation,
            validator: Validator,
            keys,
            audit,
            settings,
        }
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn keys(&self) -> &Arc<KeyPool> {
        &self.keys
    }

    pub fn audit(&self) -> &AuditSink {
        &self.audit
    }

    fn budget(&self, mode: ExecutionMode) -> Duration {
        match mode {
            ExecutionMode::Inline => self.settings.inline_timeout,
            ExecutionMode::Background { .. } => self.settings.worker_timeout,
        }
    }

    /// Run a build to a terminal state (or hand it back to the queue).
    pub async fn run(&self, ctx: &BuildContext, sink: &dyn EventSink) -> RunOutcome {
        info!(build_id = %ctx.build_id, mode = ?ctx.mode, model = %ctx.model, "Build started");
        sink.progress(PROGRESS_ADMITTED);

        let mut state = BuildState::Queued;
        while !state.phase().is_terminal() {
            let from = state.phase();
            let mut next = if ctx.cancel.is_cancelled() {
                BuildState::failed(from, KIND_CANCELLED, "Build cancelled", false)
            } else {
                self.step(state, ctx, sink).await
            };

            let to = next.phase();
            if !from.can_transition_to(to) {
                error!(build_id = %ctx.build_id, %from, %to, "Illegal phase transition");
                next = BuildState::failed(
                    from,
                    "internal_error",
                    format!("Illegal phase transition {} -> {}", from, to),
                    false,
                );
            }

            if let BuildState::Complete(report) = &next {
                match self.persist_files(ctx, &report.files).await {
                    Ok(_) => sink.progress(PROGRESS_PERSISTED),
                    Err(e) => {
                        error!(build_id = %ctx.build_id, error = %e, "Failed to persist files");
                        next = BuildState::failed(
                            from,
                            KIND_PERSISTENCE,
                            format!("Failed to persist generated files: {}", e),
                            true,
                        );
                    }
                }
            }

            let to = next.phase();
            if !to.is_terminal() {
                let lease = ctx.lease.clone();
                let id = ctx.build_id.clone();
                match self
                    .db
                    .call(move |db| db.update_build_phase(&id, &lease, to.as_str()))
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(build_id = %ctx.build_id, phase = %to, "Build lease lost");
                        return RunOutcome::LeaseLost;
                    }
                    Err(e) => {
                        error!(build_id = %ctx.build_id, error = %e, "Failed to record phase");
                        next = BuildState::failed(
                            from,
                            KIND_PERSISTENCE,
                            format!("Failed to record phase {}: {}", to, e),
                            true,
                        );
                    }
                }
            }

            let to = next.phase();
            if !to.is_terminal() {
                debug!(build_id = %ctx.build_id, %from, %to, "Phase transition");
                sink.emit(BuildEvent::Phase {
                    build_id: ctx.build_id.clone(),
                    phase: to,
                    files_count: next.files_count(),
                });
            }
            state = next;
        }

        self.finish(ctx, state, sink).await
    }

    /// One transition. Never returns the same phase it was given.
    async fn step(&self, state: BuildState, ctx: &BuildContext, sink: &dyn EventSink) -> BuildState {
        match state {
            BuildState::Queued => BuildState::Generating,
            BuildState::Generating => self.generate(ctx, sink).await,
            BuildState::Generated { files, warnings } => BuildState::Validating { files, warnings },
            BuildState::Validating { files, warnings } => {
                let result = self.validator.validate(
                    &files,
                    &ValidationOptions {
                        auto_fix: true,
                        strict_mode: ctx.strict_mode,
                        ..Default::default()
                    },
                );
                sink.emit(BuildEvent::validation(ValidationStage::Initial, &result));
                let errors_fixed = result.stats.errors_fixed;
                let files = result.fixed_files.unwrap_or(files);
                match after_validation(result.errors.len(), ctx.max_fix_iterations) {
                    Phase::AiFixing => BuildState::AiFixing {
                        files,
                        errors: result.errors,
                        errors_fixed,
                        warnings,
                    },
                    _ => BuildState::FinalValidation {
                        files,
                        fix: None,
                        errors_fixed,
                        warnings,
                    },
                }
            }
            BuildState::AiFixing {
                files,
                errors,
                errors_fixed,
                warnings,
            } => {
                let options = AutoFixOptions {
                    model: ctx.model.clone(),
                    max_iterations: ctx.max_fix_iterations,
                    explain_fixes: self.settings.explain_fixes,
                    stagnation_limit: self.settings.stagnation_limit,
                    strict_mode: ctx.strict_mode,
                    budget: self.budget(ctx.mode),
                };
                let attempt = self
                    .autofix
                    .run(&files, &errors, &ctx.key, &options, &ctx.cancel)
                    .await;
                match &attempt.provider_error {
                    Some(e) => self.keys.record_outcome(&ctx.key, Err(e)).await,
                    None if attempt.iteration > 0 => self.keys.record_outcome(&ctx.key, Ok(())).await,
                    None => {}
                }
                sink.emit(BuildEvent::AiFixResult(attempt.clone()));
                let fixed_by_ai = attempt.initial_errors - attempt.remaining_errors;
                BuildState::FinalValidation {
                    files: attempt.files.clone(),
                    fix: Some(attempt),
                    errors_fixed: errors_fixed + fixed_by_ai,
                    warnings,
                }
            }
            BuildState::FinalValidation {
                files,
                fix,
                errors_fixed,
                warnings,
            } => {
                let validation = self.validator.validate(
                    &files,
                    &ValidationOptions {
                        auto_fix: false,
                        strict_mode: ctx.strict_mode,
                        ..Default::default()
                    },
                );
                sink.emit(BuildEvent::validation(ValidationStage::Final, &validation));
                let mut summary = validation.summary();
                summary.errors_fixed = errors_fixed;
                summary.fix_iterations = fix.as_ref().map(|f| f.iteration);
                let status = completed_status(validation.errors.len());
                BuildState::Complete(Box::new(BuildReport {
                    files,
                    validation,
                    fix,
                    summary,
                    status,
                    warnings,
                }))
            }
            // Terminal states never reach here; the loop stops first.
            terminal @ (BuildState::Complete(_) | BuildState::Failed(_)) => terminal,
        }
    }

    async fn generate(&self, ctx: &BuildContext, sink: &dyn EventSink) -> BuildState {
        let request = GenerationRequest {
            prompt: ctx.prompt.clone(),
            model: ctx.model.clone(),
            context: ctx.context.clone(),
        };
        let chunks = AtomicUsize::new(0);
        let forward_chunks = sink.wants_chunks();
        let on_chunk = |delta: &str| {
            let n = chunks.fetch_add(1, Ordering::Relaxed) + 1;
            if forward_chunks {
                sink.emit(BuildEvent::Chunk {
                    content: delta.to_string(),
                });
            }
            sink.progress(generation_progress(n));
        };

        let result = self
            .generation
            .generate(&request, &ctx.key, self.budget(ctx.mode), &ctx.cancel, &on_chunk)
            .await;
        match result {
            Ok(output) => {
                self.keys.record_outcome(&ctx.key, Ok(())).await;
                BuildState::Generated {
                    files: output.files,
                    warnings: output.warnings,
                }
            }
            Err(e) => {
                self.keys.record_outcome(&ctx.key, Err(&e)).await;
                provider_failure(Phase::Generating, &e)
            }
        }
    }

    /// Superseding write of the build's files, scoped to its project.
    async fn persist_files(&self, ctx: &BuildContext, files: &[GeneratedFile]) -> anyhow::Result<usize> {
        if files.is_empty() {
            debug!(build_id = %ctx.build_id, "No files to persist");
            return Ok(0);
        }
        let project_id = ctx.project_id.clone();
        let build_id = ctx.build_id.clone();
        let files = files.to_vec();
        let written = self
            .db
            .call(move |db| {
                db.replace_project_files(&project_id, &build_id, GENERATED_FILE_TYPE, &files)
            })
            .await?;
        info!(build_id = %ctx.build_id, files = written, "Persisted generated files");
        Ok(written)
    }

    async fn finish(&self, ctx: &BuildContext, state: BuildState, sink: &dyn EventSink) -> RunOutcome {
        match state {
            BuildState::Complete(report) => {
                let report = *report;
                let lease = ctx.lease.clone();
                let id = ctx.build_id.clone();
                let status = report.status;
                let summary = report.summary.clone();
                let written = self
                    .db
                    .call(move |db| db.finish_build(&id, &lease, status, None, Some(&summary)))
                    .await;
                match written {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(build_id = %ctx.build_id, "Build lease lost before completion");
                        return RunOutcome::LeaseLost;
                    }
                    Err(e) => {
                        let failure = BuildFailure {
                            phase: Phase::FinalValidation,
                            kind: KIND_PERSISTENCE.into(),
                            message: format!("Failed to record build completion: {}", e),
                            retryable: true,
                        };
                        return self.finish_failed(ctx, failure, sink).await;
                    }
                }

                info!(
                    build_id = %ctx.build_id,
                    status = %status.as_str(),
                    files = report.files.len(),
                    errors = report.summary.errors,
                    "Build complete"
                );
                self.audit.record(AuditEntry::new(
                    "build_completed",
                    &ctx.build_id,
                    &ctx.user_id,
                    json!({
                        "status": status.as_str(),
                        "files": report.files.len(),
                        "validation": report.summary,
                    }),
                ));
                sink.emit(BuildEvent::Complete {
                    build_id: ctx.build_id.clone(),
                    status,
                    is_clean: report.summary.is_clean,
                    files_count: report.files.len(),
                    files: report.files,
                    validation_summary: report.summary,
                    warnings: report.warnings,
                });
                sink.progress(PROGRESS_COMPLETE);
                RunOutcome::Finished(status)
            }
            BuildState::Failed(failure) => self.finish_failed(ctx, failure, sink).await,
            other => {
                // The run loop only exits on a terminal phase.
                let failure = BuildFailure {
                    phase: other.phase(),
                    kind: "internal_error".into(),
                    message: format!("Build stopped in non-terminal phase {}", other.phase()),
                    retryable: false,
                };
                self.finish_failed(ctx, failure, sink).await
            }
        }
    }

    async fn finish_failed(
        &self,
        ctx: &BuildContext,
        failure: BuildFailure,
        sink: &dyn EventSink,
    ) -> RunOutcome {
        if should_requeue(ctx.mode, &failure) {
            let lease = ctx.lease.clone();
            let id = ctx.build_id.clone();
            return match self
                .db
                .call(move |db| db.release_build_lease(&id, &lease))
                .await
            {
                Ok(true) => {
                    warn!(
                        build_id = %ctx.build_id,
                        phase = %failure.phase,
                        kind = %failure.kind,
                        error = %failure.message,
                        "Build attempt failed, handing back to queue"
                    );
                    self.audit.record(AuditEntry::new(
                        "build_requeued",
                        &ctx.build_id,
                        &ctx.user_id,
                        json!({ "phase": failure.phase, "kind": failure.kind, "error": failure.message }),
                    ));
                    RunOutcome::Retry {
                        error: failure.message,
                    }
                }
                Ok(false) => RunOutcome::LeaseLost,
                Err(e) => {
                    error!(build_id = %ctx.build_id, error = %e, "Failed to release build lease");
                    RunOutcome::Retry {
                        error: failure.message,
                    }
                }
            };
        }

        let lease = ctx.lease.clone();
        let id = ctx.build_id.clone();
        let message = failure.message.clone();
        let written = self
            .db
            .call(move |db| db.finish_build(&id, &lease, BuildStatus::Failed, Some(&message), None))
            .await;
        match written {
            Ok(true) => {}
            Ok(false) => {
                warn!(build_id = %ctx.build_id, "Build lease lost before failure write");
                return RunOutcome::LeaseLost;
            }
            Err(e) => {
                error!(build_id = %ctx.build_id, error = %e, "Failed to record build failure");
                if matches!(ctx.mode, ExecutionMode::Background { .. }) {
                    return RunOutcome::Retry {
                        error: failure.message,
                    };
                }
            }
        }

        error!(
            build_id = %ctx.build_id,
            phase = %failure.phase,
            kind = %failure.kind,
            error = %failure.message,
            "Build failed"
        );
        self.audit.record(AuditEntry::new(
            "build_failed",
            &ctx.build_id,
            &ctx.user_id,
            json!({ "phase": failure.phase, "kind": failure.kind, "error": failure.message }),
        ));
        sink.emit(BuildEvent::Error {
            build_id: ctx.build_id.clone(),
            kind: failure.kind,
            message: failure.message,
            phase: failure.phase,
        });
        sink.progress(PROGRESS_COMPLETE);
        RunOutcome::Finished(BuildStatus::Failed)
    }

    /// Terminal failure for a build whose run never started, e.g. a worker
    /// that holds the lease but finds no usable credential on the last attempt.
    pub async fn fail_unstarted(
        &self,
        build_id: &str,
        user_id: &str,
        lease: &str,
        kind: &str,
        message: &str,
    ) -> anyhow::Result<bool> {
        let (id, lease_owned, msg) = (build_id.to_string(), lease.to_string(), message.to_string());
        let written = self
            .db
            .call(move |db| db.finish_build(&id, &lease_owned, BuildStatus::Failed, Some(&msg), None))
            .await?;
        if written {
            self.audit.record(AuditEntry::new(
                "build_failed",
                build_id,
                user_id,
                json!({ "phase": Phase::Queued, "kind": kind, "error": message }),
            ));
        }
        Ok(written)
    }
}

fn provider_failure(phase: Phase, e: &ProviderError) -> BuildState {
    let message = match e.status() {
        Some(status) => format!("{} (status {})", e, status),
        None => e.to_string(),
    };
    BuildState::failed(phase, e.kind(), message, e.is_retryable())
}

/// Background attempts hand retryable failures back to the queue until the
/// last attempt. Cancellation in a worker means shutdown, so it always goes
/// back. Inline builds never retry.
fn should_requeue(mode: ExecutionMode, failure: &BuildFailure) -> bool {
    match mode {
        ExecutionMode::Inline => false,
        ExecutionMode::Background {
            attempt,
            max_attempts,
        } => failure.kind == KIND_CANCELLED || (failure.retryable && attempt < max_attempts),
    }
}
