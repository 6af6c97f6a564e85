//! Admission: request validation, capacity, credential selection and the
//! atomic build-record write. Nothing here calls the provider.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{AuditEntry, AuditSink};
use crate::capacity::{CapacityDecision, CapacityGuard, CapacitySnapshot, DenyReason};
use crate::errors::AdmissionError;
use crate::keypool::KeyPool;
use crate::store::{AdmitOutcome, Build, DbHandle, GeneratedFile, JobPayload, NewBuild, ProviderKey, ProviderKind};

pub const MAX_PROMPT_CHARS: usize = 32_000;
pub const MAX_FIX_ITERATIONS_CAP: u32 = 10;
const MAX_ID_LEN: usize = 64;

/// Body of an admit-build request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub prompt: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub build_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub strict_mode: Option<bool>,
    #[serde(default)]
    pub max_fix_iterations: Option<u32>,
    #[serde(default)]
    pub context: Vec<GeneratedFile>,
    #[serde(default)]
    pub provider: Option<ProviderKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitMode {
    /// The caller runs the build now and streams it.
    Inline,
    /// The build goes to the job queue. Re-admitting a pending build is
    /// allowed so the enqueue can be repeated idempotently.
    Queued,
}

/// Defaults applied to fields the request leaves out.
#[derive(Debug, Clone)]
pub struct AdmissionDefaults {
    pub model: String,
    pub provider: ProviderKind,
    pub max_fix_iterations: u32,
    pub strict_mode: bool,
}

/// An admitted build, ready to run inline or to enqueue.
#[derive(Debug, Clone)]
pub struct Admission {
    pub build: Build,
    pub key: ProviderKey,
    /// `None` when an already pending build was re-admitted.
    pub capacity: Option<CapacitySnapshot>,
    pub strict_mode: bool,
    pub max_fix_iterations: u32,
    pub context: Vec<GeneratedFile>,
    pub provider: ProviderKind,
    /// False for a re-admitted pending build; no usage was counted.
    pub fresh: bool,
}

impl Admission {
    pub fn job_payload(&self) -> JobPayload {
        JobPayload {
            build_id: self.build.id.clone(),
            project_id: self.build.project_id.clone(),
            user_id: self.build.user_id.clone(),
            prompt: self.build.prompt.clone(),
            model: self.build.model.clone(),
            credential_id: self.key.id,
            provider: self.provider,
            context: self.context.clone(),
            strict_mode: self.strict_mode,
            max_fix_iterations: self.max_fix_iterations,
        }
    }
}

pub struct AdmissionController {
    db: DbHandle,
    capacity: CapacityGuard,
    keys: Arc<KeyPool>,
    audit: AuditSink,
    defaults: AdmissionDefaults,
}

impl AdmissionController {
    pub fn new(
        db: DbHandle,
        capacity: CapacityGuard,
        keys: Arc<KeyPool>,
        audit: AuditSink,
        defaults: AdmissionDefaults,
    ) -> Self {
        Self {
            db,
            capacity,
            keys,
            audit,
            defaults,
        }
    }

    pub fn capacity(&self) -> &CapacityGuard {
        &self.capacity
    }

    pub async fn admit(
        &self,
        user_id: &str,
        request: BuildRequest,
        mode: AdmitMode,
    ) -> Result<Admission, AdmissionError> {
        validate_request(&request)?;
        let build_id = request
            .build_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let project_id = request.project_id.clone().unwrap_or_else(|| build_id.clone());
        let provider = request.provider.unwrap_or(self.defaults.provider);
        let strict_mode = request.strict_mode.unwrap_or(self.defaults.strict_mode);
        let max_fix_iterations = request
            .max_fix_iterations
            .unwrap_or(self.defaults.max_fix_iterations);

        let existing = {
            let id = build_id.clone();
            self.db
                .call(move |db| db.get_build(&id))
                .await
                .map_err(AdmissionError::Store)?
        };
        let pending = match &existing {
            Some(build) if build.user_id != user_id => {
                return Err(AdmissionError::NotOwner { build_id });
            }
            Some(build) if !build.status.is_terminal() => {
                if mode == AdmitMode::Inline {
                    return Err(AdmissionError::BuildAlreadyRunning { build_id });
                }
                true
            }
            _ => false,
        };

        // A pending re-enqueue was already counted when it was first admitted.
        let snapshot = if pending {
            None
        } else {
            match self.capacity.check(user_id).await {
                CapacityDecision::Allow(snapshot) => Some(snapshot),
                CapacityDecision::Deny { reason, upgrade } => {
                    info!(user_id, %build_id, reason = reason.code(), "Admission denied");
                    return Err(AdmissionError::Denied { reason, upgrade });
                }
            }
        };

        let key = match self.keys.get_key_with_failover(provider).await {
            Ok(Some(key)) => key,
            Ok(None) => {
                info!(user_id, %build_id, %provider, "Admission denied, no usable credential");
                return Err(AdmissionError::CredentialExhausted {
                    provider: provider.to_string(),
                });
            }
            Err(e) => {
                warn!(user_id, error = %e, "Key pool unavailable, denying admission");
                return Err(AdmissionError::Denied {
                    reason: DenyReason::StoreUnavailable {
                        detail: format!("{:#}", e),
                    },
                    upgrade: false,
                });
            }
        };

        let new = NewBuild {
            id: build_id.clone(),
            project_id,
            user_id: user_id.to_string(),
            prompt: request.prompt.clone(),
            model: request
                .model
                .clone()
                .unwrap_or_else(|| self.defaults.model.clone()),
        };
        let limit = snapshot.as_ref().map(|s| s.concurrent_limit);
        let allow_pending = mode == AdmitMode::Queued;
        let outcome = self
            .db
            .call(move |db| db.admit_build(&new, limit, allow_pending))
            .await
            .map_err(AdmissionError::Store)?;

        let (build, fresh) = match outcome {
            AdmitOutcome::Created(build) | AdmitOutcome::Reset(build) => (build, true),
            AdmitOutcome::Pending(build) => (build, false),
            AdmitOutcome::AlreadyRunning => {
                return Err(AdmissionError::BuildAlreadyRunning { build_id });
            }
            AdmitOutcome::NotOwner => return Err(AdmissionError::NotOwner { build_id }),
            AdmitOutcome::LimitReached { active } => {
                // Lost a race with another admission for the same user.
                return Err(AdmissionError::Denied {
                    reason: DenyReason::ConcurrencyLimit {
                        active,
                        limit: limit.unwrap_or(active),
                    },
                    upgrade: snapshot
                        .as_ref()
                        .is_some_and(|s| !self.capacity.plans().is_top_tier(&s.plan)),
                });
            }
        };

        if fresh && let Err(e) = self.capacity.record_usage(user_id, Utc::now()).await {
            warn!(user_id, %build_id, error = %e, "Failed to record usage");
        }

        info!(
            user_id,
            build_id = %build.id,
            key = %key.fingerprint(),
            ?mode,
            fresh,
            "Build admitted"
        );
        self.audit.record(AuditEntry::new(
            "build_admitted",
            &build.id,
            user_id,
            json!({
                "mode": format!("{:?}", mode).to_lowercase(),
                "model": build.model,
                "provider": provider,
                "key": key.fingerprint(),
                "fresh": fresh,
            }),
        ));

        Ok(Admission {
            build,
            key,
            capacity: snapshot,
            strict_mode,
            max_fix_iterations,
            context: request.context,
            provider,
            fresh,
        })
    }
}

fn validate_request(request: &BuildRequest) -> Result<(), AdmissionError> {
    if request.prompt.trim().is_empty() {
        return Err(AdmissionError::BadRequest("prompt must not be empty".into()));
    }
    if request.prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(AdmissionError::BadRequest(format!(
            "prompt exceeds {} characters",
            MAX_PROMPT_CHARS
        )));
    }
    if let Some(n) = request.max_fix_iterations
        && n > MAX_FIX_ITERATIONS_CAP
    {
        return Err(AdmissionError::BadRequest(format!(
            "maxFixIterations must be at most {}",
            MAX_FIX_ITERATIONS_CAP
        )));
    }
    for (field, value) in [
        ("buildId", request.build_id.as_deref()),
        ("projectId", request.project_id.as_deref()),
    ] {
        if let Some(value) = value
            && !is_valid_id(value)
        {
            return Err(AdmissionError::BadRequest(format!(
                "{} must be 1-{} characters of [A-Za-z0-9_-]",
                field, MAX_ID_LEN
            )));
        }
    }
    if let Some(model) = &request.model
        && model.trim().is_empty()
    {
        return Err(AdmissionError::BadRequest("model must not be empty".into()));
    }
    Ok(())
}

fn is_valid_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_ID_LEN
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capacity::PlanTable;
    use crate::store::{BuildDb, BuildStatus};

    async fn controller(keys: &[&str]) -> (AdmissionController, DbHandle) {
        let db = DbHandle::new(BuildDb::new_in_memory().unwrap());
        for secret in keys {
            let secret = secret.to_string();
            db.call(move |db| db.add_provider_key(ProviderKind::Anthropic, &secret))
                .await
                .unwrap();
        }
        let capacity = CapacityGuard::new(
            Arc::new(db.clone()),
            PlanTable::default(),
            Duration::from_secs(1),
        );
        let pool = Arc::new(KeyPool::new(Arc::new(db.clone())));
        let controller = AdmissionController::new(
            db.clone(),
            capacity,
            pool,
            AuditSink::disabled(),
            AdmissionDefaults {
                model: "claude-sonnet".into(),
                provider: ProviderKind::Anthropic,
                max_fix_iterations: 3,
                strict_mode: false,
            },
        );
        (controller, db)
    }

    fn request(build_id: &str) -> BuildRequest {
        BuildRequest {
            prompt: "Create a button component".into(),
            build_id: Some(build_id.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_admit_creates_queued_build_and_counts_usage() {
        let (controller, db) = controller(&["sk-a"]).await;
        let admission = controller
            .admit("u1", request("b1"), AdmitMode::Inline)
            .await
            .unwrap();
        assert!(admission.fresh);
        assert_eq!(admission.build.status, BuildStatus::Queued);
        assert_eq!(admission.build.project_id, "b1");
        assert_eq!(admission.build.model, "claude-sonnet");
        assert_eq!(admission.max_fix_iterations, 3);
        let snapshot = admission.capacity.unwrap();
        assert_eq!(snapshot.plan, "free");

        let now = Utc::now();
        let (today, _) = db
            .call(move |db| {
                db.usage_counts(
                    "u1",
                    &crate::capacity::day_key(now),
                    &crate::capacity::month_key(now),
                )
            })
            .await
            .unwrap();
        assert_eq!(today, 1);
    }

    #[tokio::test]
    async fn test_all_keys_rate_limited_is_credential_exhausted() {
        let (controller, db) = controller(&["sk-a", "sk-b"]).await;
        let until = Utc::now() + chrono::Duration::seconds(60);
        for key in db.call(|db| db.list_provider_keys(None)).await.unwrap() {
            db.call(move |db| db.set_key_cooldown(key.id, until)).await.unwrap();
        }

        let err = controller
            .admit("u1", request("b1"), AdmitMode::Inline)
            .await
            .unwrap_err();

        assert!(matches!(err, AdmissionError::CredentialExhausted { .. }));
        assert!(db.call(|db| db.get_build("b1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrency_cap_denies_next_build() {
        let (controller, _db) = controller(&["sk-a"]).await;
        for i in 0..3 {
            controller
                .admit("u1", request(&format!("b{}", i)), AdmitMode::Inline)
                .await
                .unwrap();
        }
        let err = controller
            .admit("u1", request("b3"), AdmitMode::Inline)
            .await
            .unwrap_err();
        match err {
            AdmissionError::Denied { reason, upgrade } => {
                assert_eq!(reason, DenyReason::ConcurrencyLimit { active: 3, limit: 3 });
                assert!(upgrade);
            }
            other => panic!("unexpected: {:?}", other),
        }
        // Other users are unaffected.
        controller
            .admit("u2", request("c0"), AdmitMode::Inline)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_running_build_cannot_be_admitted_inline_twice() {
        let (controller, _db) = controller(&["sk-a"]).await;
        controller.admit("u1", request("b1"), AdmitMode::Inline).await.unwrap();
        let err = controller
            .admit("u1", request("b1"), AdmitMode::Inline)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::BuildAlreadyRunning { .. }));
    }

    #[tokio::test]
    async fn test_queued_readmission_is_idempotent() {
        let (controller, db) = controller(&["sk-a"]).await;
        controller.admit("u1", request("b1"), AdmitMode::Queued).await.unwrap();
        let again = controller
            .admit("u1", request("b1"), AdmitMode::Queued)
            .await
            .unwrap();
        assert!(!again.fresh);
        assert!(again.capacity.is_none());
        assert_eq!(db.call(|db| db.active_build_count("u1")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_queued_admission_refuses_inline_owned_build() {
        let (controller, db) = controller(&["sk-a"]).await;
        controller.admit("u1", request("b1"), AdmitMode::Inline).await.unwrap();
        assert!(db
            .call(|db| db.acquire_build_lease("b1", "inline-lease", false))
            .await
            .unwrap());
        let err = controller
            .admit("u1", request("b1"), AdmitMode::Queued)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::BuildAlreadyRunning { .. }));
    }

    #[tokio::test]
    async fn test_other_users_build_is_refused() {
        let (controller, _db) = controller(&["sk-a"]).await;
        controller.admit("u1", request("b1"), AdmitMode::Queued).await.unwrap();
        let err = controller
            .admit("u2", request("b1"), AdmitMode::Queued)
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::NotOwner { .. }));
    }

    #[tokio::test]
    async fn test_bad_requests_rejected() {
        let (controller, _db) = controller(&["sk-a"]).await;
        let cases = [
            BuildRequest {
                prompt: "   ".into(),
                ..Default::default()
            },
            BuildRequest {
                prompt: "x".into(),
                build_id: Some("../etc".into()),
                ..Default::default()
            },
            BuildRequest {
                prompt: "x".into(),
                max_fix_iterations: Some(99),
                ..Default::default()
            },
        ];
        for case in cases {
            let err = controller.admit("u1", case, AdmitMode::Inline).await.unwrap_err();
            assert!(matches!(err, AdmissionError::BadRequest(_)), "{:?}", err);
        }
    }

    #[test]
    fn test_request_deserializes_camel_case() {
        let request: BuildRequest = serde_json::from_value(json!({
            "prompt": "p",
            "projectId": "proj",
            "maxFixIterations": 0,
            "strictMode": true,
            "provider": "openai"
        }))
        .unwrap();
        assert_eq!(request.project_id.as_deref(), Some("proj"));
        assert_eq!(request.max_fix_iterations, Some(0));
        assert_eq!(request.strict_mode, Some(true));
        assert_eq!(request.provider, Some(ProviderKind::OpenAi));
    }
}
