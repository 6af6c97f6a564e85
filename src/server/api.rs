use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::{Stream, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::capacity::DenyReason;
use crate::errors::{AdmissionError, QueueError};
use crate::orchestrator::runner::KIND_PERSISTENCE;
use crate::orchestrator::{
    self, AdmissionController, AdmitMode, BuildEvent, BuildRequest, ChannelSink, EventSink,
    Orchestrator, Phase,
};
use crate::queue::JobQueue;
use crate::runtime::Services;
use crate::store::{Build, DbHandle};

pub const USER_HEADER: &str = "x-user-id";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub admission: Arc<AdmissionController>,
    pub orchestrator: Arc<Orchestrator>,
    pub queue: Arc<JobQueue>,
    /// Parent of every inline build's cancellation token.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(services: &Services, shutdown: CancellationToken) -> Self {
        Self {
            db: services.db.clone(),
            admission: services.admission.clone(),
            orchestrator: services.orchestrator.clone(),
            queue: services.queue.clone(),
            shutdown,
        }
    }
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Unauthorized,
    NotFound(String),
    Forbidden(String),
    Admission(AdmissionError),
    Internal(String),
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        ApiError::Admission(err)
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::JobNotFound { job_id } => ApiError::NotFound(format!("Job {} not found", job_id)),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{:#}", err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                json!({"error": "unauthorized", "message": format!("Missing {} header", USER_HEADER)}),
            ),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({"error": "not_found", "message": msg})),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, json!({"error": "forbidden", "message": msg})),
            ApiError::Internal(msg) => {
                error!(error = %msg, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"error": "internal", "message": msg}),
                )
            }
            ApiError::Admission(err) => admission_response(&err),
        };
        (status, Json(body)).into_response()
    }
}

fn admission_response(err: &AdmissionError) -> (StatusCode, serde_json::Value) {
    let message = err.to_string();
    match err {
        AdmissionError::Denied { reason, upgrade } => {
            let status = match reason {
                DenyReason::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::TOO_MANY_REQUESTS,
            };
            (
                status,
                json!({"error": reason.code(), "message": message, "reason": reason, "upgrade": upgrade}),
            )
        }
        AdmissionError::CredentialExhausted { .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            json!({"error": "credential_exhausted", "message": message}),
        ),
        AdmissionError::BuildAlreadyRunning { .. } => (
            StatusCode::CONFLICT,
            json!({"error": "build_already_running", "message": message}),
        ),
        AdmissionError::NotOwner { .. } => (StatusCode::FORBIDDEN, json!({"error": "forbidden", "message": message})),
        AdmissionError::BadRequest(_) => (StatusCode::BAD_REQUEST, json!({"error": "bad_request", "message": message})),
        AdmissionError::Store(e) => {
            error!(error = %e, "Admission store failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"error": "store_unavailable", "message": message}),
            )
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/builds", post(create_build))
        .route("/api/builds/async", post(enqueue_build))
        .route("/api/builds/{id}", get(get_build_status))
        .route("/api/builds/{id}/files", get(get_build_files))
        .route("/api/queue/stats", get(queue_stats))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

fn caller(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ApiError::Unauthorized)
}

/// Load a build and check the caller owns it.
async fn owned_build(state: &AppState, id: &str, user: &str) -> Result<Build, ApiError> {
    let build_id = id.to_string();
    let build = state
        .db
        .call(move |db| db.get_build(&build_id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Build {} not found", id)))?;
    if build.user_id != user {
        return Err(ApiError::Forbidden(format!("Build {} belongs to a different user", id)));
    }
    Ok(build)
}

fn sse_event(event: &BuildEvent) -> Event {
    Event::default().event(event.name()).data(event.data().to_string())
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Admit and run a build on this request, streaming its events as SSE.
/// Dropping the response stream cancels the provider call.
async fn create_build(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<BuildRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let user = caller(&headers)?;
    let admission = state.admission.admit(&user, req, AdmitMode::Inline).await?;
    let build_id = admission.build.id.clone();

    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = state.shutdown.child_token();
    let guard = cancel.clone().drop_guard();
    let orchestrator = state.orchestrator.clone();

    tokio::spawn(async move {
        let sink = ChannelSink::new(tx);
        match orchestrator::run_inline(&orchestrator, admission, cancel, &sink).await {
            Ok(outcome) => debug!(build_id = %build_id, ?outcome, "Inline build finished"),
            Err(e) => {
                warn!(build_id = %build_id, error = %e, "Inline build did not start");
                // Another owner holds the lease and keeps the build; otherwise
                // nobody does and the admitted record must not hold a slot.
                let kind = match &e {
                    AdmissionError::BuildAlreadyRunning { .. } => "build_already_running",
                    _ => {
                        let (id, message) = (build_id.clone(), e.to_string());
                        if let Err(cleanup) =
                            orchestrator.db().call(move |db| db.fail_unowned_build(&id, &message)).await
                        {
                            error!(build_id = %build_id, error = %cleanup, "Failed to release unstarted build");
                        }
                        KIND_PERSISTENCE
                    }
                };
                sink.emit(BuildEvent::Error {
                    build_id,
                    kind: kind.into(),
                    message: e.to_string(),
                    phase: Phase::Queued,
                });
            }
        }
    });

    let stream = UnboundedReceiverStream::new(rx).map(move |event| {
        let _keep = &guard;
        Ok(sse_event(&event))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Admit a build and hand it to the worker pool.
async fn enqueue_build(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<BuildRequest>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let user = caller(&headers)?;
    let admission = state.admission.admit(&user, req, AdmitMode::Queued).await?;
    let build_id = admission.build.id.clone();

    let outcome = match state.queue.enqueue(admission.job_payload()).await {
        Ok(outcome) => outcome,
        Err(e) => {
            // Nobody will pick the build up; release its capacity slot.
            let (id, message) = (build_id.clone(), e.to_string());
            if let Err(cleanup) = state.db.call(move |db| db.fail_unowned_build(&id, &message)).await {
                error!(build_id = %build_id, error = %cleanup, "Failed to mark unqueued build failed");
            }
            return Err(e.into());
        }
    };

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "jobId": build_id,
            "buildId": build_id,
            "enqueue": format!("{:?}", outcome).to_lowercase(),
            "capacity": admission.capacity,
        })),
    ))
}

async fn get_build_status(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = caller(&headers)?;
    owned_build(&state, &id, &user).await?;
    let view = state
        .queue
        .build_status(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Build {} not found", id)))?;
    Ok(Json(json!(view)))
}

async fn get_build_files(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = caller(&headers)?;
    owned_build(&state, &id, &user).await?;
    let build_id = id.clone();
    let files = state.db.call(move |db| db.files_for_build(&build_id)).await?;
    Ok(Json(json!({"buildId": id, "files": files})))
}

async fn queue_stats(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user = caller(&headers)?;
    let stats = state.queue.stats(&user).await?;
    Ok(Json(json!(stats)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::errors::ProviderError;
    use crate::generation::testing::ScriptedProvider;
    use crate::store::BuildDb;

    const CLEAN_BUTTON: &str = "Here it is.\n```tsx:src/Button.tsx\nexport function Button({ label }: { label: string }) {\n  return <button>{label}</button>;\n}\n```\n";

    fn test_services(responses: Vec<Result<String, ProviderError>>) -> Services {
        let config = Config {
            seed_keys: vec!["sk-test".into()],
            ..Default::default()
        };
        let db = BuildDb::new_in_memory().unwrap();
        Services::with_provider(config, db, Arc::new(ScriptedProvider::new(responses))).unwrap()
    }

    fn test_app(services: &Services) -> Router {
        let state = Arc::new(AppState::new(services, CancellationToken::new()));
        api_router().with_state(state)
    }

    fn post_json(uri: &str, user: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn get_as(uri: &str, user: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(USER_HEADER, user)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let services = test_services(vec![]);
        let resp = test_app(&services)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_user_is_unauthorized() {
        let services = test_services(vec![]);
        let resp = test_app(&services)
            .oneshot(post_json("/api/builds", None, json!({"prompt": "a button"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_empty_prompt_is_bad_request() {
        let services = test_services(vec![]);
        let resp = test_app(&services)
            .oneshot(post_json("/api/builds", Some("u1"), json!({"prompt": "  "})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "bad_request");
    }

    #[tokio::test]
    async fn test_inline_build_streams_events() {
        let services = test_services(vec![Ok(CLEAN_BUTTON.into())]);
        let app = test_app(&services);
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/builds",
                Some("u1"),
                json!({"prompt": "a button", "buildId": "b-inline"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/event-stream");

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("event: phase"));
        assert!(text.contains("event: chunk"));
        assert!(text.contains("event: validation"));
        assert!(text.contains("event: complete"));
        assert!(!text.contains("event: error"));

        let resp = app.oneshot(get_as("/api/builds/b-inline/files", "u1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["files"][0]["path"], "src/Button.tsx");
    }

    #[tokio::test]
    async fn test_inline_provider_failure_streams_error() {
        let services = test_services(vec![Err(ProviderError::Http {
            status: 400,
            body: "bad model".into(),
        })]);
        let resp = test_app(&services)
            .oneshot(post_json("/api/builds", Some("u1"), json!({"prompt": "a button"})))
            .await
            .unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("event: error"));
        assert!(text.contains("provider_error"));
        assert!(!text.contains("event: complete"));
    }

    #[tokio::test]
    async fn test_async_build_is_accepted_and_queryable() {
        let services = test_services(vec![]);
        let app = test_app(&services);
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/builds/async",
                Some("u1"),
                json!({"prompt": "a button", "buildId": "b-async"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = body_json(resp).await;
        assert_eq!(body["jobId"], "b-async");
        assert_eq!(body["enqueue"], "created");

        let resp = app.clone().oneshot(get_as("/api/builds/b-async", "u1")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let view = body_json(resp).await;
        assert_eq!(view["status"], "queued");
        assert_eq!(view["progress"], 0);

        let resp = app.clone().oneshot(get_as("/api/builds/b-async", "u2")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = app.oneshot(get_as("/api/queue/stats", "u1")).await.unwrap();
        let stats = body_json(resp).await;
        assert_eq!(stats["waiting"], 1);
        assert_eq!(stats["userActiveBuilds"], 1);
    }

    #[tokio::test]
    async fn test_async_enqueue_of_running_inline_build_conflicts() {
        let config = Config {
            seed_keys: vec!["sk-test".into()],
            ..Default::default()
        };
        let provider = ScriptedProvider::new(vec![Ok(CLEAN_BUTTON.into())])
            .with_delay(std::time::Duration::from_millis(500));
        let services =
            Services::with_provider(config, BuildDb::new_in_memory().unwrap(), Arc::new(provider)).unwrap();
        let app = test_app(&services);

        let inline = app
            .clone()
            .oneshot(post_json("/api/builds", Some("u1"), json!({"prompt": "a button", "buildId": "b-live"})))
            .await
            .unwrap();
        assert_eq!(inline.status(), StatusCode::OK);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/builds/async",
                Some("u1"),
                json!({"prompt": "a button", "buildId": "b-live"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(resp).await["error"], "build_already_running");

        let bytes = inline.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("event: complete"));

        let resp = app.oneshot(get_as("/api/queue/stats", "u1")).await.unwrap();
        assert_eq!(body_json(resp).await["waiting"], 0);
    }

    #[tokio::test]
    async fn test_unknown_build_is_not_found() {
        let services = test_services(vec![]);
        let resp = test_app(&services)
            .oneshot(get_as("/api/builds/nope", "u1"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_no_credentials_is_service_unavailable() {
        let db = BuildDb::new_in_memory().unwrap();
        let services =
            Services::with_provider(Config::default(), db, Arc::new(ScriptedProvider::new(vec![]))).unwrap();
        let resp = test_app(&services)
            .oneshot(post_json("/api/builds/async", Some("u1"), json!({"prompt": "a button"})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(resp).await["error"], "credential_exhausted");
    }

    #[test]
    fn test_concurrency_denial_maps_to_429_with_upgrade() {
        let err = AdmissionError::Denied {
            reason: DenyReason::ConcurrencyLimit { active: 1, limit: 1 },
            upgrade: true,
        };
        let (status, body) = admission_response(&err);
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "concurrency_limit");
        assert_eq!(body["upgrade"], true);
    }
}
