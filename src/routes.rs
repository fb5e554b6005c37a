//! HTTP routes for the hook port.
//!
//! This router hosts the three daemon endpoints that share the hook port:
//!
//! - `POST /hook` - hook ingest (one JSON payload per request)
//! - `GET /logs/{sessionId}` - per-session audit log download
//! - `GET /health` - liveness and counters
//!
//! The daemon binds to loopback only and carries no authentication; the
//! only hardening here is shape validation, a bounded body size, and the
//! path-safe session-id predicate on the log route.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::hook::{is_valid_session_id, HookPayload, IncomingHook};
use crate::registry::Registry;

/// Maximum accepted hook body size. Oversized payloads get 413.
pub const MAX_HOOK_BODY_BYTES: usize = 128 * 1024;

/// Bound on request handling, including body reads.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state for the hook-port handlers.
#[derive(Clone)]
pub struct AppState {
    /// The session registry.
    pub registry: Registry,
    /// False until the initial log scan has been kicked off; hooks arriving
    /// earlier get 503 and the forwarder retries.
    pub ready: Arc<AtomicBool>,
    /// Server start time for uptime reporting.
    pub start_time: Instant,
}

impl AppState {
    /// Creates state for a registry, initially not ready.
    #[must_use]
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            ready: Arc::new(AtomicBool::new(false)),
            start_time: Instant::now(),
        }
    }

    /// Marks the daemon ready to accept hooks.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }
}

/// Builds the hook-port router.
pub fn create_hook_router(state: AppState) -> Router {
    Router::new()
        .route("/hook", post(post_hook).options(preflight))
        .layer(DefaultBodyLimit::max(MAX_HOOK_BODY_BYTES))
        .route("/logs/{session_id}", get(get_session_log).options(preflight))
        .route("/health", get(get_health))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// JSON error response body.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl ErrorResponse {
    fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// JSON success response body for `POST /hook`.
#[derive(Debug, Serialize)]
struct OkResponse {
    ok: bool,
}

/// POST /hook - ingest one hook payload.
///
/// # Responses
///
/// - `200 {"ok":true}` - accepted (including logging-only hooks)
/// - `400 {"error":…}` - malformed JSON, missing `sessionId`, or unknown
///   `hookEventName`
/// - `413` - body over [`MAX_HOOK_BODY_BYTES`]
/// - `503` - registry not ready yet
async fn post_hook(State(state): State<AppState>, body: Bytes) -> Response {
    if !state.ready.load(Ordering::Acquire) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse::new("daemon is starting")),
        )
            .into_response();
    }

    let payload: HookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            debug!(error = %err, "rejecting malformed hook body");
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(format!("invalid JSON: {err}"))),
            )
                .into_response();
        }
    };

    let hook = match IncomingHook::try_from(payload) {
        Ok(hook) => hook,
        Err(err) => {
            debug!(error = %err, "rejecting invalid hook payload");
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse::new(err.to_string())),
            )
                .into_response();
        }
    };

    state.registry.handle_hook(hook).await;
    (StatusCode::OK, Json(OkResponse { ok: true })).into_response()
}

/// GET /logs/{sessionId} - download the session's audit log.
///
/// The id must match `[A-Za-z0-9_-]+`; anything else (dots, slashes,
/// backslashes, NUL) is rejected before touching the filesystem.
async fn get_session_log(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Response {
    if !is_valid_session_id(&session_id) {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new("invalid session id")),
        )
            .into_response();
    }

    let path = state.registry.audit().path_for(&session_id);
    let content = match tokio::fs::read(&path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::new("unknown session")),
            )
                .into_response();
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "audit log read failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse::new("failed to read audit log")),
            )
                .into_response();
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    if let Ok(value) =
        HeaderValue::from_str(&format!("attachment; filename=\"{session_id}.log\""))
    {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    (StatusCode::OK, headers, content).into_response()
}

/// Health check response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always "ok" when the server answers.
    pub status: String,
    /// Number of live sessions.
    pub sessions: usize,
    /// Number of snapshot stream subscribers.
    pub subscribers: usize,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
    /// Consumer-side hint for hiding long-idle sessions.
    pub idle_display_threshold_ms: u64,
}

/// GET /health - liveness and counters.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        sessions: state.registry.session_count().await,
        subscribers: state.registry.publisher().subscriber_count(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        idle_display_threshold_ms: state.registry.config().idle_display_threshold.as_millis()
            as u64,
    })
}

/// OPTIONS preflight: 204 with permissive CORS, for dashboards served from
/// another origin.
async fn preflight() -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("*"),
    );
    (StatusCode::NO_CONTENT, headers).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_state(dir: &TempDir) -> AppState {
        let config = Config::for_dirs(dir.path().join("tree"), dir.path().join("data"));
        let state = AppState::new(Registry::new(config));
        state.mark_ready();
        state
    }

    fn hook_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/hook")
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn hook_accepts_valid_payload() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let app = create_hook_router(state.clone());

        let response = app
            .oneshot(hook_request(
                r#"{"hookEventName":"UserPromptSubmit","sessionId":"s1","prompt":"hi"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["ok"], true);
        assert_eq!(state.registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn hook_rejects_invalid_json() {
        let dir = TempDir::new().unwrap();
        let app = create_hook_router(test_state(&dir));
        let response = app.oneshot(hook_request("not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("invalid JSON"));
    }

    #[tokio::test]
    async fn hook_rejects_missing_session_id() {
        let dir = TempDir::new().unwrap();
        let app = create_hook_router(test_state(&dir));
        let response = app
            .oneshot(hook_request(r#"{"hookEventName":"Stop"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn hook_rejects_unknown_event_name() {
        let dir = TempDir::new().unwrap();
        let app = create_hook_router(test_state(&dir));
        let response = app
            .oneshot(hook_request(
                r#"{"hookEventName":"Mystery","sessionId":"s1"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn hook_returns_503_before_ready() {
        let dir = TempDir::new().unwrap();
        let config = Config::for_dirs(dir.path().join("tree"), dir.path().join("data"));
        let state = AppState::new(Registry::new(config));
        let app = create_hook_router(state);
        let response = app
            .oneshot(hook_request(r#"{"hookEventName":"Stop","sessionId":"s1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn hook_rejects_oversized_body() {
        let dir = TempDir::new().unwrap();
        let app = create_hook_router(test_state(&dir));
        let oversized = "x".repeat(MAX_HOOK_BODY_BYTES + 1);
        let response = app.oneshot(hook_request(&oversized)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn hook_accepts_unknown_extra_fields() {
        let dir = TempDir::new().unwrap();
        let app = create_hook_router(test_state(&dir));
        let response = app
            .oneshot(hook_request(
                r#"{"hookEventName":"Notification","sessionId":"s1","brandNew":{"a":1}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn logs_rejects_unsafe_ids() {
        let dir = TempDir::new().unwrap();
        let app = create_hook_router(test_state(&dir));
        for bad in ["..", "a.b", "a%2Fb.", "sess.log"] {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri(format!("/logs/{bad}"))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(
                response.status(),
                StatusCode::BAD_REQUEST,
                "id {bad:?} must be rejected"
            );
        }
    }

    #[tokio::test]
    async fn logs_unknown_session_is_404() {
        let dir = TempDir::new().unwrap();
        let app = create_hook_router(test_state(&dir));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/logs/no-such-session")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn logs_serves_audit_file_with_headers() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let audit_path = state.registry.audit().path_for("s9");
        std::fs::create_dir_all(audit_path.parent().unwrap()).unwrap();
        std::fs::write(&audit_path, "[init] working\n").unwrap();

        let app = create_hook_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/logs/s9")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"s9.log\""
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"[init] working\n");
    }

    #[tokio::test]
    async fn logs_rejects_non_get_methods() {
        let dir = TempDir::new().unwrap();
        let app = create_hook_router(test_state(&dir));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/logs/s1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn preflight_answers_204_with_cors() {
        let dir = TempDir::new().unwrap();
        let app = create_hook_router(test_state(&dir));
        let response = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/logs/s1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir);
        let app = create_hook_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let health = body_json(response).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["sessions"], 0);
        assert_eq!(health["idleDisplayThresholdMs"], 3_600_000);
    }
}
