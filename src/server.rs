//! HTTP surface: the single message endpoint plus auxiliary endpoints.
//!
//! Every route sits behind the `x-api-key` check. The inbound handler parses
//! the body by hand so malformed requests get a clean 400, and it wraps turn
//! processing in `catch_unwind` so an unexpected internal failure degrades
//! to the safe fallback reply instead of a 500 — the conversation must
//! never break.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::FutureExt;
use serde_json::json;
use tracing::{error, warn};

use crate::session::{SessionManager, SAFE_FALLBACK_REPLY};
use crate::types::{HoneypotReply, HoneypotRequest};

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub api_key: Arc<str>,
    pub started_at: Instant,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/honeypot/message", post(handle_inbound))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/debug/session/:id", get(debug_session))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .with_state(state)
}

async fn require_api_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let presented = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    if presented != Some(state.api_key.as_ref()) {
        warn!("rejected request with missing or invalid api key");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "status": "error", "message": "missing or invalid api key" })),
        )
            .into_response();
    }
    next.run(request).await
}

async fn handle_inbound(State(state): State<AppState>, body: Bytes) -> Response {
    let request: HoneypotRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return bad_request(format!("malformed request body: {e}")),
    };
    if request.session_id.trim().is_empty() {
        return bad_request("sessionId must not be empty".to_string());
    }
    if request.message.text.trim().is_empty() {
        return bad_request("message.text must not be empty".to_string());
    }

    let reply = AssertUnwindSafe(state.manager.handle_message(&request))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            error!(session_id = %request.session_id, "turn processing panicked");
            SAFE_FALLBACK_REPLY.to_string()
        });

    (StatusCode::OK, Json(HoneypotReply::success(reply))).into_response()
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "status": "error", "message": message })),
    )
        .into_response()
}

async fn health() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn stats(State(state): State<AppState>) -> Response {
    let mut body = state.manager.stats().await;
    if let Some(obj) = body.as_object_mut() {
        obj.insert(
            "uptimeSeconds".to_string(),
            json!(state.started_at.elapsed().as_secs()),
        );
    }
    Json(body).into_response()
}

async fn debug_session(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.debug_snapshot(&id).await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "status": "error", "message": "unknown session" })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackDispatcher;
    use crate::safety::SafetyFabric;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    const KEY: &str = "test-key";

    fn test_app(dir: &tempfile::TempDir) -> Router {
        let dispatcher =
            Arc::new(CallbackDispatcher::new(None, dir.path().join("retry.jsonl")).unwrap());
        let manager = Arc::new(SessionManager::new(
            Arc::new(SafetyFabric::new(4)),
            None,
            dispatcher,
        ));
        build_router(AppState {
            manager,
            api_key: Arc::from(KEY),
            started_at: Instant::now(),
        })
    }

    fn inbound(session: &str, text: &str) -> HttpRequest<Body> {
        let body = json!({
            "sessionId": session,
            "message": { "sender": "scammer", "text": text, "timestamp": 1 },
            "conversationHistory": []
        });
        HttpRequest::builder()
            .method("POST")
            .uri("/api/honeypot/message")
            .header("content-type", "application/json")
            .header(API_KEY_HEADER, KEY)
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
    async fn message_endpoint_returns_exactly_status_and_reply() {
        let dir = tempfile::tempdir().unwrap();
        let response = test_app(&dir)
            .oneshot(inbound("s1", "hello there"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let obj = body.as_object().unwrap();
        let mut keys: Vec<&str> = obj.keys().map(|k| k.as_str()).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["reply", "status"]);
        assert_eq!(obj["status"], "success");
        assert!(!obj["reply"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_api_key_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/api/honeypot/message")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let response = test_app(&dir).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_api_key_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let mut request = inbound("s1", "hello");
        request
            .headers_mut()
            .insert(API_KEY_HEADER, "wrong".parse().unwrap());
        let response = test_app(&dir).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/api/honeypot/message")
            .header("content-type", "application/json")
            .header(API_KEY_HEADER, KEY)
            .body(Body::from("{\"sessionId\": 42}"))
            .unwrap();
        let response = test_app(&dir).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_message_text_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let response = test_app(&dir).oneshot(inbound("s1", "  ")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_answers_behind_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir);

        let unauthorized = HttpRequest::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(unauthorized).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let authorized = HttpRequest::builder()
            .uri("/health")
            .header(API_KEY_HEADER, KEY)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(authorized).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn stats_reports_session_counters() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir);
        app.clone()
            .oneshot(inbound("s-stats", "hello"))
            .await
            .unwrap();

        let request = HttpRequest::builder()
            .uri("/stats")
            .header(API_KEY_HEADER, KEY)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let body = body_json(response).await;
        assert_eq!(body["totalSessions"], 1);
        assert_eq!(body["callbacksDispatched"], 0);
    }

    #[tokio::test]
    async fn debug_endpoint_returns_session_or_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir);
        app.clone()
            .oneshot(inbound("s-debug", "pay me at x@paytm"))
            .await
            .unwrap();

        let found = HttpRequest::builder()
            .uri("/debug/session/s-debug")
            .header(API_KEY_HEADER, KEY)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(found).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["sessionId"], "s-debug");

        let missing = HttpRequest::builder()
            .uri("/debug/session/nope")
            .header(API_KEY_HEADER, KEY)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(missing).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
