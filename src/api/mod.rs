//! HTTP API
//!
//! Two routes: `POST /offer` runs the WebRTC handshake (form-encoded offer
//! in, raw answer SDP out) and `GET /health` reports liveness. Any origin
//! may call either route.

use std::sync::Arc;

use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::session::SessionCoordinator;
use crate::Error;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SessionCoordinator>,
}

/// Build the service router with CORS and request tracing
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/offer", post(handle_offer))
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct OfferRequest {
    #[serde(default)]
    sdp: String,
}

/// Map negotiation failures onto HTTP statuses with a JSON error body
struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_client_error() {
            StatusCode::BAD_REQUEST
        } else {
            error!(error = %self.0, "offer negotiation failed");
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

/// `POST /offer`: negotiate a session from the submitted offer SDP
async fn handle_offer(
    State(state): State<AppState>,
    Form(request): Form<OfferRequest>,
) -> std::result::Result<String, ApiError> {
    let answer = state.coordinator.negotiate(&request.sdp).await?;
    let sessions = state.coordinator.active_sessions().await;
    info!(sessions, "offer answered");
    Ok(answer)
}

/// `GET /health`: liveness probe
async fn handle_health() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Method, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let mut config = crate::config::Config::default();
        config.rtp.base_port = 22000;
        config.rtp.max_port = 22999;
        config.webrtc.stun_servers = Vec::new();
        config.webrtc.gather_timeout_seconds = 2;
        config.source.command = "/bin/true".to_string();
        let coordinator = Arc::new(SessionCoordinator::new(Arc::new(config)).unwrap());
        AppState { coordinator }
    }

    #[tokio::test]
    async fn test_health_returns_ok() {
        let router = build_router(test_state());
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"OK");
    }

    #[tokio::test]
    async fn test_empty_offer_is_bad_request() {
        let state = test_state();
        let router = build_router(state.clone());
        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/offer")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from("sdp="))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(parsed["error"].as_str().unwrap().contains("empty"));
        // A rejected offer must not leave anything behind.
        assert_eq!(state.coordinator.active_sessions().await, 0);
        assert_eq!(state.coordinator.leased_ports(), 0);
    }

    #[tokio::test]
    async fn test_missing_sdp_field_is_bad_request() {
        let router = build_router(test_state());
        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/offer")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_valid_offer_returns_answer_sdp() {
        let state = test_state();
        let router = build_router(state.clone());

        let offer = crate::session::video_offer_sdp().await;
        let body = serde_urlencoded::to_string([("sdp", offer.as_str())]).unwrap();
        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/offer")
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let answer = response.into_body().collect().await.unwrap().to_bytes();
        let answer = std::str::from_utf8(&answer).unwrap();
        assert!(answer.contains("m=video"), "answer must carry the video media line");
        assert_eq!(state.coordinator.active_sessions().await, 1);
        assert_eq!(state.coordinator.leased_ports(), 1);

        state.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_preflight_allocates_nothing() {
        let state = test_state();
        let router = build_router(state.clone());
        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::OPTIONS)
                    .uri("/offer")
                    .header(header::ORIGIN, "http://example.com")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.coordinator.leased_ports(), 0);
    }
}
