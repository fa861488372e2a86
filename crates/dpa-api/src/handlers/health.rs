//! Liveness, readiness and metrics endpoints

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use dpa_proxy::encode_metrics;

use crate::error::ApiError;
use crate::state::AppState;

/// GET /healthz
pub async fn healthz() -> &'static str {
    "ok"
}

/// GET /readyz
///
/// 503 until the controller finished its first full list pass.
pub async fn readyz(State(state): State<AppState>) -> Result<&'static str, ApiError> {
    if state.readiness.is_ready() {
        Ok("ok")
    } else {
        Err(ApiError::ServiceUnavailable(
            "initial reconciliation has not completed".to_string(),
        ))
    }
}

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> Response {
    match encode_metrics(&state.metrics) {
        Ok(text) => ([(CONTENT_TYPE, "text/plain; version=0.0.4")], text).into_response(),
        Err(e) => ApiError::internal(e).into_response(),
    }
}
