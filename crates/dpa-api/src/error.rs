//! API error types and conversions

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dpa_core::models::reason;
use dpa_core::{BackendError, Status};

/// API error type that converts to a status-object response
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// 404 Not Found
    #[error("{0}")]
    NotFound(String),
    /// 503 Service Unavailable
    #[error("{0}")]
    ServiceUnavailable(String),
    /// 500 Internal Server Error
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Internal(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_status(&self) -> Status {
        let reason = match self {
            ApiError::NotFound(_) => reason::NOT_FOUND,
            ApiError::ServiceUnavailable(_) => reason::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => reason::INTERNAL_ERROR,
        };
        Status::failure(self.status_code().as_u16(), reason, self.to_string())
    }

    /// Record this error on the current span's `error` field
    pub fn record(&self) {
        tracing::Span::current().record("error", tracing::field::display(self));
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = status.as_u16(), message = %self, "API error");
        } else {
            tracing::debug!(code = status.as_u16(), message = %self, "API client error");
        }
        (status, Json(self.to_status())).into_response()
    }
}

/// Dispatcher paths keep a coarse mapping: every backend failure is a 500
/// carrying the backend's message.
impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        ApiError::Internal(err.to_string())
    }
}
