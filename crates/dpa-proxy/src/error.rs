//! Error types for the route proxy and the HTTP plugin backend

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dpa_core::models::reason;
use dpa_core::{BackendError, Status};
use thiserror::Error;

/// Errors raised on the proxy path
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Descriptor carries a base URL we cannot proxy to
    #[error("invalid backend URL {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    /// No authenticated identity on the request
    #[error("no user found for request")]
    MissingUser,

    /// Identity could not be encoded as a header
    #[error("invalid identity header: {0}")]
    InvalidHeader(String),

    /// Connection or protocol failure talking to the origin
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// Origin answered an upgrade request with something other than 101
    #[error("upstream refused upgrade with status {0}")]
    UpgradeRejected(u16),

    /// Failure from the plugin execution backend or the call context
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::InvalidBaseUrl { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::MissingUser => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::InvalidHeader(_) => StatusCode::BAD_REQUEST,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpgradeRejected(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Backend(e) => StatusCode::from_u16(e.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    /// Uniform status object for this error
    pub fn to_status(&self) -> Status {
        let code = self.status_code();
        let reason = match code {
            StatusCode::BAD_REQUEST => reason::BAD_REQUEST,
            StatusCode::NOT_FOUND => reason::NOT_FOUND,
            StatusCode::BAD_GATEWAY => reason::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE => reason::SERVICE_UNAVAILABLE,
            StatusCode::GATEWAY_TIMEOUT => reason::TIMEOUT,
            _ => reason::INTERNAL_ERROR,
        };
        Status::failure(code.as_u16(), reason, self.to_string())
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        ProxyError::Upstream(e.to_string())
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.to_status())).into_response()
    }
}
