//! Common error types for backends and the route registry

use thiserror::Error;

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors that can occur while talking to a backend or one of the
/// external collaborators.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Resource, plugin or datasource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed or unacceptable input
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Call primitive not implemented by this backend
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Connection-level failure reaching the backend
    #[error("Transport error: {0}")]
    Transport(String),

    /// Backend answered with something we could not interpret
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Backend is known but currently not serving
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The request deadline passed before the backend answered
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The inbound request went away
    #[error("Request cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BackendError {
    /// Returns the HTTP status code this error would map to under a strict
    /// client/server split.
    ///
    /// Dispatcher paths deliberately do not use this and answer 500 for
    /// everything; it is used for logging and by the route proxy.
    pub fn status_code(&self) -> u16 {
        match self {
            BackendError::NotFound(_) => 404,
            BackendError::InvalidRequest(_) => 400,
            BackendError::NotSupported(_) => 501,
            BackendError::Transport(_) => 502,
            BackendError::Protocol(_) => 502,
            BackendError::Unavailable(_) => 503,
            BackendError::DeadlineExceeded => 504,
            BackendError::Cancelled => 499,
            BackendError::Internal(_) => 500,
        }
    }
}

/// Errors raised while building or publishing a route entry
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Name is not of the form `{version}.{group}`
    #[error("invalid descriptor name: {0}")]
    InvalidName(String),

    /// Descriptor content is inconsistent or incomplete
    #[error("invalid descriptor {name}: {reason}")]
    InvalidDescriptor { name: String, reason: String },

    /// Declared routes cannot coexist in one route table
    #[error("route conflict in {name}: {reason}")]
    RouteConflict { name: String, reason: String },

    /// The backend for this descriptor could not be resolved
    #[error("backend resolution failed: {0}")]
    Backend(#[from] BackendError),
}

impl RegistryError {
    pub fn invalid(name: impl Into<String>, reason: impl Into<String>) -> Self {
        RegistryError::InvalidDescriptor {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(BackendError::NotFound("x".into()).status_code(), 404);
        assert_eq!(BackendError::Transport("x".into()).status_code(), 502);
        assert_eq!(BackendError::DeadlineExceeded.status_code(), 504);
        assert_eq!(BackendError::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn registry_error_wraps_backend_error() {
        let err: RegistryError = BackendError::NotFound("plugin foo".into()).into();
        assert_eq!(
            err.to_string(),
            "backend resolution failed: Not found: plugin foo"
        );
    }
}
