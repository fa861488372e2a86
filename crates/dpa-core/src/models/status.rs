//! Uniform status object returned to callers on every failure

use serde::{Deserialize, Serialize};

pub const STATUS_SUCCESS: &str = "Success";
pub const STATUS_FAILURE: &str = "Failure";

/// Machine-readable reasons used in `Status.reason`
pub mod reason {
    pub const INTERNAL_ERROR: &str = "InternalError";
    pub const BAD_REQUEST: &str = "BadRequest";
    pub const NOT_FOUND: &str = "NotFound";
    pub const BAD_GATEWAY: &str = "BadGateway";
    pub const SERVICE_UNAVAILABLE: &str = "ServiceUnavailable";
    pub const TIMEOUT: &str = "Timeout";
    pub const UNAUTHORIZED: &str = "Unauthorized";
}

/// Generic status object (`kind: Status`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    #[serde(default = "status_kind")]
    pub kind: String,
    #[serde(default = "status_api_version")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default)]
    pub code: u16,
}

fn status_kind() -> String {
    "Status".to_string()
}

fn status_api_version() -> String {
    "v1".to_string()
}

impl Status {
    pub fn failure(code: u16, reason: &str, message: impl Into<String>) -> Self {
        Self {
            kind: status_kind(),
            api_version: status_api_version(),
            status: Some(STATUS_FAILURE.to_string()),
            message: message.into(),
            reason: reason.to_string(),
            code,
        }
    }

    /// 500 `InternalError` with the given message
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::failure(500, reason::INTERNAL_ERROR, message)
    }

    /// The status attached to a disallowed admission response when the
    /// backend supplied none.
    pub fn default_denial() -> Self {
        Self::failure(500, "", "Internal error")
    }

    pub fn success() -> Self {
        Self {
            kind: status_kind(),
            api_version: status_api_version(),
            status: Some(STATUS_SUCCESS.to_string()),
            message: String::new(),
            reason: String::new(),
            code: 200,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.status.as_deref() == Some(STATUS_FAILURE)
    }
}
