//! Admission webhook review envelope

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Status;

/// Envelope kind every inbound review must carry
pub const ADMISSION_REVIEW_KIND: &str = "AdmissionReview";

/// Patch type attached to mutation responses
pub const PATCH_TYPE_JSON_PATCH: &str = "JSONPatch";

/// Generic admission review envelope (request in, response out)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    #[serde(default)]
    pub kind: GroupVersionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_object: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    /// Base64-encoded RFC 6902 patch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Status>,
}

/// Admission operation understood by plugin backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AdmissionOperation {
    Create,
    Update,
    Delete,
}

impl AdmissionOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionOperation::Create => "CREATE",
            AdmissionOperation::Update => "UPDATE",
            AdmissionOperation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for AdmissionOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons an envelope operation cannot be mapped to a backend operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("operation is required")]
    Missing,
    /// `CONNECT` reviews have no backend counterpart
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("unknown operation: {0}")]
    Unknown(String),
}

impl FromStr for AdmissionOperation {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(AdmissionOperation::Create),
            "UPDATE" => Ok(AdmissionOperation::Update),
            "DELETE" => Ok(AdmissionOperation::Delete),
            "CONNECT" => Err(OperationError::Unsupported(s.to_string())),
            "" => Err(OperationError::Missing),
            other => Err(OperationError::Unknown(other.to_string())),
        }
    }
}

impl AdmissionRequest {
    /// Map the envelope operation to a backend operation
    pub fn parse_operation(&self) -> Result<AdmissionOperation, OperationError> {
        self.operation
            .as_deref()
            .ok_or(OperationError::Missing)?
            .parse()
    }
}

impl AdmissionReview {
    /// Build the reply envelope, echoing the inbound apiVersion and kind
    pub fn reply(&self, response: AdmissionResponse) -> Self {
        Self {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            request: None,
            response: Some(response),
        }
    }
}
