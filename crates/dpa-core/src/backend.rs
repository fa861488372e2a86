//! PluginBackend trait - the plugin execution backend behind `plugin`-kind
//! descriptors, plus the plugin-context resolver and the backend resolver.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::RequestContext;
use crate::error::{BackendError, BackendResult};
use crate::models::{
    AdmissionOperation, DataQuery, GroupVersionKind, QueryDataResponse, Status, UserInfo,
};

// =============================================================================
// Plugin Context
// =============================================================================

/// A configured datasource instance as seen by its plugin
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceInstance {
    pub uid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub json_data: Value,
}

/// Execution context handed to the plugin on every call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginContext {
    #[serde(default)]
    pub org_id: i64,
    #[serde(rename = "pluginID")]
    pub plugin_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource: Option<DataSourceInstance>,
}

/// Resolves `(pluginID, uid)` to the execution context for a call
#[async_trait]
pub trait PluginContextProvider: Send + Sync {
    /// `uid` is the datasource instance for datasource plugins, `None` for
    /// app plugins.
    async fn plugin_context(
        &self,
        ctx: &RequestContext,
        plugin_id: &str,
        uid: Option<&str>,
    ) -> BackendResult<PluginContext>;
}

// =============================================================================
// Call Primitives
// =============================================================================

/// Forwarded data query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryCall {
    pub plugin_context: PluginContext,
    pub queries: Vec<DataQuery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

/// Admission input: operation, kind and raw object bytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionCall {
    pub plugin_context: PluginContext,
    pub operation: AdmissionOperation,
    pub kind: GroupVersionKind,
    #[serde(with = "base64_bytes", default)]
    pub object_bytes: Vec<u8>,
    #[serde(with = "base64_bytes", default)]
    pub old_object_bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Status>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResult {
    pub allowed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Status>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Mutated object; empty when the backend left the object alone
    #[serde(with = "base64_bytes", default)]
    pub object_bytes: Vec<u8>,
}

/// Raw HTTP-shaped call into a plugin's resource handler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceCall {
    pub plugin_context: PluginContext,
    pub method: String,
    /// Path relative to the group/version mount, leading `/` included
    pub path: String,
    /// Raw query string without `?`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub query: String,
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(with = "base64_bytes", default)]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, Vec<String>>,
    #[serde(with = "base64_bytes", default)]
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Ok,
    Error,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResult {
    pub status: HealthStatus,
    #[serde(default)]
    pub message: String,
}

// =============================================================================
// PluginBackend Trait
// =============================================================================

/// Plugin execution backend.
///
/// Every primitive has a default that reports `NotSupported`, so a plugin
/// only implements what its descriptor declares.
#[async_trait]
pub trait PluginBackend: Send + Sync {
    /// Plugin this backend executes
    fn plugin_id(&self) -> &str;

    async fn query_data(
        &self,
        ctx: &RequestContext,
        call: QueryCall,
    ) -> BackendResult<QueryDataResponse> {
        let _ = (ctx, call);
        Err(BackendError::NotSupported("query_data".to_string()))
    }

    async fn mutate_admission(
        &self,
        ctx: &RequestContext,
        call: AdmissionCall,
    ) -> BackendResult<MutationResult> {
        let _ = (ctx, call);
        Err(BackendError::NotSupported("mutate_admission".to_string()))
    }

    async fn validate_admission(
        &self,
        ctx: &RequestContext,
        call: AdmissionCall,
    ) -> BackendResult<ValidationResult> {
        let _ = (ctx, call);
        Err(BackendError::NotSupported("validate_admission".to_string()))
    }

    async fn call_resource(
        &self,
        ctx: &RequestContext,
        call: ResourceCall,
    ) -> BackendResult<ResourceResponse> {
        let _ = (ctx, call);
        Err(BackendError::NotSupported("call_resource".to_string()))
    }

    async fn check_health(
        &self,
        ctx: &RequestContext,
        plugin_context: PluginContext,
    ) -> BackendResult<HealthResult> {
        let _ = (ctx, plugin_context);
        Err(BackendError::NotSupported("check_health".to_string()))
    }
}

/// Maps a plugin id to its execution backend
pub trait BackendResolver: Send + Sync {
    fn resolve(&self, plugin_id: &str) -> BackendResult<Arc<dyn PluginBackend>>;
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct QueryOnly;

    #[async_trait]
    impl PluginBackend for QueryOnly {
        fn plugin_id(&self) -> &str {
            "query-only"
        }

        async fn query_data(
            &self,
            _ctx: &RequestContext,
            call: QueryCall,
        ) -> BackendResult<QueryDataResponse> {
            let mut resp = QueryDataResponse::default();
            for q in call.queries {
                resp.results.insert(q.ref_id, Value::Bool(true));
            }
            Ok(resp)
        }
    }

    #[tokio::test]
    async fn unimplemented_primitives_are_not_supported() {
        let backend = QueryOnly;
        let ctx = RequestContext::background();
        let err = backend
            .check_health(&ctx, PluginContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::NotSupported(ref op) if op == "check_health"));
    }

    #[test]
    fn admission_call_encodes_bytes_as_base64() {
        let call = AdmissionCall {
            plugin_context: PluginContext {
                plugin_id: "foo".into(),
                ..Default::default()
            },
            operation: AdmissionOperation::Create,
            kind: GroupVersionKind::default(),
            object_bytes: br#"{"a":1}"#.to_vec(),
            old_object_bytes: Vec::new(),
        };
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["objectBytes"], "eyJhIjoxfQ==");
        assert_eq!(value["operation"], "CREATE");
        assert_eq!(value["pluginContext"]["pluginID"], "foo");

        let back: AdmissionCall = serde_json::from_value(value).unwrap();
        assert_eq!(back, call);
    }
}
