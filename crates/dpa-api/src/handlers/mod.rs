//! Per-service request handlers mounted by the backend dispatcher
//!
//! Every handler receives the [`BackendHandle`] of the descriptor it was
//! built for and the raw request, and always produces a response; failures
//! become status objects.

pub mod admission;
pub mod discovery_docs;
pub mod health;
pub mod query;
pub mod route;

use std::sync::Arc;
use std::time::Duration;

use axum::http::header::CONTENT_TYPE;
use axum::http::{Extensions, HeaderMap};
use dpa_core::{
    GroupVersion, PluginBackend, PluginContextProvider, PluginType, RequestContext, UserInfo,
};

use crate::error::ApiError;

/// Everything a handler needs to know about the descriptor it serves
pub struct BackendHandle {
    pub name: String,
    pub group_version: GroupVersion,
    pub plugin_id: String,
    pub plugin_type: PluginType,
    pub plugin: Option<Arc<dyn PluginBackend>>,
    pub contexts: Arc<dyn PluginContextProvider>,
    pub request_timeout: Duration,
    pub body_limit: usize,
}

impl BackendHandle {
    /// Plugin execution backend for admission and query calls
    pub fn plugin(&self) -> Result<&Arc<dyn PluginBackend>, ApiError> {
        self.plugin
            .as_ref()
            .ok_or_else(|| ApiError::internal(format!("no plugin backend for {}", self.plugin_id)))
    }

    /// Call context for one inbound request
    pub fn request_context(&self, extensions: &Extensions) -> RequestContext {
        request_context(extensions, self.request_timeout)
    }
}

/// Build a call context from the identity the auth layer attached
pub fn request_context(extensions: &Extensions, timeout: Duration) -> RequestContext {
    let user = extensions.get::<UserInfo>().cloned();
    let ctx = RequestContext::new(user);
    if timeout.is_zero() {
        ctx
    } else {
        ctx.with_timeout(timeout)
    }
}

/// Whether the request body is declared as JSON (`application/json`, any
/// parameters)
pub fn is_json_content(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|essence| essence.trim().eq_ignore_ascii_case("application/json"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn json_content_type_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_json_content(&headers));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json; charset=utf-8"));
        assert!(is_json_content(&headers));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/yaml"));
        assert!(!is_json_content(&headers));
    }

    #[test]
    fn context_picks_up_user() {
        let mut ext = Extensions::new();
        ext.insert(UserInfo::new("bob"));
        let ctx = request_context(&ext, Duration::from_secs(5));
        assert_eq!(ctx.user().unwrap().name, "bob");
        assert!(ctx.deadline().is_some());
        assert!(request_context(&Extensions::new(), Duration::ZERO)
            .deadline()
            .is_none());
    }
}
