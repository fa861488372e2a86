//! Route services of `plugin` backends, served through the plugin's
//! resource-call primitive instead of an HTTP origin

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{HeaderName, HeaderValue, Request, Response, StatusCode};
use axum::response::IntoResponse;
use dpa_core::{
    BackendError, PluginBackend, PluginContextProvider, RequestContext, ResourceCall,
};
use tracing::instrument;

use crate::error::ProxyError;
use crate::headers;

/// Largest request body buffered for a resource call
pub const DEFAULT_RESOURCE_BODY_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct PluginResourceProxy {
    mount: String,
    plugin_id: String,
    backend: Arc<dyn PluginBackend>,
    contexts: Arc<dyn PluginContextProvider>,
    body_limit: usize,
}

impl PluginResourceProxy {
    pub fn new(
        mount: &str,
        plugin_id: &str,
        backend: Arc<dyn PluginBackend>,
        contexts: Arc<dyn PluginContextProvider>,
    ) -> Self {
        Self {
            mount: mount.trim_end_matches('/').to_string(),
            plugin_id: plugin_id.to_string(),
            backend,
            contexts,
            body_limit: DEFAULT_RESOURCE_BODY_LIMIT,
        }
    }

    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    #[instrument(
        name = "plugin_resource",
        skip_all,
        fields(plugin = %self.plugin_id, method = %req.method(), error = tracing::field::Empty)
    )]
    pub async fn forward(&self, ctx: &RequestContext, req: Request<Body>) -> Response<Body> {
        match self.try_forward(ctx, req).await {
            Ok(response) => response,
            Err(e) => {
                tracing::Span::current().record("error", tracing::field::display(&e));
                tracing::warn!(error = %e, "Plugin resource call failed");
                e.into_response()
            }
        }
    }

    async fn try_forward(
        &self,
        ctx: &RequestContext,
        req: Request<Body>,
    ) -> Result<Response<Body>, ProxyError> {
        if ctx.user().is_none() {
            return Err(ProxyError::MissingUser);
        }
        let (parts, body) = req.into_parts();
        let path = parts
            .uri
            .path()
            .strip_prefix(self.mount.as_str())
            .unwrap_or(parts.uri.path())
            .to_string();

        let mut request_headers = parts.headers;
        headers::strip_hop_by_hop(&mut request_headers);
        headers::strip_identity_headers(&mut request_headers);
        let mut header_map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in &request_headers {
            if let Ok(v) = value.to_str() {
                header_map
                    .entry(name.as_str().to_string())
                    .or_default()
                    .push(v.to_string());
            }
        }

        let body = to_bytes(body, self.body_limit)
            .await
            .map_err(|e| BackendError::InvalidRequest(format!("failed to read body: {}", e)))?;

        let plugin_context = self
            .contexts
            .plugin_context(ctx, &self.plugin_id, None)
            .await?;

        let call = ResourceCall {
            plugin_context,
            method: parts.method.to_string(),
            path,
            query: parts.uri.query().unwrap_or_default().to_string(),
            headers: header_map,
            body: body.to_vec(),
        };

        let reply = self.backend.call_resource(ctx, call).await?;

        let status = StatusCode::from_u16(reply.status).map_err(|_| {
            BackendError::Protocol(format!("invalid status code {}", reply.status))
        })?;
        let mut response = Response::builder().status(status);
        if let Some(out) = response.headers_mut() {
            for (name, values) in &reply.headers {
                let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                    continue;
                };
                for value in values {
                    if let Ok(value) = HeaderValue::from_str(value) {
                        out.append(name.clone(), value);
                    }
                }
            }
            headers::strip_hop_by_hop(out);
        }
        response
            .body(Body::from(reply.body))
            .map_err(|e| ProxyError::Upstream(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticContextProvider;
    use async_trait::async_trait;
    use dpa_core::{BackendResult, ResourceResponse, UserInfo};

    struct Echo;

    #[async_trait]
    impl PluginBackend for Echo {
        fn plugin_id(&self) -> &str {
            "echo"
        }

        async fn call_resource(
            &self,
            _ctx: &RequestContext,
            call: ResourceCall,
        ) -> BackendResult<ResourceResponse> {
            let mut headers = BTreeMap::new();
            headers.insert("x-path".to_string(), vec![call.path.clone()]);
            headers.insert(
                "x-user".to_string(),
                vec![call.plugin_context.user.map(|u| u.name).unwrap_or_default()],
            );
            Ok(ResourceResponse {
                status: 201,
                headers,
                body: call.body,
            })
        }
    }

    fn proxy() -> PluginResourceProxy {
        PluginResourceProxy::new(
            "/apis/app.example.com/v1",
            "echo",
            Arc::new(Echo),
            Arc::new(StaticContextProvider::default()),
        )
    }

    #[tokio::test]
    async fn forwards_suffix_and_body() {
        let ctx = RequestContext::new(Some(UserInfo::new("alice")));
        let req = Request::builder()
            .method("POST")
            .uri("/apis/app.example.com/v1/namespaces/default/things?x=1")
            .body(Body::from("payload"))
            .unwrap();

        let resp = proxy().forward(&ctx, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(resp.headers()["x-path"], "/namespaces/default/things");
        assert_eq!(resp.headers()["x-user"], "alice");
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"payload");
    }

    #[tokio::test]
    async fn requires_user() {
        let req = Request::builder()
            .uri("/apis/app.example.com/v1/namespaces/default/things")
            .body(Body::empty())
            .unwrap();
        let resp = proxy().forward(&RequestContext::background(), req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
