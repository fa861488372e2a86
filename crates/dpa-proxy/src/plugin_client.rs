//! HttpPluginBackend - plugin execution backend reached over HTTP.
//!
//! Each call primitive is a JSON `POST` to a fixed path under the plugin's
//! endpoint:
//!
//! | primitive | path |
//! |---|---|
//! | query | `/query` |
//! | mutation admission | `/admission/mutate` |
//! | validation admission | `/admission/validate` |
//! | resource call | `/resource` |
//! | health | `/health` |
//!
//! Failures come back as a status object; its message is preserved.

use std::time::Duration;

use async_trait::async_trait;
use dpa_core::{
    AdmissionCall, BackendError, BackendResult, HealthResult, MutationResult, PluginBackend,
    PluginContext, QueryCall, QueryDataResponse, RequestContext, ResourceCall, ResourceResponse,
    Status, ValidationResult,
};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;
use url::Url;

use crate::error::ProxyError;
use crate::transport::DEFAULT_CONNECT_TIMEOUT;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpPluginBackend {
    plugin_id: String,
    base_url: Url,
    client: Client,
}

impl HttpPluginBackend {
    pub fn new(plugin_id: &str, base_url: &str) -> Result<Self, ProxyError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()?;
        let base_url = Url::parse(base_url).map_err(|e| ProxyError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            plugin_id: plugin_id.to_string(),
            base_url,
            client,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Url {
        let mut url = self.base_url.clone();
        let joined = format!("{}{}", self.base_url.path().trim_end_matches('/'), path);
        url.set_path(&joined);
        url
    }

    async fn call<Req, Resp>(&self, ctx: &RequestContext, path: &str, body: &Req) -> BackendResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = self.endpoint(path);
        tracing::debug!(plugin = %self.plugin_id, url = %url, "Calling plugin");

        ctx.run(async {
            let response = self
                .client
                .post(url)
                .json(body)
                .send()
                .await
                .map_err(|e| BackendError::Transport(e.to_string()))?;

            let status = response.status();
            if status.is_success() {
                response
                    .json::<Resp>()
                    .await
                    .map_err(|e| BackendError::Protocol(format!("invalid plugin response: {}", e)))
            } else {
                Err(extract_error(response, status).await)
            }
        })
        .await
    }
}

async fn extract_error(response: reqwest::Response, status: StatusCode) -> BackendError {
    let message = match response.json::<Status>().await {
        Ok(s) if !s.message.is_empty() => s.message,
        _ => format!("HTTP {}", status),
    };

    match status {
        StatusCode::NOT_FOUND => BackendError::NotFound(message),
        StatusCode::BAD_REQUEST => BackendError::InvalidRequest(message),
        StatusCode::NOT_IMPLEMENTED => BackendError::NotSupported(message),
        StatusCode::SERVICE_UNAVAILABLE => BackendError::Unavailable(message),
        StatusCode::GATEWAY_TIMEOUT => BackendError::DeadlineExceeded,
        _ => BackendError::Internal(message),
    }
}

#[async_trait]
impl PluginBackend for HttpPluginBackend {
    fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    #[instrument(skip_all, fields(plugin = %self.plugin_id))]
    async fn query_data(
        &self,
        ctx: &RequestContext,
        call: QueryCall,
    ) -> BackendResult<QueryDataResponse> {
        self.call(ctx, "/query", &call).await
    }

    #[instrument(skip_all, fields(plugin = %self.plugin_id, operation = %call.operation))]
    async fn mutate_admission(
        &self,
        ctx: &RequestContext,
        call: AdmissionCall,
    ) -> BackendResult<MutationResult> {
        self.call(ctx, "/admission/mutate", &call).await
    }

    #[instrument(skip_all, fields(plugin = %self.plugin_id, operation = %call.operation))]
    async fn validate_admission(
        &self,
        ctx: &RequestContext,
        call: AdmissionCall,
    ) -> BackendResult<ValidationResult> {
        self.call(ctx, "/admission/validate", &call).await
    }

    #[instrument(skip_all, fields(plugin = %self.plugin_id, method = %call.method, path = %call.path))]
    async fn call_resource(
        &self,
        ctx: &RequestContext,
        call: ResourceCall,
    ) -> BackendResult<ResourceResponse> {
        self.call(ctx, "/resource", &call).await
    }

    async fn check_health(
        &self,
        ctx: &RequestContext,
        plugin_context: PluginContext,
    ) -> BackendResult<HealthResult> {
        self.call(ctx, "/health", &plugin_context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_keep_base_path() {
        let backend = HttpPluginBackend::new("foo", "http://plugins.local:7000/foo/").unwrap();
        assert_eq!(
            backend.endpoint("/admission/mutate").as_str(),
            "http://plugins.local:7000/foo/admission/mutate"
        );
        assert_eq!(backend.plugin_id(), "foo");
    }

    #[test]
    fn rejects_bad_url() {
        assert!(HttpPluginBackend::new("foo", "::nope").is_err());
    }
}
