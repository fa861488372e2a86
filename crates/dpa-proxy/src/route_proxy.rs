//! RouteProxy - reverse proxy for `route` services of `http` backends

use axum::body::Body;
use axum::http::{header, Request, Response};
use axum::response::IntoResponse;
use dpa_core::RequestContext;
use tracing::instrument;
use url::Url;

use crate::error::ProxyError;
use crate::headers;
use crate::metrics::ProxyMetrics;
use crate::transport::{self, TracingTransport};
use crate::upgrade::UpgradeDialer;

/// Proxies requests under one `/apis/{group}/{version}` mount to a backend
/// origin, forwarding the path suffix after the mount.
#[derive(Clone)]
pub struct RouteProxy {
    mount: String,
    base_url: Url,
    transport: TracingTransport,
    dialer: UpgradeDialer,
    metrics: ProxyMetrics,
}

impl RouteProxy {
    /// `mount` is the `/apis/{group}/{version}` prefix stripped from inbound
    /// paths; `base_url` is the origin the suffix is appended to.
    pub fn new(
        mount: &str,
        base_url: &str,
        transport: TracingTransport,
        dialer: UpgradeDialer,
        metrics: ProxyMetrics,
    ) -> Result<Self, ProxyError> {
        let parsed = Url::parse(base_url).map_err(|e| ProxyError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: e.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host().is_none() {
            return Err(ProxyError::InvalidBaseUrl {
                url: base_url.to_string(),
                reason: "expected an absolute http(s) URL".to_string(),
            });
        }
        Ok(Self {
            mount: mount.trim_end_matches('/').to_string(),
            base_url: parsed,
            transport,
            dialer,
            metrics,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Target URL for an inbound path and raw query string.
    ///
    /// The base URL path and the suffix after the mount are joined with a
    /// single `/`; the query string is carried over unchanged.
    pub fn target_url(&self, path: &str, query: Option<&str>) -> Url {
        let suffix = path.strip_prefix(self.mount.as_str()).unwrap_or(path);
        let mut url = self.base_url.clone();
        let joined = format!("{}{}", self.base_url.path().trim_end_matches('/'), suffix);
        url.set_path(&joined);
        url.set_query(query);
        url
    }

    /// Proxy one request. Failures are rendered as status objects.
    #[instrument(
        name = "route_proxy",
        skip_all,
        fields(method = %req.method(), path = %req.uri().path(), error = tracing::field::Empty)
    )]
    pub async fn forward(&self, ctx: &RequestContext, req: Request<Body>) -> Response<Body> {
        let response = match self.try_forward(ctx, req).await {
            Ok(response) => response,
            Err(e) => {
                if matches!(e, ProxyError::MissingUser) {
                    self.metrics.record_missing_user();
                }
                tracing::Span::current().record("error", tracing::field::display(&e));
                tracing::warn!(error = %e, "Route proxy request failed");
                e.into_response()
            }
        };
        self.metrics.record_response(response.status().as_u16());
        response
    }

    async fn try_forward(
        &self,
        ctx: &RequestContext,
        mut req: Request<Body>,
    ) -> Result<Response<Body>, ProxyError> {
        let user = ctx.user().ok_or(ProxyError::MissingUser)?;
        let target = self.target_url(req.uri().path(), req.uri().query());

        if headers::is_upgrade_request(req.headers()) {
            // The dialer bypasses the transport, so identity goes on first
            headers::set_identity_headers(req.headers_mut(), user)?;
            tracing::debug!(target_url = %target, "Proxying upgrade request");
            return self.dialer.proxy(req, target).await;
        }

        let (parts, body) = req.into_parts();
        let mut outbound_headers = parts.headers;
        headers::strip_hop_by_hop(&mut outbound_headers);
        outbound_headers.remove(header::HOST);

        let request = self
            .transport
            .client()
            .request(parts.method, target)
            .headers(outbound_headers)
            .body(transport::streaming_body(body))
            .build()?;

        let upstream = self.transport.execute(ctx, request).await?;

        let mut response = Response::builder().status(upstream.status());
        if let Some(response_headers) = response.headers_mut() {
            response_headers.extend(upstream.headers().clone());
            headers::strip_hop_by_hop(response_headers);
        }
        response
            .body(Body::from_stream(upstream.bytes_stream()))
            .map_err(|e| ProxyError::Upstream(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(base_url: &str) -> RouteProxy {
        RouteProxy::new(
            "/apis/testds.example.com/v1",
            base_url,
            TracingTransport::new().unwrap(),
            UpgradeDialer::new().unwrap(),
            ProxyMetrics::new().unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn joins_base_path_and_suffix() {
        let p = proxy("http://127.0.0.1:9000/api/");
        let url = p.target_url(
            "/apis/testds.example.com/v1/namespaces/default/test/123/example",
            Some("watch=true&limit=5"),
        );
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:9000/api/namespaces/default/test/123/example?watch=true&limit=5"
        );
    }

    #[test]
    fn root_base_url() {
        let p = proxy("http://backend:8080");
        let url = p.target_url("/apis/testds.example.com/v1/namespaces/ns/x", None);
        assert_eq!(url.as_str(), "http://backend:8080/namespaces/ns/x");
    }

    #[test]
    fn rejects_unusable_base_urls() {
        for bad in ["not a url", "ftp://host/x", "unix:/var/run/sock"] {
            let err = RouteProxy::new(
                "/apis/g/v1",
                bad,
                TracingTransport::new().unwrap(),
                UpgradeDialer::new().unwrap(),
                ProxyMetrics::new().unwrap(),
            )
            .err()
            .unwrap();
            assert!(matches!(err, ProxyError::InvalidBaseUrl { .. }), "{}", bad);
        }
    }

    #[tokio::test]
    async fn missing_user_is_500_and_counted() {
        let p = proxy("http://127.0.0.1:9");
        let req = Request::builder()
            .uri("/apis/testds.example.com/v1/namespaces/default/x")
            .body(Body::empty())
            .unwrap();
        let resp = p.forward(&RequestContext::background(), req).await;
        assert_eq!(resp.status().as_u16(), 500);
        assert_eq!(p.metrics.missing_user_total(), 1);
        assert_eq!(p.metrics.requests_total(500), 1);
    }
}
