//! Outbound transport for non-upgrade proxy traffic

use std::time::Duration;

use axum::body::{Body, HttpBody};
use bytes::Bytes;
use dpa_core::{BackendError, RequestContext};
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use reqwest::Client;
use tracing::Instrument;

use crate::error::ProxyError;
use crate::headers;

/// Default connect timeout for origin connections
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Wraps the shared HTTP client: every call gets its own tracing span and
/// the caller's identity headers, and is bounded by the request context.
#[derive(Clone)]
pub struct TracingTransport {
    client: Client,
}

impl TracingTransport {
    pub fn new() -> Result<Self, ProxyError> {
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Send `request` with identity headers for the context's user
    pub async fn execute(
        &self,
        ctx: &RequestContext,
        mut request: reqwest::Request,
    ) -> Result<reqwest::Response, ProxyError> {
        let user = ctx.user().ok_or(ProxyError::MissingUser)?;
        headers::set_identity_headers(request.headers_mut(), user)?;

        let span = tracing::info_span!(
            "upstream",
            http.method = %request.method(),
            url.full = %request.url(),
            http.status_code = tracing::field::Empty,
        );

        async move {
            let response = ctx
                .run(async {
                    self.client
                        .execute(request)
                        .await
                        .map_err(|e| BackendError::Transport(e.to_string()))
                })
                .await?;
            tracing::Span::current().record("http.status_code", response.status().as_u16());
            tracing::debug!("Upstream responded");
            Ok(response)
        }
        .instrument(span)
        .await
    }
}

/// Turn an inbound body into a streaming outbound body.
///
/// Chunks are pumped through a bounded channel by a background task, which
/// stops when the origin stops reading or the inbound body ends.
pub fn streaming_body(body: Body) -> reqwest::Body {
    if body.size_hint().exact() == Some(0) {
        return reqwest::Body::from(Bytes::new());
    }
    let (mut tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(8);
    tokio::spawn(async move {
        let mut stream = body.into_data_stream();
        while let Some(chunk) = stream.next().await {
            let item = chunk.map_err(std::io::Error::other);
            let failed = item.is_err();
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });
    reqwest::Body::wrap_stream(rx)
}
