//! Upgrade-aware path: tunnels websocket/SPDY style connections to the origin

use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use reqwest::Client;
use url::Url;

use crate::error::ProxyError;
use crate::transport::DEFAULT_CONNECT_TIMEOUT;

/// Dials the origin over a dedicated HTTP/1.1 client.
///
/// This client bypasses [`crate::TracingTransport`], so identity headers
/// must already be on the request handed to [`UpgradeDialer::proxy`].
#[derive(Clone)]
pub struct UpgradeDialer {
    client: Client,
}

impl UpgradeDialer {
    pub fn new() -> Result<Self, ProxyError> {
        let client = Client::builder()
            .http1_only()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    /// Forward the upgrade handshake and, once both sides switched
    /// protocols, splice the two connections together in a background task.
    pub async fn proxy(&self, mut req: Request<Body>, target: Url) -> Result<Response<Body>, ProxyError> {
        let client_upgrade = hyper::upgrade::on(&mut req);
        let (parts, _body) = req.into_parts();

        let mut headers = parts.headers;
        headers.remove(header::HOST);

        let upstream = self
            .client
            .request(parts.method, target.clone())
            .headers(headers)
            .send()
            .await?;

        if upstream.status() != StatusCode::SWITCHING_PROTOCOLS {
            tracing::warn!(
                origin = %target,
                status = upstream.status().as_u16(),
                "Origin refused upgrade"
            );
            return Err(ProxyError::UpgradeRejected(upstream.status().as_u16()));
        }

        let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in upstream.headers() {
            response = response.header(name, value);
        }
        let response = response
            .body(Body::empty())
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        tokio::spawn(async move {
            let mut upstream_io = match upstream.upgrade().await {
                Ok(io) => io,
                Err(e) => {
                    tracing::warn!(error = %e, "Origin upgrade failed");
                    return;
                }
            };
            let mut client_io = match client_upgrade.await {
                Ok(io) => TokioIo::new(io),
                Err(e) => {
                    tracing::warn!(error = %e, "Client upgrade failed");
                    return;
                }
            };
            match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
                Ok((sent, received)) => {
                    tracing::debug!(origin = %target, sent, received, "Upgraded connection closed");
                }
                Err(e) => tracing::debug!(origin = %target, error = %e, "Upgraded connection ended"),
            }
        });

        Ok(response)
    }
}
