//! The delegate handler: where requests no descriptor claims end up

use std::time::Duration;

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use axum::Router;
use dpa_api::handlers::request_context;
use dpa_api::ApiError;
use dpa_proxy::{ProxyMetrics, RouteProxy, TracingTransport, UpgradeDialer};

use crate::config::DelegateConfig;

/// Reverse proxy to the configured URL, or a local 404 when there is none
pub fn router(config: &DelegateConfig, request_timeout: Duration) -> anyhow::Result<Router> {
    let Some(url) = &config.url else {
        tracing::info!("No delegate configured, unmatched requests answer 404");
        return Ok(Router::new().fallback(not_found));
    };

    // Unregistered: these counters belong to the route proxies
    let proxy = RouteProxy::new(
        "",
        url,
        TracingTransport::new()?,
        UpgradeDialer::new()?,
        ProxyMetrics::new()?,
    )?;
    tracing::info!(url = %url, "Delegating unmatched requests");

    Ok(Router::new().fallback(move |req: Request| {
        let proxy = proxy.clone();
        async move {
            let ctx = request_context(req.extensions(), request_timeout);
            let _guard = ctx.cancel_on_drop();
            proxy.forward(&ctx, req).await
        }
    }))
}

async fn not_found(req: Request) -> Response {
    ApiError::NotFound(format!(
        "the server could not find the requested resource ({} {})",
        req.method(),
        req.uri().path()
    ))
    .into_response()
}
