//! Custom route services
//!
//! A route is served by the HTTP reverse proxy for `http` backends and by
//! the plugin resource-call primitive for `plugin` backends.

use std::sync::Arc;

use axum::extract::Request;
use axum::response::Response;
use dpa_proxy::{PluginResourceProxy, RouteProxy};

use super::BackendHandle;

#[derive(Clone)]
pub enum RouteTarget {
    Http(RouteProxy),
    Plugin(PluginResourceProxy),
}

pub async fn forward(handle: Arc<BackendHandle>, target: RouteTarget, req: Request) -> Response {
    let ctx = handle.request_context(req.extensions());
    let _guard = ctx.cancel_on_drop();
    match target {
        RouteTarget::Http(proxy) => proxy.forward(&ctx, req).await,
        RouteTarget::Plugin(proxy) => proxy.forward(&ctx, req).await,
    }
}
