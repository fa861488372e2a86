//! dpa-api - HTTP surface of the data plane aggregator
//!
//! Holds the live routing table ([`ProxyRegistry`]), the per-descriptor
//! dispatchers built from declared services, the admission and query
//! handlers, and the discovery merge for `GET /apis`.
//!
//! # Usage
//!
//! ```ignore
//! use dpa_api::{create_router, AppState, DiscoveryManager, DispatcherFactory, ProxyRegistry};
//!
//! let factory = DispatcherFactory::new(resolver, contexts, delegate.clone(), metrics)?;
//! let registry = Arc::new(ProxyRegistry::new(factory));
//! let discovery = Arc::new(DiscoveryManager::new("aggregation.example", &versions, delegate));
//! let router = create_router(AppState::new(registry, discovery, readiness, prometheus));
//! ```

pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod state;

pub use discovery::{DiscoveryManager, DiscoverySource};
pub use dispatcher::{BackendDispatcher, DispatcherFactory, DEFAULT_REQUEST_TIMEOUT};
pub use error::ApiError;
pub use registry::{ProxyRegistry, RegistrySnapshot, RouteEntry};
pub use state::{AppState, DEFAULT_BODY_LIMIT};

use axum::extract::{DefaultBodyLimit, Request};
use axum::middleware;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

/// Create the aggregator router with the given application state.
///
/// Everything that is not a probe endpoint goes through the registry, which
/// hands unmatched requests to the delegate.
pub fn create_router(state: AppState) -> Router {
    let registry = state.registry.clone();

    Router::new()
        .route("/healthz", get(handlers::health::healthz))
        .route("/readyz", get(handlers::health::readyz))
        .route("/metrics", get(handlers::health::metrics))
        .fallback(move |req: Request| async move { registry.dispatch(req).await })
        .layer(middleware::from_fn_with_state(
            state.discovery.clone(),
            discovery::aggregate,
        ))
        .layer(DefaultBodyLimit::max(state.body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
