//! dpa-proxy - Outbound paths of the data plane aggregator
//!
//! Holds everything that talks to a backend: the identity-propagating
//! reverse proxy for `route` services of `http` backends (with its
//! upgrade-aware tunnel), the resource-call bridge for `plugin` backends,
//! and an HTTP client implementing the plugin execution backend.

mod error;
pub mod headers;
mod metrics;
mod plugin_client;
mod resolver;
mod resource;
mod route_proxy;
mod transport;
mod upgrade;

pub use error::ProxyError;
pub use metrics::{encode_metrics, ProxyMetrics};
pub use plugin_client::HttpPluginBackend;
pub use resolver::{StaticBackendResolver, StaticContextProvider};
pub use resource::{PluginResourceProxy, DEFAULT_RESOURCE_BODY_LIMIT};
pub use route_proxy::RouteProxy;
pub use transport::{streaming_body, TracingTransport};
pub use upgrade::UpgradeDialer;
