//! Application state for the aggregator API

use std::sync::Arc;

use dpa_core::Readiness;
use prometheus::Registry;

use crate::discovery::DiscoveryManager;
use crate::registry::ProxyRegistry;

/// Request bodies above this are rejected by body extractors
pub const DEFAULT_BODY_LIMIT: usize = 16 * 1024 * 1024;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Live routing table, written by the reconciliation worker
    pub registry: Arc<ProxyRegistry>,
    pub discovery: Arc<DiscoveryManager>,
    /// Flipped once the first full list pass was applied
    pub readiness: Readiness,
    pub metrics: Registry,
    pub body_limit: usize,
}

impl AppState {
    pub fn new(
        registry: Arc<ProxyRegistry>,
        discovery: Arc<DiscoveryManager>,
        readiness: Readiness,
        metrics: Registry,
    ) -> Self {
        Self {
            registry,
            discovery,
            readiness,
            metrics,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }
}
