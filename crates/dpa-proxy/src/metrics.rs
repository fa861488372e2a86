//! Route proxy metrics

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Counters exported by the route proxy.
///
/// Cloning shares the underlying counters.
#[derive(Clone)]
pub struct ProxyMetrics {
    missing_user: IntCounter,
    requests: IntCounterVec,
}

impl ProxyMetrics {
    /// Create the counters without registering them anywhere
    pub fn new() -> Result<Self, prometheus::Error> {
        let missing_user = IntCounter::with_opts(Opts::new(
            "dpa_route_proxy_missing_user_total",
            "Route proxy requests rejected because no authenticated user was present",
        ))?;
        let requests = IntCounterVec::new(
            Opts::new(
                "dpa_route_proxy_requests_total",
                "Route proxy requests by response code",
            ),
            &["code"],
        )?;
        Ok(Self {
            missing_user,
            requests,
        })
    }

    /// Create the counters and register them in `registry`
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::new()?;
        registry.register(Box::new(metrics.missing_user.clone()))?;
        registry.register(Box::new(metrics.requests.clone()))?;
        Ok(metrics)
    }

    pub fn record_missing_user(&self) {
        self.missing_user.inc();
    }

    pub fn record_response(&self, code: u16) {
        self.requests.with_label_values(&[&code.to_string()]).inc();
    }

    pub fn missing_user_total(&self) -> u64 {
        self.missing_user.get()
    }

    pub fn requests_total(&self, code: u16) -> u64 {
        self.requests.with_label_values(&[&code.to_string()]).get()
    }
}

/// Encode everything in `registry` to the Prometheus text format
pub fn encode_metrics(registry: &Registry) -> Result<String, String> {
    let mut buffer = vec![];
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;
    String::from_utf8(buffer).map_err(|e| format!("Metrics are not UTF-8: {}", e))
}
