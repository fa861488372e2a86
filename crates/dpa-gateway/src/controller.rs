//! Reconciliation controller
//!
//! Keeps the routing table in step with the resource store. Watch events
//! are reduced to descriptor names and pushed through a [`WorkQueue`]; one
//! worker pops names, looks the descriptor up and registers or unregisters
//! it. The worker is the only writer of the routing table.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dpa_core::{BackendError, Readiness, RegistryError, ResourceSource, RouteRegistrar};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rate_limit::controller_rate_limiter;
use crate::workqueue::WorkQueue;

/// Controller tuning, as read from the `[controller]` config section
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Pause between failed initial list attempts
    pub list_retry_interval_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_secs: u64,
    /// Overall requeue rate
    pub qps: f64,
    pub burst: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            list_retry_interval_ms: 1000,
            backoff_base_ms: 5,
            backoff_max_secs: 30,
            qps: 10.0,
            burst: 100,
        }
    }
}

impl ControllerConfig {
    pub fn list_retry_interval(&self) -> Duration {
        Duration::from_millis(self.list_retry_interval_ms)
    }

    /// Reject settings the rate limiter cannot pace with
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        if !self.qps.is_finite() || self.qps <= 0.0 {
            return Err(InvalidConfig(format!(
                "qps must be a positive number, got {}",
                self.qps
            )));
        }
        if self.burst == 0 {
            return Err(InvalidConfig("burst must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid controller config: {0}")]
pub struct InvalidConfig(pub String);

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("lookup failed: {0}")]
    Source(#[from] BackendError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub struct Controller {
    source: Arc<dyn ResourceSource>,
    registrar: Arc<dyn RouteRegistrar>,
    readiness: Readiness,
    queue: WorkQueue<String>,
    /// Names currently registered; consulted on relist so deletions missed
    /// during a watch gap are still applied
    known: Mutex<HashSet<String>>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(
        source: Arc<dyn ResourceSource>,
        registrar: Arc<dyn RouteRegistrar>,
        readiness: Readiness,
        config: ControllerConfig,
    ) -> Self {
        let limiter = controller_rate_limiter(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_secs(config.backoff_max_secs),
            config.qps,
            config.burst,
        );
        Self {
            source,
            registrar,
            readiness,
            queue: WorkQueue::new(limiter),
            known: Mutex::new(HashSet::new()),
            config,
        }
    }

    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        // Subscribe before listing so nothing between list and watch is lost
        let mut events = self.source.subscribe();

        tokio::select! {
            _ = self.source.wait_for_sync() => {}
            _ = shutdown.cancelled() => {
                self.queue.shut_down();
                return;
            }
        }

        if !self.initial_sync(&shutdown).await {
            self.queue.shut_down();
            return;
        }

        let worker = tokio::spawn({
            let controller = self.clone();
            async move { controller.work().await }
        });

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => {
                        debug!(descriptor = %event.name(), "Watch event");
                        self.queue.add(event.name().to_string());
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Watch lagged, relisting");
                        self.relist().await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Watch closed");
                        break;
                    }
                },
            }
        }

        self.queue.shut_down();
        if let Err(e) = worker.await {
            warn!(error = %e, "Controller worker ended abnormally");
        }
        info!("Controller stopped");
    }

    /// List and apply everything once, retrying the list until it succeeds.
    /// Returns `false` if shut down first.
    async fn initial_sync(&self, shutdown: &CancellationToken) -> bool {
        loop {
            match self.source.list().await {
                Ok(items) => {
                    let count = items.len();
                    for descriptor in items {
                        let name = descriptor.name().to_string();
                        match self.registrar.register(&descriptor) {
                            Ok(()) => {
                                self.known.lock().insert(name);
                            }
                            Err(e) => {
                                warn!(descriptor = %name, error = %e, "Initial apply failed, requeueing");
                                self.queue.add_rate_limited(name);
                            }
                        }
                    }
                    if self.readiness.signal() {
                        info!(descriptors = count, "Initial reconciliation complete");
                    }
                    return true;
                }
                Err(e) => {
                    warn!(error = %e, "Initial list failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.list_retry_interval()) => {}
                        _ = shutdown.cancelled() => return false,
                    }
                }
            }
        }
    }

    /// Queue every listed and every registered name
    async fn relist(&self) {
        match self.source.list().await {
            Ok(items) => {
                let known: Vec<String> = self.known.lock().iter().cloned().collect();
                for name in items.iter().map(|d| d.name().to_string()).chain(known) {
                    self.queue.add(name);
                }
            }
            Err(e) => warn!(error = %e, "Relist failed"),
        }
    }

    async fn work(&self) {
        while let Some(key) = self.queue.get().await {
            match self.reconcile(&key).await {
                Ok(()) => self.queue.forget(&key),
                Err(e) => {
                    warn!(
                        descriptor = %key,
                        error = %e,
                        requeues = self.queue.num_requeues(&key),
                        "Reconcile failed, requeueing"
                    );
                    self.queue.add_rate_limited(key.clone());
                }
            }
            self.queue.done(&key);
        }
        debug!("Controller worker drained");
    }

    /// Apply the current state of one descriptor to the routing table
    pub async fn reconcile(&self, name: &str) -> Result<(), ReconcileError> {
        match self.source.get(name).await? {
            Some(descriptor) => {
                self.registrar.register(&descriptor)?;
                self.known.lock().insert(name.to_string());
            }
            None => {
                // Names that never registered have nothing to remove
                let registered = self.known.lock().contains(name);
                if registered {
                    self.registrar.unregister(name)?;
                    self.known.lock().remove(name);
                }
            }
        }
        Ok(())
    }
}
