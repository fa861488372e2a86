//! Periodic backend health probe feeding the `Available` condition

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dpa_core::models::CONDITION_AVAILABLE;
use dpa_core::{
    BackendDescriptor, BackendError, BackendKind, BackendResolver, BackendResult, Condition,
    ConditionStatus, HealthStatus, PluginContextProvider, RequestContext, ResourceSource,
    StatusWriter,
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const REASON_HEALTHY: &str = "BackendHealthy";
pub const REASON_UNHEALTHY: &str = "BackendUnhealthy";

/// `[availability]` config section
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AvailabilityConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Per-probe deadline
    pub timeout_secs: u64,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            timeout_secs: 5,
        }
    }
}

/// Outcome of probing one backend
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub healthy: bool,
    pub message: String,
}

impl ProbeResult {
    fn healthy(message: impl Into<String>) -> Self {
        Self {
            healthy: true,
            message: message.into(),
        }
    }

    fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
        }
    }

    pub fn condition(&self) -> Condition {
        Condition {
            condition_type: CONDITION_AVAILABLE.to_string(),
            status: if self.healthy {
                ConditionStatus::True
            } else {
                ConditionStatus::False
            },
            reason: Some(
                if self.healthy {
                    REASON_HEALTHY
                } else {
                    REASON_UNHEALTHY
                }
                .to_string(),
            ),
            message: Some(self.message.clone()),
            last_transition_time: None,
        }
    }
}

pub struct AvailabilityChecker {
    source: Arc<dyn ResourceSource>,
    writer: Arc<dyn StatusWriter>,
    resolver: Arc<dyn BackendResolver>,
    contexts: Arc<dyn PluginContextProvider>,
    client: reqwest::Client,
    config: AvailabilityConfig,
}

impl AvailabilityChecker {
    pub fn new(
        source: Arc<dyn ResourceSource>,
        writer: Arc<dyn StatusWriter>,
        resolver: Arc<dyn BackendResolver>,
        contexts: Arc<dyn PluginContextProvider>,
        config: AvailabilityConfig,
    ) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BackendError::Internal(format!("Failed to create probe client: {}", e)))?;
        Ok(Self {
            source,
            writer,
            resolver,
            contexts,
            client,
            config,
        })
    }

    /// Probe on every interval until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("Availability checking disabled");
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.check_all(&shutdown).await {
                        Ok(updated) => debug!(updated, "Availability pass complete"),
                        Err(e) => warn!(error = %e, "Availability pass failed"),
                    }
                }
            }
        }
        debug!("Availability checker stopped");
    }

    /// Probe every descriptor once. Returns how many statuses were written.
    pub async fn check_all(&self, shutdown: &CancellationToken) -> BackendResult<usize> {
        let mut updated = 0;
        for descriptor in self.source.list().await? {
            if shutdown.is_cancelled() {
                break;
            }
            let probe = self.probe(&descriptor, shutdown).await;
            let mut status = descriptor.status.clone();
            if !status.set_condition(probe.condition(), Utc::now()) {
                continue;
            }
            match self.writer.update_status(descriptor.name(), status).await {
                Ok(()) => {
                    updated += 1;
                    info!(
                        descriptor = %descriptor.name(),
                        healthy = probe.healthy,
                        message = %probe.message,
                        "Availability changed"
                    );
                }
                Err(e) => {
                    warn!(descriptor = %descriptor.name(), error = %e, "Status update failed")
                }
            }
        }
        Ok(updated)
    }

    pub async fn probe(&self, descriptor: &BackendDescriptor, shutdown: &CancellationToken) -> ProbeResult {
        let ctx = RequestContext::background()
            .with_parent(shutdown)
            .with_timeout(Duration::from_secs(self.config.timeout_secs));
        let result = match descriptor.spec.backend.kind {
            BackendKind::Http => self.probe_http(descriptor, &ctx).await,
            BackendKind::Plugin => self.probe_plugin(descriptor, &ctx).await,
        };
        result.unwrap_or_else(|e| ProbeResult::unhealthy(e.to_string()))
    }

    async fn probe_http(
        &self,
        descriptor: &BackendDescriptor,
        ctx: &RequestContext,
    ) -> BackendResult<ProbeResult> {
        let base = descriptor
            .spec
            .backend
            .base_url
            .as_deref()
            .ok_or_else(|| BackendError::InvalidRequest("http backend has no baseURL".into()))?;
        let url = format!("{}/healthz", base.trim_end_matches('/'));
        let response = ctx
            .run(async {
                self.client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| BackendError::Transport(e.to_string()))
            })
            .await?;
        let status = response.status();
        Ok(if status.is_success() {
            ProbeResult::healthy(format!("{} answered {}", url, status.as_u16()))
        } else {
            ProbeResult::unhealthy(format!("{} answered {}", url, status.as_u16()))
        })
    }

    async fn probe_plugin(
        &self,
        descriptor: &BackendDescriptor,
        ctx: &RequestContext,
    ) -> BackendResult<ProbeResult> {
        let plugin_id = &descriptor.spec.plugin_id;
        let backend = self.resolver.resolve(plugin_id)?;
        let plugin_context = self.contexts.plugin_context(ctx, plugin_id, None).await?;
        let health = ctx.run(backend.check_health(ctx, plugin_context)).await?;
        Ok(match health.status {
            HealthStatus::Ok => ProbeResult::healthy(health.message),
            HealthStatus::Error | HealthStatus::Unknown => ProbeResult::unhealthy(health.message),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_reasons() {
        let up = ProbeResult::healthy("ok").condition();
        assert_eq!(up.status, ConditionStatus::True);
        assert_eq!(up.reason.as_deref(), Some(REASON_HEALTHY));

        let down = ProbeResult::unhealthy("refused").condition();
        assert_eq!(down.status, ConditionStatus::False);
        assert_eq!(down.reason.as_deref(), Some(REASON_UNHEALTHY));
        assert_eq!(down.message.as_deref(), Some("refused"));
    }
}
