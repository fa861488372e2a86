//! Static lookups from plugin id to backend and plugin context

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dpa_core::{
    BackendError, BackendResolver, BackendResult, DataSourceInstance, PluginBackend,
    PluginContext, PluginContextProvider, RequestContext,
};

/// Backend resolver over a fixed set of plugins known at startup
#[derive(Default, Clone)]
pub struct StaticBackendResolver {
    backends: HashMap<String, Arc<dyn PluginBackend>>,
}

impl StaticBackendResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own plugin id
    pub fn with_backend(mut self, backend: Arc<dyn PluginBackend>) -> Self {
        self.insert(backend);
        self
    }

    pub fn insert(&mut self, backend: Arc<dyn PluginBackend>) {
        self.backends
            .insert(backend.plugin_id().to_string(), backend);
    }

    pub fn plugin_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl BackendResolver for StaticBackendResolver {
    fn resolve(&self, plugin_id: &str) -> BackendResult<Arc<dyn PluginBackend>> {
        self.backends
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("plugin {}", plugin_id)))
    }
}

/// Builds plugin contexts from the request identity without consulting a
/// datasource registry: the datasource instance carries only its uid.
#[derive(Debug, Clone, Default)]
pub struct StaticContextProvider {
    org_id: i64,
}

impl StaticContextProvider {
    pub fn new(org_id: i64) -> Self {
        Self { org_id }
    }
}

#[async_trait]
impl PluginContextProvider for StaticContextProvider {
    async fn plugin_context(
        &self,
        ctx: &RequestContext,
        plugin_id: &str,
        uid: Option<&str>,
    ) -> BackendResult<PluginContext> {
        if plugin_id.is_empty() {
            return Err(BackendError::InvalidRequest("plugin id is required".to_string()));
        }
        Ok(PluginContext {
            org_id: self.org_id,
            plugin_id: plugin_id.to_string(),
            plugin_version: None,
            user: ctx.user().cloned(),
            datasource: uid.map(|uid| DataSourceInstance {
                uid: uid.to_string(),
                ..Default::default()
            }),
        })
    }
}
