//! Declarative resource store contract and an in-memory implementation

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};

use crate::error::{BackendError, BackendResult};
use crate::models::{BackendDescriptor, DescriptorStatus};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Change notification for one descriptor
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(BackendDescriptor),
    Modified(BackendDescriptor),
    Deleted(BackendDescriptor),
}

impl WatchEvent {
    pub fn name(&self) -> &str {
        match self {
            WatchEvent::Added(d) | WatchEvent::Modified(d) | WatchEvent::Deleted(d) => d.name(),
        }
    }
}

/// list/watch/get access to BackendDescriptor resources
#[async_trait]
pub trait ResourceSource: Send + Sync {
    /// Subscribe to change notifications from now on
    fn subscribe(&self) -> broadcast::Receiver<WatchEvent>;

    /// Resolve once the local cache reflects the store
    async fn wait_for_sync(&self);

    async fn list(&self) -> BackendResult<Vec<BackendDescriptor>>;

    async fn get(&self, name: &str) -> BackendResult<Option<BackendDescriptor>>;
}

/// Status subresource writer
#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn update_status(&self, name: &str, status: DescriptorStatus) -> BackendResult<()>;
}

/// In-process store used by the daemon and the tests.
///
/// Every write bumps a store-wide resource version and emits a watch event.
pub struct InMemoryStore {
    items: RwLock<BTreeMap<String, BackendDescriptor>>,
    events: broadcast::Sender<WatchEvent>,
    synced: watch::Sender<bool>,
    revision: AtomicU64,
    failing_lists: AtomicUsize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Empty store that reports itself synced
    pub fn new() -> Self {
        let store = Self::unsynced();
        store.mark_synced();
        store
    }

    /// Empty store whose `wait_for_sync` blocks until [`Self::mark_synced`]
    pub fn unsynced() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (synced, _) = watch::channel(false);
        Self {
            items: RwLock::new(BTreeMap::new()),
            events,
            synced,
            revision: AtomicU64::new(0),
            failing_lists: AtomicUsize::new(0),
        }
    }

    pub fn with_items(items: impl IntoIterator<Item = BackendDescriptor>) -> Self {
        let store = Self::new();
        for item in items {
            store.apply(item);
        }
        store
    }

    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    /// Make the next `n` list calls fail with `Unavailable`
    pub fn fail_next_lists(&self, n: usize) {
        self.failing_lists.store(n, Ordering::SeqCst);
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Create or replace a descriptor, keeping any existing status
    pub fn apply(&self, mut descriptor: BackendDescriptor) {
        descriptor.metadata.resource_version = Some(self.next_revision());
        let event = {
            let mut items = self.items.write();
            match items.get(descriptor.name()) {
                Some(existing) => {
                    if descriptor.status == DescriptorStatus::default() {
                        descriptor.status = existing.status.clone();
                    }
                    items.insert(descriptor.name().to_string(), descriptor.clone());
                    WatchEvent::Modified(descriptor)
                }
                None => {
                    items.insert(descriptor.name().to_string(), descriptor.clone());
                    WatchEvent::Added(descriptor)
                }
            }
        };
        tracing::debug!(name = %event.name(), "Descriptor stored");
        // No receivers is not an error for a store
        let _ = self.events.send(event);
    }

    /// Remove a descriptor; returns the removed value
    pub fn delete(&self, name: &str) -> Option<BackendDescriptor> {
        let removed = self.items.write().remove(name);
        if let Some(d) = &removed {
            tracing::debug!(name = %name, "Descriptor deleted");
            let _ = self.events.send(WatchEvent::Deleted(d.clone()));
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

#[async_trait]
impl ResourceSource for InMemoryStore {
    fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    async fn wait_for_sync(&self) {
        let mut rx = self.synced.subscribe();
        // Sender lives as long as self
        let _ = rx.wait_for(|synced| *synced).await;
    }

    async fn list(&self) -> BackendResult<Vec<BackendDescriptor>> {
        let failing = self
            .failing_lists
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(BackendError::Unavailable("store list failed".to_string()));
        }
        Ok(self.items.read().values().cloned().collect())
    }

    async fn get(&self, name: &str) -> BackendResult<Option<BackendDescriptor>> {
        Ok(self.items.read().get(name).cloned())
    }
}

#[async_trait]
impl StatusWriter for InMemoryStore {
    async fn update_status(&self, name: &str, status: DescriptorStatus) -> BackendResult<()> {
        let updated = {
            let mut items = self.items.write();
            let item = items
                .get_mut(name)
                .ok_or_else(|| BackendError::NotFound(format!("descriptor {}", name)))?;
            item.status = status;
            item.metadata.resource_version = Some(self.next_revision());
            item.clone()
        };
        let _ = self.events.send(WatchEvent::Modified(updated));
        Ok(())
    }
}
