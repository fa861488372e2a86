//! Live routing table
//!
//! The registry is written by exactly one task (the reconciliation worker)
//! and read by every inbound request. Readers take a single atomic load of
//! the current [`RegistrySnapshot`]; writers build a new snapshot and swap it
//! in. Replacing the dispatcher of an existing entry does not touch the
//! snapshot at all: the entry's own dispatcher pointer is swapped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use axum::extract::Request;
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dpa_core::routing::{parse_descriptor_name, split_api_path, APIS_PREFIX};
use dpa_core::{BackendDescriptor, GroupVersion, RegistryError, RouteRegistrar};
use tower::ServiceExt;

use crate::dispatcher::{BackendDispatcher, DispatcherFactory};
use crate::handlers::discovery_docs;

/// One registered descriptor
pub struct RouteEntry {
    name: String,
    group_version: GroupVersion,
    dispatcher: ArcSwap<BackendDispatcher>,
}

impl RouteEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group_version(&self) -> &GroupVersion {
        &self.group_version
    }

    pub fn dispatcher(&self) -> Arc<BackendDispatcher> {
        self.dispatcher.load_full()
    }
}

/// Immutable view of the table
#[derive(Default, Clone)]
pub struct RegistrySnapshot {
    entries: HashMap<String, Arc<RouteEntry>>,
    /// `/apis/{group}/{version}` prefix mounts
    mounts: HashMap<GroupVersion, Arc<RouteEntry>>,
    /// group -> registered versions; a group is mounted while non-empty
    groups: BTreeMap<String, BTreeSet<String>>,
}

impl RegistrySnapshot {
    pub fn entry(&self, name: &str) -> Option<&Arc<RouteEntry>> {
        self.entries.get(name)
    }

    pub fn mount(&self, group: &str, version: &str) -> Option<&Arc<RouteEntry>> {
        self.mounts.get(&GroupVersion::new(group, version))
    }

    pub fn group_versions(&self, group: &str) -> Option<&BTreeSet<String>> {
        self.groups.get(group)
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mount count per group/version prefix never exceeds one, and every
    /// mount belongs to a listed group version
    pub fn is_consistent(&self) -> bool {
        self.mounts.len() == self.entries.len()
            && self.mounts.iter().all(|(gv, entry)| {
                entry.group_version == *gv
                    && self
                        .groups
                        .get(&gv.group)
                        .is_some_and(|versions| versions.contains(&gv.version))
            })
            && self.groups.values().all(|versions| !versions.is_empty())
            && self.groups.values().map(BTreeSet::len).sum::<usize>() == self.mounts.len()
    }
}

pub struct ProxyRegistry {
    factory: DispatcherFactory,
    snapshot: ArcSwap<RegistrySnapshot>,
}

impl ProxyRegistry {
    pub fn new(factory: DispatcherFactory) -> Self {
        Self {
            factory,
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
        }
    }

    /// Current table; one atomic load
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    pub fn factory(&self) -> &DispatcherFactory {
        &self.factory
    }

    /// Route a request under `/apis` to its entry, or to the delegate
    pub async fn dispatch(&self, req: Request) -> Response {
        let snapshot = self.snapshot.load_full();
        let path = req.uri().path();

        if let Some(group) = group_path(path) {
            if let Some(versions) = snapshot.group_versions(group) {
                if req.method() == Method::GET {
                    let doc = discovery_docs::group_document(group, versions.iter().cloned());
                    return Json(doc).into_response();
                }
            }
        }

        let entry = split_api_path(path).and_then(|(group, version, _)| snapshot.mount(group, version).cloned());
        // Release the snapshot before awaiting; the entry keeps what it needs
        drop(snapshot);

        match entry {
            Some(entry) => entry.dispatcher().dispatch(req).await,
            None => match self.factory.delegate().clone().oneshot(req).await {
                Ok(response) => response,
                Err(never) => match never {},
            },
        }
    }
}

/// `/apis/{group}` or `/apis/{group}/`
fn group_path(path: &str) -> Option<&str> {
    let rest = path.strip_prefix(APIS_PREFIX)?.strip_prefix('/')?;
    let group = rest.strip_suffix('/').unwrap_or(rest);
    if group.is_empty() || group.contains('/') {
        None
    } else {
        Some(group)
    }
}

impl RouteRegistrar for ProxyRegistry {
    fn register(&self, descriptor: &BackendDescriptor) -> Result<(), RegistryError> {
        let dispatcher = Arc::new(self.factory.build(descriptor)?);
        let current = self.snapshot.load();

        if let Some(entry) = current.entry(descriptor.name()) {
            entry.dispatcher.store(dispatcher);
            tracing::info!(descriptor = %descriptor.name(), "Route entry replaced");
            return Ok(());
        }

        let group_version = descriptor.group_version();
        let entry = Arc::new(RouteEntry {
            name: descriptor.name().to_string(),
            group_version: group_version.clone(),
            dispatcher: ArcSwap::new(dispatcher),
        });

        let mut next = RegistrySnapshot::clone(&current);
        next.entries.insert(entry.name.clone(), entry.clone());
        next.mounts.insert(group_version.clone(), entry);
        next.groups
            .entry(group_version.group.clone())
            .or_default()
            .insert(group_version.version.clone());
        self.snapshot.store(Arc::new(next));

        tracing::info!(
            descriptor = %descriptor.name(),
            prefix = %group_version.path_prefix(),
            "Route entry registered"
        );
        Ok(())
    }

    fn unregister(&self, name: &str) -> Result<(), RegistryError> {
        let current = self.snapshot.load();
        if current.entry(name).is_none() {
            tracing::debug!(descriptor = %name, "Unregister of unknown entry ignored");
            return Ok(());
        }
        let group_version = parse_descriptor_name(name)?;

        let mut next = RegistrySnapshot::clone(&current);
        next.entries.remove(name);
        next.mounts.remove(&group_version);
        let group_empty = match next.groups.get_mut(&group_version.group) {
            Some(versions) => {
                versions.remove(&group_version.version);
                versions.is_empty()
            }
            None => false,
        };
        if group_empty {
            next.groups.remove(&group_version.group);
        }
        self.snapshot.store(Arc::new(next));

        tracing::info!(
            descriptor = %name,
            group_removed = group_empty,
            "Route entry unregistered"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_path_matching() {
        assert_eq!(group_path("/apis/g.example"), Some("g.example"));
        assert_eq!(group_path("/apis/g.example/"), Some("g.example"));
        assert_eq!(group_path("/apis/g.example/v1"), None);
        assert_eq!(group_path("/apis"), None);
        assert_eq!(group_path("/apis/"), None);
    }
}
