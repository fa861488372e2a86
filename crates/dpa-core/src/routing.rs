//! Naming and path helpers shared by the registry and the controller.
//!
//! A descriptor named `"{version}.{group}"` owns the URL prefix
//! `/apis/{group}/{version}`. These helpers centralise the conversion in both
//! directions so the controller's delete path and the registry agree on it.

use std::cmp::Ordering;
use std::fmt;

use crate::error::RegistryError;
use crate::models::BackendDescriptor;

/// Root of all aggregated API paths
pub const APIS_PREFIX: &str = "/apis";

/// A group/version pair, displayed as `"{group}/{version}"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupVersion {
    pub group: String,
    pub version: String,
}

impl GroupVersion {
    pub fn new(group: &str, version: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
        }
    }

    /// `/apis/{group}/{version}`
    pub fn path_prefix(&self) -> String {
        format!("{}/{}/{}", APIS_PREFIX, self.group, self.version)
    }

    /// `/apis/{group}`
    pub fn group_path(&self) -> String {
        format!("{}/{}", APIS_PREFIX, self.group)
    }
}

impl fmt::Display for GroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.version)
    }
}

/// Canonical descriptor name for a group/version.
///
/// ```
/// # use dpa_core::routing::descriptor_name;
/// assert_eq!(descriptor_name("testds.example.com", "v1"), "v1.testds.example.com");
/// ```
pub fn descriptor_name(group: &str, version: &str) -> String {
    format!("{}.{}", version, group)
}

/// Split `"{version}.{group}"` at the first `.`.
///
/// ```
/// # use dpa_core::routing::parse_descriptor_name;
/// let gv = parse_descriptor_name("v1.testds.example.com").unwrap();
/// assert_eq!(gv.group, "testds.example.com");
/// assert_eq!(gv.version, "v1");
/// assert!(parse_descriptor_name("nodot").is_err());
/// ```
pub fn parse_descriptor_name(name: &str) -> Result<GroupVersion, RegistryError> {
    match name.split_once('.') {
        Some((version, group)) if !version.is_empty() && !group.is_empty() => {
            Ok(GroupVersion::new(group, version))
        }
        _ => Err(RegistryError::InvalidName(name.to_string())),
    }
}

/// Split a request path into `(group, version, suffix)` when it lies under
/// `/apis/{group}/{version}`. The suffix keeps its leading `/` and is empty
/// for the exact mount.
///
/// ```
/// # use dpa_core::routing::split_api_path;
/// assert_eq!(
///     split_api_path("/apis/g.example/v1/namespaces/default/x"),
///     Some(("g.example", "v1", "/namespaces/default/x"))
/// );
/// assert_eq!(split_api_path("/apis/g.example/v1"), Some(("g.example", "v1", "")));
/// assert_eq!(split_api_path("/apis/g.example"), None);
/// ```
pub fn split_api_path(path: &str) -> Option<(&str, &str, &str)> {
    let rest = path.strip_prefix(APIS_PREFIX)?.strip_prefix('/')?;
    let (group, rest) = rest.split_once('/')?;
    let (version, suffix) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    if group.is_empty() || version.is_empty() {
        return None;
    }
    Some((group, version, suffix))
}

/// Stability level parsed out of a Kubernetes-style version string
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Stability {
    Alpha,
    Beta,
    Ga,
}

fn parse_kube_version(v: &str) -> Option<(u32, Stability, u32)> {
    let rest = v.strip_prefix('v')?;
    let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let major: u32 = rest[..digits].parse().ok()?;
    let tail = &rest[digits..];
    if tail.is_empty() {
        return Some((major, Stability::Ga, 0));
    }
    let (stability, minor) = if let Some(m) = tail.strip_prefix("alpha") {
        (Stability::Alpha, m)
    } else if let Some(m) = tail.strip_prefix("beta") {
        (Stability::Beta, m)
    } else {
        return None;
    };
    let minor = if minor.is_empty() { 0 } else { minor.parse().ok()? };
    Some((major, stability, minor))
}

/// Kubernetes version priority: GA before beta before alpha, higher numbers
/// first, non-conforming strings last in lexical order. `Ordering::Less`
/// means `a` is preferred.
pub fn compare_kube_versions(a: &str, b: &str) -> Ordering {
    match (parse_kube_version(a), parse_kube_version(b)) {
        (Some((amaj, astab, amin)), Some((bmaj, bstab, bmin))) => bstab
            .cmp(&astab)
            .then(bmaj.cmp(&amaj))
            .then(bmin.cmp(&amin)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Write side of the routing table.
///
/// The reconciliation controller drives an implementation of this from its
/// single worker; implementations may assume calls are never concurrent.
pub trait RouteRegistrar: Send + Sync {
    /// Build and publish the route entry for a descriptor, replacing any
    /// existing entry of the same name
    fn register(&self, descriptor: &BackendDescriptor) -> Result<(), RegistryError>;

    /// Remove the entry for `name` and its mounts. Unknown names are a no-op.
    fn unregister(&self, name: &str) -> Result<(), RegistryError>;
}
