//! Discovery documents in the legacy flat shape and the aggregated
//! versioned shape

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `as=` parameter selecting the aggregated discovery document
pub const AGGREGATED_DISCOVERY_AS: &str = "APIGroupDiscoveryList";

/// Content type of the aggregated discovery document
pub const AGGREGATED_DISCOVERY_CONTENT_TYPE: &str =
    "application/json;g=apidiscovery.k8s.io;v=v2;as=APIGroupDiscoveryList";

pub const AGGREGATED_DISCOVERY_API_VERSION: &str = "apidiscovery.k8s.io/v2";

// =============================================================================
// Legacy format
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct APIGroupList {
    #[serde(default = "group_list_kind")]
    pub kind: String,
    #[serde(default = "v1")]
    pub api_version: String,
    #[serde(default)]
    pub groups: Vec<APIGroup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct APIGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub name: String,
    #[serde(default)]
    pub versions: Vec<GroupVersionForDiscovery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_version: Option<GroupVersionForDiscovery>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersionForDiscovery {
    pub group_version: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct APIResourceList {
    #[serde(default = "resource_list_kind")]
    pub kind: String,
    #[serde(default = "v1")]
    pub api_version: String,
    pub group_version: String,
    #[serde(default)]
    pub resources: Vec<Value>,
}

fn group_list_kind() -> String {
    "APIGroupList".to_string()
}

fn resource_list_kind() -> String {
    "APIResourceList".to_string()
}

fn v1() -> String {
    "v1".to_string()
}

impl APIGroupList {
    pub fn new(groups: Vec<APIGroup>) -> Self {
        Self {
            kind: group_list_kind(),
            api_version: v1(),
            groups,
        }
    }
}

impl APIGroup {
    /// Build a group document. `versions` must already be ordered with the
    /// preferred version first.
    pub fn new(name: &str, versions: &[String]) -> Self {
        let versions: Vec<_> = versions
            .iter()
            .map(|v| GroupVersionForDiscovery {
                group_version: format!("{}/{}", name, v),
                version: v.clone(),
            })
            .collect();
        Self {
            kind: Some("APIGroup".to_string()),
            api_version: Some(v1()),
            name: name.to_string(),
            preferred_version: versions.first().cloned(),
            versions,
        }
    }

    /// Same document without the `kind`/`apiVersion` header, as embedded in
    /// an `APIGroupList`.
    pub fn into_list_item(mut self) -> Self {
        self.kind = None;
        self.api_version = None;
        self
    }
}

impl APIResourceList {
    pub fn new(group_version: &str) -> Self {
        Self {
            kind: resource_list_kind(),
            api_version: v1(),
            group_version: group_version.to_string(),
            resources: Vec::new(),
        }
    }
}

// =============================================================================
// Aggregated format
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct APIGroupDiscoveryList {
    #[serde(default = "aggregated_list_kind")]
    pub kind: String,
    #[serde(default = "aggregated_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub metadata: DiscoveryMeta,
    #[serde(default)]
    pub items: Vec<APIGroupDiscovery>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct APIGroupDiscovery {
    #[serde(default)]
    pub metadata: DiscoveryMeta,
    #[serde(default)]
    pub versions: Vec<APIVersionDiscovery>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct APIVersionDiscovery {
    pub version: String,
    #[serde(default)]
    pub resources: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub freshness: Option<String>,
}

fn aggregated_list_kind() -> String {
    AGGREGATED_DISCOVERY_AS.to_string()
}

fn aggregated_api_version() -> String {
    AGGREGATED_DISCOVERY_API_VERSION.to_string()
}

impl APIGroupDiscoveryList {
    pub fn new(items: Vec<APIGroupDiscovery>) -> Self {
        Self {
            kind: aggregated_list_kind(),
            api_version: aggregated_api_version(),
            metadata: DiscoveryMeta::default(),
            items,
        }
    }
}

impl APIGroupDiscovery {
    pub fn new(name: &str, versions: &[String]) -> Self {
        Self {
            metadata: DiscoveryMeta {
                name: Some(name.to_string()),
            },
            versions: versions
                .iter()
                .map(|v| APIVersionDiscovery {
                    version: v.clone(),
                    resources: Vec::new(),
                    freshness: Some("Current".to_string()),
                })
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }
}
