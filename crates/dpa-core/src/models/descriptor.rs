//! BackendDescriptor resource model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::routing::{self, GroupVersion};

/// Condition type written by the availability checker
pub const CONDITION_AVAILABLE: &str = "Available";

/// Declarative resource describing a backend and the routes it serves.
///
/// The name is always `"{version}.{group}"`, so one descriptor owns exactly
/// one group/version prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub metadata: ObjectMeta,
    pub spec: DescriptorSpec,
    #[serde(default)]
    pub status: DescriptorStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    /// Opaque version assigned by the store on every write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorSpec {
    #[serde(rename = "pluginID")]
    pub plugin_id: String,
    pub plugin_type: PluginType,
    pub group: String,
    pub version: String,
    pub backend: BackendRef,
    #[serde(default)]
    pub services: Vec<ServiceDeclaration>,
}

/// Kind of plugin fronted by a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    App,
    Datasource,
}

/// Where calls for this descriptor are executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRef {
    #[serde(rename = "type")]
    pub kind: BackendKind,
    #[serde(rename = "baseURL", default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Plugin process reached through the plugin execution backend
    Plugin,
    /// Plain HTTP origin
    Http,
}

/// One service a backend offers under its group/version prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDeclaration {
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceType {
    Admission,
    Conversion,
    Query,
    Route,
    Stream,
    DatasourceProxy,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Admission => "admission",
            ServiceType::Conversion => "conversion",
            ServiceType::Query => "query",
            ServiceType::Route => "route",
            ServiceType::Stream => "stream",
            ServiceType::DatasourceProxy => "datasource-proxy",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DescriptorStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl BackendDescriptor {
    /// Create a descriptor with a well-formed name and no services
    pub fn new(
        group: &str,
        version: &str,
        plugin_id: &str,
        plugin_type: PluginType,
        backend: BackendRef,
    ) -> Self {
        Self {
            metadata: ObjectMeta {
                name: routing::descriptor_name(group, version),
                resource_version: None,
            },
            spec: DescriptorSpec {
                plugin_id: plugin_id.to_string(),
                plugin_type,
                group: group.to_string(),
                version: version.to_string(),
                backend,
                services: Vec::new(),
            },
            status: DescriptorStatus::default(),
        }
    }

    /// Append a service declaration (builder style)
    pub fn with_service(
        mut self,
        service_type: ServiceType,
        method: Option<&str>,
        path: Option<&str>,
    ) -> Self {
        self.spec.services.push(ServiceDeclaration {
            service_type,
            method: method.map(str::to_string),
            path: path.map(str::to_string),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn group_version(&self) -> GroupVersion {
        GroupVersion::new(&self.spec.group, &self.spec.version)
    }

    /// Current `Available` condition, if any
    pub fn available_condition(&self) -> Option<&Condition> {
        self.status
            .conditions
            .iter()
            .find(|c| c.condition_type == CONDITION_AVAILABLE)
    }
}

impl BackendRef {
    pub fn plugin() -> Self {
        Self {
            kind: BackendKind::Plugin,
            base_url: None,
        }
    }

    pub fn http(base_url: &str) -> Self {
        Self {
            kind: BackendKind::Http,
            base_url: Some(base_url.to_string()),
        }
    }
}

impl DescriptorStatus {
    /// Insert or replace a condition of the same type.
    ///
    /// `lastTransitionTime` is carried over from the existing condition
    /// unless the status value changed. Returns `true` when anything changed.
    pub fn set_condition(&mut self, mut condition: Condition, now: DateTime<Utc>) -> bool {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            Some(existing) => {
                if existing.status == condition.status {
                    condition.last_transition_time = existing.last_transition_time;
                } else {
                    condition.last_transition_time = Some(now);
                }
                if *existing == condition {
                    return false;
                }
                *existing = condition;
                true
            }
            None => {
                condition.last_transition_time = Some(now);
                self.conditions.push(condition);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn deserializes_wire_shape() {
        let json = r#"{
            "metadata": {"name": "v1.testds.example.com"},
            "spec": {
                "pluginID": "testds",
                "pluginType": "datasource",
                "group": "testds.example.com",
                "version": "v1",
                "backend": {"type": "http", "baseURL": "http://127.0.0.1:9000/api"},
                "services": [
                    {"type": "route", "method": "GET", "path": "/test/{name}/example"},
                    {"type": "datasource-proxy"}
                ]
            }
        }"#;

        let d: BackendDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(d.name(), "v1.testds.example.com");
        assert_eq!(d.spec.plugin_type, PluginType::Datasource);
        assert_eq!(d.spec.backend.kind, BackendKind::Http);
        assert_eq!(
            d.spec.backend.base_url.as_deref(),
            Some("http://127.0.0.1:9000/api")
        );
        assert_eq!(d.spec.services[1].service_type, ServiceType::DatasourceProxy);
        assert!(d.status.conditions.is_empty());
    }

    #[test]
    fn builder_produces_canonical_name() {
        let d = BackendDescriptor::new(
            "foo.example.com",
            "v2",
            "foo-app",
            PluginType::App,
            BackendRef::plugin(),
        )
        .with_service(ServiceType::Admission, None, None);
        assert_eq!(d.name(), "v2.foo.example.com");
        assert_eq!(d.group_version().to_string(), "foo.example.com/v2");
        assert_eq!(d.spec.services.len(), 1);
    }

    fn available(status: ConditionStatus, reason: &str) -> Condition {
        Condition {
            condition_type: CONDITION_AVAILABLE.to_string(),
            status,
            reason: Some(reason.to_string()),
            message: None,
            last_transition_time: None,
        }
    }

    #[test]
    fn set_condition_keeps_transition_time_when_status_unchanged() {
        let t0 = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let t1 = DateTime::parse_from_rfc3339("2024-01-01T00:05:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let mut status = DescriptorStatus::default();
        assert!(status.set_condition(available(ConditionStatus::True, "BackendHealthy"), t0));
        assert!(!status.set_condition(available(ConditionStatus::True, "BackendHealthy"), t1));
        assert_eq!(status.conditions[0].last_transition_time, Some(t0));

        assert!(status.set_condition(available(ConditionStatus::False, "BackendUnhealthy"), t1));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].last_transition_time, Some(t1));
    }
}
