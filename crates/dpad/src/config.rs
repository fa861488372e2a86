//! Daemon configuration
//!
//! Every section is optional; a missing file means all defaults.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use dpa_api::{DEFAULT_BODY_LIMIT, DEFAULT_REQUEST_TIMEOUT};
use dpa_core::{BackendDescriptor, UserInfo};
use dpa_gateway::{AvailabilityConfig, ControllerConfig};
use serde::Deserialize;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:8443";
pub const DEFAULT_FILTER: &str = "dpad=info,dpa_api=info,dpa_gateway=info,dpa_proxy=info";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub discovery: DiscoveryConfig,
    pub delegate: DelegateConfig,
    pub controller: ControllerConfig,
    pub availability: AvailabilityConfig,
    pub auth: AuthConfig,
    /// Plugin execution endpoints by plugin id
    pub plugins: BTreeMap<String, PluginEndpoint>,
    /// File seeding the descriptor store, relative to the config file
    pub descriptors: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Deadline for backend calls; 0 disables it
    pub request_timeout_secs: u64,
    pub body_limit_bytes: usize,
    pub org_id: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8443)),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            body_limit_bytes: DEFAULT_BODY_LIMIT,
            org_id: 1,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` wins when set
    pub filter: Option<String>,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub local_group: String,
    pub local_versions: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            local_group: "aggregation.example".to_string(),
            local_versions: vec!["v0alpha1".to_string()],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DelegateConfig {
    /// Reverse-proxied when set; otherwise unmatched requests get a 404
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: Vec<TokenEntry>,
}

/// One static bearer token and the identity it authenticates as
#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub user: String,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl TokenEntry {
    pub fn user_info(&self) -> UserInfo {
        UserInfo {
            name: self.user.clone(),
            uid: self.uid.clone(),
            groups: self.groups.clone(),
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginEndpoint {
    pub url: String,
}

/// Descriptor seed file
#[derive(Debug, Default, Deserialize)]
struct DescriptorFile {
    #[serde(default, alias = "descriptor")]
    descriptors: Vec<BackendDescriptor>,
}

impl Config {
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.controller.validate()?;
        Ok(config)
    }

    /// Load from `path`, resolving the descriptor file against its directory
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config =
            Self::parse(&content).with_context(|| format!("parsing config {}", path.display()))?;
        if let (Some(descriptors), Some(dir)) = (config.descriptors.as_mut(), path.parent()) {
            if descriptors.is_relative() {
                *descriptors = dir.join(&*descriptors);
            }
        }
        Ok(config)
    }

    pub fn log_filter(&self) -> &str {
        self.logging.filter.as_deref().unwrap_or(DEFAULT_FILTER)
    }

    /// Descriptors to seed the store with; none when no file is configured
    pub fn load_descriptors(&self) -> anyhow::Result<Vec<BackendDescriptor>> {
        let Some(path) = &self.descriptors else {
            return Ok(Vec::new());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading descriptors {}", path.display()))?;
        parse_descriptors(path, &content)
            .with_context(|| format!("parsing descriptors {}", path.display()))
    }
}

/// TOML by default; `.yaml`/`.yml`/`.json` by extension
fn parse_descriptors(path: &Path, content: &str) -> anyhow::Result<Vec<BackendDescriptor>> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let file: DescriptorFile = match ext {
        "yaml" | "yml" => serde_yaml::from_str(content)?,
        "json" => serde_json::from_str(content)?,
        _ => toml::from_str(content)?,
    };
    Ok(file.descriptors)
}
