//! Discovery merge for `GET /apis`
//!
//! Two document shapes are served. The aggregated shape
//! (`APIGroupDiscoveryList`) is the union of every registered
//! [`DiscoverySource`]. The legacy shape (`APIGroupList`) is the delegate's
//! own document with the local groups appended.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Router;
use dpa_core::models::{
    AGGREGATED_DISCOVERY_AS, AGGREGATED_DISCOVERY_CONTENT_TYPE,
};
use dpa_core::routing::APIS_PREFIX;
use dpa_core::{APIGroup, APIGroupDiscovery, APIGroupDiscoveryList, APIGroupList, UserInfo};
use tower::ServiceExt;
use tracing::instrument;

use crate::error::ApiError;

/// Largest delegate discovery document accepted
const DISCOVERY_BODY_LIMIT: usize = 8 * 1024 * 1024;

/// A provider of aggregated discovery groups
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    fn name(&self) -> &str;

    async fn groups(&self, user: Option<&UserInfo>) -> Result<Vec<APIGroupDiscovery>, ApiError>;
}

/// Groups served by this process, fixed at construction
pub struct LocalSource {
    groups: Vec<APIGroupDiscovery>,
}

impl LocalSource {
    pub fn new(groups: Vec<APIGroupDiscovery>) -> Self {
        Self { groups }
    }
}

#[async_trait]
impl DiscoverySource for LocalSource {
    fn name(&self) -> &str {
        "local"
    }

    async fn groups(&self, _user: Option<&UserInfo>) -> Result<Vec<APIGroupDiscovery>, ApiError> {
        Ok(self.groups.clone())
    }
}

/// Asks the delegate for its aggregated document
pub struct DelegateSource {
    delegate: Router,
}

impl DelegateSource {
    pub fn new(delegate: Router) -> Self {
        Self { delegate }
    }
}

#[async_trait]
impl DiscoverySource for DelegateSource {
    fn name(&self) -> &str {
        "delegate"
    }

    async fn groups(&self, user: Option<&UserInfo>) -> Result<Vec<APIGroupDiscovery>, ApiError> {
        let response = call_delegate(&self.delegate, AGGREGATED_DISCOVERY_CONTENT_TYPE, user).await;
        if !response.status().is_success() {
            return Err(ApiError::internal(format!(
                "delegate answered {} to aggregated discovery",
                response.status()
            )));
        }
        let body = to_bytes(response.into_body(), DISCOVERY_BODY_LIMIT)
            .await
            .map_err(|e| ApiError::internal(format!("failed to read delegate discovery: {}", e)))?;
        let list: APIGroupDiscoveryList = serde_json::from_slice(&body).map_err(|e| {
            ApiError::internal(format!("failed to decode delegate discovery: {}", e))
        })?;
        Ok(list.items)
    }
}

/// Internal `GET /apis` against the delegate with the given `Accept`
async fn call_delegate(delegate: &Router, accept: &str, user: Option<&UserInfo>) -> Response {
    let mut req = Request::new(Body::empty());
    *req.method_mut() = Method::GET;
    *req.uri_mut() = axum::http::Uri::from_static(APIS_PREFIX);
    if let Ok(value) = HeaderValue::from_str(accept) {
        req.headers_mut().insert(ACCEPT, value);
    }
    if let Some(user) = user {
        req.extensions_mut().insert(user.clone());
    }
    match delegate.clone().oneshot(req).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

pub struct DiscoveryManager {
    local: Vec<APIGroup>,
    sources: Vec<Arc<dyn DiscoverySource>>,
    delegate: Router,
}

impl DiscoveryManager {
    /// Serve `local_group` at `local_versions` (preferred first) alongside
    /// the delegate's groups
    pub fn new(local_group: &str, local_versions: &[String], delegate: Router) -> Self {
        let local = if local_versions.is_empty() {
            Vec::new()
        } else {
            vec![APIGroup::new(local_group, local_versions).into_list_item()]
        };
        let local_aggregated = local
            .iter()
            .map(|g| {
                let versions: Vec<String> = g.versions.iter().map(|v| v.version.clone()).collect();
                APIGroupDiscovery::new(&g.name, &versions)
            })
            .collect();
        Self {
            local,
            sources: vec![
                Arc::new(LocalSource::new(local_aggregated)),
                Arc::new(DelegateSource::new(delegate.clone())),
            ],
            delegate,
        }
    }

    pub fn add_source(&mut self, source: Arc<dyn DiscoverySource>) {
        self.sources.push(source);
    }

    pub fn local_groups(&self) -> &[APIGroup] {
        &self.local
    }

    /// Union of every source; a failing source is left out
    pub async fn aggregated(&self, user: Option<&UserInfo>) -> APIGroupDiscoveryList {
        let mut merged: Vec<APIGroupDiscovery> = Vec::new();
        for source in &self.sources {
            match source.groups(user).await {
                Ok(groups) => merge_groups(&mut merged, groups),
                Err(e) => {
                    tracing::warn!(source = source.name(), error = %e, "Discovery source failed")
                }
            }
        }
        APIGroupDiscoveryList::new(merged)
    }

    /// Delegate's legacy document plus the local groups.
    ///
    /// A non-success answer from the delegate is returned as is.
    #[instrument(name = "legacy_discovery", skip_all, fields(error = tracing::field::Empty))]
    pub async fn legacy(&self, user: Option<&UserInfo>) -> Result<APIGroupList, Response> {
        let response = call_delegate(&self.delegate, "application/json", user).await;
        if !response.status().is_success() {
            return Err(response);
        }
        match decode_group_list(response).await {
            Ok(mut list) => {
                list.groups.extend(self.local.iter().cloned());
                Ok(list)
            }
            Err(e) => {
                e.record();
                Err(e.into_response())
            }
        }
    }
}

async fn decode_group_list(response: Response) -> Result<APIGroupList, ApiError> {
    let body = to_bytes(response.into_body(), DISCOVERY_BODY_LIMIT)
        .await
        .map_err(|e| ApiError::internal(format!("failed to read delegate discovery: {}", e)))?;
    serde_json::from_slice(&body).map_err(|e| ApiError::internal(e.to_string()))
}

/// Append `incoming` groups; versions of a group already present are
/// merged, the first source winning per version
fn merge_groups(merged: &mut Vec<APIGroupDiscovery>, incoming: Vec<APIGroupDiscovery>) {
    for group in incoming {
        match merged.iter_mut().find(|g| g.name() == group.name()) {
            Some(existing) => {
                for version in group.versions {
                    if !existing.versions.iter().any(|v| v.version == version.version) {
                        existing.versions.push(version);
                    }
                }
            }
            None => merged.push(group),
        }
    }
}

/// Whether `Accept` asks for the aggregated document
pub fn wants_aggregated(headers: &HeaderMap) -> bool {
    headers.get_all(ACCEPT).iter().any(|value| {
        value.to_str().is_ok_and(|v| {
            v.split(',').any(|range| {
                range
                    .split(';')
                    .skip(1)
                    .filter_map(|p| p.split_once('='))
                    .any(|(k, val)| k.trim() == "as" && val.trim() == AGGREGATED_DISCOVERY_AS)
            })
        })
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyFormat {
    Json,
    Yaml,
}

/// Pick the legacy serialization from `Accept` q-values. JSON unless YAML
/// is strictly preferred.
pub fn negotiate_legacy(headers: &HeaderMap) -> LegacyFormat {
    let mut json_q: Option<f32> = None;
    let mut yaml_q: Option<f32> = None;
    for value in headers.get_all(ACCEPT).iter() {
        let Ok(value) = value.to_str() else { continue };
        for range in value.split(',') {
            let mut parts = range.split(';');
            let media = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
            let q = parts
                .filter_map(|p| p.split_once('='))
                .find(|(k, _)| k.trim() == "q")
                .and_then(|(_, v)| v.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            let slot = match media.as_str() {
                "application/json" | "application/*" | "*/*" => &mut json_q,
                "application/yaml" => &mut yaml_q,
                _ => continue,
            };
            *slot = Some(slot.map_or(q, |old| old.max(q)));
        }
    }
    match (json_q, yaml_q) {
        (_, Some(y)) if y > 0.0 && y > json_q.unwrap_or(0.0) => LegacyFormat::Yaml,
        _ => LegacyFormat::Json,
    }
}

fn encode_legacy(list: &APIGroupList, format: LegacyFormat) -> Response {
    let encoded = match format {
        LegacyFormat::Json => serde_json::to_vec(list).map_err(|e| e.to_string()),
        LegacyFormat::Yaml => serde_yaml::to_string(list)
            .map(String::into_bytes)
            .map_err(|e| e.to_string()),
    };
    let content_type = match format {
        LegacyFormat::Json => "application/json",
        LegacyFormat::Yaml => "application/yaml",
    };
    match encoded {
        Ok(body) => ([(CONTENT_TYPE, content_type)], body).into_response(),
        Err(e) => ApiError::internal(format!("failed to encode discovery: {}", e)).into_response(),
    }
}

fn is_discovery_root(req: &Request) -> bool {
    req.method() == Method::GET && matches!(req.uri().path(), "/apis" | "/apis/")
}

/// Middleware answering `GET /apis` and `GET /apis/`; everything else
/// passes through untouched
pub async fn aggregate(
    State(discovery): State<Arc<DiscoveryManager>>,
    req: Request,
    next: Next,
) -> Response {
    if !is_discovery_root(&req) {
        return next.run(req).await;
    }
    let user = req.extensions().get::<UserInfo>().cloned();

    if wants_aggregated(req.headers()) {
        let list = discovery.aggregated(user.as_ref()).await;
        return match serde_json::to_vec(&list) {
            Ok(body) => ([(CONTENT_TYPE, AGGREGATED_DISCOVERY_CONTENT_TYPE)], body).into_response(),
            Err(e) => ApiError::internal(format!("failed to encode discovery: {}", e)).into_response(),
        };
    }

    let format = negotiate_legacy(req.headers());
    match discovery.legacy(user.as_ref()).await {
        Ok(list) => encode_legacy(&list, format),
        Err(response) => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn accept(value: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(value));
        headers
    }

    #[test]
    fn detects_aggregated_accept() {
        assert!(wants_aggregated(&accept(
            "application/json;g=apidiscovery.k8s.io;v=v2;as=APIGroupDiscoveryList,application/json"
        )));
        assert!(!wants_aggregated(&accept("application/json")));
        assert!(!wants_aggregated(&HeaderMap::new()));
    }

    #[test]
    fn legacy_negotiation() {
        assert_eq!(negotiate_legacy(&HeaderMap::new()), LegacyFormat::Json);
        assert_eq!(negotiate_legacy(&accept("application/yaml")), LegacyFormat::Yaml);
        assert_eq!(
            negotiate_legacy(&accept("application/json;q=0.5, application/yaml")),
            LegacyFormat::Yaml
        );
        assert_eq!(
            negotiate_legacy(&accept("application/yaml;q=0.5, application/json")),
            LegacyFormat::Json
        );
        assert_eq!(negotiate_legacy(&accept("text/html")), LegacyFormat::Json);
    }

    #[test]
    fn merge_unions_groups_and_versions() {
        let mut merged = vec![APIGroupDiscovery::new("a.example", &["v1".into()])];
        merge_groups(
            &mut merged,
            vec![
                APIGroupDiscovery::new("a.example", &["v1".into(), "v2".into()]),
                APIGroupDiscovery::new("b.example", &["v1".into()]),
            ],
        );
        let names: Vec<_> = merged.iter().map(|g| g.name().to_string()).collect();
        assert_eq!(names, ["a.example", "b.example"]);
        let versions: Vec<_> = merged[0].versions.iter().map(|v| v.version.as_str()).collect();
        assert_eq!(versions, ["v1", "v2"]);
    }
}
