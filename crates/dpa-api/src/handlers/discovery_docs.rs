//! Legacy discovery documents served from registered mounts

use std::cmp::Ordering;

use axum::response::{IntoResponse, Response};
use axum::Json;
use dpa_core::routing::compare_kube_versions;
use dpa_core::{APIGroup, APIResourceList, GroupVersion};

/// `GET /apis/{group}`: versions ordered by preference, preferred first
pub fn group_document(group: &str, versions: impl IntoIterator<Item = String>) -> APIGroup {
    let mut versions: Vec<String> = versions.into_iter().collect();
    versions.sort_by(|a, b| match compare_kube_versions(a, b) {
        Ordering::Equal => a.cmp(b),
        other => other,
    });
    APIGroup::new(group, &versions)
}

/// `GET /apis/{group}/{version}`
pub fn resource_list(group_version: &GroupVersion) -> Response {
    Json(APIResourceList::new(&group_version.to_string())).into_response()
}
