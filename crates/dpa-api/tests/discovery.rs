//! `GET /apis` merge against a delegate serving both discovery formats

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use dpa_api::{create_router, AppState, DiscoveryManager, DispatcherFactory, ProxyRegistry};
use dpa_core::models::AGGREGATED_DISCOVERY_CONTENT_TYPE;
use dpa_core::{
    APIGroup, APIGroupDiscovery, APIGroupDiscoveryList, APIGroupList, Readiness,
};
use dpa_proxy::{ProxyMetrics, StaticBackendResolver, StaticContextProvider};
use pretty_assertions::assert_eq;
use serde_json::Value;
use tower::ServiceExt;

/// Delegate serving `foo.example.com` in whichever format is asked for
async fn foo_discovery(headers: HeaderMap) -> Response {
    let accept = headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let versions = ["v1".to_string()];
    if accept.contains("as=APIGroupDiscoveryList") {
        let list = APIGroupDiscoveryList::new(vec![APIGroupDiscovery::new(
            "foo.example.com",
            &versions,
        )]);
        (
            [(CONTENT_TYPE, AGGREGATED_DISCOVERY_CONTENT_TYPE)],
            serde_json::to_vec(&list).unwrap(),
        )
            .into_response()
    } else {
        assert_eq!(accept, "application/json");
        let list = APIGroupList::new(vec![
            APIGroup::new("foo.example.com", &versions).into_list_item()
        ]);
        axum::Json(list).into_response()
    }
}

fn router_with_delegate(delegate: Router) -> Router {
    let factory = DispatcherFactory::new(
        Arc::new(StaticBackendResolver::new()),
        Arc::new(StaticContextProvider::new(1)),
        delegate.clone(),
        ProxyMetrics::new().unwrap(),
    )
    .unwrap();
    let discovery = DiscoveryManager::new(
        "aggregation.example",
        &["v0alpha1".to_string()],
        delegate,
    );
    create_router(AppState::new(
        Arc::new(ProxyRegistry::new(factory)),
        Arc::new(discovery),
        Readiness::new(),
        prometheus::Registry::new(),
    ))
}

async fn get_apis(router: &Router, path: &str, accept: Option<&str>) -> Response {
    let mut builder = Request::builder().uri(path);
    if let Some(accept) = accept {
        builder = builder.header(ACCEPT, accept);
    }
    router
        .clone()
        .oneshot(builder.body(Body::empty()).unwrap())
        .await
        .unwrap()
}

async fn body_bytes(resp: Response) -> Vec<u8> {
    to_bytes(resp.into_body(), usize::MAX).await.unwrap().to_vec()
}

fn group_names(list: &APIGroupList) -> Vec<&str> {
    list.groups.iter().map(|g| g.name.as_str()).collect()
}

#[tokio::test]
async fn legacy_format_appends_local_groups() {
    let router = router_with_delegate(Router::new().route("/apis", get(foo_discovery)));

    for path in ["/apis", "/apis/"] {
        let resp = get_apis(&router, path, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[CONTENT_TYPE], "application/json");
        let list: APIGroupList = serde_json::from_slice(&body_bytes(resp).await).unwrap();
        assert_eq!(list.kind, "APIGroupList");
        assert_eq!(group_names(&list), ["foo.example.com", "aggregation.example"]);
        assert_eq!(
            list.groups[1].preferred_version.as_ref().unwrap().group_version,
            "aggregation.example/v0alpha1"
        );
    }
}

#[tokio::test]
async fn legacy_format_negotiates_yaml() {
    let router = router_with_delegate(Router::new().route("/apis", get(foo_discovery)));

    let resp = get_apis(&router, "/apis", Some("application/yaml, application/json;q=0.9")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[CONTENT_TYPE], "application/yaml");
    let list: APIGroupList = serde_yaml::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(group_names(&list), ["foo.example.com", "aggregation.example"]);
}

#[tokio::test]
async fn aggregated_format_is_the_union() {
    let router = router_with_delegate(Router::new().route("/apis", get(foo_discovery)));

    let resp = get_apis(&router, "/apis", Some(AGGREGATED_DISCOVERY_CONTENT_TYPE)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(
        resp.headers()[CONTENT_TYPE],
        AGGREGATED_DISCOVERY_CONTENT_TYPE
    );
    let list: APIGroupDiscoveryList = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(list.kind, "APIGroupDiscoveryList");
    let names: Vec<_> = list.items.iter().map(|g| g.name()).collect();
    assert_eq!(names, ["aggregation.example", "foo.example.com"]);
}

#[tokio::test]
async fn delegate_failure_is_passed_through() {
    let delegate = Router::new().route(
        "/apis",
        get(|| async { (StatusCode::FORBIDDEN, "forbidden by delegate") }),
    );
    let router = router_with_delegate(delegate);

    let resp = get_apis(&router, "/apis", None).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_bytes(resp).await, b"forbidden by delegate");

    // Aggregated mode leaves the failing delegate out
    let resp = get_apis(&router, "/apis", Some(AGGREGATED_DISCOVERY_CONTENT_TYPE)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let list: APIGroupDiscoveryList = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(list.items.len(), 1);
    assert_eq!(list.items[0].name(), "aggregation.example");
}

#[tokio::test]
async fn undecodable_delegate_document_is_500() {
    let delegate = Router::new().route("/apis", get(|| async { "not json" }));
    let router = router_with_delegate(delegate);

    let resp = get_apis(&router, "/apis", None).await;
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let status: Value = serde_json::from_slice(&body_bytes(resp).await).unwrap();
    assert_eq!(status["kind"], "Status");
    assert!(status["message"].as_str().unwrap().contains("expected"));
}

#[tokio::test]
async fn other_paths_pass_through() {
    let delegate = Router::new().route("/apis/foo.example.com", get(|| async { "foo group" }));
    let router = router_with_delegate(delegate);

    let resp = get_apis(&router, "/apis/foo.example.com", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body_bytes(resp).await, b"foo group");
}
