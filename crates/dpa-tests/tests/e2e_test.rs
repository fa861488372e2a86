//! End-to-end tests through a running aggregator
//!
//! Run with: cargo test -p dpa-tests --test e2e_test

use std::collections::BTreeMap;

use axum::extract::Request;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dpa_core::{BackendDescriptor, BackendRef, ConditionStatus, PluginType, ServiceType, UserInfo};
use dpa_gateway::AvailabilityConfig;
use dpa_tests::{mock_plugin_router, serve, TestServer};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

// =============================================================================
// Test Helpers
// =============================================================================

/// Origin echoing what it received, identity headers included
async fn spawn_origin(shutdown: &CancellationToken) -> String {
    let app = Router::new().fallback(|req: Request| async move {
        let header = |name: &str| {
            req.headers()
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .map(str::to_string)
                .collect::<Vec<_>>()
        };
        Json(json!({
            "method": req.method().as_str(),
            "path": req.uri().path(),
            "user": header("x-remote-user"),
            "groups": header("x-remote-group"),
        }))
    });
    let addr = serve(app, shutdown.clone()).await.unwrap();
    format!("http://{}", addr)
}

async fn spawn_plugin(plugin_id: &str, shutdown: &CancellationToken) -> String {
    let addr = serve(mock_plugin_router(plugin_id), shutdown.clone())
        .await
        .unwrap();
    format!("http://{}", addr)
}

fn alice() -> UserInfo {
    UserInfo {
        name: "alice".to_string(),
        uid: Some("1001".to_string()),
        groups: vec!["devs".to_string(), "ops".to_string()],
        extra: BTreeMap::new(),
    }
}

fn http_descriptor(origin: &str) -> BackendDescriptor {
    BackendDescriptor::new(
        "testds.example.com",
        "v1",
        "testds",
        PluginType::App,
        BackendRef::http(origin),
    )
    .with_service(ServiceType::Route, Some("GET"), Some("/test/{name}/example"))
}

fn plugin_descriptor() -> BackendDescriptor {
    BackendDescriptor::new(
        "testds.example.com",
        "v1",
        "testds",
        PluginType::Datasource,
        BackendRef::plugin(),
    )
    .with_service(ServiceType::Admission, None, None)
    .with_service(ServiceType::Query, None, None)
    .with_service(ServiceType::Route, Some("GET"), Some("/things"))
}

fn review(operation: &str, object: Value) -> Value {
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": "d2f5c1e0-1111-4c5a-9a53-0c8f1b1d2e3f",
            "kind": {"group": "testds.example.com", "version": "v1", "kind": "Thing"},
            "operation": operation,
            "object": object
        }
    })
}

const MOUNT: &str = "/apis/testds.example.com/v1";

// =============================================================================
// Routing
// =============================================================================

#[tokio::test]
async fn seeded_route_is_served_once_ready() {
    let shutdown = CancellationToken::new();
    let origin = spawn_origin(&shutdown).await;
    let server = TestServer::builder()
        .user(alice())
        .descriptor(http_descriptor(&origin))
        .start()
        .await
        .unwrap();
    server.wait_ready().await.unwrap();

    let resp = server.client().get(server.url("/readyz")).send().await.unwrap();
    assert_eq!(resp.status(), 200);

    let path = format!("{}/namespaces/default/test/123/example", MOUNT);
    let resp = server.client().get(server.url(&path)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body,
        json!({
            "method": "GET",
            "path": "/namespaces/default/test/123/example",
            "user": ["alice"],
            "groups": ["devs", "ops"],
        })
    );

    // Same path, undeclared method
    let resp = server.client().post(server.url(&path)).send().await.unwrap();
    assert_eq!(resp.status(), 404);
    assert_eq!(resp.text().await.unwrap(), format!("delegate POST {}", path));

    let metrics = server
        .client()
        .get(server.url("/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("dpa_route_proxy_requests_total{code=\"200\"} 1"));
}

#[tokio::test]
async fn inbound_identity_headers_are_replaced() {
    let shutdown = CancellationToken::new();
    let origin = spawn_origin(&shutdown).await;
    let server = TestServer::builder()
        .user(alice())
        .descriptor(http_descriptor(&origin))
        .start()
        .await
        .unwrap();
    server.wait_ready().await.unwrap();

    let path = format!("{}/namespaces/default/test/1/example", MOUNT);
    let body: Value = server
        .client()
        .get(server.url(&path))
        .header("X-Remote-User", "mallory")
        .header("X-Remote-Group", "system:masters")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["user"], json!(["alice"]));
    assert_eq!(body["groups"], json!(["devs", "ops"]));
}

#[tokio::test]
async fn descriptors_follow_store_changes() {
    let shutdown = CancellationToken::new();
    let origin = spawn_origin(&shutdown).await;
    let server = TestServer::builder().start().await.unwrap();
    server.wait_ready().await.unwrap();

    server.wait_for_status(MOUNT, 404).await.unwrap();

    server.store().apply(http_descriptor(&origin));
    server.wait_for_status(MOUNT, 200).await.unwrap();

    let group: Value = server
        .client()
        .get(server.url("/apis/testds.example.com"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(group["preferredVersion"]["groupVersion"], "testds.example.com/v1");

    server.store().delete("v1.testds.example.com");
    server.wait_for_status(MOUNT, 404).await.unwrap();
    server
        .wait_for_status("/apis/testds.example.com", 404)
        .await
        .unwrap();
}

// =============================================================================
// Plugin services
// =============================================================================

#[tokio::test]
async fn query_reaches_http_plugin() {
    let shutdown = CancellationToken::new();
    let plugin = spawn_plugin("testds", &shutdown).await;
    let server = TestServer::builder()
        .user(alice())
        .plugin("testds", &plugin)
        .descriptor(plugin_descriptor())
        .start()
        .await
        .unwrap();
    server.wait_ready().await.unwrap();

    let path = format!("{}/namespaces/default/connections/abc/query", MOUNT);
    let resp = server
        .client()
        .post(server.url(&path))
        .json(&json!({
            "queries": [{"refId": "A", "datasource": {"type": "testds", "uid": "abc"}}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"results": {"A": {"uid": "abc", "user": "alice"}}}));

    let resp = server
        .client()
        .post(server.url(&path))
        .json(&json!({
            "queries": [{"refId": "A", "datasource": {"type": "testds", "uid": "other"}}]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let status: Value = resp.json().await.unwrap();
    assert_eq!(status["message"], "invalid datasource UID");
}

#[tokio::test]
async fn admission_round_trip_through_http_plugin() {
    let shutdown = CancellationToken::new();
    let plugin = spawn_plugin("testds", &shutdown).await;
    let server = TestServer::builder()
        .plugin("testds", &plugin)
        .descriptor(plugin_descriptor())
        .start()
        .await
        .unwrap();
    server.wait_ready().await.unwrap();

    let object = json!({"metadata": {"name": "t"}, "spec": {"forbidden": false}});
    let out: Value = server
        .client()
        .post(server.url(&format!("{}/admission/mutate", MOUNT)))
        .json(&review("CREATE", object.clone()))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let response = &out["response"];
    assert_eq!(response["allowed"], true);
    assert_eq!(response["patchType"], "JSONPatch");
    let patch_bytes = STANDARD.decode(response["patch"].as_str().unwrap()).unwrap();
    let patch: json_patch::Patch = serde_json::from_slice(&patch_bytes).unwrap();
    let mut patched = object;
    json_patch::patch(&mut patched, &patch.0).unwrap();
    assert_eq!(patched["metadata"]["labels"]["mutated-by"], "testds");

    let out: Value = server
        .client()
        .post(server.url(&format!("{}/admission/validate", MOUNT)))
        .json(&review("UPDATE", json!({"spec": {"forbidden": true}})))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(out["response"]["allowed"], false);
    assert_eq!(out["response"]["result"]["code"], 403);
    assert_eq!(out["response"]["result"]["message"], "forbidden objects are rejected");
}

#[tokio::test]
async fn plugin_route_goes_through_resource_call() {
    let shutdown = CancellationToken::new();
    let plugin = spawn_plugin("testds", &shutdown).await;
    let server = TestServer::builder()
        .user(alice())
        .plugin("testds", &plugin)
        .descriptor(plugin_descriptor())
        .start()
        .await
        .unwrap();
    server.wait_ready().await.unwrap();

    let resp = server
        .client()
        .get(server.url(&format!("{}/namespaces/default/things?limit=5", MOUNT)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body,
        json!({
            "method": "GET",
            "path": "/namespaces/default/things",
            "query": "limit=5",
            "user": "alice",
        })
    );
}

#[tokio::test]
async fn availability_condition_is_written() {
    let shutdown = CancellationToken::new();
    let plugin = spawn_plugin("testds", &shutdown).await;
    let server = TestServer::builder()
        .plugin("testds", &plugin)
        .descriptor(plugin_descriptor())
        .availability(AvailabilityConfig {
            enabled: true,
            interval_secs: 1,
            timeout_secs: 2,
        })
        .start()
        .await
        .unwrap();

    let descriptor = server
        .wait_for_descriptor("v1.testds.example.com", |d| d.available_condition().is_some())
        .await
        .unwrap();
    let condition = descriptor.available_condition().unwrap();
    assert_eq!(condition.status, ConditionStatus::True);
    assert_eq!(condition.message.as_deref(), Some("mock plugin ok"));
}
