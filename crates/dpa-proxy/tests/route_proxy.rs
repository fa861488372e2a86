//! RouteProxy against a live origin on an ephemeral port

use std::net::SocketAddr;

use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use dpa_core::{RequestContext, UserInfo};
use dpa_proxy::{ProxyMetrics, RouteProxy, TracingTransport, UpgradeDialer};
use hyper_util::rt::TokioIo;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn serve(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn header_values(headers: &HeaderMap, name: &str) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect()
}

/// Origin that reports what it received
async fn echo(req: Request) -> Json<Value> {
    let headers = req.headers().clone();
    let uri = req.uri().clone();
    let body = to_bytes(req.into_body(), usize::MAX).await.unwrap();
    Json(json!({
        "path": uri.path(),
        "query": uri.query(),
        "user": header_values(&headers, "x-remote-user"),
        "uid": header_values(&headers, "x-remote-uid"),
        "groups": header_values(&headers, "x-remote-group"),
        "extra": header_values(&headers, "x-remote-extra-scopes"),
        "body": String::from_utf8_lossy(&body),
    }))
}

/// Origin that switches protocols and echoes four bytes
async fn upgrade_echo(mut req: Request) -> Response {
    let user = req
        .headers()
        .get("x-remote-user")
        .cloned()
        .unwrap_or(header::HeaderValue::from_static(""));
    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        if let Ok(upgraded) = on_upgrade.await {
            let mut io = TokioIo::new(upgraded);
            let mut buf = [0u8; 4];
            if io.read_exact(&mut buf).await.is_ok() {
                let _ = io.write_all(&buf).await;
            }
        }
    });
    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "echo")
        .header("x-seen-user", user)
        .body(Body::empty())
        .unwrap()
}

fn route_proxy(origin: SocketAddr, metrics: ProxyMetrics) -> RouteProxy {
    RouteProxy::new(
        "/apis/testds.example.com/v1",
        &format!("http://{}/base", origin),
        TracingTransport::new().unwrap(),
        UpgradeDialer::new().unwrap(),
        metrics,
    )
    .unwrap()
}

/// Front server that authenticates everyone as `alice` and proxies
async fn front(proxy: RouteProxy) -> SocketAddr {
    let router = Router::new().fallback(any(move |req: Request| {
        let proxy = proxy.clone();
        async move {
            let mut user = UserInfo::new("alice");
            user.uid = Some("1001".into());
            user.groups = vec!["devs".into(), "system:authenticated".into()];
            user.extra.insert("scopes".into(), vec!["read".into()]);
            let ctx = RequestContext::new(Some(user));
            proxy.forward(&ctx, req).await.into_response()
        }
    }));
    serve(router).await
}

#[tokio::test]
async fn proxies_with_identity_headers() {
    let origin = serve(Router::new().fallback(any(echo))).await;
    let metrics = ProxyMetrics::new().unwrap();
    let front = front(route_proxy(origin, metrics.clone())).await;

    let resp = reqwest::Client::new()
        .post(format!(
            "http://{}/apis/testds.example.com/v1/namespaces/default/test/123/example?a=1&b=two",
            front
        ))
        .header("x-remote-user", "mallory")
        .header("x-remote-extra-scopes", "admin")
        .body("hello")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let seen: Value = resp.json().await.unwrap();
    assert_eq!(
        seen,
        json!({
            "path": "/base/namespaces/default/test/123/example",
            "query": "a=1&b=two",
            "user": ["alice"],
            "uid": ["1001"],
            "groups": ["devs", "system:authenticated"],
            "extra": ["read"],
            "body": "hello",
        })
    );
    assert_eq!(metrics.requests_total(200), 1);
}

#[tokio::test]
async fn unreachable_origin_is_bad_gateway() {
    // Bind then drop to get a port nobody listens on
    let dead = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap()
    };
    let front = front(route_proxy(dead, ProxyMetrics::new().unwrap())).await;

    let resp = reqwest::get(format!(
        "http://{}/apis/testds.example.com/v1/namespaces/default/x",
        front
    ))
    .await
    .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let status: Value = resp.json().await.unwrap();
    assert_eq!(status["kind"], "Status");
    assert_eq!(status["code"], 502);
}

#[tokio::test]
async fn tunnels_upgrade_requests() {
    let origin = serve(Router::new().fallback(any(upgrade_echo))).await;
    let front = front(route_proxy(origin, ProxyMetrics::new().unwrap())).await;

    let mut stream = TcpStream::connect(front).await.unwrap();
    stream
        .write_all(
            b"GET /apis/testds.example.com/v1/namespaces/default/exec HTTP/1.1\r\n\
              Host: localhost\r\n\
              Connection: Upgrade\r\n\
              Upgrade: echo\r\n\
              X-Remote-User: mallory\r\n\r\n",
        )
        .await
        .unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap().to_ascii_lowercase();
    assert!(head.starts_with("http/1.1 101"), "{}", head);
    assert!(head.contains("x-seen-user: alice"), "{}", head);

    stream.write_all(b"ping").await.unwrap();
    let mut echoed = [0u8; 4];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"ping");
}

#[tokio::test]
async fn refused_upgrade_is_bad_gateway() {
    let origin = serve(Router::new().fallback(any(echo))).await;
    let front = front(route_proxy(origin, ProxyMetrics::new().unwrap())).await;

    let resp = reqwest::Client::new()
        .get(format!(
            "http://{}/apis/testds.example.com/v1/namespaces/default/exec",
            front
        ))
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "echo")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let status: Value = resp.json().await.unwrap();
    assert!(status["message"].as_str().unwrap().contains("200"));
}
