//! End-to-end test harness for the data plane aggregator
//!
//! [`TestServer`] runs the full stack in-process on an ephemeral port:
//! in-memory store, reconciliation controller, live routing table,
//! discovery merge and (optionally) the availability checker. Plugins are
//! reached over real HTTP through [`dpa_proxy::HttpPluginBackend`];
//! [`mock_plugin_router`] is a stand-in plugin process for that wire.
//!
//! # Test Structure
//!
//! - `e2e_test.rs` - routing, admission and query through the running server
//! - `discovery_e2e_test.rs` - `/apis` merge against a remote delegate

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json, Router};
use dpa_api::handlers::request_context;
use dpa_api::{create_router, AppState, DiscoveryManager, DispatcherFactory, ProxyRegistry};
use dpa_core::{
    AdmissionCall, BackendDescriptor, BackendResolver, HealthResult, HealthStatus,
    InMemoryStore, MutationResult, PluginContext, PluginContextProvider, QueryCall,
    QueryDataResponse, Readiness, ResourceCall, ResourceResponse, Status, UserInfo,
    ValidationResult,
};
use dpa_gateway::{AvailabilityChecker, AvailabilityConfig, Controller, ControllerConfig};
use dpa_proxy::{
    HttpPluginBackend, ProxyMetrics, RouteProxy, StaticBackendResolver, StaticContextProvider,
    TracingTransport, UpgradeDialer,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub type HarnessResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// How long the polling helpers wait before giving up
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Serve `router` on an ephemeral localhost port until `shutdown` fires
pub async fn serve(router: Router, shutdown: CancellationToken) -> HarnessResult<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "Test listener failed");
        }
    });
    Ok(addr)
}

// =============================================================================
// Mock plugin process
// =============================================================================

/// HTTP plugin process for `plugin_id`.
///
/// - query: one result per `refId` echoing the datasource uid and user
/// - mutate: adds the label `mutated-by: {plugin_id}`
/// - validate: denies objects with `spec.forbidden: true`
/// - resource: echoes method, path and query as JSON
/// - health: always `OK`
pub fn mock_plugin_router(plugin_id: &str) -> Router {
    let id = plugin_id.to_string();
    Router::new()
        .route("/query", post(mock_query))
        .route("/admission/mutate", post(mock_mutate))
        .route("/admission/validate", post(mock_validate))
        .route("/resource", post(mock_resource))
        .route("/health", post(mock_health))
        .layer(Extension(PluginName(id)))
}

#[derive(Clone)]
struct PluginName(String);

async fn mock_query(Json(call): Json<QueryCall>) -> Json<QueryDataResponse> {
    let mut response = QueryDataResponse::default();
    for query in call.queries {
        response.results.insert(
            query.ref_id,
            json!({
                "uid": call.plugin_context.datasource.as_ref().map(|d| d.uid.clone()),
                "user": call.plugin_context.user.as_ref().map(|u| u.name.clone()),
            }),
        );
    }
    Json(response)
}

fn bad_request(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(Status::failure(400, "BadRequest", message)),
    )
        .into_response()
}

async fn mock_mutate(
    Extension(PluginName(name)): Extension<PluginName>,
    Json(call): Json<AdmissionCall>,
) -> Response {
    let mut object: Value = match serde_json::from_slice(&call.object_bytes) {
        Ok(object) => object,
        Err(e) => return bad_request(format!("undecodable object: {}", e)),
    };
    object["metadata"]["labels"]["mutated-by"] = json!(name);
    match serde_json::to_vec(&object) {
        Ok(object_bytes) => Json(MutationResult {
            allowed: true,
            result: None,
            warnings: Vec::new(),
            object_bytes,
        })
        .into_response(),
        Err(e) => bad_request(e.to_string()),
    }
}

async fn mock_validate(Json(call): Json<AdmissionCall>) -> Json<ValidationResult> {
    let object: Value = serde_json::from_slice(&call.object_bytes).unwrap_or(Value::Null);
    if object["spec"]["forbidden"] == json!(true) {
        Json(ValidationResult {
            allowed: false,
            result: Some(Status::failure(403, "Forbidden", "forbidden objects are rejected")),
            warnings: Vec::new(),
        })
    } else {
        Json(ValidationResult {
            allowed: true,
            ..Default::default()
        })
    }
}

async fn mock_resource(Json(call): Json<ResourceCall>) -> Json<ResourceResponse> {
    let body = json!({
        "method": call.method,
        "path": call.path,
        "query": call.query,
        "user": call.plugin_context.user.map(|u| u.name),
    });
    Json(ResourceResponse {
        status: 200,
        headers: [("content-type".to_string(), vec!["application/json".to_string()])]
            .into_iter()
            .collect(),
        body: body.to_string().into_bytes(),
    })
}

async fn mock_health(Json(_context): Json<PluginContext>) -> Json<HealthResult> {
    Json(HealthResult {
        status: HealthStatus::Ok,
        message: "mock plugin ok".to_string(),
    })
}

/// Delegate that answers everything with a 404 naming the request
pub fn not_found_delegate() -> Router {
    Router::new().fallback(|req: Request| async move {
        (
            StatusCode::NOT_FOUND,
            format!("delegate {} {}", req.method(), req.uri().path()),
        )
    })
}

/// Delegate reverse-proxying everything to `url` with the caller's identity
pub fn proxy_delegate(url: &str) -> HarnessResult<Router> {
    let proxy = RouteProxy::new(
        "",
        url,
        TracingTransport::new()?,
        UpgradeDialer::new()?,
        ProxyMetrics::new()?,
    )?;
    Ok(Router::new().fallback(move |req: Request| {
        let proxy = proxy.clone();
        async move {
            let ctx = request_context(req.extensions(), Duration::from_secs(30));
            let _guard = ctx.cancel_on_drop();
            proxy.forward(&ctx, req).await
        }
    }))
}

// =============================================================================
// Test server
// =============================================================================

pub struct TestServerBuilder {
    plugins: Vec<(String, String)>,
    delegate: Router,
    user: UserInfo,
    descriptors: Vec<BackendDescriptor>,
    local_group: String,
    local_versions: Vec<String>,
    availability: Option<AvailabilityConfig>,
}

impl TestServerBuilder {
    /// Register a plugin execution endpoint
    pub fn plugin(mut self, plugin_id: &str, url: &str) -> Self {
        self.plugins.push((plugin_id.to_string(), url.to_string()));
        self
    }

    pub fn delegate(mut self, delegate: Router) -> Self {
        self.delegate = delegate;
        self
    }

    /// Identity attached to every inbound request
    pub fn user(mut self, user: UserInfo) -> Self {
        self.user = user;
        self
    }

    /// Seed the store before the controller starts
    pub fn descriptor(mut self, descriptor: BackendDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    pub fn local_group(mut self, group: &str, versions: &[&str]) -> Self {
        self.local_group = group.to_string();
        self.local_versions = versions.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn availability(mut self, config: AvailabilityConfig) -> Self {
        self.availability = Some(config);
        self
    }

    pub async fn start(self) -> HarnessResult<TestServer> {
        let store = Arc::new(InMemoryStore::with_items(self.descriptors));

        let mut resolver = StaticBackendResolver::new();
        for (plugin_id, url) in &self.plugins {
            resolver.insert(Arc::new(HttpPluginBackend::new(plugin_id, url)?));
        }
        let resolver: Arc<dyn BackendResolver> = Arc::new(resolver);
        let contexts: Arc<dyn PluginContextProvider> = Arc::new(StaticContextProvider::new(1));

        let prometheus = prometheus::Registry::new();
        let metrics = ProxyMetrics::register(&prometheus)?;
        let factory = DispatcherFactory::new(
            resolver.clone(),
            contexts.clone(),
            self.delegate.clone(),
            metrics,
        )?;
        let registry = Arc::new(ProxyRegistry::new(factory));
        let discovery = Arc::new(DiscoveryManager::new(
            &self.local_group,
            &self.local_versions,
            self.delegate,
        ));
        let readiness = Readiness::new();
        let state = AppState::new(registry.clone(), discovery, readiness.clone(), prometheus);
        let app = create_router(state).layer(Extension(self.user));

        let shutdown = CancellationToken::new();
        let controller = Arc::new(Controller::new(
            store.clone(),
            registry,
            readiness.clone(),
            ControllerConfig::default(),
        ));
        tokio::spawn(controller.run(shutdown.clone()));

        if let Some(config) = self.availability {
            let checker =
                AvailabilityChecker::new(store.clone(), store.clone(), resolver, contexts, config)?;
            let token = shutdown.clone();
            tokio::spawn(async move { checker.run(token).await });
        }

        let addr = serve(app, shutdown.clone()).await?;
        Ok(TestServer {
            addr,
            store,
            readiness,
            client: reqwest::Client::new(),
            shutdown,
        })
    }
}

/// A running aggregator; stops when dropped
pub struct TestServer {
    addr: SocketAddr,
    store: Arc<InMemoryStore>,
    readiness: Readiness,
    client: reqwest::Client,
    shutdown: CancellationToken,
}

impl TestServer {
    pub fn builder() -> TestServerBuilder {
        TestServerBuilder {
            plugins: Vec::new(),
            delegate: not_found_delegate(),
            user: UserInfo::new("tester"),
            descriptors: Vec::new(),
            local_group: "aggregation.example".to_string(),
            local_versions: vec!["v0alpha1".to_string()],
            availability: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn store(&self) -> &InMemoryStore {
        &self.store
    }

    pub async fn wait_ready(&self) -> HarnessResult<()> {
        tokio::time::timeout(WAIT_TIMEOUT, self.readiness.wait()).await?;
        Ok(())
    }

    /// Poll `GET path` until it answers `status`
    pub async fn wait_for_status(&self, path: &str, status: u16) -> HarnessResult<()> {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let response = self.client.get(self.url(path)).send().await?;
            if response.status().as_u16() == status {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(format!(
                    "GET {} still answers {} (wanted {})",
                    path,
                    response.status(),
                    status
                )
                .into());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Poll the store until `name` satisfies `check`
    pub async fn wait_for_descriptor(
        &self,
        name: &str,
        check: impl Fn(&BackendDescriptor) -> bool,
    ) -> HarnessResult<BackendDescriptor> {
        use dpa_core::ResourceSource;

        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            if let Some(descriptor) = self.store.get(name).await? {
                if check(&descriptor) {
                    return Ok(descriptor);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(format!("descriptor {} never reached the expected state", name).into());
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
