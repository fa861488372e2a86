//! Per-descriptor route tables
//!
//! A [`BackendDispatcher`] is an axum `Router` assembled from the service
//! list of one descriptor. Each service type maps to a builder function in a
//! closed table; types without a builder stay unmounted and their requests
//! reach the delegate like any other unmatched request. The router and every
//! method router inside it fall back to the delegate, so neither unknown
//! paths nor method mismatches are ever dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Request};
use axum::http::Method;
use axum::response::Response;
use axum::routing::{any, get, post, MethodFilter, MethodRouter};
use axum::Router;
use dpa_core::routing::descriptor_name;
use dpa_core::{
    BackendDescriptor, BackendKind, BackendResolver, PluginBackend, PluginContextProvider,
    RegistryError, ServiceDeclaration, ServiceType,
};
use dpa_proxy::{
    PluginResourceProxy, ProxyError, ProxyMetrics, RouteProxy, TracingTransport, UpgradeDialer,
    DEFAULT_RESOURCE_BODY_LIMIT,
};
use tower::ServiceExt;

use crate::handlers::route::RouteTarget;
use crate::handlers::{admission, discovery_docs, query, route, BackendHandle};

/// Default per-request deadline for backend calls
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds dispatchers; holds everything shared between descriptors
#[derive(Clone)]
pub struct DispatcherFactory {
    resolver: Arc<dyn BackendResolver>,
    contexts: Arc<dyn PluginContextProvider>,
    transport: TracingTransport,
    dialer: UpgradeDialer,
    metrics: ProxyMetrics,
    delegate: Router,
    request_timeout: Duration,
    body_limit: usize,
}

impl DispatcherFactory {
    pub fn new(
        resolver: Arc<dyn BackendResolver>,
        contexts: Arc<dyn PluginContextProvider>,
        delegate: Router,
        metrics: ProxyMetrics,
    ) -> Result<Self, ProxyError> {
        Ok(Self {
            resolver,
            contexts,
            transport: TracingTransport::new()?,
            dialer: UpgradeDialer::new()?,
            metrics,
            delegate,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            body_limit: DEFAULT_RESOURCE_BODY_LIMIT,
        })
    }

    /// Zero disables the deadline
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    pub fn delegate(&self) -> &Router {
        &self.delegate
    }

    /// Validate a descriptor and assemble its route table
    pub fn build(&self, descriptor: &BackendDescriptor) -> Result<BackendDispatcher, RegistryError> {
        validate(descriptor)?;
        let name = descriptor.name().to_string();
        let spec = &descriptor.spec;
        let group_version = descriptor.group_version();
        let mount = group_version.path_prefix();

        let needs_plugin = spec.backend.kind == BackendKind::Plugin
            || spec.services.iter().any(|s| {
                matches!(s.service_type, ServiceType::Admission | ServiceType::Query)
            });
        let plugin = if needs_plugin {
            Some(self.resolver.resolve(&spec.plugin_id)?)
        } else {
            None
        };

        let http_proxy = match spec.backend.kind {
            BackendKind::Http => {
                let base_url = spec
                    .backend
                    .base_url
                    .as_deref()
                    .ok_or_else(|| RegistryError::invalid(&name, "http backend requires baseURL"))?;
                let proxy = RouteProxy::new(
                    &mount,
                    base_url,
                    self.transport.clone(),
                    self.dialer.clone(),
                    self.metrics.clone(),
                )
                .map_err(|e| RegistryError::invalid(&name, e.to_string()))?;
                Some(proxy)
            }
            BackendKind::Plugin => None,
        };

        let handle = Arc::new(BackendHandle {
            name: name.clone(),
            group_version,
            plugin_id: spec.plugin_id.clone(),
            plugin_type: spec.plugin_type,
            plugin: plugin.clone(),
            contexts: self.contexts.clone(),
            request_timeout: self.request_timeout,
            body_limit: self.body_limit,
        });
        let route_target = match (http_proxy, plugin) {
            (Some(proxy), _) => RouteTarget::Http(proxy),
            (None, Some(backend)) => RouteTarget::Plugin(
                PluginResourceProxy::new(&mount, &spec.plugin_id, backend, self.contexts.clone())
                    .with_body_limit(self.body_limit),
            ),
            (None, None) => {
                return Err(RegistryError::invalid(&name, "no backend for route services"))
            }
        };

        let mut by_type: BTreeMap<ServiceType, Vec<&ServiceDeclaration>> = BTreeMap::new();
        for service in &spec.services {
            by_type.entry(service.service_type).or_default().push(service);
        }

        check_paths(&name, &planned_paths(&mount, &by_type))?;

        let build = BuildContext {
            handle: handle.clone(),
            mount,
            route_target,
            delegate: self.delegate.clone(),
        };
        let router = build.assemble(&by_type)?;

        let mounted = by_type
            .keys()
            .filter(|t| route_builder(**t).is_some())
            .map(|t| t.as_str())
            .collect::<Vec<_>>();
        tracing::debug!(descriptor = %name, services = ?mounted, "Route table built");

        Ok(BackendDispatcher { handle, router })
    }
}

/// Name and shape checks that need no collaborator
fn validate(descriptor: &BackendDescriptor) -> Result<(), RegistryError> {
    let name = descriptor.name();
    let spec = &descriptor.spec;

    if spec.group.is_empty()
        || !spec
            .group
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-')
    {
        return Err(RegistryError::invalid(name, format!("invalid group {:?}", spec.group)));
    }
    if spec.version.is_empty()
        || !spec
            .version
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return Err(RegistryError::invalid(
            name,
            format!("invalid version {:?}", spec.version),
        ));
    }
    let expected = descriptor_name(&spec.group, &spec.version);
    if name != expected {
        return Err(RegistryError::invalid(
            name,
            format!("name must be {:?}", expected),
        ));
    }
    if spec.plugin_id.is_empty() {
        return Err(RegistryError::invalid(name, "pluginID is required"));
    }

    for service in spec
        .services
        .iter()
        .filter(|s| s.service_type == ServiceType::Route)
    {
        match service.path.as_deref() {
            Some(path) if path.starts_with('/') => {
                if let Some(segment) = path
                    .split('/')
                    .find(|s| s.starts_with(':') || s.starts_with('*'))
                {
                    return Err(RegistryError::invalid(
                        name,
                        format!("route segment {:?} must use {{param}} syntax", segment),
                    ));
                }
            }
            Some(path) => {
                return Err(RegistryError::invalid(
                    name,
                    format!("route path {:?} must start with '/'", path),
                ))
            }
            None => return Err(RegistryError::invalid(name, "route service requires a path")),
        }
    }
    Ok(())
}

/// Every path the route table will hold, one entry per distinct path
fn planned_paths(
    mount: &str,
    by_type: &BTreeMap<ServiceType, Vec<&ServiceDeclaration>>,
) -> Vec<String> {
    let mut paths = vec![mount.to_string()];
    if by_type.contains_key(&ServiceType::Admission) {
        paths.push(format!("{}/admission/mutate", mount));
        paths.push(format!("{}/admission/validate", mount));
    }
    if by_type.contains_key(&ServiceType::Query) {
        paths.push(format!("{}/namespaces/{{ns}}/connections/{{id}}/query", mount));
    }
    let routes: BTreeSet<&str> = by_type
        .get(&ServiceType::Route)
        .into_iter()
        .flatten()
        .filter_map(|s| s.path.as_deref())
        .collect();
    paths.extend(
        routes
            .into_iter()
            .map(|path| format!("{}/namespaces/{{ns}}{}", mount, path)),
    );
    paths
}

/// Insert the paths into a scratch matcher of the kind axum routes with, so
/// overlaps surface as errors before the router is assembled
fn check_paths(name: &str, paths: &[String]) -> Result<(), RegistryError> {
    let mut matcher = matchit::Router::new();
    for path in paths {
        matcher
            .insert(path.as_str(), ())
            .map_err(|e| RegistryError::RouteConflict {
                name: name.to_string(),
                reason: format!("route {}: {}", path, e),
            })?;
    }
    Ok(())
}

type RouteBuilder = fn(&BuildContext, Router, &[&ServiceDeclaration]) -> Result<Router, RegistryError>;

/// Closed table of per-service-type builders. `None` leaves the type
/// unmounted.
fn route_builder(service_type: ServiceType) -> Option<RouteBuilder> {
    match service_type {
        ServiceType::Admission => Some(mount_admission),
        ServiceType::Query => Some(mount_query),
        ServiceType::Route => Some(mount_routes),
        ServiceType::Conversion | ServiceType::Stream | ServiceType::DatasourceProxy => None,
    }
}

struct BuildContext {
    handle: Arc<BackendHandle>,
    mount: String,
    route_target: RouteTarget,
    delegate: Router,
}

impl BuildContext {
    fn assemble(
        &self,
        by_type: &BTreeMap<ServiceType, Vec<&ServiceDeclaration>>,
    ) -> Result<Router, RegistryError> {
        let group_version = self.handle.group_version.clone();
        let mut router = Router::new().route(
            &self.mount,
            get(move || async move { discovery_docs::resource_list(&group_version) })
                .fallback_service(self.delegate.clone()),
        );
        for (service_type, services) in by_type {
            if let Some(builder) = route_builder(*service_type) {
                router = builder(self, router, services)?;
            }
        }
        Ok(router.fallback_service(self.delegate.clone()))
    }

    fn with_fallback(&self, method_router: MethodRouter) -> MethodRouter {
        method_router.fallback_service(self.delegate.clone())
    }
}

fn mount_admission(
    ctx: &BuildContext,
    router: Router,
    _services: &[&ServiceDeclaration],
) -> Result<Router, RegistryError> {
    let mutate_handle = ctx.handle.clone();
    let validate_handle = ctx.handle.clone();
    Ok(router
        .route(
            &format!("{}/admission/mutate", ctx.mount),
            ctx.with_fallback(post(move |req: Request| admission::mutate(mutate_handle, req))),
        )
        .route(
            &format!("{}/admission/validate", ctx.mount),
            ctx.with_fallback(post(move |req: Request| {
                admission::validate(validate_handle, req)
            })),
        ))
}

fn mount_query(
    ctx: &BuildContext,
    router: Router,
    _services: &[&ServiceDeclaration],
) -> Result<Router, RegistryError> {
    let handle = ctx.handle.clone();
    Ok(router.route(
        &format!("{}/namespaces/{{ns}}/connections/{{id}}/query", ctx.mount),
        ctx.with_fallback(post(
            move |Path((ns, id)): Path<(String, String)>, req: Request| {
                query::query(handle, ns, id, req)
            },
        )),
    ))
}

fn mount_routes(
    ctx: &BuildContext,
    mut router: Router,
    services: &[&ServiceDeclaration],
) -> Result<Router, RegistryError> {
    // path -> declared methods, `None` meaning any method
    let mut paths: BTreeMap<&str, Vec<Option<Method>>> = BTreeMap::new();
    for service in services {
        let path = service.path.as_deref().unwrap_or_default();
        let method = match service.method.as_deref() {
            Some(m) if !m.is_empty() => Some(
                Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                    .map_err(|_| RegistryError::invalid(&ctx.handle.name, format!("invalid method {:?}", m)))?,
            ),
            _ => None,
        };
        let methods = paths.entry(path).or_default();
        if methods.contains(&method) {
            return Err(RegistryError::RouteConflict {
                name: ctx.handle.name.clone(),
                reason: format!(
                    "duplicate route {} {}",
                    method.as_ref().map(Method::as_str).unwrap_or("*"),
                    path
                ),
            });
        }
        if methods.iter().any(Option::is_none) || (method.is_none() && !methods.is_empty()) {
            return Err(RegistryError::RouteConflict {
                name: ctx.handle.name.clone(),
                reason: format!("route {} mixes method-less and method-specific declarations", path),
            });
        }
        methods.push(method);
    }

    for (path, methods) in paths {
        let mut method_router: MethodRouter = MethodRouter::new();
        for method in methods {
            let handle = ctx.handle.clone();
            let target = ctx.route_target.clone();
            let handler = move |req: Request| route::forward(handle, target, req);
            method_router = match method {
                None => any(handler),
                Some(method) => {
                    let filter = MethodFilter::try_from(method.clone()).map_err(|_| {
                        RegistryError::invalid(
                            &ctx.handle.name,
                            format!("unsupported method {}", method),
                        )
                    })?;
                    method_router.on(filter, handler)
                }
            };
        }
        router = router.route(
            &format!("{}/namespaces/{{ns}}{}", ctx.mount, path),
            ctx.with_fallback(method_router),
        );
    }
    Ok(router)
}

/// A built route table plus the handle it serves
#[derive(Clone)]
pub struct BackendDispatcher {
    handle: Arc<BackendHandle>,
    router: Router,
}

impl std::fmt::Debug for BackendDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendDispatcher")
            .field("name", &self.handle.name)
            .finish_non_exhaustive()
    }
}

impl BackendDispatcher {
    pub fn name(&self) -> &str {
        &self.handle.name
    }

    pub fn plugin(&self) -> Option<&Arc<dyn PluginBackend>> {
        self.handle.plugin.as_ref()
    }

    pub async fn dispatch(&self, req: Request) -> Response {
        match self.router.clone().oneshot(req).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }
}
