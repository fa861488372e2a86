//! dpad - Data Plane Aggregator Daemon
//!
//! Fronts declared backends under `/apis/{group}/{version}` and merges their
//! groups into discovery.
//!
//! Usage:
//!   dpad [config.toml]
//!
//! Without a config file every section takes its defaults: no descriptors,
//! no plugins, anonymous callers and a local 404 delegate.

mod auth;
mod config;
mod delegate;

use std::path::Path;
use std::sync::Arc;

use axum::middleware;
use dpa_api::{create_router, AppState, DiscoveryManager, DispatcherFactory, ProxyRegistry};
use dpa_core::{BackendResolver, InMemoryStore, PluginContextProvider, Readiness};
use dpa_gateway::{AvailabilityChecker, Controller};
use dpa_proxy::{HttpPluginBackend, ProxyMetrics, StaticBackendResolver, StaticContextProvider};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::auth::TokenAuthenticator;
use crate::config::{Config, LogFormat};

/// Parsed command-line arguments
struct Args {
    /// Daemon config file (TOML)
    config_path: Option<String>,
}

fn parse_args() -> Args {
    let mut result = Args { config_path: None };
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            arg if !arg.starts_with('-') => result.config_path = Some(arg.to_string()),
            other => eprintln!("dpad: ignoring unknown argument {}", other),
        }
    }
    result
}

fn print_help() {
    eprintln!(
        r#"dpad - Data Plane Aggregator Daemon

Usage: dpad [config.toml]

Options:
  -h, --help    Print this help message

Examples:
  # Defaults: no descriptors, anonymous callers
  dpad

  # With a config file
  dpad config/dpad.toml
"#
    );
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_filter().into());
    let registry = tracing_subscriber::registry().with(filter);
    match config.logging.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = parse_args();
    let config = match &args.config_path {
        Some(path) => Config::load(Path::new(path))?,
        None => Config::default(),
    };
    init_tracing(&config);

    tracing::info!("Starting dpad (Data Plane Aggregator Daemon)");
    if let Some(path) = &args.config_path {
        tracing::info!(path = %path, "Loaded config");
    }

    // Resource store, seeded from the descriptor file
    let descriptors = config.load_descriptors()?;
    tracing::info!(count = descriptors.len(), "Seeding descriptor store");
    let store = Arc::new(InMemoryStore::with_items(descriptors));

    // Plugin execution endpoints
    let mut resolver = StaticBackendResolver::new();
    for (plugin_id, endpoint) in &config.plugins {
        tracing::info!(plugin_id = %plugin_id, url = %endpoint.url, "Registering plugin backend");
        resolver.insert(Arc::new(HttpPluginBackend::new(plugin_id, &endpoint.url)?));
    }
    let resolver: Arc<dyn BackendResolver> = Arc::new(resolver);
    let contexts: Arc<dyn PluginContextProvider> =
        Arc::new(StaticContextProvider::new(config.server.org_id));

    let prometheus = prometheus::Registry::new();
    let metrics = ProxyMetrics::register(&prometheus)?;

    let request_timeout = config.server.request_timeout();
    let delegate = delegate::router(&config.delegate, request_timeout)?;

    let factory = DispatcherFactory::new(resolver.clone(), contexts.clone(), delegate.clone(), metrics)?
        .with_request_timeout(request_timeout)
        .with_body_limit(config.server.body_limit_bytes);
    let registry = Arc::new(ProxyRegistry::new(factory));
    let discovery = Arc::new(DiscoveryManager::new(
        &config.discovery.local_group,
        &config.discovery.local_versions,
        delegate,
    ));
    let readiness = Readiness::new();

    let state = AppState::new(registry.clone(), discovery, readiness.clone(), prometheus)
        .with_body_limit(config.server.body_limit_bytes);
    let authenticator = Arc::new(TokenAuthenticator::new(&config.auth.tokens));
    if config.auth.tokens.is_empty() {
        tracing::warn!("No auth tokens configured, all callers are anonymous");
    }
    let app = create_router(state).layer(middleware::from_fn_with_state(
        authenticator,
        auth::authenticate,
    ));

    let shutdown = CancellationToken::new();

    let controller = Arc::new(Controller::new(
        store.clone(),
        registry,
        readiness,
        config.controller.clone(),
    ));
    let controller_task = tokio::spawn(controller.run(shutdown.clone()));

    let checker = AvailabilityChecker::new(
        store.clone(),
        store,
        resolver,
        contexts,
        config.availability.clone(),
    )?;
    let availability_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { checker.run(shutdown).await }
    });

    let listener = tokio::net::TcpListener::bind(config.server.listen).await?;
    tracing::info!("Listening on http://{}", config.server.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    let (controller_result, availability_result) = tokio::join!(controller_task, availability_task);
    if let Err(e) = controller_result {
        tracing::warn!(error = %e, "Controller task failed");
    }
    if let Err(e) = availability_result {
        tracing::warn!(error = %e, "Availability task failed");
    }
    tracing::info!("dpad stopped");
    Ok(())
}

/// Resolve on Ctrl-C, cancelling the background loops
async fn shutdown_signal(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
    shutdown.cancel();
}
