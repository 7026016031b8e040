//! Server bootstrap and routing.
//!
//! `run_server` builds every component once (flavors, store, engines, model
//! manager, task engine, dispatcher) and shares them with the handlers
//! through `AppState`. Flavor routes are derived from the loaded dialect
//! definitions at startup.

use axum::{
    extract::{RawQuery, State},
    http::{HeaderMap, Method},
    routing::{get, on, post, MethodFilter, MethodRouter},
    Router,
};
use bytes::Bytes;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::api;
use crate::config::Config;
use crate::engine::{EngineRegistry, OllamaEngine};
use crate::error::{GatewayError, GatewayResult};
use crate::flavor::{DefinitionSource, FlavorRegistry};
use crate::manager::ModelManager;
use crate::schedule::{Dispatcher, InboundRequest, TaskEngine};
use crate::store::{MemoryStore, ServiceStore};
use crate::types::FLAVOR_OLLAMA;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            started_at: Instant::now(),
        }
    }
}

/// One flavor endpoint to mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedRoute {
    pub method: Method,
    pub path: String,
    pub flavor: String,
    pub service: String,
}

/// Expands every flavor's endpoint templates into concrete routes: the raw
/// path when the service asks for it, plus the prefixed path
/// (`<base>/services` for the canonical flavor, `<base>/api_flavors/<name>`
/// otherwise). The first flavor to claim a (method, path) keeps it.
pub fn flavor_routes(flavors: &FlavorRegistry, route_base: &str) -> GatewayResult<Vec<MountedRoute>> {
    let mut names = flavors.names();
    names.sort();
    let mut seen = HashSet::new();
    let mut routes = Vec::new();

    for name in names {
        let flavor = flavors.get(&name)?;
        let prefix = if flavor.is_canonical() {
            format!("{}/services", route_base)
        } else {
            format!("{}/api_flavors/{}", route_base, name)
        };
        for spec in flavor.routes()? {
            let method = Method::from_bytes(spec.method.as_bytes()).map_err(|_| {
                GatewayError::config(format!("flavor {} has invalid method {}", name, spec.method))
            })?;
            let mut paths = Vec::with_capacity(2);
            if spec.install_raw {
                paths.push(spec.path.clone());
            }
            paths.push(format!("{}{}", prefix, spec.path));

            for path in paths {
                if !seen.insert((method.clone(), path.clone())) {
                    warn!(flavor = %name, %method, %path, "route already installed, skipping");
                    continue;
                }
                routes.push(MountedRoute {
                    method: method.clone(),
                    path,
                    flavor: name.clone(),
                    service: spec.service.clone(),
                });
            }
        }
    }
    Ok(routes)
}

fn service_handler(route: &MountedRoute) -> GatewayResult<MethodRouter<AppState>> {
    let filter = MethodFilter::try_from(route.method.clone()).map_err(|_| {
        GatewayError::config(format!("method {} cannot be routed", route.method))
    })?;
    let path = route.path.clone();
    let flavor = route.flavor.clone();
    let service = route.service.clone();

    Ok(on(
        filter,
        move |State(state): State<AppState>,
              method: Method,
              headers: HeaderMap,
              RawQuery(query): RawQuery,
              body: Bytes| {
            let path = path.clone();
            let flavor = flavor.clone();
            let service = service.clone();
            async move {
                let inbound = InboundRequest {
                    method,
                    headers,
                    body,
                    query,
                };
                api::handle_service(state, path, flavor, service, inbound).await
            }
        },
    ))
}

/// Router with flavor routes, admin routes and the tower-http layers.
pub fn build_router(state: AppState, route_base: &str) -> GatewayResult<Router> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    let mut by_path: BTreeMap<String, MethodRouter<AppState>> = BTreeMap::new();
    let routes = flavor_routes(state.dispatcher.flavors(), route_base)?;
    for route in &routes {
        let handler = service_handler(route)?;
        debug!(method = %route.method, path = %route.path, flavor = %route.flavor, "mounting route");
        let merged = match by_path.remove(&route.path) {
            Some(existing) => existing.merge(handler),
            None => handler,
        };
        by_path.insert(route.path.clone(), merged);
    }
    info!("Mounted {} flavor routes", routes.len());

    let mut router = Router::new()
        .route(&format!("{}/models/states", route_base), get(api::model_states))
        .route(&format!("{}/models/unload", route_base), post(api::unload_model))
        .route(&format!("{}/flavors/:name/reload", route_base), post(api::reload_flavor))
        .route("/healthz", get(api::health))
        .route("/metrics", get(crate::metrics::get_metrics));
    for (path, method_router) in by_path {
        router = router.route(&path, method_router);
    }

    Ok(router
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(600)))
        .with_state(state))
}

fn build_store(config: &Config) -> anyhow::Result<Arc<dyn ServiceStore>> {
    let store = match &config.providers_file {
        Some(path) => MemoryStore::from_file(path)?,
        None => {
            warn!("No PROVIDERS_FILE configured, starting with an empty provider store");
            MemoryStore::new()
        }
    };
    Ok(Arc::new(store))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Builds all components and serves until Ctrl-C.
pub async fn run_server(cfg: Config) -> anyhow::Result<()> {
    crate::telemetry::init_tracing();
    crate::metrics::init_metrics();
    cfg.print_config();

    let source = match &cfg.flavor_dir {
        Some(dir) => DefinitionSource::Directory(dir.clone()),
        None => DefinitionSource::Builtin,
    };
    let flavors = Arc::new(FlavorRegistry::load(&source)?);
    let store = build_store(&cfg)?;

    let mut engines = EngineRegistry::new();
    engines.register(FLAVOR_OLLAMA, Arc::new(OllamaEngine::new(cfg.ollama_host.clone())));
    let engines = Arc::new(engines);

    let manager = Arc::new(ModelManager::new(cfg.manager_config(), engines));
    manager.start();
    manager.initialize_running_models().await;

    let task_engine = Arc::new(TaskEngine::new(flavors, store.clone(), cfg.engine_config())?);
    let dispatcher = Arc::new(Dispatcher::new(task_engine, store, Some(manager.clone())));

    let app = build_router(AppState::new(dispatcher), &cfg.route_base())?;

    let addr = cfg.api_addr()?;
    info!("Starting HTTP server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.stop();
    info!("Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flavor::{Flavor, FlavorDef};

    fn registry() -> FlavorRegistry {
        let mut registry = FlavorRegistry::new();
        for (name, yaml) in [
            (
                "gateway",
                "name: gateway\nservices:\n  chat:\n    endpoints: [\"POST /chat\"]\n",
            ),
            (
                "ollama",
                "name: ollama\nservices:\n  chat:\n    endpoints: [\"POST /api/chat\"]\n    install_raw_routes: true\n  models:\n    endpoints: [\"GET /api/tags\"]\n    install_raw_routes: true\n",
            ),
            (
                "shadow",
                "name: shadow\nservices:\n  chat:\n    endpoints: [\"POST /api/chat\"]\n    install_raw_routes: true\n",
            ),
        ] {
            let def = FlavorDef::from_yaml(name, yaml).unwrap();
            registry.register(Flavor::new(def, DefinitionSource::Builtin).unwrap());
        }
        registry
    }

    // ===== Route Expansion =====

    #[test]
    fn test_canonical_and_flavor_prefixes() {
        let routes = flavor_routes(&registry(), "/gateway/v0.1").unwrap();
        let paths: Vec<&str> = routes.iter().map(|r| r.path.as_str()).collect();
        assert!(paths.contains(&"/gateway/v0.1/services/chat"));
        assert!(paths.contains(&"/gateway/v0.1/api_flavors/ollama/api/chat"));
        assert!(paths.contains(&"/api/chat"));
        assert!(paths.contains(&"/api/tags"));
        assert!(!paths.contains(&"/chat"));
    }

    #[test]
    fn test_duplicate_raw_route_keeps_first_flavor() {
        let routes = flavor_routes(&registry(), "/gateway/v0.1").unwrap();
        let raw: Vec<&MountedRoute> = routes.iter().filter(|r| r.path == "/api/chat").collect();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].flavor, "ollama");
        assert!(routes
            .iter()
            .any(|r| r.path == "/gateway/v0.1/api_flavors/shadow/api/chat"));
    }

    #[test]
    fn test_methods_are_parsed() {
        let routes = flavor_routes(&registry(), "/gateway/v0.1").unwrap();
        let tags = routes.iter().find(|r| r.path == "/api/tags").unwrap();
        assert_eq!(tags.method, Method::GET);
        assert_eq!(tags.service, "models");
    }
}
