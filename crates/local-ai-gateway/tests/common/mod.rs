#![allow(dead_code)]

use async_trait::async_trait;
use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use local_ai_gateway::engine::{EngineInfo, EngineRegistry, ModelEngine};
use local_ai_gateway::flavor::FlavorDef;
use local_ai_gateway::types::{ResultKind, Service, ServiceResult};
use local_ai_gateway::{
    DefinitionSource, Dispatcher, EngineConfig, Flavor, FlavorRegistry, InboundRequest,
    LifecycleError, ManagerConfig, MemoryStore, ModelManager, ServiceProvider, ServiceStore,
    TaskEngine,
};

/// Local engine double that records lifecycle calls.
#[derive(Default)]
pub struct RecordingEngine {
    events: Mutex<Vec<String>>,
}

impl RecordingEngine {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn loads(&self) -> usize {
        self.events().iter().filter(|e| e.starts_with("load:")).count()
    }
}

#[async_trait]
impl ModelEngine for RecordingEngine {
    fn name(&self) -> &str {
        "recording"
    }

    fn info(&self) -> EngineInfo {
        EngineInfo {
            name: "recording".into(),
            host: String::new(),
        }
    }

    async fn health_check(&self) -> Result<(), LifecycleError> {
        Ok(())
    }

    async fn load_model(&self, model: &str) -> Result<(), LifecycleError> {
        self.events.lock().unwrap().push(format!("load:{}", model));
        Ok(())
    }

    async fn unload_model(&self, model: &str) -> Result<(), LifecycleError> {
        self.events.lock().unwrap().push(format!("unload:{}", model));
        Ok(())
    }
}

pub struct Harness {
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<MemoryStore>,
    pub engine: Arc<RecordingEngine>,
    pub manager: Arc<ModelManager>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.manager.stop();
    }
}

pub fn service(name: &str, policy: &str, local: &str, remote: &str) -> Service {
    serde_json::from_value(json!({
        "name": name,
        "hybrid_policy": policy,
        "local_provider": local,
        "remote_provider": remote,
    }))
    .unwrap()
}

pub fn provider(name: &str, service: &str, location: &str, flavor: &str, url: String) -> ServiceProvider {
    serde_json::from_value(json!({
        "provider_name": name,
        "service_name": service,
        "service_source": location,
        "flavor": flavor,
        "url": url,
    }))
    .unwrap()
}

/// Built-in dialects plus `(name, yaml)` definitions registered on top.
pub fn flavors_with(extra: &[(&str, &str)]) -> FlavorRegistry {
    let mut flavors = FlavorRegistry::load(&DefinitionSource::Builtin).unwrap();
    for (name, yaml) in extra {
        let def = FlavorDef::from_yaml(name, yaml).unwrap();
        flavors.register(Flavor::new(def, DefinitionSource::Builtin).unwrap());
    }
    flavors
}

pub fn engine_config() -> EngineConfig {
    EngineConfig {
        upstream_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(20),
        ..EngineConfig::default()
    }
}

pub fn harness(services: Vec<Service>, providers: Vec<ServiceProvider>) -> Harness {
    harness_with(flavors_with(&[]), engine_config(), services, providers)
}

pub fn harness_with(
    flavors: FlavorRegistry,
    config: EngineConfig,
    services: Vec<Service>,
    providers: Vec<ServiceProvider>,
) -> Harness {
    let flavors = Arc::new(flavors);
    let store = Arc::new(MemoryStore::new());
    for s in services {
        store.put_service(s);
    }
    for p in providers {
        store.put_provider(p);
    }

    let engine = Arc::new(RecordingEngine::default());
    let mut engines = EngineRegistry::new();
    engines.register("ollama", engine.clone());
    let manager = Arc::new(ModelManager::new(
        ManagerConfig {
            queue_timeout: Duration::from_secs(2),
            ..ManagerConfig::default()
        },
        Arc::new(engines),
    ));
    manager.start();

    let shared: Arc<dyn ServiceStore> = store.clone();
    let task_engine = Arc::new(TaskEngine::new(flavors, shared.clone(), config).unwrap());
    let dispatcher = Arc::new(Dispatcher::new(task_engine, shared, Some(manager.clone())));

    Harness {
        dispatcher,
        store,
        engine,
        manager,
    }
}

pub fn post_json(body: Value) -> InboundRequest {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", "application/json".parse().unwrap());
    InboundRequest {
        method: Method::POST,
        headers,
        body: Bytes::from(body.to_string()),
        query: None,
    }
}

/// Reads until the terminal result; panics if the task never finishes.
pub async fn collect(mut rx: mpsc::Receiver<ServiceResult>) -> Vec<ServiceResult> {
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(result) = rx.recv().await {
            let terminal = result.kind.is_terminal();
            out.push(result);
            if terminal {
                break;
            }
        }
    })
    .await
    .expect("task did not finish in time");
    out
}

pub fn chunks(results: &[ServiceResult]) -> Vec<String> {
    results
        .iter()
        .filter(|r| r.kind == ResultKind::Chunk)
        .map(|r| String::from_utf8_lossy(&r.http.body).into_owned())
        .collect()
}

pub fn terminal_count(results: &[ServiceResult]) -> usize {
    results.iter().filter(|r| r.kind.is_terminal()).count()
}
