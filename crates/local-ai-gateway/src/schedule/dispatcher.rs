//! Target resolution and task spawning.
//!
//! `invoke_service` is the single entry point route handlers use: it turns
//! an inbound HTTP request into a `ServiceRequest`, picks a local or remote
//! provider for it, and spawns the task whose results stream back over the
//! returned channel.

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::task::{ResultSink, ServiceTask, TaskEngine};
use crate::error::{GatewayError, GatewayResult};
use crate::flavor::FlavorRegistry;
use crate::manager::{needs_queuing, ModelManager};
use crate::metrics;
use crate::store::ServiceStore;
use crate::types::{
    HttpContent, HybridPolicy, Location, ServiceProvider, ServiceRequest, ServiceResult,
    ServiceTarget,
};

const RESULT_BUFFER: usize = 64;

/// Raw request as received by a flavor route.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub query: Option<String>,
}

/// Enabled providers configured for one service.
#[derive(Debug, Clone, Default)]
pub struct Candidates {
    pub local: Option<ServiceProvider>,
    pub remote: Option<ServiceProvider>,
}

impl Candidates {
    pub fn get(&self, location: Location) -> Option<&ServiceProvider> {
        match location {
            Location::Local => self.local.as_ref(),
            Location::Remote => self.remote.as_ref(),
        }
    }
}

/// Chooses between the local and remote provider of a service.
pub trait TargetSelector: Send + Sync {
    fn select(
        &self,
        policy: HybridPolicy,
        service: &str,
        candidates: &Candidates,
    ) -> GatewayResult<Location>;
}

/// `always_local` and `always_remote` are strict; `default` prefers the
/// local provider and falls back to the remote one.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicySelector;

impl TargetSelector for PolicySelector {
    fn select(
        &self,
        policy: HybridPolicy,
        service: &str,
        candidates: &Candidates,
    ) -> GatewayResult<Location> {
        match policy {
            HybridPolicy::AlwaysLocal => candidates
                .local
                .as_ref()
                .map(|_| Location::Local)
                .ok_or_else(|| GatewayError::not_found(format!("no local provider for service {}", service))),
            HybridPolicy::AlwaysRemote => candidates
                .remote
                .as_ref()
                .map(|_| Location::Remote)
                .ok_or_else(|| GatewayError::not_found(format!("no remote provider for service {}", service))),
            HybridPolicy::Default => {
                if candidates.local.is_some() {
                    Ok(Location::Local)
                } else if candidates.remote.is_some() {
                    Ok(Location::Remote)
                } else {
                    Err(GatewayError::not_found(format!(
                        "no default provider for service {}",
                        service
                    )))
                }
            }
        }
    }
}

/// The requested model when the provider offers it (or lists nothing), else
/// the provider's first model, else the flavor default.
pub fn resolve_model(
    requested: Option<&str>,
    provider: &ServiceProvider,
    flavor_default: Option<String>,
) -> String {
    let offered = provider.properties().models;
    if let Some(requested) = requested.filter(|m| !m.is_empty()) {
        if offered.is_empty() || offered.iter().any(|m| m == requested) {
            return requested.to_string();
        }
    }
    offered
        .into_iter()
        .next()
        .or(flavor_default)
        .unwrap_or_default()
}

/// `a=1&a=2&b=x` → `{"a": ["1", "2"], "b": ["x"]}`
fn query_to_json(query: &str) -> GatewayResult<Bytes> {
    let url = reqwest::Url::parse(&format!("http://localhost/?{}", query))
        .map_err(|e| GatewayError::Serialization(format!("bad query string: {}", e)))?;
    let mut map = Map::new();
    for (key, value) in url.query_pairs() {
        let entry = map
            .entry(key.into_owned())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(values) = entry {
            values.push(Value::String(value.into_owned()));
        }
    }
    Ok(Bytes::from(serde_json::to_vec(&Value::Object(map))?))
}

fn first_scalar(value: &Value) -> Option<&Value> {
    match value {
        Value::Array(items) => items.first(),
        other => Some(other),
    }
}

fn truthy(value: Option<&Value>) -> bool {
    match value.and_then(first_scalar) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true") || s == "1",
        Some(Value::Number(n)) => n.as_i64().map(|n| n != 0).unwrap_or(false),
        _ => false,
    }
}

/// Decrements the active-task gauge when the task ends, however it ends.
struct ActiveTask;

impl ActiveTask {
    fn begin() -> Self {
        metrics::inc_active_tasks();
        ActiveTask
    }
}

impl Drop for ActiveTask {
    fn drop(&mut self) {
        metrics::dec_active_tasks();
    }
}

pub struct Dispatcher {
    engine: Arc<TaskEngine>,
    store: Arc<dyn ServiceStore>,
    manager: Option<Arc<ModelManager>>,
    selector: Arc<dyn TargetSelector>,
    next_task_id: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<TaskEngine>,
        store: Arc<dyn ServiceStore>,
        manager: Option<Arc<ModelManager>>,
    ) -> Self {
        Self {
            engine,
            store,
            manager,
            selector: Arc::new(PolicySelector),
            next_task_id: AtomicU64::new(0),
        }
    }

    pub fn with_selector(mut self, selector: Arc<dyn TargetSelector>) -> Self {
        self.selector = selector;
        self
    }

    pub fn flavors(&self) -> &Arc<FlavorRegistry> {
        self.engine.flavors()
    }

    pub fn manager(&self) -> Option<&Arc<ModelManager>> {
        self.manager.as_ref()
    }

    /// Builds the request, resolves its target and spawns the task.
    pub async fn invoke_service(
        &self,
        flavor: &str,
        service: &str,
        inbound: InboundRequest,
    ) -> GatewayResult<(u64, mpsc::Receiver<ServiceResult>)> {
        let request = self.build_request(flavor, service, inbound).await?;
        let target = self.resolve(&request).await?;
        Ok(self.submit(request, target))
    }

    async fn build_request(
        &self,
        flavor: &str,
        service: &str,
        inbound: InboundRequest,
    ) -> GatewayResult<ServiceRequest> {
        self.flavors().get(flavor)?;
        let record = self
            .store
            .get_service(service)
            .await?
            .filter(|s| s.status != 0)
            .ok_or_else(|| GatewayError::not_found(format!("service {} is not available", service)))?;

        let body = if inbound.method == Method::GET {
            match inbound.query.as_deref().filter(|q| !q.is_empty()) {
                Some(query) => query_to_json(query)?,
                None => Bytes::new(),
            }
        } else {
            inbound.body
        };

        let parsed: Option<Value> = serde_json::from_slice(&body).ok();
        let field = |name: &str| parsed.as_ref().and_then(|v| v.get(name));
        let model = field("model")
            .and_then(first_scalar)
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(ServiceRequest {
            service: service.to_string(),
            model,
            from_flavor: flavor.to_string(),
            hybrid_policy: record.hybrid_policy,
            ask_stream: truthy(field("stream")),
            think: truthy(field("think")),
            http: HttpContent::new(inbound.headers, body),
        })
    }

    async fn candidates(&self, service: &str) -> GatewayResult<Candidates> {
        let record = self
            .store
            .get_service(service)
            .await?
            .ok_or_else(|| GatewayError::not_found(format!("service {} is not available", service)))?;
        let mut candidates = Candidates::default();
        for (name, location) in [
            (&record.local_provider, Location::Local),
            (&record.remote_provider, Location::Remote),
        ] {
            if name.is_empty() {
                continue;
            }
            let provider = self
                .store
                .get_provider(name)
                .await?
                .filter(|p| p.is_enabled() && p.service_source == location);
            match location {
                Location::Local => candidates.local = provider,
                Location::Remote => candidates.remote = provider,
            }
        }
        Ok(candidates)
    }

    /// Picks location, provider, model and stream mode for a request.
    pub async fn resolve(&self, request: &ServiceRequest) -> GatewayResult<ServiceTarget> {
        let candidates = self.candidates(&request.service).await?;
        let location = self
            .selector
            .select(request.hybrid_policy, &request.service, &candidates)?;
        let provider = candidates.get(location).cloned().ok_or_else(|| {
            GatewayError::not_found(format!(
                "{} provider for service {} not found",
                location, request.service
            ))
        })?;

        let to_flavor = self.flavors().get(&provider.flavor)?;
        let model = resolve_model(
            request.model.as_deref(),
            &provider,
            to_flavor.default_model(&request.service),
        );
        let stream = request.ask_stream && provider.supports_stream();
        debug!(
            service = %request.service,
            %location,
            provider = %provider.provider_name,
            model = %model,
            stream,
            "target resolved"
        );

        Ok(ServiceTarget {
            location,
            to_flavor: provider.flavor.clone(),
            model,
            provider,
            stream,
        })
    }

    /// Spawns the task; its results arrive on the returned receiver.
    pub fn submit(
        &self,
        request: ServiceRequest,
        target: ServiceTarget,
    ) -> (u64, mpsc::Receiver<ServiceResult>) {
        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(RESULT_BUFFER);
        let task = ServiceTask {
            id: task_id,
            request,
            target,
        };
        info!(
            task_id,
            service = %task.request.service,
            from = %task.request.from_flavor,
            to = %task.target.to_flavor,
            location = %task.target.location,
            "task dispatched"
        );

        let engine = self.engine.clone();
        let manager = self
            .manager
            .clone()
            .filter(|_| needs_queuing(task.target.location, &task.request.service));
        tokio::spawn(async move {
            let _active = ActiveTask::begin();
            let mut sink = ResultSink::new(task.id, tx);

            let lease = match manager {
                Some(manager) => {
                    // a caller that goes away while queued gives up its turn
                    let acquired = tokio::select! {
                        acquired = manager.acquire(task.id, &task.target.model, &task.target.provider) => acquired,
                        _ = sink.closed() => {
                            info!(task_id = task.id, "caller disconnected while waiting for local model");
                            return;
                        }
                    };
                    match acquired {
                        Ok(lease) => Some(lease),
                        Err(e) => {
                            warn!(task_id = task.id, error = %e, "could not acquire local model");
                            sink.fail(e).await;
                            return;
                        }
                    }
                }
                None => None,
            };

            engine.execute(&task, &mut sink).await;
            drop(lease);
        });

        (task_id, rx)
    }
}
