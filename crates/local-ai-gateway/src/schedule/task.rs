//! Task execution: one dispatched request from conversion to the terminal
//! result.
//!
//! ```text
//! Dispatched -> RequestConverting -> Invoking -> ResponseReceiving
//!            -> ResponseConverting (once) | StreamRelaying (N times)
//!            -> Done | Failed
//! ```

use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::auth::{Authenticator, CredentialEndpoints, OutboundRequest};
use super::stream::StreamMode;
use crate::convert::ConversionKind;
use crate::error::{GatewayError, GatewayResult, HttpErrorResponse};
use crate::flavor::{Flavor, FlavorRegistry};
use crate::store::ServiceStore;
use crate::types::{
    AuthType, ConvertContext, HttpContent, ServiceProvider, ServiceRequest, ServiceResult,
    ServiceTarget, FLAVOR_OLLAMA,
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub upstream_timeout: Duration,
    pub poll_interval: Duration,
    pub credential_endpoints: CredentialEndpoints,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_millis(500),
            credential_endpoints: CredentialEndpoints::new(),
        }
    }
}

/// One in-flight execution unit.
#[derive(Debug, Clone)]
pub struct ServiceTask {
    pub id: u64,
    pub request: ServiceRequest,
    pub target: ServiceTarget,
}

/// Sending side of a task's result channel.
///
/// Enforces that nothing follows the terminal result, and turns a dropped
/// receiver into silent discards so the task can keep draining upstream.
pub struct ResultSink {
    task_id: u64,
    tx: mpsc::Sender<ServiceResult>,
    disconnected: bool,
    terminated: bool,
}

impl ResultSink {
    pub fn new(task_id: u64, tx: mpsc::Sender<ServiceResult>) -> Self {
        Self {
            task_id,
            tx,
            disconnected: false,
            terminated: false,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Resolves once the consumer has dropped its receiver.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    async fn emit(&mut self, result: ServiceResult) {
        if self.terminated {
            debug!(task_id = self.task_id, "result after terminal result ignored");
            return;
        }
        if result.kind.is_terminal() {
            self.terminated = true;
        }
        if self.disconnected {
            return;
        }
        if self.tx.send(result).await.is_err() {
            warn!(task_id = self.task_id, "result consumer disconnected, discarding further output");
            self.disconnected = true;
        }
    }

    pub async fn chunk(&mut self, http: HttpContent) {
        let result = ServiceResult::chunk(self.task_id, http);
        self.emit(result).await;
    }

    pub async fn done(&mut self, status: StatusCode, http: HttpContent) {
        let result = ServiceResult::done(self.task_id, status, http);
        self.emit(result).await;
    }

    pub async fn fail(&mut self, error: GatewayError) {
        let result = ServiceResult::failed(self.task_id, error);
        self.emit(result).await;
    }
}

/// Upstream answer, either still streaming or already read in full.
enum UpstreamResponse {
    Live(reqwest::Response),
    Buffered {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
}

impl UpstreamResponse {
    fn status(&self) -> StatusCode {
        match self {
            UpstreamResponse::Live(r) => r.status(),
            UpstreamResponse::Buffered { status, .. } => *status,
        }
    }

    fn headers(&self) -> &HeaderMap {
        match self {
            UpstreamResponse::Live(r) => r.headers(),
            UpstreamResponse::Buffered { headers, .. } => headers,
        }
    }

    async fn bytes(self) -> GatewayResult<Bytes> {
        match self {
            UpstreamResponse::Live(r) => Ok(r.bytes().await?),
            UpstreamResponse::Buffered { body, .. } => Ok(body),
        }
    }
}

pub struct TaskEngine {
    flavors: Arc<FlavorRegistry>,
    store: Arc<dyn ServiceStore>,
    client: reqwest::Client,
    config: EngineConfig,
}

impl TaskEngine {
    pub fn new(
        flavors: Arc<FlavorRegistry>,
        store: Arc<dyn ServiceStore>,
        config: EngineConfig,
    ) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            flavors,
            store,
            client,
            config,
        })
    }

    pub fn flavors(&self) -> &Arc<FlavorRegistry> {
        &self.flavors
    }

    /// Runs the task to completion. Always leaves exactly one terminal
    /// result on the sink, even when the consumer is gone.
    pub async fn execute(&self, task: &ServiceTask, sink: &mut ResultSink) {
        if let Err(e) = self.run(task, sink).await {
            error!(task_id = task.id, error = %e, "service task failed");
            sink.fail(e).await;
        }
        if !sink.is_terminated() {
            sink.fail(GatewayError::conversion("task", "task ended without a result"))
                .await;
        }
    }

    async fn run(&self, task: &ServiceTask, sink: &mut ResultSink) -> GatewayResult<()> {
        let request = &task.request;
        let target = &task.target;
        let provider = &target.provider;

        if let Some(asked) = request.model.as_deref() {
            if !asked.is_empty() && !target.model.is_empty() && asked != target.model {
                warn!(
                    task_id = task.id,
                    model_in_request = asked,
                    model_to_use = %target.model,
                    provider = %provider.provider_name,
                    "model mismatch, using the target's model"
                );
            }
        }
        if request.ask_stream && !target.stream {
            warn!(
                task_id = task.id,
                provider = %provider.provider_name,
                "request asks for stream mode but the provider does not support it"
            );
        }

        // 1. request conversion
        let request_flavor = self.flavors.get(&request.from_flavor)?;
        let target_flavor = self.flavors.get(&target.to_flavor)?;
        let conversion_needed = request_flavor.name() != target_flavor.name();

        let mut content = request.http.clone();
        if conversion_needed {
            info!(
                task_id = task.id,
                from = request_flavor.name(),
                to = target_flavor.name(),
                "converting request"
            );
            let mut ctx = ConvertContext::new().with("stream", target.stream);
            if !target.model.is_empty() {
                ctx.insert("model", target.model.as_str());
            }
            content = self.flavors.convert_between(
                request_flavor.name(),
                target_flavor.name(),
                &request.service,
                ConversionKind::Request,
                &content,
                &ctx,
            )?;
        }

        // 2. invocation
        let outbound = self.build_outbound(provider, content)?;
        let mut response = self.invoke(task, outbound).await?;

        if provider.auth_type == AuthType::Credentials {
            response = check_credential_envelope(response).await?;
        }

        let segments = target_flavor
            .service_def(&request.service)
            .map(|d| (d.request_segments, d.extra_url))
            .unwrap_or((1, String::new()));
        if segments.0 > 1 {
            response = self.poll_until_finished(task, response, &segments.1).await?;
        }

        // 3. response handling
        let mode = StreamMode::detect(response.headers());
        debug!(task_id = task.id, framing = ?mode.framing, "response received");
        let response_ctx =
            ConvertContext::new().with("id", format!("{}{}", rand::random::<u64>(), task.id));

        if !mode.is_stream() {
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            let mut content = HttpContent::new(headers, body);
            if conversion_needed {
                content = self.flavors.convert_between(
                    target_flavor.name(),
                    request_flavor.name(),
                    &request.service,
                    ConversionKind::Response,
                    &content,
                    &response_ctx,
                )?;
            }
            sink.done(status, content).await;
            return Ok(());
        }

        let relay = StreamRelay {
            engine: self,
            task,
            request_flavor: &request_flavor,
            target_flavor: &target_flavor,
            conversion_needed,
            upstream_mode: mode,
            ctx: response_ctx,
        };
        relay.run(response, sink).await
    }

    fn build_outbound(
        &self,
        provider: &ServiceProvider,
        content: HttpContent,
    ) -> GatewayResult<OutboundRequest> {
        let method = Method::from_bytes(provider.method.to_uppercase().as_bytes())
            .map_err(|e| GatewayError::config(format!("bad provider method {}: {}", provider.method, e)))?;

        let mut url = provider.url.clone();
        let mut body = content.body;

        if method == Method::GET && !body.is_empty() {
            url = append_query(&url, &body)?;
            body = Bytes::new();
        } else if !is_empty_object(&provider.extra_json_body) {
            body = merge_extra_body(body, &provider.extra_json_body)?;
        }

        let mut headers = HeaderMap::new();
        for (name, value) in content.headers.iter() {
            if name != CONTENT_LENGTH && name != HOST {
                headers.insert(name.clone(), value.clone());
            }
        }
        if !is_empty_object(&provider.extra_headers) {
            let extra: serde_json::Map<String, Value> = serde_json::from_str(&provider.extra_headers)?;
            for (k, v) in extra {
                let value = match v {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                let name = HeaderName::from_bytes(k.as_bytes())
                    .map_err(|e| GatewayError::config(format!("bad extra header {}: {}", k, e)))?;
                let value = HeaderValue::from_str(&value)
                    .map_err(|e| GatewayError::config(format!("bad extra header value {}: {}", value, e)))?;
                headers.insert(name, value);
            }
        }

        let mut outbound = OutboundRequest {
            method,
            url,
            headers,
            body,
        };
        Authenticator::select(provider)?.authenticate(
            &mut outbound,
            provider,
            &self.config.credential_endpoints,
        )?;
        Ok(outbound)
    }

    async fn send(&self, outbound: OutboundRequest) -> GatewayResult<reqwest::Response> {
        let response = self
            .client
            .request(outbound.method, &outbound.url)
            .headers(outbound.headers)
            .body(outbound.body)
            .send()
            .await?;
        Ok(response)
    }

    /// Sends the outbound call; non-2xx answers become structured upstream
    /// errors.
    async fn invoke(&self, task: &ServiceTask, outbound: OutboundRequest) -> GatewayResult<UpstreamResponse> {
        info!(task_id = task.id, method = %outbound.method, url = %outbound.url, "sending request to service provider");
        let response = self.send(outbound).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(UpstreamResponse::Live(response));
        }

        let provider = &task.target.provider;
        if status == StatusCode::NOT_FOUND && provider.flavor == FLAVOR_OLLAMA {
            if let Err(e) = self.store.mark_model_downloading(&task.target.model).await {
                debug!(task_id = task.id, error = %e, "could not mark model as downloading");
            }
        }
        Err(upstream_error(task.id, response).await)
    }

    /// Submit-then-poll for asynchronous upstream job APIs.
    async fn poll_until_finished(
        &self,
        task: &ServiceTask,
        submitted: UpstreamResponse,
        extra_url: &str,
    ) -> GatewayResult<UpstreamResponse> {
        let body = submitted.bytes().await?;
        let submit: Value = serde_json::from_slice(&body)?;
        let job_id = submit
            .pointer("/output/task_id")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::conversion("poll", "submit response has no output.task_id"))?
            .to_string();
        info!(task_id = task.id, job_id = %job_id, "polling asynchronous upstream job");

        let provider = &task.target.provider;
        let authenticator = Authenticator::select(provider)?;
        loop {
            let mut poll = OutboundRequest {
                method: Method::GET,
                url: format!("{}/{}", extra_url.trim_end_matches('/'), job_id),
                headers: HeaderMap::new(),
                body: Bytes::new(),
            };
            authenticator.authenticate(&mut poll, provider, &self.config.credential_endpoints)?;
            let response = self.send(poll).await?;
            if !response.status().is_success() {
                return Err(upstream_error(task.id, response).await);
            }
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            let parsed: Value = serde_json::from_slice(&body)?;
            let job_status = parsed
                .pointer("/output/task_status")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if matches!(job_status, "SUCCEEDED" | "FAILED" | "UNKNOWN") {
                debug!(task_id = task.id, job_status, "upstream job finished");
                return Ok(UpstreamResponse::Buffered {
                    status,
                    headers,
                    body,
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

struct StreamRelay<'a> {
    engine: &'a TaskEngine,
    task: &'a ServiceTask,
    request_flavor: &'a Flavor,
    target_flavor: &'a Flavor,
    conversion_needed: bool,
    upstream_mode: StreamMode,
    ctx: ConvertContext,
}

#[derive(Default)]
struct RelayState {
    send_back: Option<StreamMode>,
    prologue_sent: bool,
    chunks: usize,
}

impl StreamRelay<'_> {
    async fn run(self, response: UpstreamResponse, sink: &mut ResultSink) -> GatewayResult<()> {
        let status = response.status();
        let prologue = self.request_flavor.stream_prologue(&self.task.request.service);
        let epilogue = self.request_flavor.stream_epilogue(&self.task.request.service);
        let mut decoder = self.upstream_mode.decoder();
        let mut state = RelayState::default();

        match response {
            UpstreamResponse::Live(response) => {
                let mut body = response.bytes_stream();
                while let Some(next) = body.next().await {
                    decoder.push(&next?);
                    while let Some(chunk) = decoder.next_chunk() {
                        self.relay(chunk, &prologue, &mut state, sink).await?;
                    }
                }
            }
            UpstreamResponse::Buffered { body, .. } => {
                decoder.push(&body);
                while let Some(chunk) = decoder.next_chunk() {
                    self.relay(chunk, &prologue, &mut state, sink).await?;
                }
            }
        }

        let remainder = decoder.finish();
        if !remainder.is_empty() {
            self.relay(remainder, &prologue, &mut state, sink).await?;
        }
        debug!(task_id = self.task.id, chunks = state.chunks, "upstream stream finished");

        let send_back = state
            .send_back
            .clone()
            .unwrap_or_else(|| self.upstream_mode.clone());
        if self.conversion_needed {
            for fragment in &epilogue {
                sink.chunk(HttpContent::new(
                    send_back.headers.clone(),
                    send_back.wrap_chunk(fragment.as_bytes()),
                ))
                .await;
            }
        }
        sink.done(status, HttpContent::new(send_back.headers, Bytes::new()))
            .await;
        Ok(())
    }

    async fn relay(
        &self,
        chunk: Bytes,
        prologue: &[String],
        state: &mut RelayState,
        sink: &mut ResultSink,
    ) -> GatewayResult<()> {
        state.chunks += 1;
        if !self.conversion_needed {
            sink.chunk(HttpContent::new(self.upstream_mode.headers.clone(), chunk))
                .await;
            return Ok(());
        }

        let payload = self.upstream_mode.unwrap_chunk(&chunk);
        if payload.is_empty() {
            debug!(task_id = self.task.id, "empty stream chunk dropped");
            return Ok(());
        }
        if state.chunks == 1 {
            info!(
                task_id = self.task.id,
                from = self.target_flavor.name(),
                to = self.request_flavor.name(),
                "converting stream response"
            );
        }

        let content = HttpContent::new(self.upstream_mode.headers.clone(), payload);
        let converted = match self.engine.flavors.convert_between(
            self.target_flavor.name(),
            self.request_flavor.name(),
            &self.task.request.service,
            ConversionKind::StreamResponse,
            &content,
            &self.ctx,
        ) {
            Ok(c) => c,
            Err(e) if e.is_drop() => {
                debug!(task_id = self.task.id, "stream chunk dropped by converter");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let send_back = state
            .send_back
            .get_or_insert_with(|| StreamMode::detect(&converted.headers))
            .clone();
        if !state.prologue_sent {
            state.prologue_sent = true;
            for fragment in prologue {
                sink.chunk(HttpContent::new(
                    send_back.headers.clone(),
                    send_back.wrap_chunk(fragment.as_bytes()),
                ))
                .await;
            }
        }
        let body = send_back.wrap_chunk(&converted.body);
        sink.chunk(HttpContent::new(send_back.headers, body)).await;
        Ok(())
    }
}

async fn upstream_error(task_id: u64, response: reqwest::Response) -> GatewayError {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await.unwrap_or_default();
    warn!(
        task_id,
        status = status.as_u16(),
        body = %String::from_utf8_lossy(&body),
        "service provider returned an error"
    );
    GatewayError::Upstream(HttpErrorResponse {
        status,
        headers,
        body,
    })
}

/// Credential-bundle providers wrap failures in a 200 with `status_code`.
async fn check_credential_envelope(response: UpstreamResponse) -> GatewayResult<UpstreamResponse> {
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/json"))
        .unwrap_or(false);
    if !is_json {
        return Ok(response);
    }
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await?;
    let parsed: Value = serde_json::from_slice(&body)?;
    let ok = parsed
        .get("status_code")
        .and_then(Value::as_f64)
        .map(|code| code == 200.0)
        .unwrap_or(false);
    if !ok {
        return Err(GatewayError::Upstream(HttpErrorResponse {
            status: StatusCode::BAD_REQUEST,
            headers,
            body,
        }));
    }
    Ok(UpstreamResponse::Buffered {
        status,
        headers,
        body,
    })
}

fn is_empty_object(json: &str) -> bool {
    let trimmed = json.trim();
    trimmed.is_empty() || trimmed == "{}"
}

/// Flattens a JSON object body into query parameters.
fn append_query(url: &str, body: &[u8]) -> GatewayResult<String> {
    let params: serde_json::Map<String, Value> = serde_json::from_slice(body)?;
    let mut url = reqwest::Url::parse(url)
        .map_err(|e| GatewayError::config(format!("bad provider url {}: {}", url, e)))?;
    {
        let mut query = url.query_pairs_mut();
        for (key, value) in &params {
            let values = match value {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            for v in values {
                match v {
                    Value::String(s) => query.append_pair(key, &s),
                    Value::Null => continue,
                    other => query.append_pair(key, &other.to_string()),
                };
            }
        }
    }
    Ok(url.to_string())
}

fn merge_extra_body(body: Bytes, extra: &str) -> GatewayResult<Bytes> {
    let extra: serde_json::Map<String, Value> = serde_json::from_str(extra)?;
    let mut parsed = match serde_json::from_slice::<Value>(&body) {
        Ok(Value::Object(map)) => map,
        _ => return Ok(body),
    };
    for (k, v) in extra {
        parsed.insert(k, v);
    }
    Ok(Bytes::from(serde_json::to_vec(&Value::Object(parsed))?))
}
