//! Ollama engine adapter.
//!
//! Talks to a running `ollama serve` over its HTTP API. Loading and unloading
//! use the generate endpoint with `keep_alive` (-1 pins the model, 0 evicts
//! it), which is how Ollama exposes residency control.

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{ByteStream, EngineInfo, EngineModel, ModelEngine};
use crate::error::LifecycleError;

const START_ATTEMPTS: u32 = 30;
const START_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
struct ModelList {
    #[serde(default)]
    models: Vec<EngineModel>,
}

pub struct OllamaEngine {
    host: String,
    client: reqwest::Client,
    server_process: Mutex<Option<Child>>,
}

impl OllamaEngine {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(600))
                .build()
                .unwrap_or_default(),
            server_process: Mutex::new(None),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.host, path)
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<reqwest::Response, LifecycleError> {
        let response = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(engine_error)?;
        check_status(path, response).await
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> Result<T, LifecycleError> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(engine_error)?;
        let response = check_status(path, response).await?;
        response.json::<T>().await.map_err(engine_error)
    }

    fn stream_body(response: reqwest::Response) -> ByteStream {
        response
            .bytes_stream()
            .map(|chunk| chunk.map_err(engine_error))
            .boxed()
    }
}

fn engine_error(e: reqwest::Error) -> LifecycleError {
    LifecycleError::Engine(e.to_string())
}

async fn check_status(path: &str, response: reqwest::Response) -> Result<reqwest::Response, LifecycleError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(LifecycleError::Engine(format!(
        "ollama {} returned {}: {}",
        path, status, body
    )))
}

#[async_trait]
impl ModelEngine for OllamaEngine {
    fn name(&self) -> &str {
        "ollama"
    }

    fn info(&self) -> EngineInfo {
        EngineInfo {
            name: self.name().to_string(),
            host: self.host.clone(),
        }
    }

    async fn health_check(&self) -> Result<(), LifecycleError> {
        let response = self
            .client
            .get(self.url("/"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(engine_error)?;
        check_status("/", response).await.map(|_| ())
    }

    async fn start_engine(&self) -> Result<(), LifecycleError> {
        if self.health_check().await.is_ok() {
            debug!(host = %self.host, "ollama already running");
            return Ok(());
        }

        info!("Starting ollama serve");
        let child = Command::new("ollama")
            .arg("serve")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| LifecycleError::Engine(format!("failed to spawn ollama: {}", e)))?;
        if let Ok(mut slot) = self.server_process.lock() {
            *slot = Some(child);
        }

        for attempt in 1..=START_ATTEMPTS {
            sleep(START_BACKOFF).await;
            if self.health_check().await.is_ok() {
                info!("✅ ollama ready after {} attempts", attempt);
                return Ok(());
            }
        }
        Err(LifecycleError::Engine(format!(
            "ollama did not become healthy after {} attempts",
            START_ATTEMPTS
        )))
    }

    async fn stop_engine(&self) -> Result<(), LifecycleError> {
        let child = self.server_process.lock().ok().and_then(|mut slot| slot.take());
        match child {
            Some(mut child) => {
                info!("Stopping ollama serve");
                child
                    .kill()
                    .map_err(|e| LifecycleError::Engine(format!("failed to stop ollama: {}", e)))
            }
            None => {
                warn!("ollama was not started by the gateway, leaving it running");
                Ok(())
            }
        }
    }

    async fn version(&self) -> Result<String, LifecycleError> {
        let v: Value = self.get_json("/api/version").await?;
        Ok(v.get("version").and_then(Value::as_str).unwrap_or_default().to_string())
    }

    async fn list_models(&self) -> Result<Vec<EngineModel>, LifecycleError> {
        Ok(self.get_json::<ModelList>("/api/tags").await?.models)
    }

    async fn running_models(&self) -> Result<Vec<EngineModel>, LifecycleError> {
        Ok(self.get_json::<ModelList>("/api/ps").await?.models)
    }

    async fn pull_model(&self, model: &str) -> Result<(), LifecycleError> {
        self.post_json("/api/pull", json!({"name": model, "stream": false}))
            .await
            .map(|_| ())
    }

    async fn pull_model_stream(&self, model: &str) -> Result<ByteStream, LifecycleError> {
        let response = self
            .post_json("/api/pull", json!({"name": model, "stream": true}))
            .await?;
        Ok(Self::stream_body(response))
    }

    async fn delete_model(&self, model: &str) -> Result<(), LifecycleError> {
        let response = self
            .client
            .delete(self.url("/api/delete"))
            .json(&json!({"name": model}))
            .send()
            .await
            .map_err(engine_error)?;
        check_status("/api/delete", response).await.map(|_| ())
    }

    async fn copy_model(&self, source: &str, destination: &str) -> Result<(), LifecycleError> {
        self.post_json("/api/copy", json!({"source": source, "destination": destination}))
            .await
            .map(|_| ())
    }

    async fn load_model(&self, model: &str) -> Result<(), LifecycleError> {
        self.post_json("/api/generate", json!({"model": model, "keep_alive": -1}))
            .await
            .map(|_| ())
            .map_err(|e| LifecycleError::LoadFailed {
                model: model.to_string(),
                reason: e.to_string(),
            })
    }

    async fn unload_model(&self, model: &str) -> Result<(), LifecycleError> {
        self.post_json("/api/generate", json!({"model": model, "keep_alive": 0}))
            .await
            .map(|_| ())
            .map_err(|e| LifecycleError::UnloadFailed {
                model: model.to_string(),
                reason: e.to_string(),
            })
    }

    async fn chat(&self, mut request: Value) -> Result<Value, LifecycleError> {
        if let Some(obj) = request.as_object_mut() {
            obj.insert("stream".into(), Value::Bool(false));
        }
        self.post_json("/api/chat", request)
            .await?
            .json()
            .await
            .map_err(engine_error)
    }

    async fn chat_stream(&self, mut request: Value) -> Result<ByteStream, LifecycleError> {
        if let Some(obj) = request.as_object_mut() {
            obj.insert("stream".into(), Value::Bool(true));
        }
        let response = self.post_json("/api/chat", request).await?;
        Ok(Self::stream_body(response))
    }

    async fn embed(&self, request: Value) -> Result<Value, LifecycleError> {
        self.post_json("/api/embed", request)
            .await?
            .json()
            .await
            .map_err(engine_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===== Residency Control =====

    #[tokio::test]
    async fn test_load_and_unload_use_keep_alive() {
        let mut server = mockito::Server::new_async().await;
        let load = server
            .mock("POST", "/api/generate")
            .match_body(mockito::Matcher::Json(json!({"model": "qwen2:7b", "keep_alive": -1})))
            .with_status(200)
            .with_body(r#"{"done":true}"#)
            .create_async()
            .await;
        let unload = server
            .mock("POST", "/api/generate")
            .match_body(mockito::Matcher::Json(json!({"model": "qwen2:7b", "keep_alive": 0})))
            .with_status(200)
            .with_body(r#"{"done":true}"#)
            .create_async()
            .await;

        let engine = OllamaEngine::new(server.url());
        engine.load_model("qwen2:7b").await.unwrap();
        engine.unload_model("qwen2:7b").await.unwrap();
        load.assert_async().await;
        unload.assert_async().await;
    }

    #[tokio::test]
    async fn test_load_failure_is_typed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/generate")
            .with_status(404)
            .with_body(r#"{"error":"model not found"}"#)
            .create_async()
            .await;

        let engine = OllamaEngine::new(server.url());
        let err = engine.load_model("missing").await.unwrap_err();
        assert!(matches!(err, LifecycleError::LoadFailed { ref model, .. } if model == "missing"));
    }

    // ===== Listing =====

    #[tokio::test]
    async fn test_running_models() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/ps")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"models":[{"name":"llama3:8b","size":4661224676,"digest":"abc"}]}"#)
            .create_async()
            .await;

        let engine = OllamaEngine::new(format!("{}/", server.url()));
        let running = engine.running_models().await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].name, "llama3:8b");
    }
}
