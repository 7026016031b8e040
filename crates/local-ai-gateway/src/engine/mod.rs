//! Local model engine adapters.
//!
//! The lifecycle manager only ever talks to an engine through `ModelEngine`;
//! which runtime sits behind it is decided by the provider's flavor.

pub mod ollama;

pub use ollama::OllamaEngine;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::LifecycleError;

/// A model known to an engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub digest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineInfo {
    pub name: String,
    pub host: String,
}

pub type ByteStream = BoxStream<'static, Result<Bytes, LifecycleError>>;

fn unsupported<T>(engine: &str, op: &str) -> Result<T, LifecycleError> {
    Err(LifecycleError::Engine(format!("{} does not support {}", engine, op)))
}

/// Contract between the gateway core and one local runtime.
///
/// Only `health_check`, `load_model` and `unload_model` are required; the
/// remaining operations answer "unsupported" unless an adapter provides them.
#[async_trait]
pub trait ModelEngine: Send + Sync {
    fn name(&self) -> &str;

    fn info(&self) -> EngineInfo;

    async fn health_check(&self) -> Result<(), LifecycleError>;

    async fn load_model(&self, model: &str) -> Result<(), LifecycleError>;

    async fn unload_model(&self, model: &str) -> Result<(), LifecycleError>;

    async fn install_engine(&self) -> Result<(), LifecycleError> {
        unsupported(self.name(), "install")
    }

    async fn init_env(&self) -> Result<(), LifecycleError> {
        unsupported(self.name(), "init_env")
    }

    async fn start_engine(&self) -> Result<(), LifecycleError> {
        unsupported(self.name(), "start")
    }

    async fn stop_engine(&self) -> Result<(), LifecycleError> {
        unsupported(self.name(), "stop")
    }

    async fn version(&self) -> Result<String, LifecycleError> {
        unsupported(self.name(), "version")
    }

    async fn list_models(&self) -> Result<Vec<EngineModel>, LifecycleError> {
        unsupported(self.name(), "list_models")
    }

    /// Models currently resident in engine memory.
    async fn running_models(&self) -> Result<Vec<EngineModel>, LifecycleError> {
        unsupported(self.name(), "running_models")
    }

    async fn pull_model(&self, _model: &str) -> Result<(), LifecycleError> {
        unsupported(self.name(), "pull_model")
    }

    async fn pull_model_stream(&self, _model: &str) -> Result<ByteStream, LifecycleError> {
        unsupported(self.name(), "pull_model_stream")
    }

    async fn delete_model(&self, _model: &str) -> Result<(), LifecycleError> {
        unsupported(self.name(), "delete_model")
    }

    async fn copy_model(&self, _source: &str, _destination: &str) -> Result<(), LifecycleError> {
        unsupported(self.name(), "copy_model")
    }

    async fn chat(&self, _request: Value) -> Result<Value, LifecycleError> {
        unsupported(self.name(), "chat")
    }

    async fn chat_stream(&self, _request: Value) -> Result<ByteStream, LifecycleError> {
        unsupported(self.name(), "chat_stream")
    }

    async fn embed(&self, _request: Value) -> Result<Value, LifecycleError> {
        unsupported(self.name(), "embed")
    }
}

/// Flavor name → engine adapter.
#[derive(Default, Clone)]
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn ModelEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, flavor: impl Into<String>, engine: Arc<dyn ModelEngine>) {
        self.engines.insert(flavor.into(), engine);
    }

    pub fn get(&self, flavor: &str) -> Result<Arc<dyn ModelEngine>, LifecycleError> {
        self.engines
            .get(flavor)
            .cloned()
            .ok_or_else(|| LifecycleError::Engine(format!("no local engine for flavor {}", flavor)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn ModelEngine>)> {
        self.engines.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

impl std::fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.engines.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Minimal;

    #[async_trait]
    impl ModelEngine for Minimal {
        fn name(&self) -> &str {
            "minimal"
        }

        fn info(&self) -> EngineInfo {
            EngineInfo {
                name: "minimal".into(),
                host: String::new(),
            }
        }

        async fn health_check(&self) -> Result<(), LifecycleError> {
            Ok(())
        }

        async fn load_model(&self, _model: &str) -> Result<(), LifecycleError> {
            Ok(())
        }

        async fn unload_model(&self, _model: &str) -> Result<(), LifecycleError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_optional_operations_are_unsupported() {
        let engine = Minimal;
        assert!(engine.health_check().await.is_ok());
        let err = engine.pull_model("m").await.unwrap_err();
        assert!(err.to_string().contains("does not support pull_model"));
        assert!(engine.running_models().await.is_err());
    }

    #[test]
    fn test_lifecycle_calls_outside_runtime() {
        let engine = Minimal;
        tokio_test::assert_ok!(tokio_test::block_on(engine.load_model("m")));
        tokio_test::assert_ok!(tokio_test::block_on(engine.unload_model("m")));
        tokio_test::assert_err!(tokio_test::block_on(engine.version()));
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = EngineRegistry::new();
        registry.register("ollama", Arc::new(Minimal));
        assert!(registry.get("ollama").is_ok());
        assert!(matches!(registry.get("openvino"), Err(LifecycleError::Engine(_))));
    }
}
