//! Read access to persisted services/providers/models, plus the single write
//! the core performs (marking a model as downloading).

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

use crate::error::{GatewayError, GatewayResult};
use crate::types::{Location, ModelRecord, Service, ServiceProvider};

pub const MODEL_STATUS_DOWNLOADING: &str = "downloading";

#[async_trait]
pub trait ServiceStore: Send + Sync {
    async fn get_service(&self, name: &str) -> GatewayResult<Option<Service>>;

    async fn get_provider(&self, provider_name: &str) -> GatewayResult<Option<ServiceProvider>>;

    /// First enabled provider matching (flavor, location, service).
    async fn find_provider(
        &self,
        flavor: &str,
        location: Location,
        service: &str,
    ) -> GatewayResult<Option<ServiceProvider>>;

    async fn list_providers(&self) -> GatewayResult<Vec<ServiceProvider>>;

    /// Sets an existing model record's status to `downloading`. Unknown models
    /// are left alone.
    async fn mark_model_downloading(&self, model: &str) -> GatewayResult<()>;

    async fn model_status(&self, model: &str) -> GatewayResult<Option<String>>;
}

/// JSON catalog used to seed a `MemoryStore`.
#[derive(Debug, Default, Deserialize)]
pub struct Catalog {
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub providers: Vec<ServiceProvider>,
    #[serde(default)]
    pub models: Vec<ModelRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    services: DashMap<String, Service>,
    providers: DashMap<String, ServiceProvider>,
    models: DashMap<String, ModelRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_catalog(catalog: Catalog) -> Self {
        let store = Self::new();
        for s in catalog.services {
            store.put_service(s);
        }
        for p in catalog.providers {
            store.put_provider(p);
        }
        for m in catalog.models {
            store.put_model(m);
        }
        store
    }

    pub fn from_file(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::config(format!("cannot read providers file {}: {}", path.display(), e))
        })?;
        let catalog: Catalog = serde_json::from_str(&text)?;
        info!(
            "Loaded provider catalog from {}: {} services, {} providers, {} models",
            path.display(),
            catalog.services.len(),
            catalog.providers.len(),
            catalog.models.len()
        );
        Ok(Self::from_catalog(catalog))
    }

    pub fn put_service(&self, service: Service) {
        self.services.insert(service.name.clone(), service);
    }

    pub fn put_provider(&self, provider: ServiceProvider) {
        self.providers.insert(provider.provider_name.clone(), provider);
    }

    pub fn put_model(&self, model: ModelRecord) {
        self.models.insert(model.model_name.clone(), model);
    }
}

#[async_trait]
impl ServiceStore for MemoryStore {
    async fn get_service(&self, name: &str) -> GatewayResult<Option<Service>> {
        Ok(self.services.get(name).map(|s| s.clone()))
    }

    async fn get_provider(&self, provider_name: &str) -> GatewayResult<Option<ServiceProvider>> {
        Ok(self.providers.get(provider_name).map(|p| p.clone()))
    }

    async fn find_provider(
        &self,
        flavor: &str,
        location: Location,
        service: &str,
    ) -> GatewayResult<Option<ServiceProvider>> {
        let mut matches: Vec<ServiceProvider> = self
            .providers
            .iter()
            .filter(|p| {
                p.flavor == flavor
                    && p.service_source == location
                    && p.service_name == service
                    && p.is_enabled()
            })
            .map(|p| p.clone())
            .collect();
        matches.sort_by_key(|p| p.id);
        Ok(matches.into_iter().next())
    }

    async fn list_providers(&self) -> GatewayResult<Vec<ServiceProvider>> {
        let mut all: Vec<ServiceProvider> = self.providers.iter().map(|p| p.clone()).collect();
        all.sort_by_key(|p| p.id);
        Ok(all)
    }

    async fn mark_model_downloading(&self, model: &str) -> GatewayResult<()> {
        if let Some(mut record) = self.models.get_mut(model) {
            record.status = MODEL_STATUS_DOWNLOADING.to_string();
            debug!(model, "model marked as downloading");
        }
        Ok(())
    }

    async fn model_status(&self, model: &str) -> GatewayResult<Option<String>> {
        Ok(self.models.get(model).map(|m| m.status.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "services": [{"name": "chat", "hybrid_policy": "always_local", "local_provider": "local_ollama_chat"}],
        "providers": [
            {"id": 2, "provider_name": "local_ollama_chat", "service_name": "chat", "service_source": "local",
             "url": "http://127.0.0.1:11434/api/chat", "flavor": "ollama"},
            {"id": 3, "provider_name": "disabled_chat", "service_name": "chat", "service_source": "local",
             "url": "http://127.0.0.1:11434/api/chat", "flavor": "ollama", "status": 0}
        ],
        "models": [{"model_name": "llama-x", "provider_name": "local_ollama_chat", "status": "downloaded"}]
    }"#;

    fn store() -> MemoryStore {
        MemoryStore::from_catalog(serde_json::from_str(CATALOG).unwrap())
    }

    #[tokio::test]
    async fn test_lookup_by_name() {
        let s = store();
        let svc = s.get_service("chat").await.unwrap().unwrap();
        assert_eq!(svc.local_provider, "local_ollama_chat");
        assert!(s.get_service("embed").await.unwrap().is_none());
        assert!(s.get_provider("local_ollama_chat").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_find_provider_skips_disabled() {
        let s = store();
        let p = s
            .find_provider("ollama", Location::Local, "chat")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(p.provider_name, "local_ollama_chat");
        assert!(s
            .find_provider("ollama", Location::Remote, "chat")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_mark_model_downloading() {
        let s = store();
        s.mark_model_downloading("llama-x").await.unwrap();
        assert_eq!(
            s.model_status("llama-x").await.unwrap().as_deref(),
            Some(MODEL_STATUS_DOWNLOADING)
        );
        // unknown model is not created
        s.mark_model_downloading("ghost").await.unwrap();
        assert!(s.model_status("ghost").await.unwrap().is_none());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("providers.json");
        std::fs::write(&path, CATALOG).unwrap();
        let s = MemoryStore::from_file(&path).unwrap();
        assert_eq!(s.providers.len(), 2);
        assert!(MemoryStore::from_file(dir.path().join("missing.json")).is_err());
    }
}
