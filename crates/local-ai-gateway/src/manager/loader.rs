//! Model residency bookkeeping: load, unload, switch and reference counts.
//!
//! The map of `ModelState`s sits behind one read/write lock. A single
//! `Notify` acts as the condition variable for "some load or unload finished";
//! it is never used for per-request readiness, which goes through the queue's
//! own channels.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::state::{ModelState, ModelStateSnapshot, ModelStatus};
use crate::engine::{EngineRegistry, ModelEngine};
use crate::error::LifecycleError;
use crate::metrics;

#[derive(Debug, Clone, Serialize)]
pub struct LoaderStats {
    pub total_models: usize,
    pub current_model: Option<String>,
    pub status_count: BTreeMap<String, usize>,
}

#[derive(Default)]
struct LoaderInner {
    models: HashMap<String, Arc<ModelState>>,
    current_model: Option<String>,
}

#[derive(Default)]
pub struct Loader {
    inner: RwLock<LoaderInner>,
    changed: Notify,
}

/// Resets a load that never reached an outcome (its future was dropped).
struct LoadGuard<'a> {
    loader: &'a Loader,
    state: &'a ModelState,
    armed: bool,
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(model = %self.state.model_name, "model load abandoned");
            self.state.fail_load(LifecycleError::LoadFailed {
                model: self.state.model_name.clone(),
                reason: "load cancelled".to_string(),
            });
            self.loader.changed.notify_waiters();
        }
    }
}

/// Rolls an abandoned unload back to Idle.
struct UnloadGuard<'a> {
    loader: &'a Loader,
    state: &'a ModelState,
    armed: bool,
}

impl Drop for UnloadGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(model = %self.state.model_name, "model unload abandoned");
            self.state.set_status(ModelStatus::Idle);
            self.loader.changed.notify_waiters();
        }
    }
}

impl Loader {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, LoaderInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, LoaderInner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes sure `model` is resident.
    ///
    /// Returns at once when it already is; joins an in-flight load (and gets
    /// that load's error if it fails); waits out an in-flight unload and then
    /// loads again.
    pub async fn ensure_model_loaded(
        &self,
        model: &str,
        provider_name: &str,
        flavor: &str,
        engine: Arc<dyn ModelEngine>,
    ) -> Result<(), LifecycleError> {
        let mut waited = false;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let state = {
                let mut inner = self.write();
                inner
                    .models
                    .entry(model.to_string())
                    .or_insert_with(|| {
                        Arc::new(ModelState::new(
                            model,
                            provider_name,
                            flavor,
                            engine.clone(),
                            ModelStatus::Unloaded,
                        ))
                    })
                    .clone()
            };

            match state.status() {
                ModelStatus::Idle | ModelStatus::InUse => return Ok(()),
                ModelStatus::Loading => {
                    debug!(model, "waiting for in-flight load");
                    waited = true;
                }
                ModelStatus::Unloading => {
                    debug!(model, "waiting for in-flight unload before reloading");
                }
                ModelStatus::Unloaded => {
                    if waited {
                        if let Some(err) = state.last_error() {
                            return Err(err);
                        }
                    }
                    if state.begin_load() {
                        return self.load(&state).await;
                    }
                    // someone else moved it on; look again
                    continue;
                }
            }

            notified.await;
        }
    }

    async fn load(&self, state: &ModelState) -> Result<(), LifecycleError> {
        info!(model = %state.model_name, provider = %state.provider_name, "Loading model");
        let mut guard = LoadGuard {
            loader: self,
            state,
            armed: true,
        };
        let result = state.engine.load_model(&state.model_name).await;
        guard.armed = false;

        let outcome = match result {
            Ok(()) => {
                state.finish_load();
                info!(model = %state.model_name, "Model loaded successfully");
                Ok(())
            }
            Err(e) => {
                let err = match e {
                    LifecycleError::LoadFailed { .. } => e,
                    other => LifecycleError::LoadFailed {
                        model: state.model_name.clone(),
                        reason: other.to_string(),
                    },
                };
                error!(model = %state.model_name, error = %err, "Model load failed");
                state.fail_load(err.clone());
                Err(err)
            }
        };
        self.changed.notify_waiters();
        outcome
    }

    async fn unload(&self, state: &Arc<ModelState>) -> Result<(), LifecycleError> {
        state.set_status(ModelStatus::Unloading);
        info!(model = %state.model_name, "Unloading model");
        let mut guard = UnloadGuard {
            loader: self,
            state,
            armed: true,
        };
        let result = state.engine.unload_model(&state.model_name).await;
        guard.armed = false;

        if let Err(e) = result {
            state.set_status(ModelStatus::Idle);
            self.changed.notify_waiters();
            return Err(match e {
                LifecycleError::UnloadFailed { .. } => e,
                other => LifecycleError::UnloadFailed {
                    model: state.model_name.clone(),
                    reason: other.to_string(),
                },
            });
        }

        {
            let mut inner = self.write();
            let same_record = inner
                .models
                .get(&state.model_name)
                .map(|s| Arc::ptr_eq(s, state))
                .unwrap_or(false);
            if same_record {
                inner.models.remove(&state.model_name);
            }
            if inner.current_model.as_deref() == Some(state.model_name.as_str()) {
                inner.current_model = None;
            }
        }
        info!(model = %state.model_name, "Model unloaded successfully");
        self.changed.notify_waiters();
        Ok(())
    }

    /// The only path by which the resident model changes. Failure to unload
    /// the current model is logged and does not stop the new load.
    pub async fn switch_model(
        &self,
        current: Option<&str>,
        new_model: &str,
        provider_name: &str,
        flavor: &str,
        engine: Arc<dyn ModelEngine>,
    ) -> Result<(), LifecycleError> {
        if let Some(current) = current.filter(|c| *c != new_model) {
            let resident = self
                .model_state(current)
                .map(|s| s.status().is_loaded())
                .unwrap_or(false);
            if resident {
                info!(from = current, to = new_model, "Switching model");
                metrics::inc_model_switches();
                if let Err(e) = self.force_unload_model(current).await {
                    error!(model = current, error = %e, "Failed to unload current model during switch");
                }
            }
        }

        self.ensure_model_loaded(new_model, provider_name, flavor, engine)
            .await?;
        self.write().current_model = Some(new_model.to_string());
        Ok(())
    }

    /// Drops all references and unloads.
    pub async fn force_unload_model(&self, model: &str) -> Result<(), LifecycleError> {
        let state = self
            .model_state(model)
            .ok_or_else(|| LifecycleError::ModelNotFound(model.to_string()))?;
        state.reset_refs();
        self.unload(&state).await
    }

    pub fn mark_model_in_use(&self, model: &str) -> Result<(), LifecycleError> {
        let state = self
            .model_state(model)
            .ok_or_else(|| LifecycleError::ModelNotFound(model.to_string()))?;
        state.increment_ref()?;
        debug!(model, ref_count = state.ref_count(), "Model marked as in use");
        Ok(())
    }

    pub fn mark_model_idle(&self, model: &str) -> Result<(), LifecycleError> {
        let state = self
            .model_state(model)
            .ok_or_else(|| LifecycleError::ModelNotFound(model.to_string()))?;
        state.decrement_ref();
        debug!(model, ref_count = state.ref_count(), "Model marked as idle");
        Ok(())
    }

    pub fn model_state(&self, model: &str) -> Option<Arc<ModelState>> {
        self.read().models.get(model).cloned()
    }

    pub fn all_states(&self) -> Vec<ModelStateSnapshot> {
        let mut states: Vec<ModelStateSnapshot> =
            self.read().models.values().map(|s| s.snapshot()).collect();
        states.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        states
    }

    pub fn current_model(&self) -> Option<String> {
        self.read().current_model.clone()
    }

    pub fn idle_models(&self, idle_timeout: Duration) -> Vec<Arc<ModelState>> {
        self.read()
            .models
            .values()
            .filter(|s| s.is_idle(idle_timeout))
            .cloned()
            .collect()
    }

    /// Records models an engine already holds in memory as Idle.
    pub async fn initialize_running_models(&self, engines: &EngineRegistry) {
        for (flavor, engine) in engines.iter() {
            let running = match engine.running_models().await {
                Ok(models) => models,
                Err(e) => {
                    debug!(flavor = %flavor, error = %e, "engine cannot report running models");
                    continue;
                }
            };

            let mut inner = self.write();
            for model in running.into_iter().filter(|m| !m.name.is_empty()) {
                let state = ModelState::new(
                    model.name.clone(),
                    flavor.clone(),
                    flavor.clone(),
                    engine.clone(),
                    ModelStatus::Idle,
                );
                state.finish_load();
                info!(model = %model.name, provider = %flavor, "Discovered running model");
                if inner.current_model.is_none() {
                    inner.current_model = Some(model.name.clone());
                }
                inner.models.insert(model.name, Arc::new(state));
            }
        }
        info!(discovered_models = self.read().models.len(), "Loader initialization complete");
    }

    pub fn stats(&self) -> LoaderStats {
        let inner = self.read();
        let mut status_count = BTreeMap::new();
        for state in inner.models.values() {
            *status_count.entry(state.status().as_str().to_string()).or_insert(0) += 1;
        }
        LoaderStats {
            total_models: inner.models.len(),
            current_model: inner.current_model.clone(),
            status_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::test_support::ScriptedEngine;

    fn engine() -> Arc<ScriptedEngine> {
        Arc::new(ScriptedEngine::new())
    }

    // ===== Ensure Loaded =====

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let loader = Loader::new();
        let e = engine();
        loader.ensure_model_loaded("m1", "p", "ollama", e.clone()).await.unwrap();
        loader.ensure_model_loaded("m1", "p", "ollama", e.clone()).await.unwrap();
        assert_eq!(e.load_count("m1"), 1);
        assert_eq!(loader.model_state("m1").unwrap().status(), ModelStatus::Idle);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_share_one_load() {
        let loader = Arc::new(Loader::new());
        let e = Arc::new(ScriptedEngine::new().with_load_delay(Duration::from_millis(50)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let loader = loader.clone();
            let e = e.clone();
            handles.push(tokio::spawn(async move {
                loader.ensure_model_loaded("m1", "p", "ollama", e).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(e.load_count("m1"), 1);
    }

    #[tokio::test]
    async fn test_waiters_receive_the_load_failure() {
        let loader = Arc::new(Loader::new());
        let e = Arc::new(
            ScriptedEngine::new()
                .with_load_delay(Duration::from_millis(50))
                .failing("bad"),
        );

        let mut handles = Vec::new();
        for _ in 0..4 {
            let loader = loader.clone();
            let e = e.clone();
            handles.push(tokio::spawn(async move {
                loader.ensure_model_loaded("bad", "p", "ollama", e).await
            }));
        }
        let results: Vec<_> = futures::future::join_all(handles).await;
        let errors: Vec<LifecycleError> = results
            .into_iter()
            .map(|r| r.unwrap().unwrap_err())
            .collect();
        assert!(errors.iter().all(|e| matches!(e, LifecycleError::LoadFailed { .. })));
        assert_eq!(loader.model_state("bad").unwrap().status(), ModelStatus::Unloaded);
    }

    #[tokio::test]
    async fn test_cancelled_load_resets_record() {
        let loader = Arc::new(Loader::new());
        let e = Arc::new(ScriptedEngine::new().with_load_delay(Duration::from_secs(5)));

        let fut = loader.ensure_model_loaded("m1", "p", "ollama", e.clone());
        let _ = tokio::time::timeout(Duration::from_millis(20), fut).await;
        assert_eq!(loader.model_state("m1").unwrap().status(), ModelStatus::Unloaded);
    }

    // ===== Switch / Unload =====

    #[tokio::test]
    async fn test_switch_unloads_then_loads() {
        let loader = Loader::new();
        let e = engine();
        loader.switch_model(None, "m1", "p", "ollama", e.clone()).await.unwrap();
        assert_eq!(loader.current_model().as_deref(), Some("m1"));

        loader.switch_model(Some("m1"), "m2", "p", "ollama", e.clone()).await.unwrap();
        assert_eq!(loader.current_model().as_deref(), Some("m2"));
        assert!(loader.model_state("m1").is_none());
        assert_eq!(e.events(), vec!["load:m1", "unload:m1", "load:m2"]);
    }

    #[tokio::test]
    async fn test_switch_continues_after_unload_failure() {
        let loader = Loader::new();
        let e = Arc::new(ScriptedEngine::new().failing_unload("m1"));
        loader.switch_model(None, "m1", "p", "ollama", e.clone()).await.unwrap();
        loader.switch_model(Some("m1"), "m2", "p", "ollama", e.clone()).await.unwrap();
        // failed unload rolls m1 back to Idle
        assert_eq!(loader.model_state("m1").unwrap().status(), ModelStatus::Idle);
        assert_eq!(loader.current_model().as_deref(), Some("m2"));
    }

    #[tokio::test]
    async fn test_mark_in_use_and_idle() {
        let loader = Loader::new();
        loader.ensure_model_loaded("m1", "p", "ollama", engine()).await.unwrap();
        loader.mark_model_in_use("m1").unwrap();
        assert_eq!(loader.model_state("m1").unwrap().status(), ModelStatus::InUse);
        loader.mark_model_idle("m1").unwrap();
        assert_eq!(loader.model_state("m1").unwrap().status(), ModelStatus::Idle);
        assert!(matches!(loader.mark_model_in_use("ghost"), Err(LifecycleError::ModelNotFound(_))));
    }

    #[tokio::test]
    async fn test_force_unload_unknown_model() {
        let loader = Loader::new();
        assert!(matches!(
            loader.force_unload_model("ghost").await,
            Err(LifecycleError::ModelNotFound(_))
        ));
    }

    // ===== Discovery / Stats =====

    #[tokio::test]
    async fn test_initialize_running_models() {
        let loader = Loader::new();
        let e = Arc::new(ScriptedEngine::new().with_running(&["llama3:8b"]));
        let mut registry = EngineRegistry::new();
        registry.register("ollama", e);
        loader.initialize_running_models(&registry).await;

        assert_eq!(loader.model_state("llama3:8b").unwrap().status(), ModelStatus::Idle);
        assert_eq!(loader.current_model().as_deref(), Some("llama3:8b"));
        let stats = loader.stats();
        assert_eq!(stats.total_models, 1);
        assert_eq!(stats.status_count.get("idle"), Some(&1));
    }
}
