//! Local model lifecycle manager.
//!
//! Guarantees that at most one local model is resident and executing at a
//! time. Remote and embedding requests never come through here.
//!
//! ```text
//! acquire() ──► Queue (bounded, timeout) ──► serialization worker
//!                                              │ switch_model / ensure
//!                                              │ mark_model_in_use
//!              ModelLease ◄──── ready ─────────┘
//!              drop(lease) ──── complete ──► mark_model_idle, next request
//! ```

pub mod cleaner;
pub mod loader;
pub mod queue;
pub mod state;

pub use cleaner::{Cleaner, CleanerStats};
pub use loader::{Loader, LoaderStats};
pub use queue::{Queue, QueueStats, QueuedRequest};
pub use state::{ModelState, ModelStateSnapshot, ModelStatus};

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::engine::EngineRegistry;
use crate::error::{GatewayError, GatewayResult, LifecycleError};
use crate::types::{Location, ServiceProvider, SERVICE_EMBED};

/// Local, non-embedding requests need exclusive model residency.
pub fn needs_queuing(location: Location, service: &str) -> bool {
    location == Location::Local && service != SERVICE_EMBED
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub queue_size: usize,
    pub queue_timeout: Duration,
    pub idle_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            queue_size: 10,
            queue_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub loader: LoaderStats,
    pub queue: QueueStats,
    pub cleaner: CleanerStats,
    pub models: Vec<ModelStateSnapshot>,
}

/// Exclusive use of the resident model for one task. Dropping it releases
/// the serialization slot.
#[derive(Debug)]
pub struct ModelLease {
    task_id: u64,
    model: String,
    complete: Option<oneshot::Sender<()>>,
}

impl ModelLease {
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn release(mut self) {
        self.complete_now();
    }

    fn complete_now(&mut self) {
        if let Some(tx) = self.complete.take() {
            debug!(task_id = self.task_id, model = %self.model, "releasing model lease");
            let _ = tx.send(());
        }
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        self.complete_now();
    }
}

pub struct ModelManager {
    config: ManagerConfig,
    engines: Arc<EngineRegistry>,
    loader: Arc<Loader>,
    queue: Arc<Queue>,
    cleaner: Arc<Cleaner>,
}

impl ModelManager {
    pub fn new(config: ManagerConfig, engines: Arc<EngineRegistry>) -> Self {
        let loader = Arc::new(Loader::new());
        let queue = Arc::new(Queue::new(config.queue_size, config.queue_timeout));
        let cleaner = Arc::new(Cleaner::new(
            loader.clone(),
            queue.clone(),
            config.idle_timeout,
        ));
        info!(
            queue_size = config.queue_size,
            queue_timeout = ?config.queue_timeout,
            idle_timeout = ?config.idle_timeout,
            cleanup_interval = ?config.cleanup_interval,
            "Model manager initialized"
        );
        Self {
            config,
            engines,
            loader,
            queue,
            cleaner,
        }
    }

    pub fn start(&self) {
        self.queue.start(self.loader.clone());
        self.cleaner.start(self.config.cleanup_interval);
        info!("Model manager started");
    }

    pub fn stop(&self) {
        self.queue.stop();
        self.cleaner.stop();
        info!("Model manager stopped");
    }

    pub fn loader(&self) -> &Arc<Loader> {
        &self.loader
    }

    pub fn engines(&self) -> &Arc<EngineRegistry> {
        &self.engines
    }

    pub async fn initialize_running_models(&self) {
        self.loader.initialize_running_models(&self.engines).await;
    }

    /// Waits for a turn on the local engine and for `model` to be resident.
    ///
    /// Fails with `QueueTimeout` when admission takes too long and with the
    /// switch error when the model cannot be loaded. Dropping the returned
    /// future abandons the request without holding the slot.
    pub async fn acquire(
        &self,
        task_id: u64,
        model: &str,
        provider: &ServiceProvider,
    ) -> GatewayResult<ModelLease> {
        let engine = self.engines.get(&provider.flavor)?;
        let (ready_tx, ready_rx) = oneshot::channel();
        let (complete_tx, complete_rx) = oneshot::channel();

        self.queue
            .enqueue(QueuedRequest {
                task_id,
                model: model.to_string(),
                provider_name: provider.provider_name.clone(),
                flavor: provider.flavor.clone(),
                engine,
                enqueued_at: Instant::now(),
                ready: ready_tx,
                complete: complete_rx,
            })
            .await?;
        debug!(task_id, model, "Local model request enqueued");

        match ready_rx.await {
            Ok(Ok(())) => Ok(ModelLease {
                task_id,
                model: model.to_string(),
                complete: Some(complete_tx),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(GatewayError::QueueClosed),
        }
    }

    pub fn set_idle_timeout(&self, timeout: Duration) {
        self.cleaner.set_idle_timeout(timeout);
    }

    pub async fn force_cleanup(&self) -> usize {
        self.cleaner.force_cleanup().await
    }

    /// Unloads `model` unless a task holds it or the worker is serving it,
    /// which fails with `ModelInUse`.
    pub async fn force_unload_model(&self, model: &str) -> GatewayResult<()> {
        let state = self
            .loader
            .model_state(model)
            .ok_or_else(|| LifecycleError::ModelNotFound(model.to_string()))?;
        if state.ref_count() > 0 || self.queue.is_serving(model) {
            return Err(LifecycleError::ModelInUse(model.to_string()).into());
        }
        Ok(self.loader.force_unload_model(model).await?)
    }

    pub fn model_states(&self) -> Vec<ModelStateSnapshot> {
        self.loader.all_states()
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            loader: self.loader.stats(),
            queue: self.queue.stats(),
            cleaner: self.cleaner.stats(),
            models: self.loader.all_states(),
        }
    }
}
