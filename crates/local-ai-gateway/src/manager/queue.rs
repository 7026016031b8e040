//! Admission queue and capacity-one serialization stage for local models.
//!
//! Requests are admitted onto a bounded channel (with a timeout) and served
//! one at a time by a single worker. For each request the worker makes the
//! requested model resident, marks it in use and signals readiness; it then
//! holds the slot until the request's lease is released.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use super::loader::Loader;
use crate::engine::ModelEngine;
use crate::error::{GatewayError, GatewayResult, LifecycleError};
use crate::metrics;

/// A pending local-model access ticket.
pub struct QueuedRequest {
    pub task_id: u64,
    pub model: String,
    pub provider_name: String,
    pub flavor: String,
    pub engine: Arc<dyn ModelEngine>,
    pub enqueued_at: Instant,
    /// Ok once the model is resident and marked in use, Err on switch failure.
    pub ready: oneshot::Sender<GatewayResult<()>>,
    /// Resolves (value or drop) when the task is finished with the model.
    pub complete: oneshot::Receiver<()>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CurrentTask {
    pub task_id: u64,
    pub model_name: String,
    pub queue_wait_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queue_size: usize,
    pub queue_length: usize,
    pub queue_timeout_secs: u64,
    pub processing: bool,
    pub started: bool,
    pub current_task: Option<CurrentTask>,
}

#[derive(Default)]
struct Shared {
    pending: AtomicUsize,
    processing: AtomicBool,
    current: Mutex<Option<CurrentTask>>,
}

impl Shared {
    fn set_current(&self, task: Option<CurrentTask>) {
        self.processing.store(task.is_some(), Ordering::SeqCst);
        if let Ok(mut current) = self.current.lock() {
            *current = task;
        }
    }
}

struct Running {
    tx: mpsc::Sender<QueuedRequest>,
    shutdown: watch::Sender<bool>,
}

pub struct Queue {
    queue_size: usize,
    queue_timeout: Duration,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl Queue {
    pub fn new(queue_size: usize, queue_timeout: Duration) -> Self {
        Self {
            queue_size: queue_size.max(1),
            queue_timeout,
            shared: Arc::new(Shared::default()),
            running: Mutex::new(None),
        }
    }

    pub fn start(&self, loader: Arc<Loader>) {
        let Ok(mut running) = self.running.lock() else {
            return;
        };
        if running.is_some() {
            warn!("Queue already started");
            return;
        }
        let (tx, rx) = mpsc::channel(self.queue_size);
        let (shutdown, shutdown_rx) = watch::channel(false);
        tokio::spawn(process_loop(rx, loader, self.shared.clone(), shutdown_rx));
        *running = Some(Running { tx, shutdown });
        info!(
            queue_size = self.queue_size,
            queue_timeout = ?self.queue_timeout,
            "Queue started"
        );
    }

    pub fn stop(&self) {
        let running = self.running.lock().ok().and_then(|mut r| r.take());
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            info!("Queue stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.running.lock().map(|r| r.is_some()).unwrap_or(false)
    }

    /// Admits a request, waiting at most the queue timeout for room.
    pub async fn enqueue(&self, request: QueuedRequest) -> GatewayResult<()> {
        let tx = self
            .running
            .lock()
            .ok()
            .and_then(|r| r.as_ref().map(|r| r.tx.clone()))
            .ok_or(GatewayError::QueueClosed)?;

        debug!(
            task_id = request.task_id,
            model = %request.model,
            queue_length = self.len(),
            "Enqueueing request"
        );
        let task_id = request.task_id;
        self.shared.pending.fetch_add(1, Ordering::SeqCst);
        metrics::inc_queue();
        match tx.send_timeout(request, self.queue_timeout).await {
            Ok(()) => {
                debug!(task_id, "Request enqueued");
                Ok(())
            }
            Err(e) => {
                self.shared.pending.fetch_sub(1, Ordering::SeqCst);
                metrics::dec_queue();
                match e {
                    mpsc::error::SendTimeoutError::Timeout(_) => {
                        Err(GatewayError::QueueTimeout(self.queue_timeout))
                    }
                    mpsc::error::SendTimeoutError::Closed(_) => Err(GatewayError::QueueClosed),
                }
            }
        }
    }

    /// Requests admitted but not yet picked up by the worker.
    pub fn len(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_processing(&self) -> bool {
        self.shared.processing.load(Ordering::SeqCst)
    }

    /// True while any request is being served or waiting.
    pub fn has_active_or_pending(&self) -> bool {
        self.is_processing() || !self.is_empty()
    }

    /// True while the worker is serving a request for `model`.
    pub fn is_serving(&self, model: &str) -> bool {
        self.shared
            .current
            .lock()
            .ok()
            .and_then(|c| c.as_ref().map(|t| t.model_name == model))
            .unwrap_or(false)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queue_size: self.queue_size,
            queue_length: self.len(),
            queue_timeout_secs: self.queue_timeout.as_secs(),
            processing: self.is_processing(),
            started: self.is_started(),
            current_task: self.shared.current.lock().ok().and_then(|c| c.clone()),
        }
    }
}

async fn process_loop(
    mut rx: mpsc::Receiver<QueuedRequest>,
    loader: Arc<Loader>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Queue process loop started");
    loop {
        let request = tokio::select! {
            request = rx.recv() => match request {
                Some(r) => r,
                None => break,
            },
            _ = shutdown.changed() => break,
        };
        let waited = request.enqueued_at.elapsed();
        // busy before leaving pending, so has_active_or_pending never reads false in between
        shared.set_current(Some(CurrentTask {
            task_id: request.task_id,
            model_name: request.model.clone(),
            queue_wait_ms: waited.as_millis() as u64,
        }));
        shared.pending.fetch_sub(1, Ordering::SeqCst);
        metrics::dec_queue();

        if !serve(request, waited, &loader, &shared, &mut shutdown).await {
            break;
        }
    }
    shared.set_current(None);
    debug!("Queue process loop stopped");
}

/// Serves one request to completion. Returns false when the queue is
/// shutting down.
async fn serve(
    mut request: QueuedRequest,
    waited: Duration,
    loader: &Loader,
    shared: &Shared,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    metrics::observe_queue_wait(waited.as_secs_f64());

    if request.ready.is_closed() {
        debug!(task_id = request.task_id, "caller gone before its turn, skipping");
        shared.set_current(None);
        return true;
    }

    info!(
        task_id = request.task_id,
        model = %request.model,
        queue_wait = ?waited,
        "Processing request"
    );

    if let Err(e) = make_ready(&request, loader).await {
        warn!(task_id = request.task_id, model = %request.model, error = %e, "Model switch failed");
        let _ = request.ready.send(Err(e.into()));
        shared.set_current(None);
        return true;
    }

    if request.ready.send(Ok(())).is_err() {
        debug!(task_id = request.task_id, "caller gone after model became ready");
        let _ = loader.mark_model_idle(&request.model);
        shared.set_current(None);
        return true;
    }

    let keep_running = tokio::select! {
        _ = &mut request.complete => true,
        _ = shutdown.changed() => {
            warn!(task_id = request.task_id, "Queue stopped while processing request");
            false
        }
    };
    debug!(
        task_id = request.task_id,
        model = %request.model,
        processing_time = ?request.enqueued_at.elapsed(),
        "Request completed"
    );
    if let Err(e) = loader.mark_model_idle(&request.model) {
        debug!(model = %request.model, error = %e, "model gone before release");
    }
    shared.set_current(None);
    keep_running
}

/// Switches to the requested model and takes a reference on it. An unload
/// that lands between the two steps gets one more switch.
async fn make_ready(request: &QueuedRequest, loader: &Loader) -> Result<(), LifecycleError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let current = loader.current_model();
        loader
            .switch_model(
                current.as_deref(),
                &request.model,
                &request.provider_name,
                &request.flavor,
                request.engine.clone(),
            )
            .await?;
        match loader.mark_model_in_use(&request.model) {
            Err(LifecycleError::ModelNotReady { .. } | LifecycleError::ModelNotFound(_))
                if attempts < 2 =>
            {
                debug!(task_id = request.task_id, model = %request.model, "model left residency before use, switching again");
            }
            result => return result,
        }
    }
}
