//! Periodic unloading of idle models.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::loader::Loader;
use super::queue::Queue;

#[derive(Debug, Clone, Serialize)]
pub struct CleanerStats {
    pub idle_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub started: bool,
    pub runs: u64,
    pub unloaded: u64,
}

pub struct Cleaner {
    loader: Arc<Loader>,
    queue: Arc<Queue>,
    idle_timeout: Mutex<Duration>,
    cleanup_interval: Mutex<Duration>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    runs: AtomicU64,
    unloaded: AtomicU64,
}

impl Cleaner {
    pub fn new(loader: Arc<Loader>, queue: Arc<Queue>, idle_timeout: Duration) -> Self {
        Self {
            loader,
            queue,
            idle_timeout: Mutex::new(idle_timeout),
            cleanup_interval: Mutex::new(Duration::ZERO),
            shutdown: Mutex::new(None),
            runs: AtomicU64::new(0),
            unloaded: AtomicU64::new(0),
        }
    }

    pub fn start(self: &Arc<Self>, cleanup_interval: Duration) {
        let Ok(mut shutdown) = self.shutdown.lock() else {
            return;
        };
        if shutdown.is_some() {
            warn!("Cleaner already started");
            return;
        }
        if let Ok(mut interval) = self.cleanup_interval.lock() {
            *interval = cleanup_interval;
        }

        let (tx, mut rx) = watch::channel(false);
        *shutdown = Some(tx);
        let cleaner = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            // the first tick fires immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cleaner.perform_cleanup().await;
                    }
                    _ = rx.changed() => break,
                }
            }
            debug!("Cleanup loop stopped");
        });
        info!(
            cleanup_interval = ?cleanup_interval,
            idle_timeout = ?self.idle_timeout(),
            "Cleaner started"
        );
    }

    pub fn stop(&self) {
        let tx = self.shutdown.lock().ok().and_then(|mut s| s.take());
        if let Some(tx) = tx {
            let _ = tx.send(true);
            info!("Cleaner stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.shutdown.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout.lock().map(|t| *t).unwrap_or_default()
    }

    pub fn set_idle_timeout(&self, timeout: Duration) {
        if let Ok(mut t) = self.idle_timeout.lock() {
            *t = timeout;
        }
        info!(timeout = ?timeout, "Cleaner idle timeout set");
    }

    /// Runs one cleanup pass now.
    pub async fn force_cleanup(&self) -> usize {
        info!("Force cleanup triggered");
        self.perform_cleanup().await
    }

    /// Unloads every model idle past the timeout. Skipped entirely while a
    /// request is being served or waiting, so a model about to be used is
    /// never pulled out from under it.
    async fn perform_cleanup(&self) -> usize {
        self.runs.fetch_add(1, Ordering::Relaxed);
        if self.queue.has_active_or_pending() {
            debug!("Local model requests in flight, skipping cleanup");
            return 0;
        }

        let idle_timeout = self.idle_timeout();
        let idle_models = self.loader.idle_models(idle_timeout);
        if idle_models.is_empty() {
            debug!("No idle models to clean up");
            return 0;
        }
        info!(count = idle_models.len(), "Found idle models to clean up");

        let mut cleaned = 0;
        for state in &idle_models {
            // a request may have arrived while earlier models were unloading
            if self.queue.has_active_or_pending() {
                debug!("Request arrived during cleanup, stopping early");
                break;
            }
            let idle_time = state.idle_for();
            match self.loader.force_unload_model(&state.model_name).await {
                Ok(()) => {
                    cleaned += 1;
                    info!(model = %state.model_name, idle_time = ?idle_time, "Unloaded idle model");
                }
                Err(e) => {
                    error!(model = %state.model_name, idle_time = ?idle_time, error = %e, "Failed to unload idle model");
                }
            }
        }
        self.unloaded.fetch_add(cleaned as u64, Ordering::Relaxed);
        info!(total_checked = idle_models.len(), successfully_cleaned = cleaned, "Cleanup completed");
        cleaned
    }

    pub fn stats(&self) -> CleanerStats {
        CleanerStats {
            idle_timeout_secs: self.idle_timeout().as_secs(),
            cleanup_interval_secs: self.cleanup_interval.lock().map(|i| i.as_secs()).unwrap_or(0),
            started: self.is_started(),
            runs: self.runs.load(Ordering::Relaxed),
            unloaded: self.unloaded.load(Ordering::Relaxed),
        }
    }
}
