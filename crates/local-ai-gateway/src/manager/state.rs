//! Per-model residency record.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crate::engine::ModelEngine;
use crate::error::LifecycleError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    Unloaded,
    Loading,
    Idle,
    InUse,
    Unloading,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::Unloaded => "unloaded",
            ModelStatus::Loading => "loading",
            ModelStatus::Idle => "idle",
            ModelStatus::InUse => "in_use",
            ModelStatus::Unloading => "unloading",
        }
    }

    /// Resident and usable.
    pub fn is_loaded(&self) -> bool {
        matches!(self, ModelStatus::Idle | ModelStatus::InUse)
    }
}

#[derive(Debug)]
struct Inner {
    status: ModelStatus,
    ref_count: usize,
    last_used: Instant,
    last_used_at: DateTime<Utc>,
    loaded_at: Option<DateTime<Utc>>,
    last_error: Option<LifecycleError>,
}

/// Serializable view of a `ModelState` for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ModelStateSnapshot {
    pub model_name: String,
    pub provider_name: String,
    pub flavor: String,
    pub status: ModelStatus,
    pub ref_count: usize,
    pub last_used_at: DateTime<Utc>,
    pub loaded_at: Option<DateTime<Utc>>,
}

/// Residency record for one model. All mutation goes through the record's
/// own lock, so readers never contend with the loader's map lock.
pub struct ModelState {
    pub model_name: String,
    pub provider_name: String,
    pub flavor: String,
    pub engine: Arc<dyn ModelEngine>,
    inner: RwLock<Inner>,
}

impl ModelState {
    pub fn new(
        model_name: impl Into<String>,
        provider_name: impl Into<String>,
        flavor: impl Into<String>,
        engine: Arc<dyn ModelEngine>,
        status: ModelStatus,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            provider_name: provider_name.into(),
            flavor: flavor.into(),
            engine,
            inner: RwLock::new(Inner {
                status,
                ref_count: 0,
                last_used: Instant::now(),
                last_used_at: Utc::now(),
                loaded_at: None,
                last_error: None,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self) -> ModelStatus {
        self.read().status
    }

    pub fn set_status(&self, status: ModelStatus) {
        self.write().status = status;
    }

    pub fn ref_count(&self) -> usize {
        self.read().ref_count
    }

    pub fn touch(&self) {
        let mut inner = self.write();
        inner.last_used = Instant::now();
        inner.last_used_at = Utc::now();
    }

    /// Only a resident model gains references; a record that is loading,
    /// unloading or gone is refused.
    pub fn increment_ref(&self) -> Result<(), LifecycleError> {
        let mut inner = self.write();
        if !inner.status.is_loaded() {
            return Err(LifecycleError::ModelNotReady {
                model: self.model_name.clone(),
                status: inner.status.as_str().to_string(),
            });
        }
        inner.ref_count += 1;
        inner.status = ModelStatus::InUse;
        inner.last_used = Instant::now();
        inner.last_used_at = Utc::now();
        Ok(())
    }

    /// Saturates at zero; reaching zero makes the model Idle.
    pub fn decrement_ref(&self) {
        let mut inner = self.write();
        inner.ref_count = inner.ref_count.saturating_sub(1);
        if inner.ref_count == 0 {
            inner.status = ModelStatus::Idle;
            inner.last_used = Instant::now();
            inner.last_used_at = Utc::now();
        }
    }

    /// Drops all references ahead of a forced unload.
    pub fn reset_refs(&self) {
        let mut inner = self.write();
        inner.ref_count = 0;
        inner.status = ModelStatus::Idle;
    }

    /// Loading → Unloaded, remembering why.
    pub fn fail_load(&self, error: LifecycleError) {
        let mut inner = self.write();
        inner.status = ModelStatus::Unloaded;
        inner.last_error = Some(error);
    }

    /// Unloaded → Loading. Returns false if another caller got there first.
    pub fn begin_load(&self) -> bool {
        let mut inner = self.write();
        if inner.status != ModelStatus::Unloaded {
            return false;
        }
        inner.status = ModelStatus::Loading;
        inner.last_error = None;
        true
    }

    pub fn finish_load(&self) {
        let mut inner = self.write();
        inner.status = ModelStatus::Idle;
        inner.loaded_at = Some(Utc::now());
        inner.last_used = Instant::now();
        inner.last_used_at = Utc::now();
    }

    pub fn last_error(&self) -> Option<LifecycleError> {
        self.read().last_error.clone()
    }

    pub fn idle_for(&self) -> Duration {
        self.read().last_used.elapsed()
    }

    /// Idle with no references for longer than `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        let inner = self.read();
        inner.status == ModelStatus::Idle && inner.ref_count == 0 && inner.last_used.elapsed() > timeout
    }

    pub fn snapshot(&self) -> ModelStateSnapshot {
        let inner = self.read();
        ModelStateSnapshot {
            model_name: self.model_name.clone(),
            provider_name: self.provider_name.clone(),
            flavor: self.flavor.clone(),
            status: inner.status,
            ref_count: inner.ref_count,
            last_used_at: inner.last_used_at,
            loaded_at: inner.loaded_at,
        }
    }
}

impl std::fmt::Debug for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelState")
            .field("model_name", &self.model_name)
            .field("provider_name", &self.provider_name)
            .field("status", &self.status())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}
