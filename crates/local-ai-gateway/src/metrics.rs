use axum::http::StatusCode;
use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;
use tracing::warn;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static ACTIVE_TASKS: OnceLock<IntGauge> = OnceLock::new();
static QUEUE_DEPTH: OnceLock<IntGauge> = OnceLock::new();
static QUEUE_WAIT_TIME: OnceLock<Histogram> = OnceLock::new();
static MODEL_SWITCHES: OnceLock<IntCounter> = OnceLock::new();

fn register<T>(metric: prometheus::Result<T>, slot: &OnceLock<T>)
where
    T: prometheus::core::Collector + Clone + 'static,
{
    match metric {
        Ok(m) => {
            if slot.set(m.clone()).is_ok() {
                REGISTRY.register(Box::new(m)).ok();
            }
        }
        Err(e) => warn!("failed to create metric: {}", e),
    }
}

/// Registers the gateway's collectors. Safe to call more than once.
pub fn init_metrics() {
    if REQ_COUNTER.get().is_none() {
        register(
            IntCounterVec::new(
                prometheus::opts!("requests_total", "Total requests per route"),
                &["route", "status"],
            ),
            &REQ_COUNTER,
        );
    }
    if ACTIVE_TASKS.get().is_none() {
        register(
            IntGauge::new("active_tasks", "Service tasks currently executing"),
            &ACTIVE_TASKS,
        );
    }
    if QUEUE_DEPTH.get().is_none() {
        register(
            IntGauge::new("queue_depth", "Local model requests waiting in queue"),
            &QUEUE_DEPTH,
        );
    }
    if QUEUE_WAIT_TIME.get().is_none() {
        register(
            Histogram::with_opts(prometheus::HistogramOpts::new(
                "queue_wait_time_seconds",
                "Time spent waiting in the local model queue",
            )),
            &QUEUE_WAIT_TIME,
        );
    }
    if MODEL_SWITCHES.get().is_none() {
        register(
            IntCounter::new("model_switches_total", "Resident local model switches"),
            &MODEL_SWITCHES,
        );
    }
}

pub fn inc_request(route: &str, status: &str) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, status]).inc();
    }
}

pub fn inc_active_tasks() {
    if let Some(gauge) = ACTIVE_TASKS.get() {
        gauge.inc();
    }
}

pub fn dec_active_tasks() {
    if let Some(gauge) = ACTIVE_TASKS.get() {
        gauge.dec();
    }
}

pub fn inc_queue() {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.inc();
    }
}

pub fn dec_queue() {
    if let Some(gauge) = QUEUE_DEPTH.get() {
        gauge.dec();
    }
}

pub fn observe_queue_wait(duration: f64) {
    if let Some(histogram) = QUEUE_WAIT_TIME.get() {
        histogram.observe(duration);
    }
}

pub fn inc_model_switches() {
    if let Some(counter) = MODEL_SWITCHES.get() {
        counter.inc();
    }
}

pub fn render() -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(buffer)
}

pub async fn get_metrics() -> impl IntoResponse {
    match render() {
        Ok(buffer) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; version=0.0.4")],
            e.to_string().into_bytes(),
        ),
    }
}
