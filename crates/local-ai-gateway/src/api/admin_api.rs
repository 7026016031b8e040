//! Administrative endpoints: model residency inspection and control, flavor
//! reloads and liveness.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::service_api::error_response;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub flavors: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct UnloadRequest {
    pub model: String,
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.started_at.elapsed().as_secs(),
            flavors: state.dispatcher.flavors().names(),
        }),
    )
}

/// GET /<prefix>/<v>/models/states
pub async fn model_states(State(state): State<AppState>) -> Response {
    match state.dispatcher.manager() {
        Some(manager) => (StatusCode::OK, Json(manager.stats())).into_response(),
        None => (
            StatusCode::OK,
            Json(serde_json::json!({ "models": [] })),
        )
            .into_response(),
    }
}

/// POST /<prefix>/<v>/models/unload
pub async fn unload_model(
    State(state): State<AppState>,
    Json(req): Json<UnloadRequest>,
) -> Response {
    let Some(manager) = state.dispatcher.manager() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "model manager is not running" })),
        )
            .into_response();
    };
    match manager.force_unload_model(&req.model).await {
        Ok(()) => {
            info!(model = %req.model, "model unloaded on request");
            (
                StatusCode::OK,
                Json(serde_json::json!({ "model": req.model, "status": "unloaded" })),
            )
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// POST /<prefix>/<v>/flavors/:name/reload
pub async fn reload_flavor(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.dispatcher.flavors().reload(&name) {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "flavor": name, "status": "reloaded" })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}
