//! Operational endpoints: `/status`, `/health`, `/metrics`, `/readiness`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppContext;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn status(State(context): State<Arc<AppContext>>) -> Json<Value> {
    let mut detectors = Vec::new();
    for detector in context.all_detectors() {
        detectors.push(detector.status().await);
    }
    Json(json!({
        "status": "ok",
        "uptime_secs": context.started_at.elapsed().as_secs(),
        "environment": context.config.environment,
        "memory": context.memory.stats(),
        "locks": context.lock_stats.snapshot(),
        "cache": context.response_cache.metrics(),
        "parallel": context.parallel.metrics(),
        "pdf_permits_available": context.pdf_semaphore.current_value(),
        "records": context.records.stats().await,
        "detectors": detectors,
    }))
}

pub async fn metrics(State(context): State<Arc<AppContext>>) -> Json<Value> {
    Json(json!({
        "memory": context.memory.stats(),
        "cache": context.response_cache.metrics(),
        "parallel": context.parallel.metrics(),
        "locks": context.lock_stats.snapshot(),
        "model_cache_entries": context.model_cache.len(),
    }))
}

/// Ready when at least one detection engine can serve requests.
pub async fn readiness(
    State(context): State<Arc<AppContext>>,
) -> (StatusCode, Json<Value>) {
    let mut engines = Vec::new();
    let mut any_ready = false;
    for detector in context.all_detectors() {
        let status = detector.status().await;
        any_ready |= status.initialized;
        engines.push(json!({
            "engine": status.engine,
            "ready": status.initialized,
        }));
    }
    let code = if any_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(json!({
            "ready": any_ready,
            "engines": engines,
        })),
    )
}
