// GET /health, GET /status (spec.md §6). Grounded on the reference
// `health_check`/`readiness_check` pair's shape (query every dependency,
// 503 unless everything required is OK) but checked against this service's
// own component set via the Orchestrator rather than a fixed db+qdrant pair.

use super::AppState;
use crate::orchestrator::HealthState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;

/// GET /health — 200 iff every component reports `Ok` (a `Degraded` capture
/// queue, e.g. non-empty dead-letter, does not fail the probe; `Down` does).
pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let health = state.orchestrator.health().await;
    let all_ok = health.values().all(|c| c.state != HealthState::Down);
    let status = if all_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(serde_json::json!({ "components": health })))
}

/// GET /status — counts and component states, always 200 (callers use
/// `/health` to decide liveness; `/status` is informational).
pub async fn status(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    let health = state.orchestrator.health().await;
    match state.orchestrator.counts().await {
        Ok((projects, conversations, units)) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "components": health,
                "counts": { "projects": projects, "conversations": conversations, "memory_units": units },
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": { "code": e.code(), "message": e.public_message() } })),
        ),
    }
}
