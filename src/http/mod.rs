// Local HTTP API (C9, spec.md §6). Grounded on the reference `api/http`
// module split (one file per concern, `mod.rs` re-exporting handlers and
// assembling the router against a shared `Arc<AppState>`), generalised from
// the reference's auth/health pair to this service's five routes.

pub mod conversation;
pub mod health;
pub mod memory;

use crate::error::MemoryError;
use crate::orchestrator::Orchestrator;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps a `MemoryError` to the HTTP status its `code()` implies (spec.md §7).
/// Kept as one function rather than inlined per-handler so every route agrees
/// on the mapping.
pub fn status_for_error(err: &MemoryError) -> StatusCode {
    match err {
        MemoryError::Validation(_) => StatusCode::BAD_REQUEST,
        MemoryError::NotFound(_) => StatusCode::NOT_FOUND,
        MemoryError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        MemoryError::ProviderUnavailable(_) | MemoryError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        MemoryError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
        MemoryError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        MemoryError::ConsistencyViolation { .. } | MemoryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Idempotency keys are process-lifetime only — there is no requirement in
/// spec.md that a duplicate `POST /conversation/store` survive a restart,
/// only that it not create a second conversation row within one run.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    idempotency: Mutex<HashMap<String, String>>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        AppState {
            orchestrator,
            idempotency: Mutex::new(HashMap::new()),
        }
    }

    fn idempotent_conversation_id(&self, key: &str) -> Option<String> {
        self.idempotency.lock().get(key).cloned()
    }

    fn remember_idempotency_key(&self, key: String, conversation_id: String) {
        self.idempotency.lock().insert(key, conversation_id);
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/conversation/store", post(conversation::store_conversation))
        .route("/memory/search", post(memory::search))
        .route("/memory/inject", post(memory::inject))
        .route("/health", get(health::health_check))
        .route("/status", get(health::status))
        .with_state(state)
}
