// POST /conversation/store (spec.md §6).

use super::AppState;
use crate::store::Role;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

#[derive(Debug, Deserialize)]
pub struct StoreMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct StoreConversationRequest {
    pub project_id: String,
    pub session_id: Option<String>,
    pub messages: Vec<StoreMessage>,
}

pub async fn store_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<StoreConversationRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let idempotency_key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    if let Some(key) = &idempotency_key {
        if let Some(conversation_id) = state.idempotent_conversation_id(key) {
            return (StatusCode::OK, Json(serde_json::json!({ "conversation_id": conversation_id })));
        }
    }

    let mut messages = Vec::with_capacity(request.messages.len());
    for m in request.messages {
        let role: Role = match m.role.parse() {
            Ok(r) => r,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": { "code": "VALIDATION", "message": e.to_string() } })),
                )
            }
        };
        messages.push((role, m.content, m.timestamp));
    }

    match state
        .orchestrator
        .ingest_conversation(&request.project_id, request.session_id, messages)
        .await
    {
        Ok((conversation, compression)) => {
            if let Some(key) = idempotency_key {
                state.remember_idempotency_key(key, conversation.conversation_id.clone());
            }
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "conversation_id": conversation.conversation_id,
                    "compression": compression,
                })),
            )
        }
        Err(e) => (
            super::status_for_error(&e),
            Json(serde_json::json!({ "error": { "code": e.code(), "message": e.public_message() } })),
        ),
    }
}
