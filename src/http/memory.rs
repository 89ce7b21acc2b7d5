// POST /memory/search, POST /memory/inject (spec.md §6).

use super::AppState;
use crate::injector::InjectionMode;
use crate::retriever::RetrievalRequest;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub limit: Option<usize>,
    pub project_id: Option<String>,
    pub min_score: Option<f32>,
}

#[derive(Debug, Serialize)]
struct ResultItem {
    unit_id: String,
    title: String,
    summary: String,
    score: f32,
    source: &'static str,
    project_id: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SearchRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let project_id = request.project_id.unwrap_or_else(|| crate::store::GLOBAL_PROJECT_ID.to_string());
    let retrieval_request = RetrievalRequest {
        query_text: request.query,
        limit: request.limit.unwrap_or(5).clamp(1, 100),
        min_score: request.min_score.unwrap_or(0.3),
        ..Default::default()
    };

    match state.orchestrator.search(&project_id, &retrieval_request).await {
        Ok(results) => {
            let items: Vec<ResultItem> = results
                .iter()
                .map(|r| ResultItem {
                    unit_id: r.unit.unit_id.clone(),
                    title: r.unit.title.clone(),
                    summary: r.unit.summary.clone(),
                    score: r.score,
                    source: match r.source {
                        crate::retriever::Source::Semantic => "semantic",
                        crate::retriever::Source::Keyword => "keyword",
                        crate::retriever::Source::Hybrid => "hybrid",
                    },
                    project_id: r.unit.project_id.clone(),
                    created_at: r.unit.created_at,
                })
                .collect();
            (StatusCode::OK, Json(serde_json::json!({ "results": items })))
        }
        Err(e) => (
            super::status_for_error(&e),
            Json(serde_json::json!({ "error": { "code": e.code(), "message": e.public_message() } })),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub struct InjectRequest {
    pub original_prompt: String,
    pub query_text: Option<String>,
    pub injection_mode: Option<String>,
    pub project_id: Option<String>,
}

pub async fn inject(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InjectRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let project_id = request.project_id.unwrap_or_else(|| crate::store::GLOBAL_PROJECT_ID.to_string());
    let query_text = request.query_text.unwrap_or_else(|| request.original_prompt.clone());
    let retrieval_request = RetrievalRequest {
        query_text,
        ..Default::default()
    };
    let mode = InjectionMode::parse(request.injection_mode.as_deref());

    match state
        .orchestrator
        .inject(&project_id, &request.original_prompt, &retrieval_request, mode)
        .await
    {
        Ok((enhanced_prompt, injected_unit_ids)) => (
            StatusCode::OK,
            Json(serde_json::json!({ "enhanced_prompt": enhanced_prompt, "injected_unit_ids": injected_unit_ids })),
        ),
        Err(e) => (
            super::status_for_error(&e),
            Json(serde_json::json!({ "error": { "code": e.code(), "message": e.public_message() } })),
        ),
    }
}
