// MCP stdio server (C9, spec.md §6): exactly five tools over the
// Orchestrator's public surface. Grounded on the reference `MiraServer`'s
// tool-router shape (`#[tool_router]`/`#[tool_handler]` over a cloneable
// struct holding shared state, `Parameters<T>` request extraction, a
// `json_response` helper wrapping `CallToolResult::success`) but exposing
// only five memory tools, and encoding failures as a
// `{ error: { code, message } }` JSON body instead of a protocol-level
// `McpError` — a handler error must never crash the stdio loop.

use crate::error::MemoryError as ServiceError;
use crate::injector::InjectionMode;
use crate::orchestrator::Orchestrator;
use crate::retriever::{MergeStrategy, RetrievalRequest, RetrievalResult};
use rmcp::{
    handler::server::tool::ToolRouter, handler::server::wrapper::Parameters, model::*, tool,
    tool_handler, tool_router, ErrorData as McpError, ServerHandler,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct MemoryServer {
    orchestrator: Arc<Orchestrator>,
    tool_router: ToolRouter<Self>,
}

impl MemoryServer {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        MemoryServer {
            orchestrator,
            tool_router: Self::tool_router(),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MemorySearchParams {
    pub query: String,
    pub limit: Option<usize>,
    pub project_id: Option<String>,
    pub min_score: Option<f32>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MemoryInjectParams {
    pub original_prompt: String,
    pub query_text: Option<String>,
    pub injection_mode: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MemoryCrossProjectSearchParams {
    pub query: String,
    pub project_ids: Option<Vec<String>>,
    pub include_all_projects: Option<bool>,
    pub merge_strategy: Option<String>,
    pub max_results_per_project: Option<usize>,
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

impl From<&RetrievalResult> for ResultItem {
    fn from(r: &RetrievalResult) -> Self {
        ResultItem {
            unit_id: r.unit.unit_id.clone(),
            title: r.unit.title.clone(),
            summary: r.unit.summary.clone(),
            score: r.score,
            source: source_label(r.source),
            project_id: r.unit.project_id.clone(),
            created_at: r.unit.created_at,
        }
    }
}

fn source_label(source: crate::retriever::Source) -> &'static str {
    match source {
        crate::retriever::Source::Semantic => "semantic",
        crate::retriever::Source::Keyword => "keyword",
        crate::retriever::Source::Hybrid => "hybrid",
    }
}

/// Wire value `project` (spec.md §6) is the per-project interleave strategy
/// that §4.6 calls `round_robin`; the two sections disagree on the name, not
/// the behaviour, so both map to the same `MergeStrategy` variant.
fn parse_merge_strategy(raw: Option<&str>) -> MergeStrategy {
    match raw {
        Some("time") => MergeStrategy::Time,
        Some("project") | Some("round_robin") => MergeStrategy::RoundRobin,
        _ => MergeStrategy::Score,
    }
}

fn json_response(value: impl Serialize) -> CallToolResult {
    let body = serde_json::to_string(&value).unwrap_or_else(|_| "{}".to_string());
    CallToolResult::success(vec![Content::text(body)])
}

fn error_response(err: ServiceError) -> CallToolResult {
    json_response(serde_json::json!({
        "error": { "code": err.code(), "message": err.public_message() }
    }))
}

const DEFAULT_PROJECT: &str = crate::store::GLOBAL_PROJECT_ID;

#[tool_router]
impl MemoryServer {
    #[tool(description = "Search stored memory units by hybrid semantic + keyword retrieval.")]
    async fn memory_search(&self, Parameters(params): Parameters<MemorySearchParams>) -> Result<CallToolResult, McpError> {
        let request = RetrievalRequest {
            query_text: params.query,
            limit: params.limit.unwrap_or(5).clamp(1, 100),
            min_score: params.min_score.unwrap_or(0.3),
            ..Default::default()
        };
        let project_id = params.project_id.unwrap_or_else(|| DEFAULT_PROJECT.to_string());
        match self.orchestrator.search(&project_id, &request).await {
            Ok(results) => {
                let items: Vec<ResultItem> = results.iter().map(ResultItem::from).collect();
                Ok(json_response(serde_json::json!({ "results": items })))
            }
            Err(e) => Ok(error_response(e)),
        }
    }

    #[tool(description = "Inject the most relevant stored memory into a prompt before sending it to a model.")]
    async fn memory_inject(&self, Parameters(params): Parameters<MemoryInjectParams>) -> Result<CallToolResult, McpError> {
        let query_text = params.query_text.unwrap_or_else(|| params.original_prompt.clone());
        let request = RetrievalRequest {
            query_text,
            ..Default::default()
        };
        let mode = InjectionMode::parse(params.injection_mode.as_deref());
        match self
            .orchestrator
            .inject(DEFAULT_PROJECT, &params.original_prompt, &request, mode)
            .await
        {
            Ok((enhanced_prompt, injected_unit_ids)) => Ok(json_response(serde_json::json!({
                "enhanced_prompt": enhanced_prompt,
                "injected_unit_ids": injected_unit_ids,
            }))),
            Err(e) => Ok(error_response(e)),
        }
    }

    #[tool(description = "Report memory service component states and row counts.")]
    async fn memory_status(&self) -> Result<CallToolResult, McpError> {
        let health = self.orchestrator.health().await;
        match self.orchestrator.counts().await {
            Ok((projects, conversations, units)) => Ok(json_response(serde_json::json!({
                "components": health,
                "counts": {
                    "projects": projects,
                    "conversations": conversations,
                    "memory_units": units,
                },
            }))),
            Err(e) => Ok(error_response(e)),
        }
    }

    #[tool(description = "Report memory service component health.")]
    async fn memory_health(&self) -> Result<CallToolResult, McpError> {
        let health = self.orchestrator.health().await;
        Ok(json_response(serde_json::json!({ "health": health })))
    }

    #[tool(description = "Search memory across multiple projects and merge results.")]
    async fn memory_cross_project_search(
        &self,
        Parameters(params): Parameters<MemoryCrossProjectSearchParams>,
    ) -> Result<CallToolResult, McpError> {
        let started = Instant::now();
        let project_ids = if params.include_all_projects.unwrap_or(false) {
            match self.orchestrator.list_project_ids().await {
                Ok(ids) => ids,
                Err(e) => return Ok(error_response(e)),
            }
        } else {
            params.project_ids.unwrap_or_default()
        };

        let strategy = parse_merge_strategy(params.merge_strategy.as_deref());
        let request = RetrievalRequest {
            query_text: params.query,
            limit: params.max_results_per_project.unwrap_or(5),
            ..Default::default()
        };

        match self.orchestrator.search_cross_project(&project_ids, &request, strategy).await {
            Ok(results) => {
                let mut project_stats = Vec::new();
                for project_id in &project_ids {
                    let count = results.iter().filter(|r| &r.unit.project_id == project_id).count();
                    project_stats.push(serde_json::json!({ "project_id": project_id, "result_count": count }));
                }
                let items: Vec<ResultItem> = results.iter().map(ResultItem::from).collect();
                Ok(json_response(serde_json::json!({
                    "results": items,
                    "project_stats": project_stats,
                    "projects_searched": project_ids,
                    "search_time_ms": started.elapsed().as_millis() as u64,
                })))
            }
            Err(e) => Ok(error_response(e)),
        }
    }
}

#[tool_handler]
impl ServerHandler for MemoryServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Long-term conversation memory: hybrid search, prompt injection, and cross-project \
                 recall over previously captured and compressed conversations."
                    .to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_strategy_accepts_both_section_spellings_for_round_robin() {
        assert_eq!(parse_merge_strategy(Some("project")), MergeStrategy::RoundRobin);
        assert_eq!(parse_merge_strategy(Some("round_robin")), MergeStrategy::RoundRobin);
        assert_eq!(parse_merge_strategy(Some("time")), MergeStrategy::Time);
        assert_eq!(parse_merge_strategy(Some("anything else")), MergeStrategy::Score);
        assert_eq!(parse_merge_strategy(None), MergeStrategy::Score);
    }

    #[test]
    fn error_response_wraps_code_and_public_message() {
        let err = ServiceError::NotFound("unit-123".to_string());
        let result = error_response(err);
        let rendered = format!("{result:?}");
        assert!(rendered.contains("NOT_FOUND"));
        assert!(rendered.contains("not found: unit-123"));
    }

    #[test]
    fn source_label_matches_retriever_source_variants() {
        assert_eq!(source_label(crate::retriever::Source::Semantic), "semantic");
        assert_eq!(source_label(crate::retriever::Source::Keyword), "keyword");
        assert_eq!(source_label(crate::retriever::Source::Hybrid), "hybrid");
    }
}
