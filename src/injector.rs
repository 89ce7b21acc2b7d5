// Injector (C7, spec.md §4.7): turns a RetrievalResult[] plus the user's
// original prompt into an enriched prompt string. Grounded on the reference
// prompt builder's section-at-a-time style (`add_x_context(&mut prompt, ...)`
// pushing into one accumulating String) but assembling memory-unit sections
// instead of persona/tool/file sections, and driven by the diversity/budget
// rules this crate's retrieval stage doesn't itself apply.

use crate::config::InjectorConfig;
use crate::gateway::provider::{ChatMessage, CompletionParams};
use crate::gateway::ModelGateway;
use crate::retriever::RetrievalResult;
use crate::utils::estimate_tokens;
use std::sync::Arc;
use tracing::warn;

/// Selected per request by the MCP/HTTP surfaces (spec.md §6's `injection_mode`):
/// scales the configured token budget rather than replacing the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InjectionMode {
    Comprehensive,
    #[default]
    Balanced,
    Conservative,
}

impl InjectionMode {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("comprehensive") => InjectionMode::Comprehensive,
            Some("conservative") => InjectionMode::Conservative,
            _ => InjectionMode::Balanced,
        }
    }

    fn effective_budget(&self, configured: Option<usize>) -> Option<usize> {
        match self {
            InjectionMode::Comprehensive => None,
            InjectionMode::Balanced => configured,
            InjectionMode::Conservative => Some(configured.map(|b| (b / 2).max(1)).unwrap_or(500)),
        }
    }
}

pub struct Injector {
    gateway: Arc<ModelGateway>,
    config: InjectorConfig,
}

impl Injector {
    pub fn new(gateway: Arc<ModelGateway>, config: InjectorConfig) -> Self {
        Injector { gateway, config }
    }

    /// Returns the enriched prompt plus the `unit_id`s of every retrieved unit
    /// that survived diversity filtering and the token budget — the set the
    /// MCP/HTTP surfaces report back as `injected_unit_ids`.
    pub async fn inject(
        &self,
        project_id: &str,
        original_prompt: &str,
        results: &[RetrievalResult],
        mode: InjectionMode,
    ) -> (String, Vec<String>) {
        let admitted = diversity_filter(results, self.config.diversity_threshold);
        let reordered = type_priority_reorder(admitted);
        let budget = mode.effective_budget(self.config.token_budget);
        let budgeted = apply_token_budget(reordered, budget);

        if budgeted.is_empty() {
            return (original_prompt.to_string(), Vec::new());
        }
        let injected_unit_ids: Vec<String> = budgeted.iter().map(|r| r.unit.unit_id.clone()).collect();

        let formatted = format_markdown(&budgeted, original_prompt);

        if !self.config.fusion_enabled {
            return (formatted, injected_unit_ids);
        }

        match self.fuse(project_id, original_prompt, &budgeted).await {
            Ok(fused) => (fused, injected_unit_ids),
            Err(e) => {
                warn!("fusion failed, falling back to plain concatenation: {e}");
                (formatted, injected_unit_ids)
            }
        }
    }

    /// Optional LLM fusion pass (spec.md §4.7 step 5): the model consolidates the
    /// admitted set into one context block. Never allowed to rewrite the
    /// verbatim user prompt — it is appended untouched after fusion, not fed
    /// through the model as editable material.
    async fn fuse(
        &self,
        project_id: &str,
        original_prompt: &str,
        admitted: &[RetrievalResult],
    ) -> crate::error::Result<String> {
        let sections: Vec<String> = admitted
            .iter()
            .map(|r| format!("### {}\n{}", r.unit.title, r.unit.summary))
            .collect();
        let messages = vec![
            ChatMessage::system(FUSION_SYSTEM_PROMPT),
            ChatMessage::user(sections.join("\n\n")),
        ];
        let consolidated = self
            .gateway
            .complete(&messages, &CompletionParams::default(), project_id)
            .await?;

        let mut out = String::new();
        out.push_str("## Relevant context\n\n");
        out.push_str(consolidated.trim());
        out.push_str("\n\n## Prompt\n\n");
        out.push_str(original_prompt);
        Ok(out)
    }
}

const FUSION_SYSTEM_PROMPT: &str = "You consolidate a set of retrieved memory summaries into a single coherent \
context block for another model to read before answering a prompt. Preserve every distinct fact; do not invent \
new ones. Do not include the user's prompt in your answer.";

/// Step 1: admit a result only if its keyword-set Jaccard overlap with every
/// already-admitted result is below the configured threshold.
fn diversity_filter(results: &[RetrievalResult], threshold: f32) -> Vec<RetrievalResult> {
    let mut admitted: Vec<RetrievalResult> = Vec::new();
    for candidate in results {
        let too_similar = admitted
            .iter()
            .any(|a| jaccard(&a.unit.keywords, &candidate.unit.keywords) >= threshold);
        if !too_similar {
            admitted.push(candidate.clone());
        }
    }
    admitted
}

fn jaccard(a: &std::collections::BTreeSet<String>, b: &std::collections::BTreeSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

/// Step 2: stable sort by `unit_type` priority, preserving intra-type order
/// (the order the Retriever already sorted results into, i.e. final score).
fn type_priority_reorder(mut results: Vec<RetrievalResult>) -> Vec<RetrievalResult> {
    results.sort_by(|a, b| {
        b.unit
            .unit_type
            .priority_rank()
            .cmp(&a.unit.unit_type.priority_rank())
    });
    results
}

/// Step 3: accumulate admitted results while the running token total stays
/// within budget. `None` budget means "comprehensive" mode — unbounded.
fn apply_token_budget(results: Vec<RetrievalResult>, budget: Option<usize>) -> Vec<RetrievalResult> {
    let Some(budget) = budget else {
        return results;
    };
    let mut out = Vec::new();
    let mut total: i64 = 0;
    for result in results {
        let tokens = estimate_tokens(&result.unit.content);
        if total + tokens > budget as i64 && !out.is_empty() {
            break;
        }
        total += tokens;
        out.push(result);
    }
    out
}

/// Step 4: structured markdown, one section per admitted result, with a final
/// section containing the original prompt verbatim.
fn format_markdown(results: &[RetrievalResult], original_prompt: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str("## Relevant context\n\n");
    for result in results {
        prompt.push_str(&format!("### {}\n", result.unit.title));
        prompt.push_str(&format!("{}\n\n", result.unit.summary));
    }
    prompt.push_str("## Prompt\n\n");
    prompt.push_str(original_prompt);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retriever::Source;
    use crate::store::{MemoryUnit, UnitType};
    use chrono::Utc;

    fn result(title: &str, unit_type: UnitType, keywords: &[&str], score: f32) -> RetrievalResult {
        let now = Utc::now();
        RetrievalResult {
            unit: MemoryUnit {
                unit_id: title.to_string(),
                project_id: "p".to_string(),
                conversation_id: None,
                unit_type,
                title: title.to_string(),
                summary: format!("summary of {title}"),
                content: format!("content of {title}"),
                keywords: keywords.iter().map(|k| k.to_string()).collect(),
                relevance_score: 0.5,
                token_count: 10,
                created_at: now,
                updated_at: now,
                expires_at: None,
                is_active: true,
            },
            score,
            source: Source::Hybrid,
            rerank_score: None,
        }
    }

    #[test]
    fn diversity_filter_drops_near_duplicate_keyword_sets() {
        let a = result("A", UnitType::Conversation, &["btree", "index", "tree"], 0.9);
        let b = result("B", UnitType::Conversation, &["btree", "index"], 0.8);
        let admitted = diversity_filter(&[a, b], 0.7);
        assert_eq!(admitted.len(), 1);
    }

    #[test]
    fn type_priority_reorders_decisions_before_conversations() {
        let conv = result("conv", UnitType::Conversation, &[], 0.9);
        let decision = result("dec", UnitType::Decision, &[], 0.1);
        let out = type_priority_reorder(vec![conv, decision]);
        assert_eq!(out[0].unit.title, "dec");
    }

    #[test]
    fn empty_results_return_original_prompt_unchanged() {
        let formatted = format_markdown(&[], "hello");
        assert!(formatted.ends_with("hello"));
    }

    #[test]
    fn token_budget_truncates_lowest_priority_tail() {
        let r1 = result("keep", UnitType::Conversation, &[], 0.9);
        let r2 = result("drop", UnitType::Conversation, &[], 0.1);
        let out = apply_token_budget(vec![r1, r2], Some(5));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].unit.title, "keep");
    }

    #[test]
    fn injection_mode_parse_defaults_to_balanced() {
        assert_eq!(InjectionMode::parse(None), InjectionMode::Balanced);
        assert_eq!(InjectionMode::parse(Some("unknown")), InjectionMode::Balanced);
        assert_eq!(InjectionMode::parse(Some("comprehensive")), InjectionMode::Comprehensive);
        assert_eq!(InjectionMode::parse(Some("conservative")), InjectionMode::Conservative);
    }

    #[test]
    fn comprehensive_mode_lifts_configured_budget() {
        assert_eq!(InjectionMode::Comprehensive.effective_budget(Some(100)), None);
    }

    #[test]
    fn balanced_mode_passes_budget_through_unchanged() {
        assert_eq!(InjectionMode::Balanced.effective_budget(Some(100)), Some(100));
        assert_eq!(InjectionMode::Balanced.effective_budget(None), None);
    }

    #[test]
    fn conservative_mode_halves_budget_with_a_floor_of_one() {
        assert_eq!(InjectionMode::Conservative.effective_budget(Some(100)), Some(50));
        assert_eq!(InjectionMode::Conservative.effective_budget(Some(1)), Some(1));
        assert_eq!(InjectionMode::Conservative.effective_budget(None), Some(500));
    }
}
