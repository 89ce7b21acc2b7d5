// Retriever (C6, spec.md §4.6) — hybrid search: vector ANN (C3) + keyword match
// (C2), merged, reranked (C1), policy-weighted and truncated. Grounded on the
// reference recall engine's shape (parallel branches joined with `tokio::join!`,
// a dedicated scorer, deduplication by id) but built around this crate's stage
// contract rather than the reference's recency/similarity/salience blend.

mod tokenize;
mod types;

pub use types::{MergeStrategy, QueryType, RetrievalRequest, RetrievalResult, Source, TimeRange};

use crate::config::{RerankStrategy, RetrievalConfig};
use crate::error::Result;
use crate::gateway::ModelGateway;
use crate::store::StructuredStore;
use crate::vector::{VectorBackend, VectorFilter};
use chrono::Utc;
use futures::future::join_all;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use types::Candidate;

const K1: usize = 20;
const TOP_M: usize = 20;
const KEYWORD_BOOST: f32 = 0.3;

pub struct Retriever {
    gateway: Arc<ModelGateway>,
    store: Arc<StructuredStore>,
    vector: Arc<dyn VectorBackend>,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        gateway: Arc<ModelGateway>,
        store: Arc<StructuredStore>,
        vector: Arc<dyn VectorBackend>,
        config: RetrievalConfig,
    ) -> Self {
        Retriever {
            gateway,
            store,
            vector,
            config,
        }
    }

    pub async fn search(&self, project_id: &str, request: &RetrievalRequest) -> Result<Vec<RetrievalResult>> {
        let now = Utc::now();
        let candidates = match request.query_type {
            QueryType::Hybrid => {
                let (semantic, keyword) = tokio::join!(
                    self.recall_semantic(project_id, request, now),
                    self.recall_keyword(project_id, request, now),
                );
                let merged = merge(semantic.unwrap_or_default(), keyword.unwrap_or_default());
                self.rerank(request, merged).await
            }
            QueryType::Semantic => {
                let semantic = self.recall_semantic(project_id, request, now).await?;
                self.rerank(request, semantic).await
            }
            QueryType::Keyword => Ok(self.recall_keyword(project_id, request, now).await?),
        };

        let hydrated = self.hydrate(candidates?).await?;
        let policy_applied = apply_policy(hydrated, self.config.default_strategy, self.config.half_life_days, now);
        Ok(threshold_and_truncate(policy_applied, request.min_score, request.limit))
    }

    /// Cross-project retrieval (spec.md §4.6): runs the single-project pipeline
    /// in parallel across accessible projects and merges by the requested
    /// strategy. `accessible_projects` is the already-permission-filtered
    /// list; a project the caller cannot read is expected to already be
    /// absent from it (C8's permission check happens upstream of the
    /// Retriever).
    pub async fn search_cross_project(
        &self,
        accessible_projects: &[String],
        request: &RetrievalRequest,
        strategy: MergeStrategy,
    ) -> Result<Vec<RetrievalResult>> {
        let branches = accessible_projects.iter().map(|project_id| async move {
            match self.search(project_id, request).await {
                Ok(results) => results,
                Err(e) => {
                    warn!(project_id = %project_id, "cross-project branch failed: {e}");
                    Vec::new()
                }
            }
        });
        let per_project = join_all(branches).await;
        Ok(merge_cross_project(per_project, strategy, request.limit))
    }

    /// Semantic branch of Stage A: embed the query, search C3 top-K1 under the
    /// project/type/expiry filter.
    async fn recall_semantic(
        &self,
        project_id: &str,
        request: &RetrievalRequest,
        now: chrono::DateTime<Utc>,
    ) -> Result<Vec<Candidate>> {
        let vector = match self.gateway.embed(&request.query_text, project_id).await {
            Ok(v) => v,
            Err(e) => {
                warn!("semantic branch embed failed, contributing empty list: {e}");
                return Ok(Vec::new());
            }
        };
        let filter = VectorFilter {
            project_id: Some(project_id.to_string()),
            unit_types: request.unit_types.clone(),
            exclude_expired_as_of: if request.include_expired { None } else { Some(now) },
            created_after: request.time_range.as_ref().and_then(|r| r.after),
            created_before: request.time_range.as_ref().and_then(|r| r.before),
        };
        match self.vector.search(vector, &filter, K1).await {
            Ok(points) => Ok(points
                .into_iter()
                .map(|p| Candidate {
                    unit_id: p.unit_id,
                    semantic_score: Some(p.score),
                    keyword_score: None,
                    score: p.score,
                    source: Source::Semantic,
                    rerank_score: None,
                })
                .collect()),
            Err(e) => {
                warn!("semantic branch search failed, contributing empty list: {e}");
                Ok(Vec::new())
            }
        }
    }

    /// Keyword branch of Stage A: tokenise the query, search C2 for units whose
    /// keyword set intersects the candidate terms.
    async fn recall_keyword(
        &self,
        project_id: &str,
        request: &RetrievalRequest,
        now: chrono::DateTime<Utc>,
    ) -> Result<Vec<Candidate>> {
        let candidates = tokenize::candidate_terms(&request.query_text);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let total = candidates.len() as f32;
        match self
            .store
            .search_by_keywords(
                project_id,
                &candidates,
                request.unit_types.as_deref(),
                K1,
                now,
                request.include_expired,
            )
            .await
        {
            Ok(hits) => Ok(hits
                .into_iter()
                .map(|(unit, match_count)| {
                    let score = match_count as f32 / total;
                    Candidate {
                        unit_id: unit.unit_id,
                        semantic_score: None,
                        keyword_score: Some(score),
                        score,
                        source: Source::Keyword,
                        rerank_score: None,
                    }
                })
                .collect()),
            Err(e) => {
                warn!("keyword branch search failed, contributing empty list: {e}");
                Ok(Vec::new())
            }
        }
    }

    /// Stage C: rerank the top-M merged candidates via C1, replacing their score
    /// with the rerank score. Candidates beyond top-M keep their Stage-B score
    /// unchanged.
    async fn rerank(&self, request: &RetrievalRequest, mut candidates: Vec<Candidate>) -> Result<Vec<Candidate>> {
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        if candidates.is_empty() {
            return Ok(candidates);
        }
        let rerank_count = candidates.len().min(TOP_M);
        let head = &candidates[..rerank_count];

        let mut docs = Vec::with_capacity(rerank_count);
        for c in head {
            let doc = match self.store.get_memory_unit(&c.unit_id).await {
                Ok(Some(unit)) => format!("{} {}", unit.title, unit.summary),
                _ => String::new(),
            };
            docs.push(doc);
        }

        match self.gateway.rerank(&request.query_text, &docs, "global").await {
            Ok(scores) if scores.len() == rerank_count => {
                for (candidate, score) in candidates.iter_mut().take(rerank_count).zip(scores) {
                    candidate.rerank_score = Some(score);
                    candidate.score = score;
                }
            }
            Ok(_) => warn!("rerank returned a mismatched score count, keeping Stage-B scores"),
            Err(e) => warn!("rerank call failed, keeping Stage-B scores: {e}"),
        }
        Ok(candidates)
    }

    async fn hydrate(&self, candidates: Vec<Candidate>) -> Result<Vec<RetrievalResult>> {
        let mut results = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if let Some(unit) = self.store.get_memory_unit(&candidate.unit_id).await? {
                results.push(RetrievalResult {
                    unit,
                    score: candidate.score,
                    source: candidate.source,
                    rerank_score: candidate.rerank_score,
                });
            }
        }
        Ok(results)
    }
}

/// Stage B: union by `unit_id`; a unit present in both branches gets
/// `semantic_score + 0.3 * keyword_score`, otherwise it keeps its single-branch
/// score tagged with that branch as source.
fn merge(semantic: Vec<Candidate>, keyword: Vec<Candidate>) -> Vec<Candidate> {
    let mut by_id: HashMap<String, Candidate> = HashMap::new();
    for c in semantic {
        by_id.insert(c.unit_id.clone(), c);
    }
    for k in keyword {
        match by_id.get_mut(&k.unit_id) {
            Some(existing) => {
                let semantic_score = existing.semantic_score.unwrap_or(0.0);
                let keyword_score = k.keyword_score.unwrap_or(0.0);
                existing.keyword_score = Some(keyword_score);
                existing.score = semantic_score + KEYWORD_BOOST * keyword_score;
                existing.source = Source::Hybrid;
            }
            None => {
                by_id.insert(k.unit_id.clone(), k);
            }
        }
    }
    by_id.into_values().collect()
}

/// Stage D: policy reranking. Applies exactly one weighting scheme to the final
/// score, chosen by configuration (default `relevance_time`).
fn apply_policy(
    results: Vec<RetrievalResult>,
    strategy: RerankStrategy,
    half_life_days: f64,
    now: chrono::DateTime<Utc>,
) -> Vec<RetrievalResult> {
    results
        .into_iter()
        .map(|mut r| {
            r.score = match strategy {
                RerankStrategy::RelevanceTime => {
                    let age_days = (now - r.unit.created_at).num_seconds() as f64 / 86_400.0;
                    let decay = (-age_days.max(0.0) / half_life_days).exp();
                    r.score * decay as f32
                }
                RerankStrategy::QualityBoost => r.score * (1.0 + 0.2 * r.unit.relevance_score),
                RerankStrategy::TypePriority => r.score * r.unit.unit_type.priority_weight(),
            };
            r
        })
        .collect()
}

/// Stage E plus the tie-break rules (spec.md §4.6): drop below `min_score`,
/// sort descending with tie-break on (unit_type priority, recency, unit_id),
/// truncate to `limit`.
fn threshold_and_truncate(mut results: Vec<RetrievalResult>, min_score: f32, limit: usize) -> Vec<RetrievalResult> {
    results.retain(|r| r.score >= min_score);
    results.sort_by(compare_results);
    results.truncate(limit);
    results
}

fn compare_results(a: &RetrievalResult, b: &RetrievalResult) -> Ordering {
    if (a.score - b.score).abs() >= 1e-6 {
        return b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal);
    }
    let priority_cmp = b.unit.unit_type.priority_rank().cmp(&a.unit.unit_type.priority_rank());
    if priority_cmp != Ordering::Equal {
        return priority_cmp;
    }
    let recency_cmp = b.unit.created_at.cmp(&a.unit.created_at);
    if recency_cmp != Ordering::Equal {
        return recency_cmp;
    }
    a.unit.unit_id.cmp(&b.unit.unit_id)
}

fn merge_cross_project(
    per_project: Vec<Vec<RetrievalResult>>,
    strategy: MergeStrategy,
    limit: usize,
) -> Vec<RetrievalResult> {
    match strategy {
        MergeStrategy::Score => {
            let mut all: Vec<RetrievalResult> = per_project.into_iter().flatten().collect();
            all.sort_by(compare_results);
            all.truncate(limit);
            all
        }
        MergeStrategy::Time => {
            let mut all: Vec<RetrievalResult> = per_project.into_iter().flatten().collect();
            all.sort_by(|a, b| b.unit.created_at.cmp(&a.unit.created_at));
            all.truncate(limit);
            all
        }
        MergeStrategy::RoundRobin => {
            let mut queues: Vec<_> = per_project.into_iter().map(|v| v.into_iter()).collect();
            let mut out = Vec::new();
            loop {
                let mut advanced = false;
                for queue in queues.iter_mut() {
                    if out.len() >= limit {
                        break;
                    }
                    if let Some(next) = queue.next() {
                        out.push(next);
                        advanced = true;
                    }
                }
                if !advanced || out.len() >= limit {
                    break;
                }
            }
            out.truncate(limit);
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::MemoryUnit as Unit;
    use crate::store::{MemoryUnit, UnitType};
    use chrono::Duration as ChronoDuration;

    fn sample_unit(id: &str, unit_type: UnitType, created_at_offset_days: i64, relevance: f32) -> MemoryUnit {
        let now = Utc::now();
        Unit {
            unit_id: id.to_string(),
            project_id: "p".to_string(),
            conversation_id: None,
            unit_type,
            title: "t".to_string(),
            summary: "s".to_string(),
            content: "c".to_string(),
            keywords: Default::default(),
            relevance_score: relevance,
            token_count: 10,
            created_at: now - ChronoDuration::days(created_at_offset_days),
            updated_at: now,
            expires_at: None,
            is_active: true,
        }
    }

    #[test]
    fn merge_applies_keyword_boost_on_overlap() {
        let semantic = vec![Candidate {
            unit_id: "u1".to_string(),
            semantic_score: Some(0.6),
            keyword_score: None,
            score: 0.6,
            source: Source::Semantic,
            rerank_score: None,
        }];
        let keyword = vec![Candidate {
            unit_id: "u1".to_string(),
            semantic_score: None,
            keyword_score: Some(0.5),
            score: 0.5,
            source: Source::Keyword,
            rerank_score: None,
        }];
        let merged = merge(semantic, keyword);
        assert_eq!(merged.len(), 1);
        assert!((merged[0].score - (0.6 + 0.3 * 0.5)).abs() < 1e-6);
        assert_eq!(merged[0].source, Source::Hybrid);
    }

    #[test]
    fn threshold_drops_low_scores_and_sorts_by_tiebreak() {
        let results = vec![
            RetrievalResult {
                unit: sample_unit("b", UnitType::Conversation, 1, 0.5),
                score: 0.5,
                source: Source::Hybrid,
                rerank_score: None,
            },
            RetrievalResult {
                unit: sample_unit("a", UnitType::Decision, 1, 0.5),
                score: 0.5,
                source: Source::Hybrid,
                rerank_score: None,
            },
            RetrievalResult {
                unit: sample_unit("c", UnitType::Conversation, 1, 0.1),
                score: 0.1,
                source: Source::Hybrid,
                rerank_score: None,
            },
        ];
        let out = threshold_and_truncate(results, 0.3, 5);
        assert_eq!(out.len(), 2);
        // equal scores within 1e-6: higher unit_type priority (Decision) wins first.
        assert_eq!(out[0].unit.unit_id, "a");
    }

    #[test]
    fn relevance_time_decays_older_units() {
        let now = Utc::now();
        let fresh = RetrievalResult {
            unit: sample_unit("fresh", UnitType::Conversation, 0, 0.5),
            score: 1.0,
            source: Source::Hybrid,
            rerank_score: None,
        };
        let old = RetrievalResult {
            unit: sample_unit("old", UnitType::Conversation, 60, 0.5),
            score: 1.0,
            source: Source::Hybrid,
            rerank_score: None,
        };
        let out = apply_policy(vec![fresh, old], RerankStrategy::RelevanceTime, 30.0, now);
        assert!(out[0].score > out[1].score);
    }
}
