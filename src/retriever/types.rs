use crate::store::{MemoryUnit, UnitType};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    Semantic,
    Keyword,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Semantic,
    Keyword,
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    Score,
    Time,
    RoundRobin,
}

#[derive(Debug, Clone)]
pub struct TimeRange {
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub query_text: String,
    pub query_type: QueryType,
    pub limit: usize,
    pub min_score: f32,
    pub unit_types: Option<Vec<UnitType>>,
    pub time_range: Option<TimeRange>,
    pub include_expired: bool,
}

impl Default for RetrievalRequest {
    fn default() -> Self {
        RetrievalRequest {
            query_text: String::new(),
            query_type: QueryType::Hybrid,
            limit: 5,
            min_score: 0.3,
            unit_types: None,
            time_range: None,
            include_expired: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub unit: MemoryUnit,
    pub score: f32,
    pub source: Source,
    pub rerank_score: Option<f32>,
}

/// An intermediate candidate tracked through Stages A-D before the unit row is
/// known to have survived filtering; keeps the merge/rerank/policy stages from
/// needing to hydrate units they might still drop.
#[derive(Debug, Clone)]
pub(super) struct Candidate {
    pub unit_id: String,
    pub semantic_score: Option<f32>,
    pub keyword_score: Option<f32>,
    pub score: f32,
    pub source: Source,
    pub rerank_score: Option<f32>,
}
