// In-memory `VectorBackend` standing in for Qdrant in tests (SPEC_FULL.md
// §2.4: "no live Qdrant in tests; the vector store is exercised through a
// trait object so a fake/in-memory implementation can stand in").

use super::{VectorBackend, VectorFilter, VectorPoint};
use crate::error::Result;
use crate::store::MemoryUnit;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
pub struct FakeVectorStore {
    points: Mutex<HashMap<String, (MemoryUnit, Vec<f32>)>>,
}

impl FakeVectorStore {
    pub fn new() -> Self {
        FakeVectorStore::default()
    }

    pub fn len(&self) -> usize {
        self.points.lock().len()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn matches_filter(unit: &MemoryUnit, filter: &VectorFilter) -> bool {
    if let Some(ref project_id) = filter.project_id {
        if &unit.project_id != project_id {
            return false;
        }
    }
    if let Some(ref types) = filter.unit_types {
        if !types.contains(&unit.unit_type) {
            return false;
        }
    }
    if let Some(now) = filter.exclude_expired_as_of {
        if let Some(expires_at) = unit.expires_at {
            if expires_at <= now {
                return false;
            }
        }
    }
    if let Some(after) = filter.created_after {
        if unit.created_at < after {
            return false;
        }
    }
    if let Some(before) = filter.created_before {
        if unit.created_at > before {
            return false;
        }
    }
    true
}

#[async_trait]
impl VectorBackend for FakeVectorStore {
    async fn upsert(&self, unit: &MemoryUnit, vector: Vec<f32>) -> Result<()> {
        self.points.lock().insert(unit.unit_id.clone(), (unit.clone(), vector));
        Ok(())
    }

    async fn delete(&self, unit_id: &str) -> Result<()> {
        self.points.lock().remove(unit_id);
        Ok(())
    }

    async fn exists(&self, unit_id: &str) -> Result<bool> {
        Ok(self.points.lock().contains_key(unit_id))
    }

    async fn search(&self, vector: Vec<f32>, filter: &VectorFilter, limit: usize) -> Result<Vec<VectorPoint>> {
        let points = self.points.lock();
        let mut scored: Vec<VectorPoint> = points
            .values()
            .filter(|(unit, _)| matches_filter(unit, filter))
            .map(|(unit, v)| VectorPoint {
                unit_id: unit.unit_id.clone(),
                score: cosine_similarity(&vector, v),
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::UnitType;
    use chrono::Utc;

    fn unit(unit_id: &str, project_id: &str) -> MemoryUnit {
        let now = Utc::now();
        MemoryUnit {
            unit_id: unit_id.to_string(),
            project_id: project_id.to_string(),
            conversation_id: None,
            unit_type: UnitType::Conversation,
            title: "t".to_string(),
            summary: "s".to_string(),
            content: "c".to_string(),
            keywords: Default::default(),
            relevance_score: 0.5,
            token_count: 1,
            created_at: now,
            updated_at: now,
            expires_at: None,
            is_active: true,
        }
    }

    #[tokio::test]
    async fn upsert_then_search_returns_the_closest_match() {
        let store = FakeVectorStore::new();
        store.upsert(&unit("a", "p"), vec![1.0, 0.0]).await.unwrap();
        store.upsert(&unit("b", "p"), vec![0.0, 1.0]).await.unwrap();

        let results = store.search(vec![1.0, 0.0], &VectorFilter::default(), 1).await.unwrap();
        assert_eq!(results[0].unit_id, "a");
    }

    #[tokio::test]
    async fn search_respects_project_filter() {
        let store = FakeVectorStore::new();
        store.upsert(&unit("a", "p1"), vec![1.0, 0.0]).await.unwrap();
        store.upsert(&unit("b", "p2"), vec![1.0, 0.0]).await.unwrap();

        let filter = VectorFilter { project_id: Some("p2".to_string()), ..Default::default() };
        let results = store.search(vec![1.0, 0.0], &filter, 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].unit_id, "b");
    }

    #[tokio::test]
    async fn delete_removes_the_point() {
        let store = FakeVectorStore::new();
        store.upsert(&unit("a", "p"), vec![1.0, 0.0]).await.unwrap();
        assert!(store.exists("a").await.unwrap());
        store.delete("a").await.unwrap();
        assert!(!store.exists("a").await.unwrap());
    }
}
