// Vector Store (C3, spec.md §4.3). One collection, `memories_v1`, cosine distance,
// configurable dimension. Payload carries enough of the memory-unit shape to
// support the Retriever's filters without a join back to the Structured Store.
//
// Exercised through the `VectorBackend` trait so a fake/in-memory backend can
// stand in for tests without a live Qdrant (SPEC_FULL.md §2.4).

pub mod fake;

use crate::config::VectorConfig;
use crate::error::{MemoryError, Result};
use crate::store::{MemoryUnit, UnitType};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, Distance, Filter, FieldCondition, Match, PointId,
    PointStruct, Range, ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder,
    DeletePointsBuilder, Value as QdrantValue, value::Kind as QdrantKind,
};
use qdrant_client::Qdrant;
use std::collections::HashMap;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub unit_id: String,
    pub score: f32,
}

/// Filter mirroring spec.md §4.3's required predicates: exact match on
/// `project_id`/`unit_type`, is-absent-or-future on `expires_at`, numeric range on
/// `created_at`.
#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub project_id: Option<String>,
    pub unit_types: Option<Vec<UnitType>>,
    pub exclude_expired_as_of: Option<DateTime<Utc>>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

/// The Vector Store's operation surface (spec.md §4.3), independent of the
/// backing engine. `Orchestrator` and `Retriever` hold `Arc<dyn VectorBackend>`
/// rather than the concrete Qdrant client so a fake store can stand in under
/// test.
#[async_trait]
pub trait VectorBackend: Send + Sync {
    async fn upsert(&self, unit: &MemoryUnit, vector: Vec<f32>) -> Result<()>;
    async fn delete(&self, unit_id: &str) -> Result<()>;
    async fn exists(&self, unit_id: &str) -> Result<bool>;
    async fn search(&self, vector: Vec<f32>, filter: &VectorFilter, limit: usize) -> Result<Vec<VectorPoint>>;
    async fn health_check(&self) -> bool;
}

pub struct VectorStore {
    client: Qdrant,
    collection: String,
    dimension: u64,
}

impl VectorStore {
    /// Phase 2 of orchestrator init (spec.md §4.8): verify the collection exists
    /// and its dimension matches configuration; create it if missing.
    pub async fn connect(config: &VectorConfig) -> Result<Self> {
        let client = Qdrant::from_url(&config.url)
            .skip_compatibility_check()
            .build()
            .map_err(MemoryError::from)?;

        let store = VectorStore {
            client,
            collection: config.collection_name.clone(),
            dimension: config.dimension,
        };
        store.ensure_collection().await?;
        Ok(store)
    }

    async fn ensure_collection(&self) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(MemoryError::from)?;

        if !exists {
            info!("creating qdrant collection {}", self.collection);
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection)
                        .vectors_config(VectorParamsBuilder::new(self.dimension, Distance::Cosine)),
                )
                .await
                .map_err(MemoryError::from)?;
            return Ok(());
        }

        let info = self
            .client
            .collection_info(&self.collection)
            .await
            .map_err(MemoryError::from)?;
        if let Some(params) = info
            .result
            .and_then(|r| r.config)
            .and_then(|c| c.params)
            .and_then(|p| p.vectors_config)
            .and_then(|v| v.config)
        {
            use qdrant_client::qdrant::vectors_config::Config as VCfg;
            if let VCfg::Params(p) = params {
                if p.size != self.dimension {
                    // I2: mismatched writes are rejected; a mismatched existing
                    // collection is a startup-time configuration error.
                    return Err(MemoryError::Validation(format!(
                        "configured dimension {} does not match existing collection dimension {}",
                        self.dimension, p.size
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn dimension(&self) -> u64 {
        self.dimension
    }
}

#[async_trait]
impl VectorBackend for VectorStore {
    async fn health_check(&self) -> bool {
        self.client.health_check().await.is_ok()
    }

    /// Upsert a unit's embedding. I2: the embedding's dimension must match the
    /// collection's configured dimension or the write is rejected up front.
    async fn upsert(&self, unit: &MemoryUnit, vector: Vec<f32>) -> Result<()> {
        if vector.len() as u64 != self.dimension {
            return Err(MemoryError::Validation(format!(
                "embedding dimension {} does not match configured dimension {}",
                vector.len(),
                self.dimension
            )));
        }

        let mut payload: HashMap<String, QdrantValue> = HashMap::new();
        payload.insert("unit_id".into(), unit.unit_id.clone().into());
        payload.insert("project_id".into(), unit.project_id.clone().into());
        if let Some(ref conv_id) = unit.conversation_id {
            payload.insert("conversation_id".into(), conv_id.clone().into());
        }
        payload.insert("unit_type".into(), unit.unit_type.to_string().into());
        payload.insert("created_at".into(), unit.created_at.timestamp().into());
        if let Some(expires_at) = unit.expires_at {
            payload.insert("expires_at".into(), expires_at.timestamp().into());
        }
        let keywords: Vec<QdrantValue> = unit.keywords.iter().map(|k| k.clone().into()).collect();
        payload.insert("keywords".into(), QdrantValue {
            kind: Some(QdrantKind::ListValue(qdrant_client::qdrant::ListValue { values: keywords })),
        });

        let point = PointStruct::new(point_id_for(&unit.unit_id), vector, payload);

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]).wait(true))
            .await
            .map_err(MemoryError::from)?;
        Ok(())
    }

    /// Delete a point by `unit_id` (spec.md §4.3 "Deletes are by unit_id").
    async fn delete(&self, unit_id: &str) -> Result<()> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(&self.collection)
                    .points(vec![PointId::from(point_id_for(unit_id))])
                    .wait(true),
            )
            .await
            .map_err(MemoryError::from)?;
        Ok(())
    }

    async fn exists(&self, unit_id: &str) -> Result<bool> {
        let result = self
            .client
            .scroll(
                ScrollPointsBuilder::new(&self.collection)
                    .filter(Filter::must([Condition::matches(
                        "unit_id",
                        unit_id.to_string(),
                    )]))
                    .limit(1),
            )
            .await
            .map_err(MemoryError::from)?;
        Ok(!result.result.is_empty())
    }

    /// Semantic branch of Stage A (spec.md §4.6): top-K by cosine similarity under
    /// the given filter.
    async fn search(
        &self,
        vector: Vec<f32>,
        filter: &VectorFilter,
        limit: usize,
    ) -> Result<Vec<VectorPoint>> {
        let mut conditions = Vec::new();
        if let Some(ref project_id) = filter.project_id {
            conditions.push(Condition::matches("project_id", project_id.clone()));
        }
        if let Some(ref types) = filter.unit_types {
            if types.len() == 1 {
                conditions.push(Condition::matches("unit_type", types[0].to_string()));
            } else if !types.is_empty() {
                conditions.push(Condition::matches(
                    "unit_type",
                    types.iter().map(|t| t.to_string()).collect::<Vec<_>>(),
                ));
            }
        }
        if let Some(after) = filter.created_after {
            conditions.push(Condition::from(FieldCondition {
                key: "created_at".to_string(),
                range: Some(Range {
                    gte: Some(after.timestamp() as f64),
                    ..Default::default()
                }),
                ..Default::default()
            }));
        }
        if let Some(before) = filter.created_before {
            conditions.push(Condition::from(FieldCondition {
                key: "created_at".to_string(),
                range: Some(Range {
                    lte: Some(before.timestamp() as f64),
                    ..Default::default()
                }),
                ..Default::default()
            }));
        }

        let mut qfilter = Filter::default();
        if !conditions.is_empty() {
            qfilter.must = conditions;
        }
        // Is-absent-OR-future predicate on `expires_at` (spec.md §4.3): Qdrant
        // rejects a value-equals-null predicate, so "absent" is expressed as a
        // `must_not` on the field-exists condition, OR'd with "> now".
        if let Some(now) = filter.exclude_expired_as_of {
            let expiry_conditions = vec![
                Condition::is_empty("expires_at"),
                Condition::from(FieldCondition {
                    key: "expires_at".to_string(),
                    range: Some(Range {
                        gt: Some(now.timestamp() as f64),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            ];
            qfilter.should = expiry_conditions.clone();
            qfilter.min_should = Some(qdrant_client::qdrant::MinShould {
                conditions: expiry_conditions,
                min_count: 1,
            });
        }

        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.collection, vector, limit as u64)
                    .filter(qfilter)
                    .with_payload(true),
            )
            .await
            .map_err(MemoryError::from)?;

        Ok(response
            .result
            .into_iter()
            .filter_map(|p| {
                let unit_id = p
                    .payload
                    .get("unit_id")
                    .and_then(|v| v.as_str().map(|s| s.to_string()))?;
                Some(VectorPoint { unit_id, score: p.score })
            })
            .collect())
    }
}

use qdrant_client::qdrant::VectorParamsBuilder;

/// Qdrant points are u64 or UUID ids; our `unit_id`s are UUID strings, so they
/// pass through directly as the point id's string form.
fn point_id_for(unit_id: &str) -> PointId {
    PointId::from(unit_id.to_string())
}

