// Retriever integration coverage exercised through the public `VectorBackend`
// trait with `FakeVectorStore` standing in for Qdrant (SPEC_FULL.md §2.4) and
// an in-memory sqlite `StructuredStore`. All requests use `QueryType::Keyword`
// so the gateway never needs a real model provider.

use chrono::Utc;
use memnon::config::{ModelsConfig, RerankStrategy, RetrievalConfig};
use memnon::gateway::ModelGateway;
use memnon::retriever::{MergeStrategy, QueryType, RetrievalRequest, Retriever};
use memnon::store::{MemoryUnit, StructuredStore, UnitType};
use memnon::vector::fake::FakeVectorStore;
use sqlx::sqlite::SqlitePool;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

async fn test_store() -> StructuredStore {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = StructuredStore::new(pool);
    store.run_migrations().await.unwrap();
    store
}

fn no_provider_models_config() -> ModelsConfig {
    ModelsConfig {
        providers: Default::default(),
        tasks: Default::default(),
        request_timeout_seconds: 30,
        max_retries: 1,
        retry_base_seconds: 1,
        retry_cap_seconds: 1,
        per_provider_concurrency: 1,
        cache_ttl_seconds: 60,
        cache_capacity: 16,
    }
}

fn retrieval_config() -> RetrievalConfig {
    RetrievalConfig {
        top_k: 20,
        rerank_top_k: 5,
        min_score: 0.0,
        default_strategy: RerankStrategy::RelevanceTime,
        half_life_days: 30.0,
    }
}

async fn seeded_unit(store: &StructuredStore, project_id: &str, title: &str, keyword: &str) -> MemoryUnit {
    store.ensure_project(project_id).await.unwrap();
    let now = Utc::now();
    let mut keywords: BTreeSet<String> = Default::default();
    keywords.insert(keyword.to_string());
    let unit = MemoryUnit {
        unit_id: Uuid::new_v4().to_string(),
        project_id: project_id.to_string(),
        conversation_id: None,
        unit_type: UnitType::Conversation,
        title: title.to_string(),
        summary: title.to_string(),
        content: title.to_string(),
        keywords,
        relevance_score: 1.0,
        token_count: 10,
        created_at: now,
        updated_at: now,
        expires_at: None,
        is_active: true,
    };
    store.insert_memory_unit(&unit).await.unwrap();
    unit
}

fn keyword_request(query: &str) -> RetrievalRequest {
    RetrievalRequest {
        query_text: query.to_string(),
        query_type: QueryType::Keyword,
        limit: 10,
        min_score: 0.0,
        ..Default::default()
    }
}

async fn build_retriever(store: Arc<StructuredStore>) -> Retriever {
    let gateway = Arc::new(ModelGateway::new(no_provider_models_config(), None));
    let vector: Arc<dyn memnon::vector::VectorBackend> = Arc::new(FakeVectorStore::new());
    Retriever::new(gateway, store, vector, retrieval_config())
}

#[tokio::test]
async fn keyword_search_is_scoped_to_a_single_project() {
    let store = Arc::new(test_store().await);
    seeded_unit(&store, "p1", "rotate the launch codes", "codes").await;
    seeded_unit(&store, "p2", "rotate the launch codes too", "codes").await;
    let retriever = build_retriever(store).await;

    let results = retriever.search("p1", &keyword_request("codes")).await.unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].unit.project_id, "p1");
}

#[tokio::test]
async fn cross_project_search_merges_results_from_every_accessible_project() {
    let store = Arc::new(test_store().await);
    let p1_unit = seeded_unit(&store, "p1", "the secret launch codes", "secret").await;
    let p2_unit = seeded_unit(&store, "p2", "another secret entirely", "secret").await;
    let retriever = build_retriever(store).await;

    let accessible = vec!["p1".to_string(), "p2".to_string()];
    let results = retriever
        .search_cross_project(&accessible, &keyword_request("secret"), MergeStrategy::Score)
        .await
        .unwrap();

    let ids: Vec<&str> = results.iter().map(|r| r.unit.unit_id.as_str()).collect();
    assert!(ids.contains(&p1_unit.unit_id.as_str()));
    assert!(ids.contains(&p2_unit.unit_id.as_str()));
}

#[tokio::test]
async fn cross_project_search_only_visits_the_projects_it_is_given() {
    let store = Arc::new(test_store().await);
    let p1_unit = seeded_unit(&store, "p1", "the secret launch codes", "secret").await;
    seeded_unit(&store, "p2", "another secret entirely", "secret").await;
    let retriever = build_retriever(store).await;

    // Models the permission-filtered set an `Orchestrator` would pass down
    // after `PermissionChecker::filter_accessible` has dropped "p2".
    let accessible = vec!["p1".to_string()];
    let results = retriever
        .search_cross_project(&accessible, &keyword_request("secret"), MergeStrategy::Score)
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].unit.unit_id, p1_unit.unit_id);
}
