// Explicit configuration, loaded once in each binary's `main()` and threaded through
// component constructors. Replaces the source pattern of a global `lazy_static!`
// config singleton (spec.md §9 "Global configuration singleton").

use std::collections::HashMap;
use std::env;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub pool_size: u32,
    pub pool_max_overflow: u32,
    pub pool_timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct VectorConfig {
    pub url: String,
    pub collection_name: String,
    pub dimension: u64,
}

/// One of the three Model Gateway task kinds. A closed set, per the REDESIGN FLAG
/// replacing the source's dynamic string-keyed provider registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Embed,
    Rerank,
    Complete,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    pub base_url: String,
}

/// `provider/model` pair selecting a concrete gateway backend for one task.
#[derive(Debug, Clone)]
pub struct ProviderModel {
    pub provider: String,
    pub model: String,
}

impl ProviderModel {
    fn parse(spec: &str) -> Self {
        match spec.split_once('/') {
            Some((provider, model)) => ProviderModel {
                provider: provider.to_string(),
                model: model.to_string(),
            },
            None => ProviderModel {
                provider: spec.to_string(),
                model: String::new(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskRouting {
    pub primary: ProviderModel,
    pub fallback: Vec<ProviderModel>,
}

#[derive(Debug, Clone)]
pub struct ModelsConfig {
    pub providers: HashMap<String, ProviderConfig>,
    pub tasks: HashMap<TaskKind, TaskRouting>,
    pub request_timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_base_seconds: u64,
    pub retry_cap_seconds: u64,
    pub per_provider_concurrency: usize,
    pub cache_ttl_seconds: u64,
    pub cache_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerankStrategy {
    RelevanceTime,
    QualityBoost,
    TypePriority,
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub rerank_top_k: usize,
    pub min_score: f32,
    pub default_strategy: RerankStrategy,
    pub half_life_days: f64,
}

#[derive(Debug, Clone)]
pub struct InjectorConfig {
    pub token_budget: Option<usize>,
    pub diversity_threshold: f32,
    pub fusion_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub spool_dir: std::path::PathBuf,
    pub max_retries: u32,
    pub retry_base_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub vector: VectorConfig,
    pub models: ModelsConfig,
    pub retrieval: RetrievalConfig,
    pub injector: InjectorConfig,
    pub queue: QueueConfig,
    pub ingest_url: String,
    pub http_bind_addr: String,
}

impl Config {
    /// Build configuration from environment once, at process start. Panics on a
    /// missing required variable — by design, the orchestrator must never start
    /// with a partially-understood configuration.
    pub fn from_env() -> Self {
        let mut providers = HashMap::new();
        for name in ["openai", "anthropic", "local"] {
            let key_var = format!("{}_API_KEY", name.to_uppercase());
            let url_var = format!("{}_BASE_URL", name.to_uppercase());
            if let Ok(api_key) = env::var(&key_var) {
                let base_url = env_or(&url_var, default_base_url(name));
                providers.insert(name.to_string(), ProviderConfig { api_key, base_url });
            }
        }

        let mut tasks = HashMap::new();
        tasks.insert(
            TaskKind::Embed,
            task_routing("EMBED", "openai/text-embedding-3-large"),
        );
        tasks.insert(
            TaskKind::Rerank,
            task_routing("RERANK", "openai/gpt-4o-mini"),
        );
        tasks.insert(
            TaskKind::Complete,
            task_routing("COMPLETE", "openai/gpt-4o-mini"),
        );

        Config {
            database: DatabaseConfig {
                url: env_or("DATABASE_URL", "sqlite://memnon.db"),
                pool_size: env_usize("DATABASE_POOL_SIZE", 20) as u32,
                pool_max_overflow: env_usize("DATABASE_POOL_MAX_OVERFLOW", 40) as u32,
                pool_timeout_seconds: env_usize("DATABASE_POOL_TIMEOUT_SECONDS", 30) as u64,
            },
            vector: VectorConfig {
                url: env_or("QDRANT_URL", "http://localhost:6334"),
                collection_name: env_or("QDRANT_COLLECTION", "memories_v1"),
                dimension: env_usize("QDRANT_DIMENSION", 4096) as u64,
            },
            models: ModelsConfig {
                providers,
                tasks,
                request_timeout_seconds: env_usize("MODEL_REQUEST_TIMEOUT_SECONDS", 30) as u64,
                max_retries: env_usize("MODEL_MAX_RETRIES", 3) as u32,
                retry_base_seconds: env_usize("MODEL_RETRY_BASE_SECONDS", 1) as u64,
                retry_cap_seconds: env_usize("MODEL_RETRY_CAP_SECONDS", 10) as u64,
                per_provider_concurrency: env_usize("MODEL_PROVIDER_CONCURRENCY", 10),
                cache_ttl_seconds: env_usize("MODEL_CACHE_TTL_SECONDS", 3600) as u64,
                cache_capacity: env_usize("MODEL_CACHE_CAPACITY", 512),
            },
            retrieval: RetrievalConfig {
                top_k: env_usize("RETRIEVAL_TOP_K", 20),
                rerank_top_k: env_usize("RETRIEVAL_RERANK_TOP_K", 5),
                min_score: env_f64("RETRIEVAL_MIN_SCORE", 0.3) as f32,
                default_strategy: RerankStrategy::RelevanceTime,
                half_life_days: env_f64("RETRIEVAL_HALF_LIFE_DAYS", 30.0),
            },
            injector: InjectorConfig {
                token_budget: env::var("INJECTOR_TOKEN_BUDGET")
                    .ok()
                    .and_then(|v| v.parse().ok()),
                diversity_threshold: env_f64("INJECTOR_DIVERSITY_THRESHOLD", 0.7) as f32,
                fusion_enabled: env_bool("INJECTOR_FUSION_ENABLED", false),
            },
            queue: QueueConfig {
                spool_dir: env_or("QUEUE_SPOOL_DIR", "data/spool").into(),
                max_retries: env_usize("QUEUE_MAX_RETRIES", 5) as u32,
                retry_base_seconds: env_usize("QUEUE_RETRY_BASE_SECONDS", 2) as u64,
            },
            ingest_url: env_or("INGEST_URL", "http://localhost:8088/conversation/store"),
            http_bind_addr: env_or("HTTP_BIND_ADDR", "0.0.0.0:8088"),
        }
    }
}

fn default_base_url(provider: &str) -> &'static str {
    match provider {
        "openai" => "https://api.openai.com/v1",
        "anthropic" => "https://api.anthropic.com/v1",
        _ => "http://localhost:11434/v1",
    }
}

fn task_routing(env_prefix: &str, default_primary: &str) -> TaskRouting {
    let primary = ProviderModel::parse(&env_or(
        &format!("{}_PRIMARY", env_prefix),
        default_primary,
    ));
    let fallback = env::var(format!("{}_FALLBACK", env_prefix))
        .ok()
        .map(|v| v.split(',').map(ProviderModel::parse).collect())
        .unwrap_or_default();
    TaskRouting { primary, fallback }
}
