// Service Orchestrator (C8, spec.md §4.8): owns the phased startup of every
// component, the compensating-transaction write path for memory units, and the
// public operation surface the MCP server and HTTP API both call into.
// Grounded on the reference `AppState::new`'s sequential `Arc::new(Service::new(...))`
// init chain (same "construct in dependency order, log each step" shape) but this
// orchestrator parallelises the independent first phase, retries each component's
// construction with backoff, and lets component rollback fall out of ordinary
// `Result` propagation and `Drop` rather than the reference's all-or-nothing
// sequential `?`.

use crate::compressor::Compressor;
use crate::config::Config;
use crate::error::{MemoryError, Result};
use crate::gateway::ModelGateway;
use crate::injector::{InjectionMode, Injector};
use crate::queue::{CaptureItem, CaptureQueue, PostOutcome};
use crate::retriever::{MergeStrategy, RetrievalRequest, RetrievalResult, Retriever};
use crate::store::{Conversation, CostRecord, MemoryUnit, Role, StructuredStore};
use crate::vector::VectorBackend;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tracing::{error, info, warn};
use uuid::Uuid;

const INIT_ATTEMPTS: u32 = 3;
const INIT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);
const QUEUE_DRAIN_INTERVAL: Duration = Duration::from_secs(2);

/// Per-project read gate for cross-project search (spec.md §4.6, §4.8 C8): a
/// project the caller cannot read is silently dropped from the search set
/// rather than rejected. The default policy allows every project, matching
/// this service's current single-tenant deployment; a caller embedding this
/// crate behind real multi-tenant auth supplies its own `PermissionChecker`.
pub trait PermissionChecker: Send + Sync {
    fn filter_accessible(&self, requested: &[String]) -> Vec<String>;
}

pub struct AllowAllPermissions;

impl PermissionChecker for AllowAllPermissions {
    fn filter_accessible(&self, requested: &[String]) -> Vec<String> {
        requested.to_vec()
    }
}

/// Retries a fallible component constructor with exponential backoff starting
/// at one second (spec.md §4.8 phased init). Each attempt is independent —
/// nothing partially constructed by a failed attempt survives to the next one.
async fn retry_init<T, F, Fut>(component: &'static str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = INIT_BACKOFF_BASE;
    let mut last_err = None;
    for attempt in 1..=INIT_ATTEMPTS {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(component, attempt, "initialisation attempt failed: {e}");
                last_err = Some(e);
                if attempt < INIT_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
    Err(last_err.unwrap())
}

/// Per-key async mutexes backing the conversation lock (spec.md §5 ordering
/// guarantee): ingest into the same conversation is always serial, so the
/// Compressor never observes interleaved state. Keys are created lazily and
/// never removed — the process lifetime of a distinct session/project count
/// is small enough that this isn't a leak worth guarding against here.
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    fn new() -> Self {
        KeyedLocks {
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut locks = self.locks.lock();
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }
}

/// Drains `CostRecord`s emitted by the gateway (spec.md §4.1 step 6) into the
/// Structured Store. Runs for the lifetime of the gateway's cost-sink sender;
/// a per-record failure is logged and skipped rather than stopping the drain.
fn spawn_cost_sink_drain(store: Arc<StructuredStore>, mut rx: mpsc::UnboundedReceiver<CostRecord>) {
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            if let Err(e) = store.record_cost(&record).await {
                warn!("failed to record cost: {e}");
            }
        }
    });
}

/// Background Capture Queue drain (spec.md §4.4): an out-of-process capture
/// agent writes `CaptureItem`s into the spool directory; this loop ships them
/// to `ingest_url` in FIFO order for as long as the process runs. Intended to
/// be spawned once per binary right after `Orchestrator::init`.
pub async fn run_queue_drain(orchestrator: Arc<Orchestrator>, ingest_url: String) {
    let client = reqwest::Client::new();
    let mut interval = tokio::time::interval(QUEUE_DRAIN_INTERVAL);
    loop {
        interval.tick().await;
        let result = orchestrator
            .queue
            .drain_once(|item| post_capture_item(client.clone(), ingest_url.clone(), item))
            .await;
        if let Err(e) = result {
            warn!("queue drain pass failed: {e}");
        }
    }
}

async fn post_capture_item(client: reqwest::Client, ingest_url: String, item: CaptureItem) -> PostOutcome {
    let body = serde_json::json!({
        "project_id": item.project_id,
        "session_id": item.session_id,
        "messages": item.messages,
    });
    match client.post(&ingest_url).json(&body).send().await {
        Ok(resp) if resp.status().is_success() => PostOutcome::Delivered,
        Ok(resp) if resp.status().as_u16() == 429 || resp.status().is_server_error() => PostOutcome::Retryable,
        Ok(resp) => {
            warn!(status = %resp.status(), "capture item rejected by ingest endpoint");
            PostOutcome::Rejected
        }
        Err(e) => {
            warn!("failed to reach ingest endpoint, will retry: {e}");
            PostOutcome::Retryable
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Ok,
    Degraded,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub state: HealthState,
    pub detail: Option<String>,
}

/// Result of the compression step triggered by `ingest_conversation` (spec.md
/// §4.5 step 5). The conversation row is committed either way; this only
/// describes whether a memory unit was also produced.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CompressionOutcome {
    NotYetIngestable,
    Compressed,
    Failed { code: &'static str, detail: String },
}

pub struct Orchestrator {
    gateway: Arc<ModelGateway>,
    store: Arc<StructuredStore>,
    vector: Arc<dyn VectorBackend>,
    queue: Arc<CaptureQueue>,
    compressor: Arc<Compressor>,
    retriever: Arc<Retriever>,
    injector: Arc<Injector>,
    conversation_locks: KeyedLocks,
    permissions: Arc<dyn PermissionChecker>,
}

impl Orchestrator {
    /// Phase 1 (parallel): Model Gateway, Structured Store, Capture Queue.
    /// Phase 2 (sequential, depends on nothing from phase 1): Vector Store.
    /// Phase 3 (sequential, depends on phases 1+2): Compressor, Retriever,
    /// Injector. A failure at any phase returns the error immediately; every
    /// component already constructed is simply dropped — there is no partial
    /// `Orchestrator` to expose (spec.md §4.8).
    pub async fn init(config: Config) -> Result<Self> {
        info!("orchestrator: phase 1 — model gateway, structured store, capture queue");
        let models_config = config.models.clone();
        let database_config = config.database.clone();
        let queue_config = config.queue.clone();
        let (cost_tx, cost_rx) = mpsc::unbounded_channel::<CostRecord>();

        let (gateway, store, queue) = tokio::try_join!(
            retry_init("model_gateway", || {
                let models_config = models_config.clone();
                let cost_tx = cost_tx.clone();
                async move { Ok::<_, MemoryError>(Arc::new(ModelGateway::new(models_config, Some(cost_tx)))) }
            }),
            retry_init("structured_store", || {
                let database_config = database_config.clone();
                async move {
                    let pool = SqlitePoolOptions::new()
                        .max_connections(database_config.pool_size + database_config.pool_max_overflow)
                        .acquire_timeout(Duration::from_secs(database_config.pool_timeout_seconds))
                        .connect(&database_config.url)
                        .await
                        .map_err(MemoryError::from)?;
                    let store = StructuredStore::new(pool);
                    store.run_migrations().await?;
                    Ok::<_, MemoryError>(Arc::new(store))
                }
            }),
            retry_init("capture_queue", || {
                let queue_config = queue_config.clone();
                async move {
                    CaptureQueue::new(queue_config.spool_dir, queue_config.max_retries, queue_config.retry_base_seconds)
                        .await
                        .map(Arc::new)
                }
            }),
        )?;
        drop(cost_tx);
        spawn_cost_sink_drain(store.clone(), cost_rx);

        info!("orchestrator: phase 2 — vector store");
        let vector_config = config.vector.clone();
        let vector: Arc<dyn VectorBackend> = retry_init("vector_store", || {
            let vector_config = vector_config.clone();
            async move {
                crate::vector::VectorStore::connect(&vector_config)
                    .await
                    .map(|v| Arc::new(v) as Arc<dyn VectorBackend>)
            }
        })
        .await?;

        info!("orchestrator: phase 3 — compressor, retriever, injector");
        let compressor = Arc::new(Compressor::new(gateway.clone()));
        let retriever = Arc::new(Retriever::new(
            gateway.clone(),
            store.clone(),
            vector.clone(),
            config.retrieval.clone(),
        ));
        let injector = Arc::new(Injector::new(gateway.clone(), config.injector.clone()));

        info!("orchestrator: initialisation complete");
        Ok(Orchestrator {
            gateway,
            store,
            vector,
            queue,
            compressor,
            retriever,
            injector,
            conversation_locks: KeyedLocks::new(),
            permissions: Arc::new(AllowAllPermissions),
        })
    }

    /// Swaps in a non-default permission policy (e.g. one backed by a real
    /// auth service). Must be called before any cross-project search.
    pub fn set_permission_checker(&mut self, permissions: Arc<dyn PermissionChecker>) {
        self.permissions = permissions;
    }

    pub fn queue(&self) -> &Arc<CaptureQueue> {
        &self.queue
    }

    pub fn gateway(&self) -> &Arc<ModelGateway> {
        &self.gateway
    }

    /// Persists a conversation, and — if it is now ingestable (I5) — triggers
    /// compression and the compensating memory-unit write. Serialized per
    /// conversation via the session/project lock so the Compressor never sees
    /// two concurrent ingests for the same conversation interleave their state
    /// (spec.md §5). The conversation row is durably committed regardless of
    /// whether compression succeeds (spec.md §4.5 step 5); compression's
    /// outcome travels back to the caller in `CompressionOutcome` instead of
    /// failing the whole call.
    pub async fn ingest_conversation(
        &self,
        project_id: &str,
        session_id: Option<String>,
        messages: Vec<(Role, String, DateTime<Utc>)>,
    ) -> Result<(Conversation, CompressionOutcome)> {
        let lock_key = session_id.clone().unwrap_or_else(|| project_id.to_string());
        self.with_deadline(async {
            let _guard = self.conversation_locks.lock(&lock_key).await;
            let conversation = self.store.store_conversation(project_id, session_id, messages).await?;

            let outcome = if self.store.is_ingestable(&conversation.conversation_id, false).await? {
                match self.compress_and_store(project_id, &conversation).await {
                    Ok(()) => CompressionOutcome::Compressed,
                    Err(e) => {
                        warn!(conversation_id = %conversation.conversation_id, "compression failed, leaving uncompressed: {e}");
                        CompressionOutcome::Failed { code: e.code(), detail: e.public_message() }
                    }
                }
            } else {
                CompressionOutcome::NotYetIngestable
            };

            Ok((conversation, outcome))
        })
        .await
    }

    async fn compress_and_store(&self, project_id: &str, conversation: &Conversation) -> Result<()> {
        let messages = self.store.get_messages(&conversation.conversation_id).await?;
        let proposal = self.compressor.compress(project_id, &messages).await?;

        let content = crate::compressor::build_transcript(&messages);
        let vector = self
            .compressor
            .embed_memory_unit(project_id, &proposal.title, &proposal.summary, &content)
            .await?;

        let now = Utc::now();
        let unit = MemoryUnit {
            unit_id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            conversation_id: Some(conversation.conversation_id.clone()),
            unit_type: proposal.unit_type,
            title: proposal.title,
            summary: proposal.summary,
            content,
            keywords: proposal.keywords,
            relevance_score: proposal.relevance_score,
            token_count: conversation.token_count,
            created_at: now,
            updated_at: now,
            expires_at: None,
            is_active: true,
        };

        self.add_memory(unit, vector).await?;
        Ok(())
    }

    /// Compensating-transaction write (spec.md §4.8 step 3): insert the row,
    /// commit, then upsert the vector point. A failed upsert triggers a
    /// compensating delete of the row just committed; since some upsert errors
    /// (e.g. a timeout after the write already reached the server) leave the
    /// vector point in place despite the error, `exists` is checked first so
    /// the compensating delete also removes an orphaned point, not just the
    /// row. A failed compensation is never swallowed — it surfaces as
    /// `CONSISTENCY_VIOLATION` so an orphaned row is never silently left
    /// behind.
    pub async fn add_memory(&self, unit: MemoryUnit, vector: Vec<f32>) -> Result<MemoryUnit> {
        self.store.insert_memory_unit(&unit).await?;
        if let Err(e) = self.vector.upsert(&unit, vector).await {
            warn!(unit_id = %unit.unit_id, "vector upsert failed after commit, compensating: {e}");

            if matches!(self.vector.exists(&unit.unit_id).await, Ok(true)) {
                if let Err(del_err) = self.vector.delete(&unit.unit_id).await {
                    warn!(unit_id = %unit.unit_id, "failed to remove orphaned vector point: {del_err}");
                }
            }

            if let Err(comp_err) = self.store.delete_memory_unit(&unit.unit_id).await {
                error!(unit_id = %unit.unit_id, "compensation failed, row is now orphaned: {comp_err}");
                return Err(MemoryError::ConsistencyViolation {
                    unit_id: unit.unit_id,
                    detail: format!("vector upsert failed ({e}) and compensating delete also failed ({comp_err})"),
                });
            }
            return Err(e);
        }
        Ok(unit)
    }

    /// Low-level admin operation: persists a conversation without triggering
    /// compression. Distinct from `ingest_conversation`, which always attempts
    /// compression once the conversation becomes ingestable.
    pub async fn store_conversation(
        &self,
        project_id: &str,
        session_id: Option<String>,
        messages: Vec<(Role, String, DateTime<Utc>)>,
    ) -> Result<Conversation> {
        self.store.store_conversation(project_id, session_id, messages).await
    }

    pub async fn search(&self, project_id: &str, request: &RetrievalRequest) -> Result<Vec<RetrievalResult>> {
        self.with_deadline(self.retriever.search(project_id, request)).await
    }

    /// Cross-project search (spec.md §4.6, §4.8 C8): `requested` is narrowed
    /// to the caller's accessible set before it ever reaches the Retriever —
    /// a project the caller cannot read is silently dropped, never an error
    /// on its own (spec.md §7 `PERMISSION_DENIED`).
    pub async fn search_cross_project(
        &self,
        requested: &[String],
        request: &RetrievalRequest,
        strategy: MergeStrategy,
    ) -> Result<Vec<RetrievalResult>> {
        let accessible = self.permissions.filter_accessible(requested);
        if accessible.is_empty() {
            return Ok(Vec::new());
        }
        self.with_deadline(self.retriever.search_cross_project(&accessible, request, strategy))
            .await
    }

    pub async fn inject(
        &self,
        project_id: &str,
        original_prompt: &str,
        query: &RetrievalRequest,
        mode: InjectionMode,
    ) -> Result<(String, Vec<String>)> {
        self.with_deadline(async {
            let results = self.retriever.search(project_id, query).await?;
            Ok(self.injector.inject(project_id, original_prompt, &results, mode).await)
        })
        .await
    }

    /// Component states for `memory_health`/`GET /health` (spec.md §6). A
    /// missing provider routing table entry degrades the gateway rather than
    /// taking it down, since other tasks may still be fully configured.
    pub async fn health(&self) -> HashMap<String, ComponentHealth> {
        let mut out = HashMap::new();

        let store_ok = sqlx::query("SELECT 1").fetch_one(self.store.pool()).await.is_ok();
        out.insert(
            "structured_store".to_string(),
            ComponentHealth {
                state: if store_ok { HealthState::Ok } else { HealthState::Down },
                detail: None,
            },
        );

        let vector_ok = self.vector.health_check().await;
        out.insert(
            "vector_store".to_string(),
            ComponentHealth {
                state: if vector_ok { HealthState::Ok } else { HealthState::Down },
                detail: None,
            },
        );

        let queue_depth = self.queue.depth().await.unwrap_or(0);
        let dead_letters = self.queue.dead_letter_count().await;
        out.insert(
            "capture_queue".to_string(),
            ComponentHealth {
                state: if dead_letters > 0 { HealthState::Degraded } else { HealthState::Ok },
                detail: Some(format!("depth={queue_depth} dead_letter={dead_letters}")),
            },
        );

        let gateway_configured = self.gateway.is_configured();
        out.insert(
            "model_gateway".to_string(),
            ComponentHealth {
                state: if gateway_configured { HealthState::Ok } else { HealthState::Degraded },
                detail: if gateway_configured {
                    None
                } else {
                    Some("no provider configured for one or more routed tasks".to_string())
                },
            },
        );

        out
    }

    pub async fn counts(&self) -> Result<(i64, i64, i64)> {
        self.store.counts().await
    }

    pub async fn list_project_ids(&self) -> Result<Vec<String>> {
        self.store.list_project_ids().await
    }

    /// Wraps a public operation in the default 30s cancellation deadline
    /// (spec.md §5). On expiry the in-flight future is dropped: any provider
    /// call in progress is cancelled, and any compensation already running to
    /// completion inside `add_memory` races the deadline rather than being
    /// guaranteed to finish — full cancellation-safe rollback is a larger
    /// undertaking than this service's transaction boundaries need today.
    async fn with_deadline<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(DEFAULT_DEADLINE, fut).await {
            Ok(result) => result,
            Err(_) => Err(MemoryError::DeadlineExceeded(DEFAULT_DEADLINE)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn keyed_locks_serialize_same_key_but_not_different_keys() {
        let locks = KeyedLocks::new();
        let _a = locks.lock("conv-1").await;
        let same_key_attempt = tokio::time::timeout(Duration::from_millis(50), locks.lock("conv-1")).await;
        assert!(same_key_attempt.is_err(), "second lock on the same key should block");

        let other_key_attempt = tokio::time::timeout(Duration::from_millis(50), locks.lock("conv-2")).await;
        assert!(other_key_attempt.is_ok(), "a different key must not be blocked");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_init_retries_until_success() {
        let attempts = AtomicU32::new(0);
        let result = retry_init("test_component", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(MemoryError::ProviderUnavailable("not yet".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_init_gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = retry_init("test_component", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err(MemoryError::ProviderUnavailable("down".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), INIT_ATTEMPTS);
    }

    #[test]
    fn allow_all_permissions_passes_every_project_through() {
        let requested = vec!["P1".to_string(), "P2".to_string()];
        assert_eq!(AllowAllPermissions.filter_accessible(&requested), requested);
    }

    /// spec.md §4.6's P1/P2 isolation scenario: a caller permitted only P1
    /// must have P2 silently dropped from the accessible set.
    struct OnlyAllow(Vec<String>);
    impl PermissionChecker for OnlyAllow {
        fn filter_accessible(&self, requested: &[String]) -> Vec<String> {
            requested.iter().filter(|p| self.0.contains(p)).cloned().collect()
        }
    }

    #[test]
    fn permission_checker_drops_projects_outside_the_allowed_set() {
        let checker = OnlyAllow(vec!["P1".to_string()]);
        let filtered = checker.filter_accessible(&["P1".to_string(), "P2".to_string()]);
        assert_eq!(filtered, vec!["P1".to_string()]);
    }
}
