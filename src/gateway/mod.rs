// Model Gateway (C1, spec.md §4.1): uniform embed/rerank/complete across N
// providers, with provider-priority fallback and per-request retries.

pub mod cache;
pub mod openai;
pub mod provider;

use crate::config::{ModelsConfig, TaskKind};
use crate::error::{MemoryError, Result};
use crate::store::CostRecord;
use crate::utils::RateLimiter;
use cache::GatewayCache;
use chrono::Utc;
use provider::{ChatMessage, CompletionParams, ModelProvider, Usage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

pub use provider::ModelProvider as Provider;

/// `CostRecord`s are emitted on a channel rather than written synchronously
/// inside the gateway's hot path (spec.md §4.1 step 6 "every successful call
/// emits a CostRecord") — the Orchestrator drains the channel into the
/// Structured Store so the gateway itself never needs a store handle.
pub type CostSink = mpsc::UnboundedSender<CostRecord>;

pub struct ModelGateway {
    providers: HashMap<String, Arc<dyn ModelProvider>>,
    config: ModelsConfig,
    embed_cache: GatewayCache<Vec<f32>>,
    rerank_cache: GatewayCache<Vec<f32>>,
    complete_cache: GatewayCache<String>,
    concurrency: HashMap<String, Arc<Semaphore>>,
    rate_limiters: HashMap<String, Arc<RateLimiter>>,
    cost_sink: Option<CostSink>,
}

impl ModelGateway {
    pub fn new(config: ModelsConfig, cost_sink: Option<CostSink>) -> Self {
        let mut providers: HashMap<String, Arc<dyn ModelProvider>> = HashMap::new();
        let mut concurrency = HashMap::new();
        let mut rate_limiters = HashMap::new();
        for (name, provider_config) in &config.providers {
            providers.insert(
                name.clone(),
                Arc::new(openai::OpenAiCompatProvider::new(
                    name.clone(),
                    provider_config.api_key.clone(),
                    provider_config.base_url.clone(),
                )),
            );
            concurrency.insert(
                name.clone(),
                Arc::new(Semaphore::new(config.per_provider_concurrency)),
            );
            // requests/minute cap derived from the concurrency cap: a provider
            // that allows N concurrent calls at a 30s timeout tolerates roughly
            // 2N calls/minute before those calls start queueing anyway.
            let rpm = (config.per_provider_concurrency as u32 * 2).max(1);
            if let Ok(limiter) = RateLimiter::new(rpm) {
                rate_limiters.insert(name.clone(), Arc::new(limiter));
            }
        }

        ModelGateway {
            embed_cache: GatewayCache::new(config.cache_capacity, Duration::from_secs(config.cache_ttl_seconds)),
            rerank_cache: GatewayCache::new(config.cache_capacity, Duration::from_secs(config.cache_ttl_seconds)),
            complete_cache: GatewayCache::new(config.cache_capacity, Duration::from_secs(config.cache_ttl_seconds)),
            providers,
            concurrency,
            rate_limiters,
            config,
            cost_sink,
        }
    }

    fn routing(&self, task: TaskKind) -> Result<&crate::config::TaskRouting> {
        self.config
            .tasks
            .get(&task)
            .ok_or_else(|| MemoryError::ProviderUnavailable(format!("{:?}", task)))
    }

    /// Cheap health signal for `memory_health`/`GET /health`: every routed task
    /// has a primary provider that is actually configured. Does not make a
    /// network call — a provider can still be unreachable and pass this check.
    pub fn is_configured(&self) -> bool {
        !self.config.tasks.is_empty()
            && self
                .config
                .tasks
                .values()
                .all(|routing| self.providers.contains_key(&routing.primary.provider))
    }

    /// Execution contract per call (spec.md §4.1 steps 1-5): select provider by
    /// task type, run with a timeout, retry with backoff on 5xx/timeout/
    /// connection error, fail over immediately on 4xx, exhaust to
    /// `PROVIDER_UNAVAILABLE`.
    async fn call_with_fallback<T, F, Fut>(
        &self,
        task: TaskKind,
        operation: &str,
        mut call: F,
    ) -> Result<(T, String, String, Usage)>
    where
        F: FnMut(Arc<dyn ModelProvider>, String) -> Fut,
        Fut: std::future::Future<Output = Result<(T, Usage)>>,
    {
        let routing = self.routing(task)?;
        let mut candidates = vec![routing.primary.clone()];
        candidates.extend(routing.fallback.clone());

        let mut last_err = MemoryError::ProviderUnavailable(operation.to_string());
        for candidate in candidates {
            let Some(provider) = self.providers.get(&candidate.provider).cloned() else {
                warn!("no provider configured for {}", candidate.provider);
                continue;
            };
            let permit_guard = self.concurrency.get(&candidate.provider).cloned();

            let rate_limiter = self.rate_limiters.get(&candidate.provider).cloned();
            let mut delay = Duration::from_secs(self.config.retry_base_seconds);
            for attempt in 0..=self.config.max_retries {
                if let Some(limiter) = &rate_limiter {
                    limiter.acquire().await;
                }
                let _permit = match &permit_guard {
                    Some(sem) => Some(sem.clone().acquire_owned().await),
                    None => None,
                };
                let fut = call(provider.clone(), candidate.model.clone());
                let result = tokio::time::timeout(
                    Duration::from_secs(self.config.request_timeout_seconds),
                    fut,
                )
                .await;

                match result {
                    Ok(Ok((value, usage))) => {
                        return Ok((value, candidate.provider.clone(), candidate.model.clone(), usage));
                    }
                    Ok(Err(MemoryError::Validation(detail))) => {
                        // 4xx: no retry, fail over to next provider immediately.
                        warn!(provider = %candidate.provider, "client error, failing over: {detail}");
                        last_err = MemoryError::Validation(detail);
                        break;
                    }
                    Ok(Err(other)) if attempt < self.config.max_retries => {
                        warn!(provider = %candidate.provider, attempt, "retryable error: {other}");
                        last_err = other;
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_secs(self.config.retry_cap_seconds));
                    }
                    Ok(Err(other)) => {
                        last_err = other;
                    }
                    Err(_) if attempt < self.config.max_retries => {
                        warn!(provider = %candidate.provider, attempt, "timed out, retrying");
                        last_err = MemoryError::DeadlineExceeded(Duration::from_secs(
                            self.config.request_timeout_seconds,
                        ));
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(Duration::from_secs(self.config.retry_cap_seconds));
                    }
                    Err(_) => {
                        last_err = MemoryError::DeadlineExceeded(Duration::from_secs(
                            self.config.request_timeout_seconds,
                        ));
                    }
                }
            }
        }
        Err(last_err)
    }

    fn emit_cost(&self, provider: String, model: String, operation: &str, usage: Usage, project_id: &str) {
        if let Some(sink) = &self.cost_sink {
            let record = CostRecord {
                provider,
                model,
                operation: operation.to_string(),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                cost: 0.0,
                timestamp: Utc::now(),
                project_id: project_id.to_string(),
            };
            if sink.send(record).is_err() {
                warn!("cost sink closed, dropping cost record");
            }
        }
    }

    /// L2-normalised before return (spec.md §4.1: norm ≈ 1.0 within 1e-6).
    pub async fn embed(&self, text: &str, project_id: &str) -> Result<Vec<f32>> {
        let routing = self.routing(TaskKind::Embed)?;
        let cache_key = GatewayCache::<Vec<f32>>::key("embed", &routing.primary.model, text);
        if let Some(cached) = self.embed_cache.get(&cache_key) {
            return Ok(cached);
        }

        let (vector, provider, model, usage) = self
            .call_with_fallback(TaskKind::Embed, "embed", |p, model| {
                let text = text.to_string();
                async move { p.embed(&model, &text).await }
            })
            .await?;

        let normalized = l2_normalize(vector);
        self.embed_cache.put(cache_key, normalized.clone());
        self.emit_cost(provider, model, "embed", usage, project_id);
        Ok(normalized)
    }

    pub async fn rerank(&self, query: &str, docs: &[String], project_id: &str) -> Result<Vec<f32>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }
        let routing = self.routing(TaskKind::Rerank)?;
        let cache_input = format!("{query}\u{1}{}", docs.join("\u{1}"));
        let cache_key = GatewayCache::<Vec<f32>>::key("rerank", &routing.primary.model, &cache_input);
        if let Some(cached) = self.rerank_cache.get(&cache_key) {
            return Ok(cached);
        }

        let (scores, provider, model, usage) = self
            .call_with_fallback(TaskKind::Rerank, "rerank", |p, model| {
                let query = query.to_string();
                let docs = docs.to_vec();
                async move { p.rerank(&model, &query, &docs).await }
            })
            .await?;

        self.rerank_cache.put(cache_key, scores.clone());
        self.emit_cost(provider, model, "rerank", usage, project_id);
        Ok(scores)
    }

    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        params: &CompletionParams,
        project_id: &str,
    ) -> Result<String> {
        let routing = self.routing(TaskKind::Complete)?;
        let cache_input = messages
            .iter()
            .map(|m| format!("{}:{}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\u{1}");
        let cache_key = GatewayCache::<String>::key("complete", &routing.primary.model, &cache_input);
        if let Some(cached) = self.complete_cache.get(&cache_key) {
            return Ok(cached);
        }

        let (text, provider, model, usage) = self
            .call_with_fallback(TaskKind::Complete, "complete", |p, model| {
                let messages = messages.to_vec();
                let params = params.clone();
                async move { p.complete(&model, &messages, &params).await }
            })
            .await?;

        self.complete_cache.put(cache_key, text.clone());
        self.emit_cost(provider, model, "complete", usage, project_id);
        info!(provider = %"complete", "completion served");
        Ok(text)
    }
}

fn l2_normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 1e-12 {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_to_unit_length() {
        let v = l2_normalize(vec![3.0, 4.0]);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }
}
