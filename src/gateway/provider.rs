// Closed set of provider variants (spec.md §9 "Dynamic provider registry" redesign
// flag): the source dispatched to model providers by string lookup in a map; here
// configuration selects one of a small, compile-time-known set of backends that
// all implement the same operation trait.

use crate::error::{MemoryError, Result};
use async_trait::async_trait;

#[derive(Debug, Clone)]
pub struct CompletionParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for CompletionParams {
    fn default() -> Self {
        CompletionParams {
            max_tokens: 1024,
            temperature: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage { role: "user".to_string(), content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage { role: "system".to_string(), content: content.into() }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub input_tokens: i64,
    pub output_tokens: i64,
}

/// A single backend's view of the three Model Gateway operations. Errors that
/// represent an HTTP 4xx (auth, bad model, bad request) must be returned as
/// `MemoryError::Validation`; the gateway's fallback loop treats only that
/// variant as "do not retry, fail over immediately" per spec.md §4.1 step 4.
/// Anything else is treated as retryable (5xx / connection / timeout).
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn embed(&self, model: &str, text: &str) -> Result<(Vec<f32>, Usage)>;

    async fn rerank(&self, model: &str, query: &str, docs: &[String]) -> Result<(Vec<f32>, Usage)>;

    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<(String, Usage)>;
}

/// Classifies a raw transport/HTTP outcome the way every `ModelProvider` impl
/// should: 4xx is non-retryable, everything else (5xx, timeout, connection) is.
pub fn classify_http_error(status: Option<u16>, detail: String) -> MemoryError {
    match status {
        Some(code) if (400..500).contains(&code) => MemoryError::Validation(detail),
        _ => MemoryError::internal(anyhow::anyhow!(detail)),
    }
}
