// Compressor (C5, spec.md §4.5): turns a closed conversation into a MemoryUnit
// proposal via C1's completion model. Grounded on the reference rolling-summary
// strategy's shape (build transcript -> prompt -> single chat() call) but the
// prompt elicits structured fields instead of prose, and chunking/folding
// replaces the reference's fixed 10/100-message windows with a token-budget
// split driven by the completion model's context window.

use crate::error::{MemoryError, Result};
use crate::gateway::provider::{ChatMessage, CompletionParams};
use crate::gateway::ModelGateway;
use crate::store::{Message, UnitType};
use crate::utils::estimate_tokens;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

/// Rough completion-model context budget for the transcript itself, leaving
/// headroom for the prompt scaffolding and the model's own output.
const CHUNK_TARGET_TOKENS: i64 = 6000;

#[derive(Debug, Clone)]
pub struct CompressionProposal {
    pub title: String,
    pub summary: String,
    pub keywords: BTreeSet<String>,
    pub unit_type: UnitType,
    pub relevance_score: f32,
}

#[derive(Debug, Deserialize)]
struct RawProposal {
    title: String,
    summary: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    unit_type: Option<String>,
    #[serde(default)]
    relevance_score: Option<f32>,
}

pub struct Compressor {
    gateway: Arc<ModelGateway>,
}

impl Compressor {
    pub fn new(gateway: Arc<ModelGateway>) -> Self {
        Compressor { gateway }
    }

    /// Compresses a conversation's messages into a single proposal. Never
    /// writes a partial unit: on any unrecoverable failure this returns an
    /// error and the caller leaves the conversation uncompressed for retry
    /// (spec.md §4.5 step 5).
    pub async fn compress(&self, project_id: &str, messages: &[Message]) -> Result<CompressionProposal> {
        let transcript = build_transcript(messages);
        if estimate_tokens(&transcript) <= CHUNK_TARGET_TOKENS {
            return self.compress_transcript(project_id, &transcript).await;
        }
        self.compress_chunked(project_id, messages).await
    }

    /// Token budget step (spec.md §4.5 step 6): split into chunks, compress
    /// each independently, then fold the per-chunk summaries into one final
    /// proposal via a second completion call.
    async fn compress_chunked(&self, project_id: &str, messages: &[Message]) -> Result<CompressionProposal> {
        let chunks = chunk_messages(messages, CHUNK_TARGET_TOKENS);
        let mut folded_summaries = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let transcript = build_transcript(chunk);
            let proposal = self.compress_transcript(project_id, &transcript).await?;
            folded_summaries.push(format!("{}: {}", proposal.title, proposal.summary));
        }
        let folded_transcript = folded_summaries.join("\n\n");
        self.compress_transcript(project_id, &folded_transcript).await
    }

    async fn compress_transcript(&self, project_id: &str, transcript: &str) -> Result<CompressionProposal> {
        let messages = vec![
            ChatMessage::system(COMPRESSION_SYSTEM_PROMPT),
            ChatMessage::user(transcript),
        ];
        let raw = self
            .gateway
            .complete(&messages, &CompletionParams::default(), project_id)
            .await?;
        parse_proposal(&raw)
    }

    /// embed-memory-unit helper (spec.md §4.5): embeds `title + "\n" + summary +
    /// "\n" + content`, truncated to a conservative character budget standing
    /// in for the embedding model's token window.
    pub async fn embed_memory_unit(
        &self,
        project_id: &str,
        title: &str,
        summary: &str,
        content: &str,
    ) -> Result<Vec<f32>> {
        const MAX_CHARS: usize = 32_000;
        let mut text = format!("{title}\n{summary}\n{content}");
        if text.len() > MAX_CHARS {
            text.truncate(MAX_CHARS);
        }
        self.gateway.embed(&text, project_id).await
    }
}

pub(crate) fn build_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Greedily groups messages so each chunk's estimated token count stays under
/// `budget`; a single message larger than the budget still gets its own chunk
/// rather than being dropped.
fn chunk_messages(messages: &[Message], budget: i64) -> Vec<Vec<Message>> {
    let mut chunks = Vec::new();
    let mut current: Vec<Message> = Vec::new();
    let mut current_tokens = 0i64;

    for message in messages {
        let tokens = estimate_tokens(&message.content);
        if !current.is_empty() && current_tokens + tokens > budget {
            chunks.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += tokens;
        current.push(message.clone());
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

const COMPRESSION_SYSTEM_PROMPT: &str = r#"You compress a conversation transcript into a single memory unit.
Respond with a single JSON object, no surrounding prose, with exactly these fields:
{
  "title": "short plain-text title, no markdown",
  "summary": "2-4 sentence summary of what happened",
  "keywords": ["lowercase", "keyword", "list"],
  "unit_type": one of "conversation", "error_log", "decision", "code_snippet", "documentation", "archive",
  "relevance_score": a number between 0 and 1 estimating how likely this content is to be useful later
}"#;

/// Parses the model's output into a proposal. Handles a bare JSON object, one
/// wrapped in a fenced code block, or one embedded in surrounding prose — the
/// persisted `title` must end up plain text regardless of how the model
/// wrapped its answer (I4).
fn parse_proposal(raw: &str) -> Result<CompressionProposal> {
    let json_text = extract_json(raw).ok_or_else(|| {
        MemoryError::Validation("compressor could not locate a JSON object in model output".to_string())
    })?;
    let parsed: RawProposal = serde_json::from_str(&json_text)
        .map_err(|e| MemoryError::Validation(format!("compressor output did not parse as JSON: {e}")))?;

    let unit_type = parsed
        .unit_type
        .as_deref()
        .and_then(|s| s.parse().ok())
        .unwrap_or(UnitType::Conversation);

    // Validate/clamp relevance_score into [0, 1] (spec.md §4.5 step 4).
    let relevance_score = parsed.relevance_score.unwrap_or(0.5).clamp(0.0, 1.0);

    Ok(CompressionProposal {
        title: parsed.title.trim().to_string(),
        summary: parsed.summary.trim().to_string(),
        keywords: parsed
            .keywords
            .into_iter()
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect(),
        unit_type,
        relevance_score,
    })
}

fn extract_json(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed.to_string());
    }
    // fenced code block: ```json ... ``` or ``` ... ```
    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        let after_fence = after_fence.strip_prefix("json").unwrap_or(after_fence);
        if let Some(end) = after_fence.find("```") {
            return Some(after_fence[..end].trim().to_string());
        }
    }
    // fallback: first '{' to last matching '}'.
    let first = trimmed.find('{')?;
    let last = trimmed.rfind('}')?;
    if last > first {
        return Some(trimmed[first..=last].to_string());
    }
    warn!("compressor found no JSON delimiters in model output");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(role: &str, content: &str) -> Message {
        Message {
            message_id: "m".to_string(),
            conversation_id: "c".to_string(),
            role: role.parse().unwrap(),
            content: content.to_string(),
            timestamp: Utc::now(),
            token_count: estimate_tokens(content),
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn parses_bare_json() {
        let raw = r#"{"title":"B-tree discussion","summary":"explained b-trees","keywords":["btree","index"],"unit_type":"documentation","relevance_score":0.9}"#;
        let proposal = parse_proposal(raw).unwrap();
        assert_eq!(proposal.title, "B-tree discussion");
        assert_eq!(proposal.unit_type, UnitType::Documentation);
        assert!((proposal.relevance_score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn extracts_json_from_fenced_block() {
        let raw = "Here you go:\n```json\n{\"title\":\"x\",\"summary\":\"y\",\"keywords\":[],\"relevance_score\":0.4}\n```\nDone.";
        let proposal = parse_proposal(raw).unwrap();
        assert_eq!(proposal.title, "x");
        assert!((proposal.relevance_score - 0.4).abs() < 1e-6);
    }

    #[test]
    fn clamps_out_of_range_relevance_score() {
        let raw = r#"{"title":"t","summary":"s","keywords":[],"relevance_score":4.2}"#;
        let proposal = parse_proposal(raw).unwrap();
        assert_eq!(proposal.relevance_score, 1.0);
    }

    #[test]
    fn chunking_splits_oversized_transcripts() {
        let messages: Vec<Message> = (0..50).map(|i| msg("HUMAN", &"word ".repeat(200 + i))).collect();
        let chunks = chunk_messages(&messages, 500);
        assert!(chunks.len() > 1);
        let total: usize = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, messages.len());
    }
}
