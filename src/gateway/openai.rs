// OpenAI-compatible backend (embeddings, rerank-via-classification-score, chat
// completion). Adapted from the reference's `OpenAIEmbeddings` request/response
// shape; the same `reqwest::Client` + bearer-auth pattern is reused for the
// completion and rerank endpoints since all three are plain JSON-over-HTTPS.

use super::provider::{classify_http_error, ChatMessage, CompletionParams, ModelProvider, Usage};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    name: String,
}

impl OpenAiCompatProvider {
    pub fn new(name: impl Into<String>, api_key: String, base_url: String) -> Self {
        OpenAiCompatProvider {
            client: reqwest::Client::new(),
            api_key,
            base_url,
            name: name.into(),
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_http_error(e.status().map(|s| s.as_u16()), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(classify_http_error(Some(status.as_u16()), detail));
        }
        response
            .json()
            .await
            .map_err(|e| classify_http_error(None, e.to_string()))
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a str,
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    usage: OpenAiUsage,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[derive(Deserialize, Default)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: i64,
    #[serde(default)]
    completion_tokens: i64,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: OpenAiUsage,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn embed(&self, model: &str, text: &str) -> Result<(Vec<f32>, Usage)> {
        let body = self
            .post(
                "/embeddings",
                json!(EmbeddingRequest { input: text, model }),
            )
            .await?;
        let parsed: EmbeddingResponse = serde_json::from_value(body)
            .map_err(|e| classify_http_error(None, e.to_string()))?;
        let vector = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .unwrap_or_default();
        Ok((
            vector,
            Usage {
                input_tokens: parsed.usage.prompt_tokens,
                output_tokens: parsed.usage.completion_tokens,
            },
        ))
    }

    /// No dedicated rerank endpoint on the OpenAI chat API; a scored classifier
    /// prompt asks the completion model to emit one relevance score per document,
    /// which the gateway then clamps into [0,1] the same way a native cross-
    /// encoder response would be.
    async fn rerank(&self, model: &str, query: &str, docs: &[String]) -> Result<(Vec<f32>, Usage)> {
        let listing = docs
            .iter()
            .enumerate()
            .map(|(i, d)| format!("{}: {}", i, d))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Query: {query}\n\nScore each document's relevance to the query from 0.0 to 1.0. \
             Respond with one line per document as \"<index>: <score>\", nothing else.\n\n{listing}"
        );
        let (text, usage) = self
            .complete(model, &[ChatMessage::user(prompt)], &CompletionParams::default())
            .await?;

        let mut scores = vec![0.0_f32; docs.len()];
        for line in text.lines() {
            if let Some((idx, score)) = line.split_once(':') {
                if let (Ok(idx), Ok(score)) = (idx.trim().parse::<usize>(), score.trim().parse::<f32>()) {
                    if idx < scores.len() {
                        scores[idx] = score.clamp(0.0, 1.0);
                    }
                }
            }
        }
        Ok((scores, usage))
    }

    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<(String, Usage)> {
        let body = json!({
            "model": model,
            "messages": messages.iter().map(|m| json!({"role": m.role, "content": m.content})).collect::<Vec<_>>(),
            "max_tokens": params.max_tokens,
            "temperature": params.temperature,
        });
        let body = self.post("/chat/completions", body).await?;
        let parsed: ChatResponse = serde_json::from_value(body)
            .map_err(|e| classify_http_error(None, e.to_string()))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        Ok((
            content,
            Usage {
                input_tokens: parsed.usage.prompt_tokens,
                output_tokens: parsed.usage.completion_tokens,
            },
        ))
    }
}
