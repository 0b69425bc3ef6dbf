//! Query rewriting and field extraction for the Extraction Executor
//! (spec §4.9).
//!
//! `QueryRewriter` composes a single natural-language retrieval query from
//! an extraction prompt; `Extractor` asks the underlying LLM to produce a
//! single extracted value (or the literal `Not Found`) from retrieved
//! context.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use crate::sentinels::NOT_FOUND;

#[async_trait]
pub trait QueryRewriter: Send + Sync {
    /// Compose a single natural-language question covering all facets
    /// mentioned in `extraction_prompt`, used as the retrieval query.
    async fn rewrite(&self, extraction_prompt: &str) -> Result<String>;
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Given the extraction prompt and the retrieved chunk texts, return
    /// the extracted value or `Not Found`. Callers normalize/validate the
    /// result (spec §4.9); this trait only owns the LLM call.
    async fn extract(&self, extraction_prompt: &str, context_chunks: &[String]) -> Result<String>;
}

// ============ Deterministic (test) implementations ============

/// Query rewriter used when no LLM is configured: a deterministic
/// template composition, per SPEC_FULL §4.9.
pub struct TemplateQueryRewriter;

#[async_trait]
impl QueryRewriter for TemplateQueryRewriter {
    async fn rewrite(&self, extraction_prompt: &str) -> Result<String> {
        Ok(format!("Answer the following about this document: {}", extraction_prompt))
    }
}

/// Test-only extractor: looks for a case-insensitive substring match of
/// the extraction prompt's first significant word in the retrieved
/// context, otherwise returns `Not Found`. Deterministic and network-free.
pub struct DeterministicExtractor;

#[async_trait]
impl Extractor for DeterministicExtractor {
    async fn extract(&self, extraction_prompt: &str, context_chunks: &[String]) -> Result<String> {
        let keyword = extraction_prompt
            .split_whitespace()
            .find(|w| w.len() > 3)
            .unwrap_or("");
        if keyword.is_empty() {
            return Ok(NOT_FOUND.to_string());
        }
        let keyword_lower = keyword.to_lowercase();
        for chunk in context_chunks {
            if let Some(pos) = chunk.to_lowercase().find(&keyword_lower) {
                let start = pos;
                let end = (pos + keyword.len() + 40).min(chunk.len());
                return Ok(chunk[start..end].trim().to_string());
            }
        }
        Ok(NOT_FOUND.to_string())
    }
}

// ============ OpenAI-backed implementations ============

pub struct OpenAiExtractor {
    client: reqwest::Client,
    model: String,
}

impl OpenAiExtractor {
    pub fn new(model: String, timeout_secs: u64) -> Result<Self> {
        if std::env::var("OPENAI_API_KEY").is_err() {
            anyhow::bail!("OPENAI_API_KEY environment variable not set");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { client, model })
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });
        let resp = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if status.as_u16() == 503 {
            anyhow::bail!("service unavailable (503)");
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI chat error {}: {}", status, text);
        }
        let json: serde_json::Value = resp.json().await?;
        json["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("malformed OpenAI chat response"))
    }
}

#[async_trait]
impl QueryRewriter for OpenAiExtractor {
    async fn rewrite(&self, extraction_prompt: &str) -> Result<String> {
        self.chat(
            "Rewrite the following extraction instruction as a single natural-language retrieval question covering every facet it mentions. Respond with only the question.",
            extraction_prompt,
        )
        .await
    }
}

#[async_trait]
impl Extractor for OpenAiExtractor {
    async fn extract(&self, extraction_prompt: &str, context_chunks: &[String]) -> Result<String> {
        let context = context_chunks.join("\n---\n");
        let user = format!(
            "Context:\n{}\n\nInstruction: {}\n\nOutput only the extracted value, or the literal string \"Not Found\" if it cannot be determined from the context.",
            context, extraction_prompt
        );
        self.chat("You extract a single field value from document context.", &user).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deterministic_extractor_finds_keyword_context() {
        let extractor = DeterministicExtractor;
        let chunks = vec!["The dosage amount is 50mg taken daily.".to_string()];
        let value = extractor.extract("What is the dosage amount?", &chunks).await.unwrap();
        assert!(value.to_lowercase().contains("dosage"));
    }

    #[tokio::test]
    async fn deterministic_extractor_not_found_when_absent() {
        let extractor = DeterministicExtractor;
        let chunks = vec!["Unrelated content about something else.".to_string()];
        let value = extractor.extract("What is the dosage amount?", &chunks).await.unwrap();
        assert_eq!(value, NOT_FOUND);
    }

    #[tokio::test]
    async fn template_rewriter_wraps_prompt() {
        let rewriter = TemplateQueryRewriter;
        let rewritten = rewriter.rewrite("the approval date").await.unwrap();
        assert!(rewritten.contains("the approval date"));
    }
}
