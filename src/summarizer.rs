//! Summarizer (spec §4.3).
//!
//! For each chunk, independently derives a title, a ≤200-word summary, and
//! the fixed-dimension embedding of that summary. Retries on upstream
//! "resource exhausted" errors with exponential backoff + jitter; on final
//! failure falls back to the raw chunk text as the summary (non-fatal —
//! spec §4.3 says this failure mode never fails ingestion).

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::chunk::RawChunk;
use crate::config::SummarizerConfig;
use crate::retry::{retry_with_backoff, Backoff};

/// A chunk after summarization: title, summary, and the embedding of the
/// summary text, alongside the original raw chunk it was derived from.
#[derive(Debug, Clone)]
pub struct SummarizedChunk {
    pub raw: RawChunk,
    pub title: String,
    pub summary: String,
    pub embedding: Vec<f32>,
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    fn embedding_dims(&self) -> usize;
    /// 3-7 word title for the given chunk text.
    async fn derive_title(&self, text: &str) -> Result<String>;
    /// Summary ≤ 200 words; `has_table` instructs the provider to preserve
    /// key tabular data points.
    async fn summarize(&self, text: &str, has_table: bool) -> Result<String>;
    /// Embedding vector of [`Summarizer::embedding_dims`] dimension.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// `true` for errors the retry loop should retry (upstream "resource
/// exhausted" / rate-limit style failures).
fn is_resource_exhausted(err: &anyhow::Error) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("resource exhausted") || msg.contains("rate limit") || msg.contains("429")
}

/// If the chunk's first five lines contain a markdown heading (a line
/// starting with `#`), return its stripped text (spec §4.3).
fn heading_from_first_lines(text: &str, max_lines: usize) -> Option<String> {
    for line in text.lines().take(max_lines) {
        let trimmed = line.trim();
        if let Some(stripped) = trimmed.strip_prefix('#') {
            let heading = stripped.trim_start_matches('#').trim();
            if !heading.is_empty() {
                return Some(heading.to_string());
            }
        }
    }
    None
}

async fn process_chunk(
    summarizer: &(dyn Summarizer),
    raw: RawChunk,
    max_retries: u32,
) -> SummarizedChunk {
    let heading = heading_from_first_lines(&raw.text, 5);
    let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(20))
        .with_jitter(Duration::from_millis(500));
    let salt = raw.chunk_index as u64;

    let attempt_result: Result<(String, String, Vec<f32>)> = retry_with_backoff(
        max_retries,
        backoff,
        salt,
        |e: &anyhow::Error| is_resource_exhausted(e),
        |_attempt| {
            let heading = heading.clone();
            async move {
                let title = match heading {
                    Some(h) => h,
                    None => summarizer.derive_title(&raw.text).await?,
                };
                let summary = summarizer.summarize(&raw.text, raw.has_table).await?;
                let embedding = summarizer.embed(&summary).await?;
                Ok((title, summary, embedding))
            }
        },
    )
    .await;

    match attempt_result {
        Ok((title, summary, embedding)) => SummarizedChunk {
            raw,
            title,
            summary,
            embedding,
        },
        Err(_) => {
            let embedding = summarizer
                .embed(&raw.text)
                .await
                .unwrap_or_else(|_| vec![0.0; summarizer.embedding_dims()]);
            SummarizedChunk {
                title: "Untitled Chunk".to_string(),
                summary: raw.text.clone(),
                embedding,
                raw,
            }
        }
    }
}

/// Summarize all of a document's chunks with a bounded worker set (≤8,
/// spec §4.3) driven by a `Semaphore` + `JoinSet`, reassembling results in
/// `chunk_index` order regardless of completion order.
pub async fn summarize_document(
    summarizer: Arc<dyn Summarizer>,
    raw_chunks: Vec<RawChunk>,
    max_concurrent: usize,
    max_retries: u32,
) -> Vec<SummarizedChunk> {
    let semaphore = Arc::new(Semaphore::new(max_concurrent.clamp(1, 8)));
    let mut join_set = tokio::task::JoinSet::new();

    for raw in raw_chunks {
        let summarizer = summarizer.clone();
        let semaphore = semaphore.clone();
        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
            process_chunk(summarizer.as_ref(), raw, max_retries).await
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        if let Ok(chunk) = joined {
            results.push(chunk);
        }
    }
    results.sort_by_key(|c| c.raw.chunk_index);
    results
}

// ============ Deterministic (test) provider ============

/// A fast, network-free summarizer for tests: truncates text for the
/// summary and derives a deterministic pseudo-embedding from a hash of the
/// text. Never errors, so retry/fallback paths are exercised only via the
/// failing test double below.
pub struct DeterministicSummarizer {
    dims: usize,
}

impl DeterministicSummarizer {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl Summarizer for DeterministicSummarizer {
    fn embedding_dims(&self) -> usize {
        self.dims
    }

    async fn derive_title(&self, text: &str) -> Result<String> {
        let words: Vec<&str> = text.split_whitespace().take(5).collect();
        Ok(if words.is_empty() {
            "Untitled Chunk".to_string()
        } else {
            words.join(" ")
        })
    }

    async fn summarize(&self, text: &str, _has_table: bool) -> Result<String> {
        let words: Vec<&str> = text.split_whitespace().take(200).collect();
        Ok(words.join(" "))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(deterministic_embedding(text, self.dims))
    }
}

/// Derives a unit-ish pseudo-embedding from a SHA-256 hash of `text`, so
/// tests get stable, distinguishable vectors without a network call.
pub fn deterministic_embedding(text: &str, dims: usize) -> Vec<f32> {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    (0..dims)
        .map(|i| {
            let byte = digest[i % digest.len()];
            (byte as f32 / 255.0) * 2.0 - 1.0
        })
        .collect()
}

// ============ OpenAI-backed provider ============

/// LLM-backed summarizer using OpenAI's chat completions for title/summary
/// and embeddings endpoint for vectors, mirroring the teacher's
/// `embedding::embed_openai` request shape.
pub struct OpenAiSummarizer {
    client: reqwest::Client,
    model: String,
    embedding_model: String,
    dims: usize,
}

impl OpenAiSummarizer {
    pub fn new(config: &SummarizerConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("summarizer.model required for provider 'openai'"))?;
        if std::env::var("OPENAI_API_KEY").is_err() {
            anyhow::bail!("OPENAI_API_KEY environment variable not set");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            model,
            embedding_model: "text-embedding-3-small".to_string(),
            dims: config.embedding_dims,
        })
    }

    fn api_key(&self) -> Result<String> {
        std::env::var("OPENAI_API_KEY").map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String> {
        let api_key = self.api_key()?;
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
impl Summarizer for OpenAiSummarizer {
    fn embedding_dims(&self) -> usize {
        self.dims
    }

    async fn derive_title(&self, text: &str) -> Result<String> {
        self.chat(
            "Produce a 3-7 word title for the following document excerpt. Respond with only the title.",
            text,
        )
        .await
    }

    async fn summarize(&self, text: &str, has_table: bool) -> Result<String> {
        let system = if has_table {
            "Summarize the following excerpt in 200 words or fewer. It contains tabular data — preserve key data points from the table."
        } else {
            "Summarize the following excerpt in 200 words or fewer."
        };
        self.chat(system, text).await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let api_key = self.api_key()?;
        let body = serde_json::json!({
            "model": self.embedding_model,
            "input": text,
        });
        let resp = self
            .client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI embeddings error {}: {}", status, text);
        }
        let json: serde_json::Value = resp.json().await?;
        let embedding = json["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| anyhow::anyhow!("malformed OpenAI embeddings response"))?;
        Ok(embedding.iter().map(|v| v.as_f64().unwrap_or(0.0) as f32).collect())
    }
}

pub fn create_summarizer(config: &SummarizerConfig) -> Result<Box<dyn Summarizer>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DeterministicSummarizer::new(config.embedding_dims))),
        "openai" => Ok(Box::new(OpenAiSummarizer::new(config)?)),
        other => anyhow::bail!("Unknown summarizer provider: {}", other),
    }
}

// ============ Vector utilities (shared with vector_index) ============

pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}
