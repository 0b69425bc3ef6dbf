//! Configuration parsing and validation.
//!
//! The pipeline is configured via a TOML file (default: `config/regdoc.toml`).
//! It defines the database path, chunking parameters, the summarizer/embedder
//! and vector-index provider settings, blob-store caching, worker pool
//! sizes, extraction tuning, and the HTTP server bind address.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub summarizer: SummarizerConfig,
    #[serde(default)]
    pub vector_index: VectorIndexConfig,
    #[serde(default)]
    pub blob_store: BlobStoreConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub chunk_overlap: usize,
}

fn default_overlap() -> usize {
    200
}

/// Embedding dimension `D` is a process-wide constant (spec §6): mismatched
/// vectors are rejected by the vector index and surface as an ingestion
/// failure.
#[derive(Debug, Deserialize, Clone)]
pub struct SummarizerConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub embedding_dims: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_chunk_workers")]
    pub max_concurrent_chunks: usize,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            embedding_dims: default_dims(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            max_concurrent_chunks: default_chunk_workers(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    768
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_chunk_workers() -> usize {
    8
}

impl SummarizerConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VectorIndexConfig {
    #[serde(default = "default_vector_provider")]
    pub provider: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_query_k")]
    pub default_k: i64,
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            provider: default_vector_provider(),
            endpoint: None,
            default_k: default_query_k(),
        }
    }
}

fn default_vector_provider() -> String {
    "memory".to_string()
}
fn default_query_k() -> i64 {
    25
}

#[derive(Debug, Deserialize, Clone)]
pub struct BlobStoreConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            user_agent: default_user_agent(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("data/blob-cache")
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (compatible; regdoc-pipeline/0.1)".to_string()
}
fn default_fetch_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    #[serde(default = "default_ingestion_workers")]
    pub workers: usize,
    #[serde(default = "default_indexing_workers")]
    pub indexing_workers: usize,
    #[serde(default = "default_phase_timeout")]
    pub ingestion_timeout_secs: u64,
    #[serde(default = "default_phase_timeout")]
    pub indexing_timeout_secs: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            workers: default_ingestion_workers(),
            indexing_workers: default_indexing_workers(),
            ingestion_timeout_secs: default_phase_timeout(),
            indexing_timeout_secs: default_phase_timeout(),
        }
    }
}

fn default_ingestion_workers() -> usize {
    3
}
fn default_indexing_workers() -> usize {
    3
}
fn default_phase_timeout() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_retrieval_k")]
    pub retrieval_k: i64,
    #[serde(default = "default_inter_call_delay_ms")]
    pub inter_call_delay_ms: u64,
    #[serde(default = "default_error_delay_ms")]
    pub error_delay_ms: u64,
    #[serde(default = "default_extraction_max_retries")]
    pub max_retries: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            retrieval_k: default_retrieval_k(),
            inter_call_delay_ms: default_inter_call_delay_ms(),
            error_delay_ms: default_error_delay_ms(),
            max_retries: default_extraction_max_retries(),
        }
    }
}

fn default_retrieval_k() -> i64 {
    25
}
fn default_inter_call_delay_ms() -> u64 {
    1000
}
fn default_error_delay_ms() -> u64 {
    2000
}
fn default_extraction_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be smaller than chunk_size");
    }

    if config.summarizer.embedding_dims == 0 {
        anyhow::bail!("summarizer.embedding_dims must be > 0");
    }

    match config.summarizer.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!("Unknown summarizer provider: '{}'", other),
    }
    if config.summarizer.is_enabled() && config.summarizer.model.is_none() {
        anyhow::bail!(
            "summarizer.model must be specified when provider is '{}'",
            config.summarizer.provider
        );
    }

    match config.vector_index.provider.as_str() {
        "memory" | "qdrant" => {}
        other => anyhow::bail!("Unknown vector_index provider: '{}'", other),
    }
    if config.vector_index.provider == "qdrant" && config.vector_index.endpoint.is_none() {
        anyhow::bail!("vector_index.endpoint must be set when provider is 'qdrant'");
    }

    if config.ingestion.workers == 0 {
        anyhow::bail!("ingestion.workers must be > 0");
    }
    if config.extraction.retrieval_k < 1 {
        anyhow::bail!("extraction.retrieval_k must be >= 1");
    }

    Ok(config)
}
