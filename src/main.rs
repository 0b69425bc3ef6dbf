//! # regdoc-pipeline
//!
//! A document ingestion, indexing, and structured-metadata extraction
//! pipeline for long-form regulatory filings.
//!
//! ## Architecture
//!
//! ```text
//! Upload → Ingestion Worker Pool → Chunker → Summarizer → SQLite
//!        → Indexing Job Coordinator → Vector Index
//!        → Extraction Job Coordinator → Extraction Executor → Extracted Metadata
//! ```
//!
//! Every subcommand below and every HTTP handler in [`server`] calls one
//! [`service::PipelineService`] method; neither touches `sqlx` directly.
//!
//! ## Modules
//!
//! - [`config`] — TOML configuration parsing and validation
//! - [`models`] — core data types shared by every stage
//! - [`db`] / [`migrate`] — SQLite connection and schema management
//! - [`blob_store`] — resolves a `source_uri` to raw bytes
//! - [`chunk`] — markdown-aware, table-preserving text chunker
//! - [`summarizer`] — per-chunk title/summary/embedding generation
//! - [`ingest`] — ingestion worker pool
//! - [`vector_index`] — vector storage and similarity query
//! - [`indexing`] — indexing job coordinator
//! - [`collections`] — collection CRUD
//! - [`documents`] — document upload/status/reprocess
//! - [`groups`] — metadata configuration and group CRUD
//! - [`extractor`] — query rewriting and field extraction
//! - [`extraction`] — extraction job coordinator and executor
//! - [`sentinels`] — extracted-value normalization
//! - [`state_machine`] — document status transition rules
//! - [`retry`] — shared backoff/retry helper
//! - [`error`] — the one typed error seam (`PipelineError`)
//! - [`service`] — the `PipelineService` façade
//! - [`server`] — the HTTP API (Axum)

mod blob_store;
mod chunk;
mod collections;
mod config;
mod db;
mod documents;
mod error;
mod extraction;
mod extractor;
mod groups;
mod indexing;
mod ingest;
mod migrate;
mod models;
mod retry;
mod sentinels;
mod server;
mod service;
mod state_machine;
mod summarizer;
mod vector_index;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::chunk::PdfTextExtractor;
use crate::extractor::{DeterministicExtractor, Extractor, OpenAiExtractor, QueryRewriter, TemplateQueryRewriter};
use crate::models::{ConfigDataType, IndexingJobType};
use crate::service::PipelineService;

#[derive(Parser)]
#[command(name = "regdocd", about = "Document ingestion, indexing, and metadata-extraction pipeline", version)]
struct Cli {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "./config/regdoc.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema
    Migrate,

    /// Register a document and drain the ingestion worker pool once
    Upload {
        /// Source URI (local path, `local://...`, or a remote URL)
        source_uri: String,
        /// Human-readable display name
        display_name: String,
        /// Optional entity label (e.g. issuer/ticker)
        #[arg(long)]
        entity_label: Option<String>,
    },

    /// Move a FAILED document back to PENDING
    Reprocess {
        /// Document id
        id: String,
    },

    /// Print a document's current status
    Status {
        /// Document id
        id: String,
    },

    /// Run the ingestion worker pool once over every PENDING document
    IngestRun,

    /// Collection management
    Collection {
        #[command(subcommand)]
        action: CollectionAction,
    },

    /// Indexing job management
    Indexing {
        #[command(subcommand)]
        action: IndexingAction,
    },

    /// Metadata configuration and group management
    Metadata {
        #[command(subcommand)]
        action: MetadataAction,
    },

    /// Extraction job management
    Extraction {
        #[command(subcommand)]
        action: ExtractionAction,
    },

    /// Start the HTTP server
    Serve,
}

#[derive(Subcommand)]
enum CollectionAction {
    /// Create a collection
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        created_by: Option<String>,
    },
    /// Add documents to a collection
    AddDocuments {
        collection_id: String,
        /// Document ids to add
        document_ids: Vec<String>,
    },
}

#[derive(Subcommand)]
enum IndexingAction {
    /// Start an indexing job over a set of documents in a collection
    Start {
        collection_id: String,
        document_ids: Vec<String>,
        #[arg(long, default_value = "index")]
        job_type: String,
    },
    /// Poll an indexing job
    Get { job_id: String },
}

#[derive(Subcommand)]
enum MetadataAction {
    /// Create a metadata configuration
    CreateConfiguration {
        name: String,
        data_type: String,
        extraction_prompt: String,
        /// Group ids this configuration belongs to
        group_ids: Vec<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        created_by: Option<String>,
    },
    /// Create a metadata group
    CreateGroup {
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        color: Option<String>,
        #[arg(long)]
        created_by: Option<String>,
    },
    /// Reorder a configuration within a group
    Reorder { group_id: String, config_id: String, new_order: i64 },
}

#[derive(Subcommand)]
enum ExtractionAction {
    /// Start an extraction job for a (collection, group) pair
    Start {
        collection_id: String,
        group_id: String,
        #[arg(long)]
        created_by: Option<String>,
    },
    /// Poll an extraction job
    Get { job_id: String },
    /// Request cooperative cancellation of a running extraction job
    Stop { job_id: String },
    /// List extracted metadata for a collection
    List {
        collection_id: String,
        #[arg(long)]
        group_id: Option<String>,
        #[arg(long)]
        document_id: Option<String>,
    },
}

/// Polls an indexing job every 200ms until it reaches a terminal status.
/// The job runs on a task the service already spawned; this just keeps the
/// CLI process (and its tokio runtime) alive long enough to see it finish.
async fn await_indexing_job(service: &PipelineService, job_id: &str) -> anyhow::Result<models::IndexingJob> {
    loop {
        let job = service.get_indexing_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

async fn await_extraction_job(service: &PipelineService, job_id: &str) -> anyhow::Result<models::ExtractionJob> {
    loop {
        let job = service.get_extraction_job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }
}

async fn build_service(cfg: &config::Config) -> anyhow::Result<Arc<PipelineService>> {
    let pool = db::connect(cfg).await?;

    let blob_store: Arc<dyn blob_store::BlobStore> = Arc::from(blob_store::create_blob_store(&cfg.blob_store)?);
    let text_extractor: Arc<dyn chunk::DocumentTextExtractor> = Arc::new(PdfTextExtractor);
    let summarizer: Arc<dyn summarizer::Summarizer> = Arc::from(summarizer::create_summarizer(&cfg.summarizer)?);
    let vector_index: Arc<dyn vector_index::VectorIndex> =
        Arc::from(vector_index::create_vector_index(&cfg.vector_index.provider, cfg.vector_index.endpoint.as_deref())?);

    let (query_rewriter, extractor): (Arc<dyn QueryRewriter>, Arc<dyn Extractor>) = if cfg.summarizer.is_enabled() {
        let model = cfg.summarizer.model.clone().unwrap_or_default();
        let openai = Arc::new(OpenAiExtractor::new(model, cfg.summarizer.timeout_secs)?);
        (openai.clone() as Arc<dyn QueryRewriter>, openai as Arc<dyn Extractor>)
    } else {
        (Arc::new(TemplateQueryRewriter), Arc::new(DeterministicExtractor))
    };

    Ok(Arc::new(PipelineService::new(
        pool,
        cfg,
        blob_store,
        text_extractor,
        summarizer,
        vector_index,
        query_rewriter,
        extractor,
    )))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();

    if matches!(cli.command, Commands::Migrate) {
        let cfg = config::load_config(&cli.config)?;
        migrate::run_migrations(&cfg).await?;
        println!("Database initialized successfully.");
        return Ok(());
    }

    let cfg = config::load_config(&cli.config)?;
    let service = build_service(&cfg).await?;

    match cli.command {
        Commands::Migrate => unreachable!("handled above"),
        Commands::Upload { source_uri, display_name, entity_label } => {
            let doc = service.upload_document(&source_uri, &display_name, entity_label.as_deref()).await?;
            println!("uploaded document {} ({})", doc.id, doc.status);
        }
        Commands::Reprocess { id } => {
            let doc = service.reprocess_document(&id).await?;
            println!("document {} is now {}", doc.id, doc.status);
        }
        Commands::Status { id } => {
            let (status, detail, extracted) = service.get_document_status(&id).await?;
            println!("status: {}", status);
            if let Some(detail) = detail {
                println!("detail: {}", detail);
            }
            println!("metadata_extracted: {}", extracted);
        }
        Commands::IngestRun => {
            let processed = service.run_ingestion().await?;
            println!("processed {} document(s)", processed);
        }
        Commands::Collection { action } => match action {
            CollectionAction::Create { name, description, created_by } => {
                let collection = service.create_collection(&name, description.as_deref(), created_by.as_deref()).await?;
                println!("created collection {} ({})", collection.id, collection.name);
            }
            CollectionAction::AddDocuments { collection_id, document_ids } => {
                let added = service.add_documents_to_collection(&collection_id, &document_ids).await?;
                println!("added {} document(s) to collection {}", added, collection_id);
            }
        },
        Commands::Indexing { action } => match action {
            IndexingAction::Start { collection_id, document_ids, job_type } => {
                let job_type = IndexingJobType::parse(&job_type)
                    .ok_or_else(|| anyhow::anyhow!("unknown job_type: {}", job_type))?;
                let job_id = service.start_indexing_job(&collection_id, &document_ids, job_type).await?;
                // The job itself runs on a task spawned by the service; a
                // one-shot CLI invocation has no long-running process to
                // poll it later, so wait here until it reaches a terminal
                // status before the runtime shuts down underneath it.
                let job = await_indexing_job(&service, &job_id).await?;
                println!(
                    "job {}: {} ({}/{} processed, {} failed)",
                    job.id, job.status, job.processed_documents, job.total_documents, job.failed_documents
                );
            }
            IndexingAction::Get { job_id } => {
                let job = service.get_indexing_job(&job_id).await?;
                println!(
                    "job {}: {} ({}/{} processed, {} failed)",
                    job.id, job.status, job.processed_documents, job.total_documents, job.failed_documents
                );
            }
        },
        Commands::Metadata { action } => match action {
            MetadataAction::CreateConfiguration { name, data_type, extraction_prompt, group_ids, description, created_by } => {
                let data_type =
                    ConfigDataType::parse(&data_type).ok_or_else(|| anyhow::anyhow!("unknown data_type: {}", data_type))?;
                let config = service
                    .create_metadata_configuration(
                        &name,
                        description.as_deref(),
                        data_type,
                        &extraction_prompt,
                        None,
                        created_by.as_deref(),
                        &group_ids,
                    )
                    .await?;
                println!("created configuration {} ({})", config.id, config.name);
            }
            MetadataAction::CreateGroup { name, description, color, created_by } => {
                let group = service
                    .create_metadata_group(&name, description.as_deref(), color.as_deref(), vec![], created_by.as_deref())
                    .await?;
                println!("created group {} ({})", group.id, group.name);
            }
            MetadataAction::Reorder { group_id, config_id, new_order } => {
                service.reorder_configuration_in_group(&group_id, &config_id, new_order).await?;
                println!("reordered configuration {} in group {} to position {}", config_id, group_id, new_order);
            }
        },
        Commands::Extraction { action } => match action {
            ExtractionAction::Start { collection_id, group_id, created_by } => {
                let job_id = service.start_extraction_job(&collection_id, &group_id, created_by.as_deref()).await?;
                let job = await_extraction_job(&service, &job_id).await?;
                println!(
                    "job {}: {} ({}/{} processed, {} failed)",
                    job.id, job.status, job.processed_documents, job.total_documents, job.failed_documents
                );
            }
            ExtractionAction::Get { job_id } => {
                let job = service.get_extraction_job(&job_id).await?;
                println!(
                    "job {}: {} ({}/{} processed, {} failed)",
                    job.id, job.status, job.processed_documents, job.total_documents, job.failed_documents
                );
            }
            ExtractionAction::Stop { job_id } => {
                service.stop_extraction_job(&job_id).await?;
                println!("requested cancellation for job {}", job_id);
            }
            ExtractionAction::List { collection_id, group_id, document_id } => {
                let rows = service.list_extracted_metadata(&collection_id, group_id.as_deref(), document_id.as_deref()).await?;
                for row in rows {
                    println!("{}/{}: {} = {}", row.document_id, row.metadata_name, row.group_id, row.extracted_value);
                }
            }
        },
        Commands::Serve => {
            server::run_server(&cfg, service).await?;
        }
    }

    Ok(())
}
