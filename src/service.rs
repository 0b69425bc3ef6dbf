//! `PipelineService`: the single façade implementing every row of spec
//! §6's service-operation table.
//!
//! Both the CLI (`main.rs`) and the HTTP layer (`server.rs`) hold an
//! `Arc<PipelineService>` and call only these methods — neither touches
//! `sqlx` or the provider traits directly. `start_indexing_job` and
//! `start_extraction_job` persist the job row synchronously, then hand
//! execution to a detached task (spec §4.7/§4.8's "emits a work
//! notification" / "publishes one background task"), returning the job id
//! immediately so callers poll with `get_indexing_job`/`get_extraction_job`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::warn;

use crate::blob_store::BlobStore;
use crate::chunk::DocumentTextExtractor;
use crate::collections::{self, add_documents_to_collection, create_collection};
use crate::config::Config;
use crate::documents::{self, get_document_status, reprocess_document, upload_document};
use crate::extraction::{self, ExtractionJobCoordinator};
use crate::extractor::{Extractor, QueryRewriter};
use crate::groups::{self, ConfigPatch, GroupPatch};
use crate::indexing::{self, IndexingJobCoordinator};
use crate::ingest::IngestionWorkerPool;
use crate::models::{
    Collection, ConfigDataType, DocumentStatus, ExtractedMetadata, ExtractionJob, IndexingJob,
    IndexingJobType, MetadataConfiguration, MetadataGroup, SourceDocument,
};
use crate::summarizer::Summarizer;
use crate::vector_index::VectorIndex;

pub struct PipelineService {
    pool: SqlitePool,
    ingestion_pool: Arc<IngestionWorkerPool>,
    indexing_coordinator: Arc<IndexingJobCoordinator>,
    extraction_coordinator: Arc<ExtractionJobCoordinator>,
    ingestion_workers: usize,
}

impl PipelineService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        config: &Config,
        blob_store: Arc<dyn BlobStore>,
        text_extractor: Arc<dyn DocumentTextExtractor>,
        summarizer: Arc<dyn Summarizer>,
        vector_index: Arc<dyn VectorIndex>,
        query_rewriter: Arc<dyn QueryRewriter>,
        extractor: Arc<dyn Extractor>,
    ) -> Self {
        let ingestion_pool = Arc::new(IngestionWorkerPool::new(
            pool.clone(),
            blob_store,
            text_extractor,
            summarizer.clone(),
            config.chunking.chunk_size,
            config.chunking.chunk_overlap,
            config.summarizer.max_concurrent_chunks,
            config.summarizer.max_retries,
            Duration::from_secs(config.ingestion.ingestion_timeout_secs),
        ));

        let indexing_coordinator = Arc::new(IndexingJobCoordinator::new(
            pool.clone(),
            vector_index.clone(),
            summarizer.clone(),
        ));

        let extraction_coordinator = Arc::new(ExtractionJobCoordinator::new(
            pool.clone(),
            vector_index,
            summarizer,
            query_rewriter,
            extractor,
            config.extraction.retrieval_k,
            Duration::from_millis(config.extraction.inter_call_delay_ms),
            Duration::from_millis(config.extraction.error_delay_ms),
            config.extraction.max_retries,
        ));

        Self {
            pool,
            ingestion_pool,
            indexing_coordinator,
            extraction_coordinator,
            ingestion_workers: config.ingestion.workers,
        }
    }

    // ---- documents ----

    pub async fn upload_document(
        &self,
        source_uri: &str,
        display_name: &str,
        entity_label: Option<&str>,
    ) -> Result<SourceDocument> {
        upload_document(&self.pool, source_uri, display_name, entity_label).await
    }

    pub async fn reprocess_document(&self, document_id: &str) -> Result<SourceDocument> {
        reprocess_document(&self.pool, document_id).await
    }

    pub async fn get_document_status(
        &self,
        document_id: &str,
    ) -> Result<(DocumentStatus, Option<String>, bool)> {
        get_document_status(&self.pool, document_id).await
    }

    pub async fn get_document(&self, document_id: &str) -> Result<SourceDocument> {
        documents::get_document(&self.pool, document_id).await
    }

    /// Runs the ingestion worker pool to drain every `PENDING` document
    /// using the configured number of workers. Used by the CLI's `ingest
    /// run` command and by the server's background driver loop.
    pub async fn run_ingestion(&self) -> Result<usize> {
        self.ingestion_pool.run_once(self.ingestion_workers).await
    }

    // ---- collections ----

    pub async fn create_collection(
        &self,
        name: &str,
        description: Option<&str>,
        created_by: Option<&str>,
    ) -> Result<Collection> {
        create_collection(&self.pool, name, description, created_by).await
    }

    pub async fn get_collection(&self, collection_id: &str) -> Result<Collection> {
        collections::get_collection(&self.pool, collection_id).await
    }

    pub async fn add_documents_to_collection(
        &self,
        collection_id: &str,
        document_ids: &[String],
    ) -> Result<usize> {
        add_documents_to_collection(&self.pool, collection_id, document_ids).await
    }

    // ---- indexing jobs ----

    /// Creates the job record, then dispatches it to run on a detached
    /// task. Returns the job id immediately; poll with
    /// [`Self::get_indexing_job`].
    pub async fn start_indexing_job(
        &self,
        collection_id: &str,
        document_ids: &[String],
        job_type: IndexingJobType,
    ) -> Result<String> {
        let job_id = self
            .indexing_coordinator
            .start_indexing_job(collection_id, document_ids, job_type)
            .await?;

        let coordinator = self.indexing_coordinator.clone();
        let job_id_for_task = job_id.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.run_job(&job_id_for_task).await {
                warn!(job_id = %job_id_for_task, error = %e, "indexing job task failed");
            }
        });

        Ok(job_id)
    }

    pub async fn get_indexing_job(&self, job_id: &str) -> Result<IndexingJob> {
        indexing::get_indexing_job(&self.pool, job_id).await
    }

    // ---- metadata configurations & groups ----

    #[allow(clippy::too_many_arguments)]
    pub async fn create_metadata_configuration(
        &self,
        name: &str,
        description: Option<&str>,
        data_type: ConfigDataType,
        extraction_prompt: &str,
        validation_rules: Option<serde_json::Value>,
        created_by: Option<&str>,
        group_ids: &[String],
    ) -> Result<MetadataConfiguration> {
        groups::create_metadata_configuration(
            &self.pool,
            name,
            description,
            data_type,
            extraction_prompt,
            validation_rules,
            created_by,
            group_ids,
        )
        .await
    }

    pub async fn update_metadata_configuration(
        &self,
        config_id: &str,
        patch: ConfigPatch,
    ) -> Result<MetadataConfiguration> {
        groups::update_metadata_configuration(&self.pool, config_id, patch).await
    }

    pub async fn delete_metadata_configuration(&self, config_id: &str) -> Result<()> {
        groups::delete_metadata_configuration(&self.pool, config_id).await
    }

    pub async fn create_metadata_group(
        &self,
        name: &str,
        description: Option<&str>,
        color: Option<&str>,
        tags: Vec<String>,
        created_by: Option<&str>,
    ) -> Result<MetadataGroup> {
        groups::create_metadata_group(&self.pool, name, description, color, tags, created_by).await
    }

    pub async fn update_metadata_group(&self, group_id: &str, patch: GroupPatch) -> Result<MetadataGroup> {
        groups::update_metadata_group(&self.pool, group_id, patch).await
    }

    pub async fn delete_metadata_group(&self, group_id: &str) -> Result<()> {
        groups::delete_metadata_group(&self.pool, group_id).await
    }

    pub async fn clone_group(&self, group_id: &str, new_name: &str) -> Result<MetadataGroup> {
        groups::clone_group(&self.pool, group_id, new_name).await
    }

    pub async fn reorder_configuration_in_group(
        &self,
        group_id: &str,
        config_id: &str,
        new_order: i64,
    ) -> Result<()> {
        groups::reorder_configuration_in_group(&self.pool, group_id, config_id, new_order).await
    }

    // ---- extraction jobs ----

    pub async fn start_extraction_job(
        &self,
        collection_id: &str,
        group_id: &str,
        created_by: Option<&str>,
    ) -> Result<String> {
        let job_id = self
            .extraction_coordinator
            .start_extraction_job(collection_id, group_id, created_by)
            .await?;

        let coordinator = self.extraction_coordinator.clone();
        let job_id_for_task = job_id.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.run_job(&job_id_for_task).await {
                warn!(job_id = %job_id_for_task, error = %e, "extraction job task failed");
            }
        });

        Ok(job_id)
    }

    pub async fn get_extraction_job(&self, job_id: &str) -> Result<ExtractionJob> {
        extraction::get_extraction_job(&self.pool, job_id).await
    }

    pub async fn stop_extraction_job(&self, job_id: &str) -> Result<()> {
        extraction::request_stop(&self.pool, job_id).await
    }

    pub async fn list_extracted_metadata(
        &self,
        collection_id: &str,
        group_id: Option<&str>,
        document_id: Option<&str>,
    ) -> Result<Vec<ExtractedMetadata>> {
        extraction::list_extracted_metadata(&self.pool, collection_id, group_id, document_id).await
    }
}
