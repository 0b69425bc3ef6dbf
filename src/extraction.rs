//! Extraction Job Coordinator and Executor.
//!
//! A job runs one [`MetadataGroup`]'s configurations against every `READY`
//! document in a collection: outer loop over documents, inner loop over
//! configurations in `display_order`, one retrieval + extraction call per
//! pair. Retrieval is scoped to the single document via a
//! `source_document_name` payload filter, so documents never bleed context
//! into each other's extractions.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use regex::Regex;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::extractor::{Extractor, QueryRewriter};
use crate::groups;
use crate::models::{now_ts, DocumentStatus, ExtractionJob, JobStatus};
use crate::sentinels::{self, INVALID_FORMAT, SERVICE_UNAVAILABLE};
use crate::summarizer::Summarizer;
use crate::vector_index::{QueryFilter, VectorIndex};

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> ExtractionJob {
    let status_str: String = row.get("status");
    ExtractionJob {
        id: row.get("id"),
        collection_id: row.get("collection_id"),
        group_id: row.get("group_id"),
        status: JobStatus::parse(&status_str).unwrap_or(JobStatus::Pending),
        total_documents: row.get("total_documents"),
        processed_documents: row.get("processed_documents"),
        failed_documents: row.get("failed_documents"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        created_by: row.get("created_by"),
        error_details: row.get("error_details"),
    }
}

pub async fn get_extraction_job(pool: &SqlitePool, job_id: &str) -> Result<ExtractionJob> {
    let row = sqlx::query("SELECT * FROM extraction_jobs WHERE id = ?1")
        .bind(job_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| PipelineError::not_found(format!("extraction job {}", job_id)))?;
    Ok(row_to_job(&row))
}

/// Requests cooperative cancellation: the running job observes this after
/// it finishes its current (document, configuration) call.
pub async fn request_stop(pool: &SqlitePool, job_id: &str) -> Result<()> {
    get_extraction_job(pool, job_id).await?;
    sqlx::query("UPDATE extraction_jobs SET cancel_requested = 1 WHERE id = ?1")
        .bind(job_id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn ready_document_ids(pool: &SqlitePool, collection_id: &str) -> Result<Vec<String>> {
    let rows = sqlx::query(
        r#"
        SELECT sd.id FROM source_documents sd
        JOIN collection_memberships cm ON cm.document_id = sd.id
        WHERE cm.collection_id = ?1 AND sd.status = 'READY'
        ORDER BY sd.id ASC
        "#,
    )
    .bind(collection_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(|r| r.get::<String, _>("id")).collect())
}

pub struct ExtractionJobCoordinator {
    pool: SqlitePool,
    vector_index: Arc<dyn VectorIndex>,
    summarizer: Arc<dyn Summarizer>,
    query_rewriter: Arc<dyn QueryRewriter>,
    extractor: Arc<dyn Extractor>,
    retrieval_k: i64,
    inter_call_delay: Duration,
    error_delay: Duration,
    max_retries: u32,
}

impl ExtractionJobCoordinator {
    pub fn new(
        pool: SqlitePool,
        vector_index: Arc<dyn VectorIndex>,
        summarizer: Arc<dyn Summarizer>,
        query_rewriter: Arc<dyn QueryRewriter>,
        extractor: Arc<dyn Extractor>,
        retrieval_k: i64,
        inter_call_delay: Duration,
        error_delay: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            pool,
            vector_index,
            summarizer,
            query_rewriter,
            extractor,
            retrieval_k,
            inter_call_delay,
            error_delay,
            max_retries,
        }
    }

    /// Creates the job row: enumerates `READY` documents in the collection
    /// and leaves processing for [`Self::run_job`].
    pub async fn start_extraction_job(
        &self,
        collection_id: &str,
        group_id: &str,
        created_by: Option<&str>,
    ) -> Result<String> {
        groups::get_group(&self.pool, group_id).await?;
        let configs = groups::list_group_configurations(&self.pool, group_id).await?;
        if configs.is_empty() {
            return Err(PipelineError::validation(format!("group {} has no configurations", group_id)));
        }

        let documents = ready_document_ids(&self.pool, collection_id).await?;

        let job_id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO extraction_jobs (id, collection_id, group_id, status, total_documents, processed_documents, failed_documents, created_by, cancel_requested)
            VALUES (?1, ?2, ?3, 'pending', ?4, 0, 0, ?5, 0)
            "#,
        )
        .bind(&job_id)
        .bind(collection_id)
        .bind(group_id)
        .bind(documents.len() as i64)
        .bind(created_by)
        .execute(&self.pool)
        .await?;

        tracing::info!(job_id = %job_id, collection_id, group_id, documents = documents.len(), configs = configs.len(), "extraction job created");
        Ok(job_id)
    }

    async fn cancel_requested(&self, job_id: &str) -> Result<bool> {
        let flag: i64 = sqlx::query_scalar("SELECT cancel_requested FROM extraction_jobs WHERE id = ?1")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(flag != 0)
    }

    /// Runs a job to completion. Outer loop is sequential over documents;
    /// inner loop sequential over configurations, pausing
    /// `inter_call_delay` between successful calls and `error_delay` after
    /// an error, so the executor doesn't hammer a struggling backend.
    pub async fn run_job(&self, job_id: &str) -> Result<()> {
        let job = get_extraction_job(&self.pool, job_id).await?;
        sqlx::query("UPDATE extraction_jobs SET status = 'processing', started_at = ?1 WHERE id = ?2")
            .bind(now_ts())
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        let documents = ready_document_ids(&self.pool, &job.collection_id).await?;
        let configs = groups::list_group_configurations(&self.pool, &job.group_id).await?;
        let collection = crate::collections::get_collection(&self.pool, &job.collection_id).await?;
        let vector_index_name = collection
            .vector_index_name
            .clone()
            .ok_or_else(|| PipelineError::conflict("collection has not been indexed yet"))?;

        let mut failed_documents = 0i64;
        let mut processed_documents = 0i64;
        let mut cancelled = false;

        for document_id in &documents {
            if self.cancel_requested(job_id).await? {
                cancelled = true;
                break;
            }
            let document_failed = self
                .process_document(
                    job_id,
                    &vector_index_name,
                    document_id,
                    &job.collection_id,
                    &job.group_id,
                    &configs,
                    &mut cancelled,
                )
                .await;

            match document_failed {
                Ok(failed) => {
                    if failed {
                        failed_documents += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!(job_id, document_id, error = %e, "document extraction failed");
                    failed_documents += 1;
                }
            }
            processed_documents += 1;
            sqlx::query("UPDATE extraction_jobs SET processed_documents = ?1, failed_documents = ?2 WHERE id = ?3")
                .bind(processed_documents)
                .bind(failed_documents)
                .bind(job_id)
                .execute(&self.pool)
                .await?;

            if cancelled {
                break;
            }
        }

        let (status, error_details) = if cancelled {
            (JobStatus::Failed, Some("stopped by user".to_string()))
        } else if failed_documents == 0 {
            (JobStatus::Completed, None)
        } else {
            (JobStatus::Failed, Some(format!("{} of {} documents failed", failed_documents, documents.len())))
        };

        sqlx::query("UPDATE extraction_jobs SET status = ?1, error_details = ?2, completed_at = ?3 WHERE id = ?4")
            .bind(status.as_str())
            .bind(&error_details)
            .bind(now_ts())
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        tracing::info!(job_id, status = status.as_str(), failed_documents, "extraction job finished");
        Ok(())
    }

    /// Runs every configuration against one document. Returns `Ok(true)` if
    /// the document should count as failed (its configurations all fell
    /// back to sentinels, no unrecoverable error). An `Err` return means an
    /// infrastructure error broke the document's processing outright.
    #[allow(clippy::too_many_arguments)]
    async fn process_document(
        &self,
        job_id: &str,
        vector_index_name: &str,
        document_id: &str,
        collection_id: &str,
        group_id: &str,
        configs: &[crate::models::MetadataConfiguration],
        cancelled: &mut bool,
    ) -> Result<bool> {
        let doc_row = sqlx::query("SELECT display_name FROM source_documents WHERE id = ?1")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PipelineError::not_found(format!("document {}", document_id)))?;
        let display_name: String = doc_row.get("display_name");

        let mut any_hard_error = false;

        for config in configs {
            if self.cancel_requested(job_id).await? {
                *cancelled = true;
                break;
            }

            let outcome = self
                .extract_one(vector_index_name, &display_name, &config.extraction_prompt, config.validation_rules.as_ref())
                .await;

            let (value, service_unavailable) = match outcome {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(document_id, config = %config.name, error = %e, "extraction configuration failed");
                    any_hard_error = true;
                    tokio::time::sleep(self.error_delay).await;
                    continue;
                }
            };
            if service_unavailable {
                any_hard_error = true;
            }

            sqlx::query(
                r#"
                INSERT INTO extracted_metadata (collection_id, document_id, group_id, metadata_name, extraction_job_id, extracted_value, extracted_by, extracted_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7)
                ON CONFLICT(collection_id, document_id, group_id, metadata_name)
                DO UPDATE SET extracted_value = excluded.extracted_value, extraction_job_id = excluded.extraction_job_id, extracted_at = excluded.extracted_at
                "#,
            )
            .bind(collection_id)
            .bind(document_id)
            .bind(group_id)
            .bind(&config.name)
            .bind(job_id)
            .bind(&value)
            .bind(now_ts())
            .execute(&self.pool)
            .await?;

            tokio::time::sleep(self.inter_call_delay).await;
        }

        if let Some(doc_status) = document_status(&self.pool, document_id).await? {
            if doc_status == DocumentStatus::Ready {
                // metadata_extracted flips true regardless of per-field sentinels.
                sqlx::query("UPDATE source_documents SET metadata_extracted = 1, updated_at = ?1 WHERE id = ?2")
                    .bind(now_ts())
                    .bind(document_id)
                    .execute(&self.pool)
                    .await?;
            }
        }

        Ok(any_hard_error)
    }

    /// Retrieval + extraction for one (document, configuration) pair.
    /// Returns a sentinel string rather than an `Err` whenever the failure
    /// mode is "no good answer", so the job can keep going; only
    /// infrastructure errors (DB, embedding, vector index) propagate. The
    /// second element is `true` when the value is the `Service Unavailable`
    /// fallback from retry exhaustion — that still counts as the document
    /// failing (spec: "any other exception increments `failed_documents` at
    /// the document level once"), unlike a genuine `Not Found`/validation
    /// sentinel.
    async fn extract_one(
        &self,
        vector_index_name: &str,
        display_name: &str,
        extraction_prompt: &str,
        validation_rules: Option<&serde_json::Value>,
    ) -> Result<(String, bool)> {
        let rewritten = self.query_rewriter.rewrite(extraction_prompt).await?;
        let query_vector = self.summarizer.embed(&rewritten).await?;
        let filter = QueryFilter::new().eq("source_document_name", display_name);
        let results = self
            .vector_index
            .query(vector_index_name, &query_vector, self.retrieval_k as usize, &filter)
            .await?;

        let mut chunks = Vec::with_capacity(results.len());
        for result in &results {
            if let Some(chunk_id) = result.payload.get("chunk_id").and_then(|v| v.as_str()) {
                let row = sqlx::query("SELECT summary, original_text FROM document_chunks WHERE id = ?1")
                    .bind(chunk_id)
                    .fetch_optional(&self.pool)
                    .await?;
                if let Some(row) = row {
                    let summary: String = row.get("summary");
                    chunks.push(summary);
                }
            }
        }

        let raw = self.extract_with_retry(extraction_prompt, &chunks).await;
        // A Service-Unavailable fallback bypasses validation just like
        // `Not Found` does: it isn't an extracted value, so there's nothing
        // for the validation regex/default to apply to.
        match raw {
            Ok(v) => {
                let normalized = sentinels::normalize_extracted_value(&v);
                Ok((apply_validation(&normalized, validation_rules), false))
            }
            Err(_) => Ok((SERVICE_UNAVAILABLE.to_string(), true)),
        }
    }

    /// Retries on HTTP 503 with a fixed `[2s, 4s, 8s]` schedule, bounded by
    /// `max_retries`. Any other error surfaces immediately.
    async fn extract_with_retry(&self, extraction_prompt: &str, chunks: &[String]) -> Result<String> {
        let schedule = [2u64, 4, 8];
        let mut attempt = 0u32;
        loop {
            match self.extractor.extract(extraction_prompt, chunks).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let is_503 = e.to_string().contains("503") || e.to_string().to_lowercase().contains("service unavailable");
                    if !is_503 || attempt >= self.max_retries {
                        return Err(e);
                    }
                    let delay = schedule.get(attempt as usize).copied().unwrap_or(8);
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// A regex under `validation_rules.regex` that fails to match yields the
/// `Invalid Format` sentinel (or `validation_rules.default` if set).
fn apply_validation(value: &str, validation_rules: Option<&serde_json::Value>) -> String {
    let Some(rules) = validation_rules else {
        return value.to_string();
    };
    if value == sentinels::NOT_FOUND {
        return value.to_string();
    }
    let Some(pattern) = rules.get("regex").and_then(|v| v.as_str()) else {
        return value.to_string();
    };
    let Ok(re) = Regex::new(pattern) else {
        return value.to_string();
    };
    if re.is_match(value) {
        value.to_string()
    } else if let Some(default) = rules.get("default").and_then(|v| v.as_str()) {
        default.to_string()
    } else {
        INVALID_FORMAT.to_string()
    }
}

async fn document_status(pool: &SqlitePool, document_id: &str) -> Result<Option<DocumentStatus>> {
    let status: Option<String> = sqlx::query_scalar("SELECT status FROM source_documents WHERE id = ?1")
        .bind(document_id)
        .fetch_optional(pool)
        .await?;
    Ok(status.and_then(|s| DocumentStatus::parse(&s)))
}

pub async fn list_extracted_metadata(
    pool: &SqlitePool,
    collection_id: &str,
    group_id: Option<&str>,
    document_id: Option<&str>,
) -> Result<Vec<crate::models::ExtractedMetadata>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM extracted_metadata
        WHERE collection_id = ?1
        AND (?2 IS NULL OR group_id = ?2)
        AND (?3 IS NULL OR document_id = ?3)
        ORDER BY document_id ASC, metadata_name ASC
        "#,
    )
    .bind(collection_id)
    .bind(group_id)
    .bind(document_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| crate::models::ExtractedMetadata {
            collection_id: row.get("collection_id"),
            document_id: row.get("document_id"),
            group_id: row.get("group_id"),
            metadata_name: row.get("metadata_name"),
            extraction_job_id: row.get("extraction_job_id"),
            extracted_value: row.get("extracted_value"),
            extracted_by: row.get("extracted_by"),
            extracted_at: row.get("extracted_at"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{DeterministicExtractor, TemplateQueryRewriter};
    use crate::summarizer::DeterministicSummarizer;
    use crate::vector_index::{InMemoryVectorIndex, VectorPoint};

    async fn setup() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::migrate::run_migrations_on(&pool).await.unwrap();
        pool
    }

    async fn seed_ready_document(pool: &SqlitePool, id: &str, display_name: &str, chunk_text: &str) {
        let now = now_ts();
        sqlx::query(
            "INSERT INTO source_documents (id, display_name, source_uri, status, metadata_extracted, created_at, updated_at) VALUES (?1, ?2, 'u', 'READY', 0, ?3, ?3)",
        )
        .bind(id)
        .bind(display_name)
        .bind(now)
        .execute(pool)
        .await
        .unwrap();

        sqlx::query(
            "INSERT INTO document_chunks (id, document_id, chunk_index, title, summary, original_text, has_table, chunk_metadata) VALUES (?1, ?2, 0, 'T', ?3, ?3, 0, '{}')",
        )
        .bind(format!("{}-c0", id))
        .bind(id)
        .bind(chunk_text)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn end_to_end_extraction_populates_metadata() {
        let pool = setup().await;
        seed_ready_document(&pool, "doc-1", "Filing A", "The dosage amount is 50mg taken daily.").await;

        let collection = crate::collections::create_collection(&pool, "Filings", None, None).await.unwrap();
        crate::collections::add_documents_to_collection(&pool, &collection.id, &["doc-1".to_string()]).await.unwrap();
        sqlx::query("UPDATE collections SET vector_index_name = 'filings_idx' WHERE id = ?1")
            .bind(&collection.id)
            .execute(&pool)
            .await
            .unwrap();

        let vector_index: Arc<dyn VectorIndex> = Arc::new(InMemoryVectorIndex::new());
        let summarizer: Arc<dyn Summarizer> = Arc::new(DeterministicSummarizer::new(8));
        vector_index.ensure_collection("filings_idx", 8).await.unwrap();
        let embedding = summarizer.embed("The dosage amount is 50mg taken daily.").await.unwrap();
        vector_index
            .upsert(
                "filings_idx",
                vec![VectorPoint {
                    id: Uuid::new_v4().to_string(),
                    vector: embedding,
                    payload: serde_json::json!({
                        "source_document_name": "Filing A",
                        "document_id": "doc-1",
                        "chunk_id": "doc-1-c0",
                        "chunk_title": "T",
                        "has_table": false,
                    }),
                }],
            )
            .await
            .unwrap();

        let group = groups::create_metadata_group(&pool, "Dosage Fields", None, None, vec![], None).await.unwrap();
        groups::create_metadata_configuration(
            &pool,
            "dosage",
            None,
            crate::models::ConfigDataType::Text,
            "What is the dosage amount?",
            None,
            None,
            &[group.id.clone()],
        )
        .await
        .unwrap();

        let coordinator = ExtractionJobCoordinator::new(
            pool.clone(),
            vector_index,
            summarizer,
            Arc::new(TemplateQueryRewriter),
            Arc::new(DeterministicExtractor),
            25,
            Duration::from_millis(1),
            Duration::from_millis(1),
            3,
        );

        let job_id = coordinator.start_extraction_job(&collection.id, &group.id, None).await.unwrap();
        coordinator.run_job(&job_id).await.unwrap();

        let job = get_extraction_job(&pool, &job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.failed_documents, 0);

        let rows = list_extracted_metadata(&pool, &collection.id, None, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].extracted_value.to_lowercase().contains("dosage"));
    }

    /// An extractor that always fails with a 503, to drive
    /// `extract_with_retry` to exhaustion deterministically.
    struct AlwaysUnavailableExtractor;

    #[async_trait::async_trait]
    impl crate::extractor::Extractor for AlwaysUnavailableExtractor {
        async fn extract(&self, _extraction_prompt: &str, _context_chunks: &[String]) -> Result<String> {
            anyhow::bail!("service unavailable (503)")
        }
    }

    /// S4: a (document, configuration) pair whose extractor call exhausts
    /// its 503 retries stores the `Service Unavailable` sentinel for that
    /// row, and counts the document as failed — not completed.
    #[tokio::test]
    async fn service_unavailable_exhaustion_fails_the_document() {
        let pool = setup().await;
        seed_ready_document(&pool, "doc-1", "Filing A", "The dosage amount is 50mg taken daily.").await;

        let collection = crate::collections::create_collection(&pool, "Filings", None, None).await.unwrap();
        crate::collections::add_documents_to_collection(&pool, &collection.id, &["doc-1".to_string()]).await.unwrap();
        sqlx::query("UPDATE collections SET vector_index_name = 'filings_idx' WHERE id = ?1")
            .bind(&collection.id)
            .execute(&pool)
            .await
            .unwrap();

        let vector_index: Arc<dyn VectorIndex> = Arc::new(InMemoryVectorIndex::new());
        let summarizer: Arc<dyn Summarizer> = Arc::new(DeterministicSummarizer::new(8));
        vector_index.ensure_collection("filings_idx", 8).await.unwrap();
        let embedding = summarizer.embed("The dosage amount is 50mg taken daily.").await.unwrap();
        vector_index
            .upsert(
                "filings_idx",
                vec![VectorPoint {
                    id: Uuid::new_v4().to_string(),
                    vector: embedding,
                    payload: serde_json::json!({
                        "source_document_name": "Filing A",
                        "document_id": "doc-1",
                        "chunk_id": "doc-1-c0",
                        "chunk_title": "T",
                        "has_table": false,
                    }),
                }],
            )
            .await
            .unwrap();

        let group = groups::create_metadata_group(&pool, "Dosage Fields", None, None, vec![], None).await.unwrap();
        groups::create_metadata_configuration(
            &pool,
            "dosage",
            None,
            crate::models::ConfigDataType::Text,
            "What is the dosage amount?",
            None,
            None,
            &[group.id.clone()],
        )
        .await
        .unwrap();

        let coordinator = ExtractionJobCoordinator::new(
            pool.clone(),
            vector_index,
            summarizer,
            Arc::new(TemplateQueryRewriter),
            Arc::new(AlwaysUnavailableExtractor),
            25,
            Duration::from_millis(1),
            Duration::from_millis(1),
            1, // max_retries=1: one retry (2s schedule) then exhaustion
        );

        let job_id = coordinator.start_extraction_job(&collection.id, &group.id, None).await.unwrap();
        coordinator.run_job(&job_id).await.unwrap();

        let job = get_extraction_job(&pool, &job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failed_documents, 1);

        let rows = list_extracted_metadata(&pool, &collection.id, None, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].extracted_value, sentinels::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn validation_falls_back_to_invalid_format() {
        let rules = serde_json::json!({ "regex": r"^\d{4}-\d{2}-\d{2}$" });
        assert_eq!(apply_validation("not-a-date", Some(&rules)), INVALID_FORMAT);
        assert_eq!(apply_validation("2024-03-15", Some(&rules)), "2024-03-15");
    }

    #[test]
    fn validation_uses_configured_default_on_mismatch() {
        let rules = serde_json::json!({ "regex": r"^\d+$", "default": "0" });
        assert_eq!(apply_validation("abc", Some(&rules)), "0");
    }

    #[test]
    fn not_found_bypasses_validation() {
        let rules = serde_json::json!({ "regex": r"^\d+$" });
        assert_eq!(apply_validation(sentinels::NOT_FOUND, Some(&rules)), sentinels::NOT_FOUND);
    }
}
