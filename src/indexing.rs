//! Indexing Job Coordinator.
//!
//! On request, creates an `IndexingJob` over a set of documents in a
//! collection and dispatches the work to a bounded pool that ensures the
//! collection's vector-store collection exists, re-embeds each document's
//! persisted chunk summaries, upserts them as points, and advances both
//! the `CollectionMembership` row and the document's global `status`.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{now_ts, DocumentStatus, IndexingJob, IndexingJobType, JobStatus};
use crate::state_machine::is_allowed;
use crate::summarizer::Summarizer;
use crate::vector_index::{VectorIndex, VectorPoint};

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> IndexingJob {
    let job_type_str: String = row.get("job_type");
    let status_str: String = row.get("status");
    IndexingJob {
        id: row.get("id"),
        collection_id: row.get("collection_id"),
        job_type: IndexingJobType::parse(&job_type_str).unwrap_or(IndexingJobType::Index),
        status: JobStatus::parse(&status_str).unwrap_or(JobStatus::Pending),
        total_documents: row.get("total_documents"),
        processed_documents: row.get("processed_documents"),
        failed_documents: row.get("failed_documents"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        error_details: row.get("error_details"),
    }
}

/// Spec §6's `GetIndexingJob`.
pub async fn get_indexing_job(pool: &SqlitePool, job_id: &str) -> Result<IndexingJob> {
    let row = sqlx::query("SELECT * FROM indexing_jobs WHERE id = ?1")
        .bind(job_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| PipelineError::not_found(format!("indexing job {}", job_id)))?;
    Ok(row_to_job(&row))
}

/// Derives a vector-store collection name from a human collection name,
/// suffixed with the collection id to guarantee uniqueness: lowercase,
/// non-word runs collapse to a single underscore, trimmed of leading and
/// trailing underscores.
pub fn sanitize_vector_index_name(collection_name: &str, collection_id: &str) -> String {
    let mut out = String::new();
    let mut last_was_sep = false;
    for ch in collection_name.to_lowercase().chars() {
        if ch.is_alphanumeric() {
            out.push(ch);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = out.trim_matches('_');
    let short_id: String = collection_id.chars().take(8).collect();
    if trimmed.is_empty() {
        format!("collection_{}", short_id)
    } else {
        format!("{}_{}", trimmed, short_id)
    }
}

pub struct IndexingJobCoordinator {
    pool: SqlitePool,
    vector_index: Arc<dyn VectorIndex>,
    summarizer: Arc<dyn Summarizer>,
}

impl IndexingJobCoordinator {
    pub fn new(pool: SqlitePool, vector_index: Arc<dyn VectorIndex>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self { pool, vector_index, summarizer }
    }

    /// Validates the collection, derives/persists `vector_index_name` if
    /// unset, filters `document_ids` to those present, creates the job
    /// record, and returns its id. Does not run the job itself — callers
    /// drive execution with [`Self::run_job`].
    pub async fn start_indexing_job(
        &self,
        collection_id: &str,
        document_ids: &[String],
        job_type: IndexingJobType,
    ) -> Result<String> {
        let vector_index_name: Option<String> =
            sqlx::query_scalar("SELECT vector_index_name FROM collections WHERE id = ?1")
                .bind(collection_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| PipelineError::not_found(format!("collection {}", collection_id)))?;

        let collection_name: String = sqlx::query_scalar("SELECT name FROM collections WHERE id = ?1")
            .bind(collection_id)
            .fetch_one(&self.pool)
            .await?;

        let vector_index_name = match vector_index_name {
            Some(name) => name,
            None => {
                let derived = sanitize_vector_index_name(&collection_name, collection_id);
                sqlx::query("UPDATE collections SET vector_index_name = ?1, updated_at = ?2 WHERE id = ?3")
                    .bind(&derived)
                    .bind(now_ts())
                    .execute(&self.pool)
                    .await?;
                derived
            }
        };

        let mut present_ids = Vec::with_capacity(document_ids.len());
        for doc_id in document_ids {
            let exists: Option<String> = sqlx::query_scalar("SELECT id FROM source_documents WHERE id = ?1")
                .bind(doc_id)
                .fetch_optional(&self.pool)
                .await?;
            match exists {
                Some(id) => present_ids.push(id),
                None => warn!(document_id = %doc_id, "dropping unknown document id from indexing job"),
            }
        }

        let job_id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO indexing_jobs (id, collection_id, job_type, status, total_documents, processed_documents, failed_documents)
            VALUES (?1, ?2, ?3, 'pending', ?4, 0, 0)
            "#,
        )
        .bind(&job_id)
        .bind(collection_id)
        .bind(job_type.as_str())
        .bind(present_ids.len() as i64)
        .execute(&self.pool)
        .await?;

        for doc_id in &present_ids {
            sqlx::query(
                r#"
                INSERT INTO collection_memberships (collection_id, document_id, indexing_status, indexing_progress)
                VALUES (?1, ?2, 'pending', 0)
                ON CONFLICT(collection_id, document_id) DO UPDATE SET indexing_status = 'pending', indexing_progress = 0
                "#,
            )
            .bind(collection_id)
            .bind(doc_id)
            .execute(&self.pool)
            .await?;
        }

        info!(job_id = %job_id, collection_id, vector_index_name, total = present_ids.len(), "indexing job created");
        Ok(job_id)
    }

    /// Executes a previously created job to completion. Documents are
    /// indexed concurrently; within one document, chunks are upserted as a
    /// single batch.
    pub async fn run_job(self: &Arc<Self>, job_id: &str) -> Result<()> {
        let job_row = sqlx::query("SELECT collection_id, job_type FROM indexing_jobs WHERE id = ?1")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        let collection_id: String = job_row.get("collection_id");
        let job_type_str: String = job_row.get("job_type");
        let job_type = IndexingJobType::parse(&job_type_str).unwrap_or(IndexingJobType::Index);

        sqlx::query("UPDATE indexing_jobs SET status = 'processing', started_at = ?1 WHERE id = ?2")
            .bind(now_ts())
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        let vector_index_name: String = sqlx::query_scalar("SELECT vector_index_name FROM collections WHERE id = ?1")
            .bind(&collection_id)
            .fetch_one(&self.pool)
            .await?;

        self.vector_index
            .ensure_collection(&vector_index_name, self.summarizer.embedding_dims())
            .await
            .context("ensuring vector collection")?;

        let document_ids: Vec<String> = sqlx::query_scalar(
            "SELECT document_id FROM collection_memberships WHERE collection_id = ?1 AND indexing_status = 'pending'",
        )
        .bind(&collection_id)
        .fetch_all(&self.pool)
        .await?;

        let mut join_set = tokio::task::JoinSet::new();
        for doc_id in document_ids {
            let this = self.clone();
            let collection_id = collection_id.clone();
            let vector_index_name = vector_index_name.clone();
            join_set.spawn(async move { this.index_one_document(&collection_id, &doc_id, &vector_index_name, job_type).await });
        }

        let mut failed = 0i64;
        let mut processed = 0i64;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(())) => processed += 1,
                Ok(Err(e)) => {
                    warn!(error = %e, "document indexing failed");
                    failed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "indexing task panicked");
                    failed += 1;
                }
            }
            sqlx::query("UPDATE indexing_jobs SET processed_documents = ?1, failed_documents = ?2 WHERE id = ?3")
                .bind(processed)
                .bind(failed)
                .bind(job_id)
                .execute(&self.pool)
                .await?;
        }

        let status = if failed == 0 { JobStatus::Completed } else { JobStatus::Failed };
        sqlx::query("UPDATE indexing_jobs SET status = ?1, completed_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(now_ts())
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            UPDATE collections SET
                documents_indexed = (SELECT COUNT(*) FROM collection_memberships WHERE collection_id = ?1 AND indexing_status = 'indexed'),
                documents_failed = (SELECT COUNT(*) FROM collection_memberships WHERE collection_id = ?1 AND indexing_status = 'failed'),
                updated_at = ?2
            WHERE id = ?1
            "#,
        )
        .bind(&collection_id)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;

        info!(job_id, processed, failed, "indexing job finished");
        Ok(())
    }

    async fn index_one_document(
        &self,
        collection_id: &str,
        document_id: &str,
        vector_index_name: &str,
        job_type: IndexingJobType,
    ) -> Result<()> {
        let result = self.index_one_document_inner(collection_id, document_id, vector_index_name, job_type).await;
        match &result {
            Ok(()) => {
                sqlx::query(
                    "UPDATE collection_memberships SET indexing_status = 'indexed', indexing_progress = 100, indexed_at = ?1, error_message = NULL WHERE collection_id = ?2 AND document_id = ?3",
                )
                .bind(now_ts())
                .bind(collection_id)
                .bind(document_id)
                .execute(&self.pool)
                .await?;
            }
            Err(e) => {
                sqlx::query(
                    "UPDATE collection_memberships SET indexing_status = 'failed', error_message = ?1 WHERE collection_id = ?2 AND document_id = ?3",
                )
                .bind(e.to_string())
                .bind(collection_id)
                .bind(document_id)
                .execute(&self.pool)
                .await?;
                let current = self.document_status(document_id).await?;
                if is_allowed(current, DocumentStatus::Failed) {
                    self.set_document_status(document_id, DocumentStatus::Failed).await?;
                }
            }
        }
        result
    }

    async fn document_status(&self, document_id: &str) -> Result<DocumentStatus> {
        let status_str: String = sqlx::query_scalar("SELECT status FROM source_documents WHERE id = ?1")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(DocumentStatus::parse(&status_str).unwrap_or(DocumentStatus::Failed))
    }

    async fn set_document_status(&self, document_id: &str, status: DocumentStatus) -> Result<()> {
        sqlx::query("UPDATE source_documents SET status = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(now_ts())
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn index_one_document_inner(
        &self,
        collection_id: &str,
        document_id: &str,
        vector_index_name: &str,
        _job_type: IndexingJobType,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE collection_memberships SET indexing_status = 'indexing' WHERE collection_id = ?1 AND document_id = ?2",
        )
        .bind(collection_id)
        .bind(document_id)
        .execute(&self.pool)
        .await?;

        let current = self.document_status(document_id).await?;
        if is_allowed(current, DocumentStatus::Indexing) {
            self.set_document_status(document_id, DocumentStatus::Indexing).await?;
        }

        let display_name: String = sqlx::query_scalar("SELECT display_name FROM source_documents WHERE id = ?1")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        let entity_label: Option<String> = sqlx::query_scalar("SELECT entity_label FROM source_documents WHERE id = ?1")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query(
            "SELECT id, chunk_index, title, summary, has_table FROM document_chunks WHERE document_id = ?1 ORDER BY chunk_index ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        let mut points = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk_id: String = row.get("id");
            let title: String = row.get("title");
            let summary: String = row.get("summary");
            let has_table: i64 = row.get("has_table");

            let embedding = self.summarizer.embed(&summary).await.context("embedding chunk summary")?;
            points.push(VectorPoint {
                id: Uuid::new_v4().to_string(),
                vector: embedding,
                payload: serde_json::json!({
                    "source_document_name": display_name,
                    "document_id": document_id,
                    "chunk_id": chunk_id,
                    "chunk_title": title,
                    "has_table": has_table != 0,
                    "entity_label": entity_label,
                }),
            });
        }

        self.vector_index.upsert(vector_index_name, points).await.context("upserting vector points")?;

        let current = self.document_status(document_id).await?;
        if is_allowed(current, DocumentStatus::Ready) {
            self.set_document_status(document_id, DocumentStatus::Ready).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_collapses_non_word_runs() {
        let name = sanitize_vector_index_name("FDA 10-K Filings!!", "abcdefgh-1234");
        assert!(name.starts_with("fda_10_k_filings_"));
        assert!(!name.contains("__"));
    }

    #[test]
    fn sanitize_handles_empty_name() {
        let name = sanitize_vector_index_name("###", "abcdefgh-1234");
        assert!(name.starts_with("collection_"));
    }

    #[tokio::test]
    async fn end_to_end_index_job_advances_document_to_ready() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::migrate::run_migrations_on(&pool).await.unwrap();

        let now = now_ts();
        sqlx::query(
            "INSERT INTO source_documents (id, display_name, source_uri, status, metadata_extracted, created_at, updated_at) VALUES ('d1', 'doc one', 'local:///x.pdf', 'DOCUMENT_STORED', 0, ?1, ?1)",
        )
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO document_chunks (id, document_id, chunk_index, title, summary, original_text, has_table, chunk_metadata) VALUES ('c1', 'd1', 0, 'T', 'S', 'orig', 0, '{}')",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO collections (id, name, description, documents_total, documents_indexed, documents_failed, created_at, updated_at) VALUES ('col1', 'My Collection', NULL, 1, 0, 0, ?1, ?1)",
        )
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();

        let vector_index: Arc<dyn VectorIndex> = Arc::new(crate::vector_index::InMemoryVectorIndex::new());
        let summarizer: Arc<dyn Summarizer> = Arc::new(crate::summarizer::DeterministicSummarizer::new(4));
        let coordinator = Arc::new(IndexingJobCoordinator::new(pool.clone(), vector_index, summarizer));

        let job_id = coordinator
            .start_indexing_job("col1", &["d1".to_string()], IndexingJobType::Index)
            .await
            .unwrap();
        coordinator.run_job(&job_id).await.unwrap();

        let status: String = sqlx::query_scalar("SELECT status FROM source_documents WHERE id = 'd1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, "READY");

        let job_status: String = sqlx::query_scalar("SELECT status FROM indexing_jobs WHERE id = ?1")
            .bind(&job_id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(job_status, "completed");

        let (indexed, failed): (i64, i64) =
            sqlx::query_as("SELECT documents_indexed, documents_failed FROM collections WHERE id = 'col1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(indexed, 1);
        assert_eq!(failed, 0);
    }
}
