//! Ingestion Worker Pool.
//!
//! Drives `PENDING` documents through PROCESSING → DOCUMENT_STORED,
//! claiming one row at a time via a compare-and-set `UPDATE ... RETURNING`
//! so concurrent workers never process the same document twice. Indexing
//! (DOCUMENT_STORED → INDEXING → READY) is a separate step driven by
//! [`crate::indexing`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use crate::blob_store::BlobStore;
use crate::chunk::{chunk_markdown, DocumentTextExtractor};
use crate::models::{now_ts, DocumentStatus, SourceDocument};
use crate::state_machine::is_allowed;
use crate::summarizer::{summarize_document, SummarizedChunk, Summarizer};

const STATUS_DETAIL_MAX: usize = 500;

fn truncate_detail(msg: &str) -> String {
    if msg.chars().count() <= STATUS_DETAIL_MAX {
        msg.to_string()
    } else {
        let truncated: String = msg.chars().take(STATUS_DETAIL_MAX).collect();
        format!("{}...", truncated)
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> SourceDocument {
    let status_str: String = row.get("status");
    SourceDocument {
        id: row.get("id"),
        display_name: row.get("display_name"),
        source_uri: row.get("source_uri"),
        entity_label: row.get("entity_label"),
        status: DocumentStatus::parse(&status_str).unwrap_or(DocumentStatus::Failed),
        status_detail: row.get("status_detail"),
        metadata_extracted: row.get::<i64, _>("metadata_extracted") != 0,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// Claims the oldest `PENDING` document by flipping it to `PROCESSING` in
/// one statement. SQLite serializes writers, so this is race-free even
/// without an explicit transaction: a losing worker's subquery simply
/// finds no matching row, affects nothing, and moves on.
async fn claim_next_pending(pool: &SqlitePool, after_id: Option<&str>) -> Result<Option<SourceDocument>> {
    let now = now_ts();
    let row = if let Some(after) = after_id {
        sqlx::query(
            r#"
            UPDATE source_documents
            SET status = 'PROCESSING', updated_at = ?1
            WHERE id = (
                SELECT id FROM source_documents
                WHERE status = 'PENDING' AND id > ?2
                ORDER BY id ASC
                LIMIT 1
            )
            RETURNING id, display_name, source_uri, entity_label, status, status_detail, metadata_extracted, created_at, updated_at
            "#,
        )
        .bind(now)
        .bind(after)
        .fetch_optional(pool)
        .await?
    } else {
        sqlx::query(
            r#"
            UPDATE source_documents
            SET status = 'PROCESSING', updated_at = ?1
            WHERE id = (
                SELECT id FROM source_documents
                WHERE status = 'PENDING'
                ORDER BY id ASC
                LIMIT 1
            )
            RETURNING id, display_name, source_uri, entity_label, status, status_detail, metadata_extracted, created_at, updated_at
            "#,
        )
        .bind(now)
        .fetch_optional(pool)
        .await?
    };
    Ok(row.map(|r| row_to_document(&r)))
}

async fn set_status(
    pool: &SqlitePool,
    document_id: &str,
    from: DocumentStatus,
    to: DocumentStatus,
    status_detail: Option<&str>,
) -> Result<()> {
    if !is_allowed(from, to) {
        anyhow::bail!("illegal document transition {:?} -> {:?}", from, to);
    }
    sqlx::query("UPDATE source_documents SET status = ?1, status_detail = ?2, updated_at = ?3 WHERE id = ?4")
        .bind(to.as_str())
        .bind(status_detail)
        .bind(now_ts())
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn persist_chunks(pool: &SqlitePool, document_id: &str, chunks: &[SummarizedChunk]) -> Result<()> {
    let mut tx = pool.begin().await?;
    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT INTO document_chunks (id, document_id, chunk_index, title, summary, original_text, has_table, chunk_metadata)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '{}')
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(document_id)
        .bind(chunk.raw.chunk_index)
        .bind(&chunk.title)
        .bind(&chunk.summary)
        .bind(&chunk.raw.text)
        .bind(chunk.raw.has_table as i64)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// One worker's view of the pipeline dependencies, shared (`Arc`) across
/// the whole pool.
pub struct IngestionWorkerPool {
    pool: SqlitePool,
    blob_store: Arc<dyn BlobStore>,
    text_extractor: Arc<dyn DocumentTextExtractor>,
    summarizer: Arc<dyn Summarizer>,
    chunk_size: usize,
    chunk_overlap: usize,
    max_concurrent_chunks: usize,
    summarizer_max_retries: u32,
    per_document_timeout: Duration,
}

impl IngestionWorkerPool {
    pub fn new(
        pool: SqlitePool,
        blob_store: Arc<dyn BlobStore>,
        text_extractor: Arc<dyn DocumentTextExtractor>,
        summarizer: Arc<dyn Summarizer>,
        chunk_size: usize,
        chunk_overlap: usize,
        max_concurrent_chunks: usize,
        summarizer_max_retries: u32,
        per_document_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            blob_store,
            text_extractor,
            summarizer,
            chunk_size,
            chunk_overlap,
            max_concurrent_chunks,
            summarizer_max_retries,
            per_document_timeout,
        }
    }

    /// Runs `workers` concurrent loops, each claiming and processing
    /// documents until no `PENDING` rows remain. Returns the number of
    /// documents this call processed (successfully or not).
    pub async fn run_once(self: &Arc<Self>, workers: usize) -> Result<usize> {
        let mut join_set = tokio::task::JoinSet::new();
        for _ in 0..workers.max(1) {
            let this = self.clone();
            join_set.spawn(async move { this.worker_loop().await });
        }
        let mut total = 0usize;
        while let Some(joined) = join_set.join_next().await {
            total += joined.context("ingestion worker task panicked")??;
        }
        Ok(total)
    }

    async fn worker_loop(&self) -> Result<usize> {
        let mut processed = 0usize;
        loop {
            let doc = match claim_next_pending(&self.pool, None).await? {
                Some(d) => d,
                None => break,
            };
            info!(document_id = %doc.id, "claimed document for ingestion");
            self.process_claimed(doc).await;
            processed += 1;
        }
        Ok(processed)
    }

    async fn process_claimed(&self, doc: SourceDocument) {
        let outcome = tokio::time::timeout(self.per_document_timeout, self.process_inner(&doc)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(document_id = %doc.id, error = %e, "ingestion failed");
                let _ = set_status(
                    &self.pool,
                    &doc.id,
                    DocumentStatus::Processing,
                    DocumentStatus::Failed,
                    Some(&truncate_detail(&e.to_string())),
                )
                .await;
            }
            Err(_elapsed) => {
                warn!(document_id = %doc.id, "ingestion timed out");
                let _ = set_status(
                    &self.pool,
                    &doc.id,
                    DocumentStatus::Processing,
                    DocumentStatus::Failed,
                    Some("Ingestion timed out"),
                )
                .await;
            }
        }
    }

    async fn process_inner(&self, doc: &SourceDocument) -> Result<()> {
        let bytes = self
            .blob_store
            .fetch(&doc.source_uri)
            .await
            .with_context(|| format!("fetching blob for {}", doc.source_uri))?;

        let markdown = self.text_extractor.extract(&bytes).context("extracting document text")?;
        let raw_chunks = chunk_markdown(&markdown, self.chunk_size, self.chunk_overlap);

        if raw_chunks.is_empty() {
            set_status(
                &self.pool,
                &doc.id,
                DocumentStatus::Processing,
                DocumentStatus::Failed,
                Some("No content could be extracted"),
            )
            .await?;
            return Ok(());
        }

        let summarized = summarize_document(
            self.summarizer.clone(),
            raw_chunks,
            self.max_concurrent_chunks,
            self.summarizer_max_retries,
        )
        .await;

        persist_chunks(&self.pool, &doc.id, &summarized)
            .await
            .context("persisting document chunks")?;

        set_status(&self.pool, &doc.id, DocumentStatus::Processing, DocumentStatus::DocumentStored, None).await?;
        info!(document_id = %doc.id, chunk_count = summarized.len(), "document stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summarizer::DeterministicSummarizer;

    struct FixedTextExtractor(String);
    impl DocumentTextExtractor for FixedTextExtractor {
        fn extract(&self, _bytes: &[u8]) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    struct NoopBlobStore;
    #[async_trait::async_trait]
    impl BlobStore for NoopBlobStore {
        async fn fetch(&self, _uri: &str) -> Result<Vec<u8>> {
            Ok(b"ignored".to_vec())
        }
    }

    async fn setup_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            r#"
            CREATE TABLE source_documents (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                source_uri TEXT NOT NULL,
                entity_label TEXT,
                status TEXT NOT NULL DEFAULT 'PENDING',
                status_detail TEXT,
                metadata_extracted INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            r#"
            CREATE TABLE document_chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                title TEXT NOT NULL,
                summary TEXT NOT NULL,
                original_text TEXT NOT NULL,
                has_table INTEGER NOT NULL DEFAULT 0,
                chunk_metadata TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    async fn insert_pending(pool: &SqlitePool, id: &str, uri: &str) {
        let now = now_ts();
        sqlx::query(
            "INSERT INTO source_documents (id, display_name, source_uri, status, metadata_extracted, created_at, updated_at) VALUES (?1, ?2, ?3, 'PENDING', 0, ?4, ?4)",
        )
        .bind(id)
        .bind(id)
        .bind(uri)
        .bind(now)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn claim_flips_one_pending_row_to_processing() {
        let pool = setup_pool().await;
        insert_pending(&pool, "d1", "local:///tmp/a.pdf").await;
        insert_pending(&pool, "d2", "local:///tmp/b.pdf").await;

        let claimed = claim_next_pending(&pool, None).await.unwrap().unwrap();
        assert_eq!(claimed.status, DocumentStatus::Processing);

        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM source_documents WHERE status = 'PENDING'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn claim_returns_none_when_nothing_pending() {
        let pool = setup_pool().await;
        assert!(claim_next_pending(&pool, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_content_transitions_to_failed_with_reason() {
        let pool = setup_pool().await;
        insert_pending(&pool, "d1", "local:///tmp/empty.pdf").await;

        let worker_pool = Arc::new(IngestionWorkerPool::new(
            pool.clone(),
            Arc::new(NoopBlobStore),
            Arc::new(FixedTextExtractor(String::new())),
            Arc::new(DeterministicSummarizer::new(4)),
            500,
            50,
            4,
            1,
            Duration::from_secs(5),
        ));
        worker_pool.run_once(1).await.unwrap();

        let row = sqlx::query("SELECT status, status_detail FROM source_documents WHERE id = 'd1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        let status: String = row.get("status");
        let detail: Option<String> = row.get("status_detail");
        assert_eq!(status, "FAILED");
        assert!(detail.unwrap().contains("No content"));
    }

    #[tokio::test]
    async fn happy_path_stores_chunks_and_advances_status() {
        let pool = setup_pool().await;
        insert_pending(&pool, "d1", "local:///tmp/doc.pdf").await;

        let worker_pool = Arc::new(IngestionWorkerPool::new(
            pool.clone(),
            Arc::new(NoopBlobStore),
            Arc::new(FixedTextExtractor("# Heading\n\nSome body text here.".to_string())),
            Arc::new(DeterministicSummarizer::new(4)),
            500,
            50,
            4,
            1,
            Duration::from_secs(5),
        ));
        worker_pool.run_once(1).await.unwrap();

        let status: String = sqlx::query_scalar("SELECT status FROM source_documents WHERE id = 'd1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, "DOCUMENT_STORED");

        let chunk_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks WHERE document_id = 'd1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(chunk_count, 1);
    }

    #[tokio::test]
    async fn truncate_detail_caps_length() {
        let long = "x".repeat(1000);
        assert!(truncate_detail(&long).chars().count() <= STATUS_DETAIL_MAX + 3);
    }
}
