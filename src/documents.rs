//! Document-level CRUD: upload, status polling, and reprocess (spec §6's
//! `UploadDocument` / `GetDocumentStatus` / `ReprocessDocument`).
//!
//! Upload only creates the `PENDING` row; the [`crate::ingest`] worker pool
//! is what actually drives it forward. Reprocess is the one user action
//! allowed to move a document out of `FAILED` (spec §4.6).

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{now_ts, DocumentStatus, SourceDocument};
use crate::state_machine::is_allowed;

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

/// Registers a document for ingestion: inserts a `PENDING` row and returns
/// it. The blob itself is not fetched here — `source_uri` is resolved
/// later by the [`crate::blob_store::BlobStore`] when a worker claims the
/// document.
pub async fn upload_document(
    pool: &SqlitePool,
    source_uri: &str,
    display_name: &str,
    entity_label: Option<&str>,
) -> Result<SourceDocument> {
    if source_uri.trim().is_empty() {
        return Err(PipelineError::validation("source_uri must not be empty"));
    }

    let id = Uuid::new_v4().to_string();
    let now = now_ts();
    sqlx::query(
        r#"
        INSERT INTO source_documents (id, display_name, source_uri, entity_label, status, status_detail, metadata_extracted, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, 'PENDING', NULL, 0, ?5, ?5)
        "#,
    )
    .bind(&id)
    .bind(display_name)
    .bind(source_uri)
    .bind(entity_label)
    .bind(now)
    .execute(pool)
    .await?;

    get_document(pool, &id).await
}

pub async fn get_document(pool: &SqlitePool, document_id: &str) -> Result<SourceDocument> {
    let row = sqlx::query("SELECT * FROM source_documents WHERE id = ?1")
        .bind(document_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| PipelineError::not_found(format!("document {}", document_id)))?;
    Ok(row_to_document(&row))
}

/// Returns `(status, status_detail, metadata_extracted)` — the projection
/// spec §6's `GetDocumentStatus` promises callers, without pulling the rest
/// of the row.
pub async fn get_document_status(
    pool: &SqlitePool,
    document_id: &str,
) -> Result<(DocumentStatus, Option<String>, bool)> {
    let doc = get_document(pool, document_id).await?;
    Ok((doc.status, doc.status_detail, doc.metadata_extracted))
}

/// Moves a `FAILED` document back to `PENDING` so the ingestion pool picks
/// it up again (spec §4.6's only exit from a terminal `FAILED` state).
pub async fn reprocess_document(pool: &SqlitePool, document_id: &str) -> Result<SourceDocument> {
    let doc = get_document(pool, document_id).await?;
    if !is_allowed(doc.status, DocumentStatus::Pending) {
        return Err(PipelineError::conflict(format!(
            "document {} is in status {} and cannot be reprocessed",
            document_id, doc.status
        )));
    }
    sqlx::query("UPDATE source_documents SET status = 'PENDING', status_detail = NULL, updated_at = ?1 WHERE id = ?2")
        .bind(now_ts())
        .bind(document_id)
        .execute(pool)
        .await?;
    get_document(pool, document_id).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::migrate::run_migrations_on(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn upload_creates_pending_document() {
        let pool = setup().await;
        let doc = upload_document(&pool, "local:///tmp/a.pdf", "Filing A", None).await.unwrap();
        assert_eq!(doc.status, DocumentStatus::Pending);
        assert!(!doc.metadata_extracted);
    }

    #[tokio::test]
    async fn upload_rejects_empty_uri() {
        let pool = setup().await;
        let err = upload_document(&pool, "  ", "Filing A", None).await.unwrap_err();
        assert!(err.to_string().contains("source_uri"));
    }

    #[tokio::test]
    async fn reprocess_requires_failed_status() {
        let pool = setup().await;
        let doc = upload_document(&pool, "local:///tmp/a.pdf", "Filing A", None).await.unwrap();
        let err = reprocess_document(&pool, &doc.id).await.unwrap_err();
        assert!(err.to_string().contains("cannot be reprocessed"));
    }

    #[tokio::test]
    async fn reprocess_moves_failed_back_to_pending() {
        let pool = setup().await;
        let doc = upload_document(&pool, "local:///tmp/a.pdf", "Filing A", None).await.unwrap();
        sqlx::query("UPDATE source_documents SET status = 'FAILED', status_detail = 'boom' WHERE id = ?1")
            .bind(&doc.id)
            .execute(&pool)
            .await
            .unwrap();

        let reprocessed = reprocess_document(&pool, &doc.id).await.unwrap();
        assert_eq!(reprocessed.status, DocumentStatus::Pending);
        assert!(reprocessed.status_detail.is_none());
    }

    #[tokio::test]
    async fn get_status_reports_projection() {
        let pool = setup().await;
        let doc = upload_document(&pool, "local:///tmp/a.pdf", "Filing A", None).await.unwrap();
        let (status, detail, extracted) = get_document_status(&pool, &doc.id).await.unwrap();
        assert_eq!(status, DocumentStatus::Pending);
        assert!(detail.is_none());
        assert!(!extracted);
    }
}
