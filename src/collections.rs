//! Collection CRUD: user-curated bundles of documents plus their
//! per-collection membership state.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{now_ts, Collection, CollectionMembership, MembershipIndexingStatus};

fn row_to_collection(row: &sqlx::sqlite::SqliteRow) -> Collection {
    Collection {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        vector_index_name: row.get("vector_index_name"),
        documents_total: row.get("documents_total"),
        documents_indexed: row.get("documents_indexed"),
        documents_failed: row.get("documents_failed"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_membership(row: &sqlx::sqlite::SqliteRow) -> CollectionMembership {
    let status_str: String = row.get("indexing_status");
    CollectionMembership {
        collection_id: row.get("collection_id"),
        document_id: row.get("document_id"),
        indexing_status: MembershipIndexingStatus::parse(&status_str).unwrap_or(MembershipIndexingStatus::Pending),
        indexing_progress: row.get("indexing_progress"),
        indexed_at: row.get("indexed_at"),
        error_message: row.get("error_message"),
        vector_point_id: row.get("vector_point_id"),
    }
}

pub async fn create_collection(pool: &SqlitePool, name: &str, description: Option<&str>, created_by: Option<&str>) -> Result<Collection> {
    let existing: Option<String> = sqlx::query_scalar("SELECT id FROM collections WHERE name = ?1")
        .bind(name)
        .fetch_optional(pool)
        .await?;
    if existing.is_some() {
        return Err(PipelineError::conflict(format!("collection '{}' already exists", name)));
    }

    let id = Uuid::new_v4().to_string();
    let now = now_ts();
    sqlx::query(
        r#"
        INSERT INTO collections (id, name, description, vector_index_name, documents_total, documents_indexed, documents_failed, created_by, created_at, updated_at)
        VALUES (?1, ?2, ?3, NULL, 0, 0, 0, ?4, ?5, ?5)
        "#,
    )
    .bind(&id)
    .bind(name)
    .bind(description)
    .bind(created_by)
    .bind(now)
    .execute(pool)
    .await?;

    get_collection(pool, &id).await
}

pub async fn get_collection(pool: &SqlitePool, id: &str) -> Result<Collection> {
    let row = sqlx::query("SELECT * FROM collections WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| PipelineError::not_found(format!("collection {}", id)))?;
    Ok(row_to_collection(&row))
}

/// Adds documents to a collection, creating `pending` memberships for any
/// not already a member. Returns the number of memberships now present
/// (new + pre-existing) among the requested ids that exist as documents.
pub async fn add_documents_to_collection(pool: &SqlitePool, collection_id: &str, document_ids: &[String]) -> Result<usize> {
    get_collection(pool, collection_id).await?;

    let mut count = 0usize;
    for doc_id in document_ids {
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM source_documents WHERE id = ?1")
            .bind(doc_id)
            .fetch_optional(pool)
            .await?;
        if exists.is_none() {
            continue;
        }
        sqlx::query(
            r#"
            INSERT INTO collection_memberships (collection_id, document_id, indexing_status, indexing_progress)
            VALUES (?1, ?2, 'pending', 0)
            ON CONFLICT(collection_id, document_id) DO NOTHING
            "#,
        )
        .bind(collection_id)
        .bind(doc_id)
        .execute(pool)
        .await?;
        count += 1;
    }

    sqlx::query(
        "UPDATE collections SET documents_total = (SELECT COUNT(*) FROM collection_memberships WHERE collection_id = ?1), updated_at = ?2 WHERE id = ?1",
    )
    .bind(collection_id)
    .bind(now_ts())
    .execute(pool)
    .await?;

    Ok(count)
}

pub async fn get_membership(pool: &SqlitePool, collection_id: &str, document_id: &str) -> Result<Option<CollectionMembership>> {
    let row = sqlx::query("SELECT * FROM collection_memberships WHERE collection_id = ?1 AND document_id = ?2")
        .bind(collection_id)
        .bind(document_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| row_to_membership(&r)))
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
    async fn create_collection_rejects_duplicate_name() {
        let pool = setup().await;
        create_collection(&pool, "Filings 2025", None, None).await.unwrap();
        let err = create_collection(&pool, "Filings 2025", None, None).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn add_documents_skips_unknown_ids_and_dedupes() {
        let pool = setup().await;
        let collection = create_collection(&pool, "Filings", None, None).await.unwrap();
        let now = now_ts();
        sqlx::query(
            "INSERT INTO source_documents (id, display_name, source_uri, status, metadata_extracted, created_at, updated_at) VALUES ('d1', 'd1', 'u', 'PENDING', 0, ?1, ?1)",
        )
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();

        let count = add_documents_to_collection(&pool, &collection.id, &["d1".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(count, 1);

        let membership = get_membership(&pool, &collection.id, "d1").await.unwrap();
        assert!(membership.is_some());
        assert!(get_membership(&pool, &collection.id, "missing").await.unwrap().is_none());
    }
}
