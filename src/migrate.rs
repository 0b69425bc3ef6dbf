//! Database schema migrations.
//!
//! Creates all tables backing the data model in spec §3 and ensures
//! idempotent execution, so `regdocd migrate` is safe to run against an
//! already-initialized database.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    run_migrations_on(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Schema setup against an already-open pool, so tests and the `migrate`
/// CLI command share one implementation.
pub async fn run_migrations_on(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_documents (
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
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            title TEXT NOT NULL,
            summary TEXT NOT NULL,
            original_text TEXT NOT NULL,
            has_table INTEGER NOT NULL DEFAULT 0,
            chunk_metadata TEXT NOT NULL DEFAULT '{}',
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES source_documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            description TEXT,
            vector_index_name TEXT UNIQUE,
            documents_total INTEGER NOT NULL DEFAULT 0,
            documents_indexed INTEGER NOT NULL DEFAULT 0,
            documents_failed INTEGER NOT NULL DEFAULT 0,
            created_by TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collection_memberships (
            collection_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            indexing_status TEXT NOT NULL DEFAULT 'pending',
            indexing_progress INTEGER NOT NULL DEFAULT 0,
            indexed_at INTEGER,
            error_message TEXT,
            vector_point_id TEXT,
            PRIMARY KEY (collection_id, document_id),
            FOREIGN KEY (collection_id) REFERENCES collections(id),
            FOREIGN KEY (document_id) REFERENCES source_documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS metadata_configurations (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            name_lower TEXT NOT NULL UNIQUE,
            description TEXT,
            data_type TEXT NOT NULL,
            extraction_prompt TEXT NOT NULL,
            extraction_prompt_version INTEGER NOT NULL DEFAULT 1,
            validation_rules TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_by TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS metadata_groups (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            name_lower TEXT NOT NULL UNIQUE,
            description TEXT,
            color TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '[]',
            is_default INTEGER NOT NULL DEFAULT 0,
            created_by TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS group_config_links (
            group_id TEXT NOT NULL,
            config_id TEXT NOT NULL,
            display_order INTEGER NOT NULL,
            added_at INTEGER NOT NULL,
            added_by TEXT,
            PRIMARY KEY (group_id, config_id),
            UNIQUE(group_id, display_order),
            FOREIGN KEY (group_id) REFERENCES metadata_groups(id),
            FOREIGN KEY (config_id) REFERENCES metadata_configurations(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS extraction_jobs (
            id TEXT PRIMARY KEY,
            collection_id TEXT NOT NULL,
            group_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            total_documents INTEGER NOT NULL DEFAULT 0,
            processed_documents INTEGER NOT NULL DEFAULT 0,
            failed_documents INTEGER NOT NULL DEFAULT 0,
            started_at INTEGER,
            completed_at INTEGER,
            created_by TEXT,
            error_details TEXT,
            cancel_requested INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (collection_id) REFERENCES collections(id),
            FOREIGN KEY (group_id) REFERENCES metadata_groups(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS indexing_jobs (
            id TEXT PRIMARY KEY,
            collection_id TEXT NOT NULL,
            job_type TEXT NOT NULL DEFAULT 'index',
            status TEXT NOT NULL DEFAULT 'pending',
            total_documents INTEGER NOT NULL DEFAULT 0,
            processed_documents INTEGER NOT NULL DEFAULT 0,
            failed_documents INTEGER NOT NULL DEFAULT 0,
            started_at INTEGER,
            completed_at INTEGER,
            error_details TEXT,
            FOREIGN KEY (collection_id) REFERENCES collections(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS extracted_metadata (
            collection_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            group_id TEXT NOT NULL,
            metadata_name TEXT NOT NULL,
            extraction_job_id TEXT NOT NULL,
            extracted_value TEXT NOT NULL,
            extracted_by TEXT,
            extracted_at INTEGER NOT NULL,
            PRIMARY KEY (collection_id, document_id, group_id, metadata_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON document_chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_status ON source_documents(status)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_memberships_document_id ON collection_memberships(document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_group_links_config_id ON group_config_links(config_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_extracted_metadata_job ON extracted_metadata(extraction_job_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_extraction_jobs_collection_status ON extraction_jobs(collection_id, status)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_source_documents_source_uri ON source_documents(source_uri)")
        .execute(pool)
        .await?;
    // Partial-unique: at most one group may have is_default = 1 (spec §6),
    // enforced at the database level rather than resting on app discipline.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_metadata_groups_one_default ON metadata_groups(is_default) WHERE is_default = 1",
    )
    .execute(pool)
    .await?;

    // The default metadata group must always exist (invariant 2, §3).
    let default_exists: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM metadata_groups WHERE is_default = 1")
            .fetch_one(pool)
            .await?;
    if !default_exists {
        let now = crate::models::now_ts();
        sqlx::query(
            r#"
            INSERT INTO metadata_groups (id, name, name_lower, description, color, tags, is_default, created_by, created_at, updated_at)
            VALUES (?1, 'Default', 'default', 'Configurations not assigned to any other group', '#6B7280', '[]', 1, NULL, ?2, ?2)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(now)
        .execute(pool)
        .await?;
    }

    Ok(())
}
