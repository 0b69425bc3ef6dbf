//! Configuration & Group Manager.
//!
//! CRUD over [`MetadataConfiguration`], [`MetadataGroup`], and their
//! many-to-many [`GroupConfigLink`] with per-group display ordering,
//! enforcing the invariants in §3 of the data model: every configuration
//! belongs to at least one group, exactly one group is the default, and a
//! group's link `display_order` values form a dense `0..n` permutation.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{now_ts, ConfigDataType, MetadataConfiguration, MetadataGroup};

const DEFAULT_GROUP_COLOR: &str = "#6B7280";

fn row_to_configuration(row: &sqlx::sqlite::SqliteRow) -> MetadataConfiguration {
    let data_type_str: String = row.get("data_type");
    let validation_rules_str: Option<String> = row.get("validation_rules");
    MetadataConfiguration {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        data_type: ConfigDataType::parse(&data_type_str).unwrap_or(ConfigDataType::Text),
        extraction_prompt: row.get("extraction_prompt"),
        extraction_prompt_version: row.get("extraction_prompt_version"),
        validation_rules: validation_rules_str.and_then(|s| serde_json::from_str(&s).ok()),
        is_active: row.get::<i64, _>("is_active") != 0,
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_group(row: &sqlx::sqlite::SqliteRow) -> MetadataGroup {
    let tags_str: String = row.get("tags");
    MetadataGroup {
        id: row.get("id"),
        name: row.get("name"),
        description: row.get("description"),
        color: row.get("color"),
        tags: serde_json::from_str(&tags_str).unwrap_or_default(),
        is_default: row.get::<i64, _>("is_default") != 0,
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub async fn get_configuration(pool: &SqlitePool, id: &str) -> Result<MetadataConfiguration> {
    let row = sqlx::query("SELECT * FROM metadata_configurations WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| PipelineError::not_found(format!("configuration {}", id)))?;
    Ok(row_to_configuration(&row))
}

pub async fn get_group(pool: &SqlitePool, id: &str) -> Result<MetadataGroup> {
    let row = sqlx::query("SELECT * FROM metadata_groups WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| PipelineError::not_found(format!("group {}", id)))?;
    Ok(row_to_group(&row))
}

async fn default_group_id(pool: &SqlitePool) -> Result<String> {
    sqlx::query_scalar("SELECT id FROM metadata_groups WHERE is_default = 1")
        .fetch_one(pool)
        .await
        .map_err(Into::into)
}

async fn next_display_order(pool: &SqlitePool, group_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM group_config_links WHERE group_id = ?1")
        .bind(group_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

pub async fn create_metadata_configuration(
    pool: &SqlitePool,
    name: &str,
    description: Option<&str>,
    data_type: ConfigDataType,
    extraction_prompt: &str,
    validation_rules: Option<serde_json::Value>,
    created_by: Option<&str>,
    group_ids: &[String],
) -> Result<MetadataConfiguration> {
    if group_ids.is_empty() {
        return Err(PipelineError::validation("configuration must be assigned to at least one group"));
    }
    for group_id in group_ids {
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM metadata_groups WHERE id = ?1")
            .bind(group_id)
            .fetch_optional(pool)
            .await?;
        if exists.is_none() {
            return Err(PipelineError::not_found(format!("group {}", group_id)));
        }
    }
    let name_lower = name.to_lowercase();
    let dup: Option<String> = sqlx::query_scalar("SELECT id FROM metadata_configurations WHERE name_lower = ?1")
        .bind(&name_lower)
        .fetch_optional(pool)
        .await?;
    if dup.is_some() {
        return Err(PipelineError::conflict(format!("configuration '{}' already exists", name)));
    }

    let id = Uuid::new_v4().to_string();
    let now = now_ts();
    let validation_rules_str = validation_rules.map(|v| v.to_string());

    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO metadata_configurations (id, name, name_lower, description, data_type, extraction_prompt, extraction_prompt_version, validation_rules, is_active, created_by, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, 1, ?8, ?9, ?9)
        "#,
    )
    .bind(&id)
    .bind(name)
    .bind(&name_lower)
    .bind(description)
    .bind(data_type.as_str())
    .bind(extraction_prompt)
    .bind(&validation_rules_str)
    .bind(created_by)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    for group_id in group_ids {
        let order = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM group_config_links WHERE group_id = ?1")
            .bind(group_id)
            .fetch_one(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO group_config_links (group_id, config_id, display_order, added_at, added_by) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(group_id)
        .bind(&id)
        .bind(order)
        .bind(now)
        .bind(created_by)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    get_configuration(pool, &id).await
}

#[derive(Default)]
pub struct ConfigPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub data_type: Option<ConfigDataType>,
    pub extraction_prompt: Option<String>,
    pub validation_rules: Option<serde_json::Value>,
    pub is_active: Option<bool>,
}

/// Bumps `extraction_prompt_version` atomically with the update iff
/// `patch.extraction_prompt` differs from the stored prompt.
pub async fn update_metadata_configuration(pool: &SqlitePool, config_id: &str, patch: ConfigPatch) -> Result<MetadataConfiguration> {
    let current = get_configuration(pool, config_id).await?;

    let name = patch.name.unwrap_or(current.name);
    let name_lower = name.to_lowercase();
    let description = patch.description.or(current.description);
    let data_type = patch.data_type.unwrap_or(current.data_type);
    let is_active = patch.is_active.unwrap_or(current.is_active);
    let validation_rules = patch.validation_rules.or(current.validation_rules);
    let validation_rules_str = validation_rules.map(|v| v.to_string());

    let (prompt, version) = match patch.extraction_prompt {
        Some(new_prompt) if new_prompt != current.extraction_prompt => (new_prompt, current.extraction_prompt_version + 1),
        Some(_) => (current.extraction_prompt, current.extraction_prompt_version),
        None => (current.extraction_prompt, current.extraction_prompt_version),
    };

    sqlx::query(
        r#"
        UPDATE metadata_configurations
        SET name = ?1, name_lower = ?2, description = ?3, data_type = ?4, extraction_prompt = ?5, extraction_prompt_version = ?6,
            validation_rules = ?7, is_active = ?8, updated_at = ?9
        WHERE id = ?10
        "#,
    )
    .bind(&name)
    .bind(&name_lower)
    .bind(&description)
    .bind(data_type.as_str())
    .bind(&prompt)
    .bind(version)
    .bind(&validation_rules_str)
    .bind(is_active as i64)
    .bind(now_ts())
    .bind(config_id)
    .execute(pool)
    .await?;

    get_configuration(pool, config_id).await
}

/// Cascade-deletes `GroupConfigLink` rows and `ExtractedMetadata` rows for
/// this configuration's name, across all collections.
pub async fn delete_metadata_configuration(pool: &SqlitePool, config_id: &str) -> Result<()> {
    let config = get_configuration(pool, config_id).await?;
    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM group_config_links WHERE config_id = ?1")
        .bind(config_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM extracted_metadata WHERE metadata_name = ?1")
        .bind(&config.name)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM metadata_configurations WHERE id = ?1")
        .bind(config_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn create_metadata_group(
    pool: &SqlitePool,
    name: &str,
    description: Option<&str>,
    color: Option<&str>,
    tags: Vec<String>,
    created_by: Option<&str>,
) -> Result<MetadataGroup> {
    let name_lower = name.to_lowercase();
    let dup: Option<String> = sqlx::query_scalar("SELECT id FROM metadata_groups WHERE name_lower = ?1")
        .bind(&name_lower)
        .fetch_optional(pool)
        .await?;
    if dup.is_some() {
        return Err(PipelineError::conflict(format!("group '{}' already exists", name)));
    }

    let id = Uuid::new_v4().to_string();
    let now = now_ts();
    let color = color.unwrap_or(DEFAULT_GROUP_COLOR);
    let tags_json = serde_json::to_string(&tags)?;

    sqlx::query(
        r#"
        INSERT INTO metadata_groups (id, name, name_lower, description, color, tags, is_default, created_by, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?8)
        "#,
    )
    .bind(&id)
    .bind(name)
    .bind(&name_lower)
    .bind(description)
    .bind(color)
    .bind(&tags_json)
    .bind(created_by)
    .bind(now)
    .execute(pool)
    .await?;

    get_group(pool, &id).await
}

#[derive(Default)]
pub struct GroupPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
    pub tags: Option<Vec<String>>,
}

pub async fn update_metadata_group(pool: &SqlitePool, group_id: &str, patch: GroupPatch) -> Result<MetadataGroup> {
    let current = get_group(pool, group_id).await?;

    if current.is_default {
        if let Some(ref new_name) = patch.name {
            if *new_name != current.name {
                return Err(PipelineError::conflict("the default group cannot be renamed"));
            }
        }
    }

    let name = patch.name.unwrap_or(current.name);
    let name_lower = name.to_lowercase();
    let description = patch.description.or(current.description);
    let color = patch.color.unwrap_or(current.color);
    let tags = patch.tags.unwrap_or(current.tags);
    let tags_json = serde_json::to_string(&tags)?;

    sqlx::query(
        "UPDATE metadata_groups SET name = ?1, name_lower = ?2, description = ?3, color = ?4, tags = ?5, updated_at = ?6 WHERE id = ?7",
    )
    .bind(&name)
    .bind(&name_lower)
    .bind(&description)
    .bind(&color)
    .bind(&tags_json)
    .bind(now_ts())
    .bind(group_id)
    .execute(pool)
    .await?;

    get_group(pool, group_id).await
}

/// Deletes a non-default group. Any configuration whose *only* link is to
/// this group is relinked to the default group first, preserving
/// invariant 1 (every configuration belongs to at least one group).
pub async fn delete_metadata_group(pool: &SqlitePool, group_id: &str) -> Result<()> {
    let group = get_group(pool, group_id).await?;
    if group.is_default {
        return Err(PipelineError::conflict("the default group cannot be deleted"));
    }
    let default_id = default_group_id(pool).await?;

    let orphan_config_ids: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT config_id FROM group_config_links
        WHERE group_id = ?1
        AND config_id NOT IN (SELECT config_id FROM group_config_links WHERE group_id != ?1)
        "#,
    )
    .bind(group_id)
    .fetch_all(pool)
    .await?;

    let mut tx = pool.begin().await?;
    for config_id in &orphan_config_ids {
        let order = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM group_config_links WHERE group_id = ?1")
            .bind(&default_id)
            .fetch_one(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO group_config_links (group_id, config_id, display_order, added_at, added_by)
            VALUES (?1, ?2, ?3, ?4, NULL)
            ON CONFLICT(group_id, config_id) DO NOTHING
            "#,
        )
        .bind(&default_id)
        .bind(config_id)
        .bind(order)
        .bind(now_ts())
        .execute(&mut *tx)
        .await?;
    }
    sqlx::query("DELETE FROM group_config_links WHERE group_id = ?1")
        .bind(group_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM metadata_groups WHERE id = ?1")
        .bind(group_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Renumbers `group_id`'s links so `config_id` lands at `new_order` and
/// every link between the old and new position shifts by one in the
/// opposite direction, keeping `display_order` a dense `0..n` permutation.
pub async fn reorder_configuration_in_group(pool: &SqlitePool, group_id: &str, config_id: &str, new_order: i64) -> Result<()> {
    let current_order: Option<i64> = sqlx::query_scalar(
        "SELECT display_order FROM group_config_links WHERE group_id = ?1 AND config_id = ?2",
    )
    .bind(group_id)
    .bind(config_id)
    .fetch_optional(pool)
    .await?;
    let current_order = current_order.ok_or_else(|| PipelineError::not_found("group/configuration link"))?;

    let link_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM group_config_links WHERE group_id = ?1")
        .bind(group_id)
        .fetch_one(pool)
        .await?;
    if new_order < 0 || new_order >= link_count {
        return Err(PipelineError::validation(format!("new_order {} out of range [0, {})", new_order, link_count)));
    }
    if current_order == new_order {
        return Ok(());
    }

    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE group_config_links SET display_order = -1 WHERE group_id = ?1 AND config_id = ?2")
        .bind(group_id)
        .bind(config_id)
        .execute(&mut *tx)
        .await?;

    if current_order < new_order {
        sqlx::query(
            "UPDATE group_config_links SET display_order = display_order - 1 WHERE group_id = ?1 AND display_order > ?2 AND display_order <= ?3",
        )
        .bind(group_id)
        .bind(current_order)
        .bind(new_order)
        .execute(&mut *tx)
        .await?;
    } else {
        sqlx::query(
            "UPDATE group_config_links SET display_order = display_order + 1 WHERE group_id = ?1 AND display_order >= ?2 AND display_order < ?3",
        )
        .bind(group_id)
        .bind(new_order)
        .bind(current_order)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query("UPDATE group_config_links SET display_order = ?1 WHERE group_id = ?2 AND config_id = ?3")
        .bind(new_order)
        .bind(group_id)
        .bind(config_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Creates a new group with `new_name` and copies `group_id`'s links at
/// identical `display_order` values.
pub async fn clone_group(pool: &SqlitePool, group_id: &str, new_name: &str) -> Result<MetadataGroup> {
    let source = get_group(pool, group_id).await?;
    let cloned = create_metadata_group(
        pool,
        new_name,
        source.description.as_deref(),
        Some(&source.color),
        source.tags.clone(),
        source.created_by.as_deref(),
    )
    .await?;

    let links = sqlx::query("SELECT config_id, display_order, added_by FROM group_config_links WHERE group_id = ?1")
        .bind(group_id)
        .fetch_all(pool)
        .await?;
    let now = now_ts();
    for link in links {
        let config_id: String = link.get("config_id");
        let display_order: i64 = link.get("display_order");
        let added_by: Option<String> = link.get("added_by");
        sqlx::query(
            "INSERT INTO group_config_links (group_id, config_id, display_order, added_at, added_by) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&cloned.id)
        .bind(&config_id)
        .bind(display_order)
        .bind(now)
        .bind(&added_by)
        .execute(pool)
        .await?;
    }

    get_group(pool, &cloned.id).await
}

pub async fn list_group_configurations(pool: &SqlitePool, group_id: &str) -> Result<Vec<MetadataConfiguration>> {
    let rows = sqlx::query(
        r#"
        SELECT mc.* FROM metadata_configurations mc
        JOIN group_config_links gcl ON gcl.config_id = mc.id
        WHERE gcl.group_id = ?1
        ORDER BY gcl.display_order ASC
        "#,
    )
    .bind(group_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_configuration).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        crate::migrate::run_migrations_on(&pool).await.unwrap();
        pool
    }

    async fn default_group(pool: &SqlitePool) -> String {
        default_group_id(pool).await.unwrap()
    }

    #[tokio::test]
    async fn create_configuration_requires_a_group() {
        let pool = setup().await;
        let err = create_metadata_configuration(&pool, "C1", None, ConfigDataType::Text, "prompt", None, None, &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("at least one group"));
    }

    #[tokio::test]
    async fn multi_group_configuration_has_independent_display_order() {
        let pool = setup().await;
        let g1 = create_metadata_group(&pool, "G1", None, None, vec![], None).await.unwrap();
        let g2 = create_metadata_group(&pool, "G2", None, None, vec![], None).await.unwrap();

        let cfg = create_metadata_configuration(
            &pool,
            "Dosage",
            None,
            ConfigDataType::Text,
            "What is the dosage?",
            None,
            None,
            &[g1.id.clone(), g2.id.clone()],
        )
        .await
        .unwrap();

        // add two more configs to G1 so position 2 is valid
        create_metadata_configuration(&pool, "C2", None, ConfigDataType::Text, "p2", None, None, &[g1.id.clone()])
            .await
            .unwrap();
        create_metadata_configuration(&pool, "C3", None, ConfigDataType::Text, "p3", None, None, &[g1.id.clone()])
            .await
            .unwrap();

        reorder_configuration_in_group(&pool, &g1.id, &cfg.id, 2).await.unwrap();

        let order_in_g1: i64 = sqlx::query_scalar(
            "SELECT display_order FROM group_config_links WHERE group_id = ?1 AND config_id = ?2",
        )
        .bind(&g1.id)
        .bind(&cfg.id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(order_in_g1, 2);

        let order_in_g2: i64 = sqlx::query_scalar(
            "SELECT display_order FROM group_config_links WHERE group_id = ?1 AND config_id = ?2",
        )
        .bind(&g2.id)
        .bind(&cfg.id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(order_in_g2, 0);

        let orders: Vec<i64> = sqlx::query_scalar("SELECT display_order FROM group_config_links WHERE group_id = ?1 ORDER BY display_order")
            .bind(&g1.id)
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(orders, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn deleting_nondefault_group_reassigns_orphans_to_default() {
        let pool = setup().await;
        let default_id = default_group(&pool).await;
        let g1 = create_metadata_group(&pool, "G1", None, None, vec![], None).await.unwrap();
        let cfg = create_metadata_configuration(&pool, "Dosage", None, ConfigDataType::Text, "p", None, None, &[g1.id.clone()])
            .await
            .unwrap();

        delete_metadata_group(&pool, &g1.id).await.unwrap();

        assert!(get_group(&pool, &g1.id).await.is_err());
        let still_exists = get_configuration(&pool, &cfg.id).await.unwrap();
        assert_eq!(still_exists.id, cfg.id);

        let link_group: String = sqlx::query_scalar("SELECT group_id FROM group_config_links WHERE config_id = ?1")
            .bind(&cfg.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(link_group, default_id);
    }

    #[tokio::test]
    async fn default_group_cannot_be_deleted_or_renamed() {
        let pool = setup().await;
        let default_id = default_group(&pool).await;
        assert!(delete_metadata_group(&pool, &default_id).await.is_err());

        let patch = GroupPatch { name: Some("Renamed".to_string()), ..Default::default() };
        assert!(update_metadata_group(&pool, &default_id, patch).await.is_err());
    }

    #[tokio::test]
    async fn updating_extraction_prompt_bumps_version() {
        let pool = setup().await;
        let g1 = create_metadata_group(&pool, "G1", None, None, vec![], None).await.unwrap();
        let cfg = create_metadata_configuration(&pool, "C", None, ConfigDataType::Text, "old prompt", None, None, &[g1.id])
            .await
            .unwrap();
        assert_eq!(cfg.extraction_prompt_version, 1);

        let patch = ConfigPatch { extraction_prompt: Some("new prompt".to_string()), ..Default::default() };
        let updated = update_metadata_configuration(&pool, &cfg.id, patch).await.unwrap();
        assert_eq!(updated.extraction_prompt_version, 2);

        let patch2 = ConfigPatch { description: Some("desc".to_string()), ..Default::default() };
        let updated2 = update_metadata_configuration(&pool, &cfg.id, patch2).await.unwrap();
        assert_eq!(updated2.extraction_prompt_version, 2);
    }

    #[tokio::test]
    async fn configuration_name_uniqueness_is_case_insensitive() {
        let pool = setup().await;
        let g1 = create_metadata_group(&pool, "G1", None, None, vec![], None).await.unwrap();
        create_metadata_configuration(&pool, "Dosage", None, ConfigDataType::Text, "p", None, None, &[g1.id.clone()])
            .await
            .unwrap();

        let err = create_metadata_configuration(&pool, "dosage", None, ConfigDataType::Text, "p2", None, None, &[g1.id])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn clone_group_copies_links_with_identical_order() {
        let pool = setup().await;
        let g1 = create_metadata_group(&pool, "G1", None, None, vec![], None).await.unwrap();
        create_metadata_configuration(&pool, "C1", None, ConfigDataType::Text, "p1", None, None, &[g1.id.clone()])
            .await
            .unwrap();
        create_metadata_configuration(&pool, "C2", None, ConfigDataType::Text, "p2", None, None, &[g1.id.clone()])
            .await
            .unwrap();

        let cloned = clone_group(&pool, &g1.id, "G1 Copy").await.unwrap();
        let original_orders = list_group_configurations(&pool, &g1.id).await.unwrap();
        let cloned_orders = list_group_configurations(&pool, &cloned.id).await.unwrap();
        let original_names: Vec<&str> = original_orders.iter().map(|c| c.name.as_str()).collect();
        let cloned_names: Vec<&str> = cloned_orders.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(original_names, cloned_names);
    }
}
