//! Core data model shared by every pipeline stage.
//!
//! These types mirror the relational schema one-to-one (see [`crate::migrate`])
//! and the entities of the ingestion/extraction domain: source documents move
//! through [`DocumentStatus`], are grouped into [`Collection`]s, and have
//! [`MetadataConfiguration`]s (bundled into [`MetadataGroup`]s) run against
//! them to produce [`ExtractedMetadata`] rows.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Lifecycle status of a [`SourceDocument`]. See [`crate::state_machine`] for
/// the allowed transition graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Processing,
    DocumentStored,
    Indexing,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "PENDING",
            DocumentStatus::Processing => "PROCESSING",
            DocumentStatus::DocumentStored => "DOCUMENT_STORED",
            DocumentStatus::Indexing => "INDEXING",
            DocumentStatus::Ready => "READY",
            DocumentStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "PENDING" => DocumentStatus::Pending,
            "PROCESSING" => DocumentStatus::Processing,
            "DOCUMENT_STORED" => DocumentStatus::DocumentStored,
            "INDEXING" => DocumentStatus::Indexing,
            "READY" => DocumentStatus::Ready,
            "FAILED" => DocumentStatus::Failed,
            _ => return None,
        })
    }
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One ingested file, tracked through the lifecycle state machine.
#[derive(Debug, Clone, Serialize)]
pub struct SourceDocument {
    pub id: String,
    pub display_name: String,
    pub source_uri: String,
    pub entity_label: Option<String>,
    pub status: DocumentStatus,
    pub status_detail: Option<String>,
    pub metadata_extracted: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One summarized, embeddable unit of a document's text.
#[derive(Debug, Clone)]
pub struct DocumentChunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub title: String,
    pub summary: String,
    pub original_text: String,
    pub has_table: bool,
    pub chunk_metadata: serde_json::Value,
}

/// A user-curated bundle of [`SourceDocument`]s with its own vector-store
/// collection.
#[derive(Debug, Clone, Serialize)]
pub struct Collection {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub vector_index_name: Option<String>,
    pub documents_total: i64,
    pub documents_indexed: i64,
    pub documents_failed: i64,
    pub created_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Per-collection membership status ∈ {pending, indexing, indexed, failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipIndexingStatus {
    Pending,
    Indexing,
    Indexed,
    Failed,
}

impl MembershipIndexingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipIndexingStatus::Pending => "pending",
            MembershipIndexingStatus::Indexing => "indexing",
            MembershipIndexingStatus::Indexed => "indexed",
            MembershipIndexingStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => MembershipIndexingStatus::Pending,
            "indexing" => MembershipIndexingStatus::Indexing,
            "indexed" => MembershipIndexingStatus::Indexed,
            "failed" => MembershipIndexingStatus::Failed,
            _ => return None,
        })
    }
}

/// Association of one document to one collection, with per-collection
/// indexing state independent of the document's own global `status`.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionMembership {
    pub collection_id: String,
    pub document_id: String,
    pub indexing_status: MembershipIndexingStatus,
    pub indexing_progress: i32,
    pub indexed_at: Option<i64>,
    pub error_message: Option<String>,
    pub vector_point_id: Option<String>,
}

/// Data type a [`MetadataConfiguration`] extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigDataType {
    Text,
    Number,
    Date,
    Boolean,
}

impl ConfigDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigDataType::Text => "text",
            ConfigDataType::Number => "number",
            ConfigDataType::Date => "date",
            ConfigDataType::Boolean => "boolean",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "text" => ConfigDataType::Text,
            "number" => ConfigDataType::Number,
            "date" => ConfigDataType::Date,
            "boolean" => ConfigDataType::Boolean,
            _ => return None,
        })
    }
}

/// A reusable named extractor: a prompt plus a data type and validation rules.
#[derive(Debug, Clone, Serialize)]
pub struct MetadataConfiguration {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub data_type: ConfigDataType,
    pub extraction_prompt: String,
    pub extraction_prompt_version: i64,
    /// JSON object; recognized keys: `regex` (string), `default` (string).
    pub validation_rules: Option<serde_json::Value>,
    pub is_active: bool,
    pub created_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A named bundle of [`MetadataConfiguration`]s with per-configuration
/// ordering (see [`GroupConfigLink`]).
#[derive(Debug, Clone, Serialize)]
pub struct MetadataGroup {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub color: String,
    pub tags: Vec<String>,
    pub is_default: bool,
    pub created_by: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Many-to-many link between a group and a configuration, carrying the
/// configuration's display position *within that group*.
#[derive(Debug, Clone, Serialize)]
pub struct GroupConfigLink {
    pub group_id: String,
    pub config_id: String,
    pub display_order: i64,
    pub added_at: i64,
    pub added_by: Option<String>,
}

/// Status of an [`ExtractionJob`] or an [`IndexingJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => JobStatus::Pending,
            "processing" => JobStatus::Processing,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// One user-initiated extraction run over a (collection, group) pair.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionJob {
    pub id: String,
    pub collection_id: String,
    pub group_id: String,
    pub status: JobStatus,
    pub total_documents: i64,
    pub processed_documents: i64,
    pub failed_documents: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub created_by: Option<String>,
    pub error_details: Option<String>,
}

/// Type of an [`IndexingJob`]: a fresh index pass, or a forced re-index of
/// documents already `READY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexingJobType {
    Index,
    Reindex,
}

impl IndexingJobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexingJobType::Index => "index",
            IndexingJobType::Reindex => "reindex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "index" => IndexingJobType::Index,
            "reindex" => IndexingJobType::Reindex,
            _ => return None,
        })
    }
}

/// One user-initiated indexing run over a set of documents in a collection.
#[derive(Debug, Clone, Serialize)]
pub struct IndexingJob {
    pub id: String,
    pub collection_id: String,
    pub job_type: IndexingJobType,
    pub status: JobStatus,
    pub total_documents: i64,
    pub processed_documents: i64,
    pub failed_documents: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error_details: Option<String>,
}

/// One extracted field value. Primary key: `(collection_id, document_id,
/// group_id, metadata_name)`.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractedMetadata {
    pub collection_id: String,
    pub document_id: String,
    pub group_id: String,
    pub metadata_name: String,
    pub extraction_job_id: String,
    pub extracted_value: String,
    pub extracted_by: Option<String>,
    pub extracted_at: i64,
}

/// Current Unix timestamp in seconds, the storage format for all `*_at`
/// columns (formatted to ISO-8601 only at the presentation boundary).
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}
