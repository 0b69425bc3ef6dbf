//! HTTP API for the ingestion/indexing/extraction pipeline.
//!
//! Every handler is a thin wrapper over one [`crate::service::PipelineService`]
//! method; the service owns all `sqlx` access and business rules.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/documents` | Upload a document (creates a `PENDING` row) |
//! | `GET`  | `/documents/:id` | Fetch a document and its current status |
//! | `POST` | `/documents/:id/reprocess` | Move a `FAILED` document back to `PENDING` |
//! | `POST` | `/collections` | Create a collection |
//! | `GET`  | `/collections/:id` | Fetch a collection |
//! | `POST` | `/collections/:id/documents` | Add documents to a collection |
//! | `POST` | `/collections/:id/indexing-jobs` | Start an indexing job |
//! | `GET`  | `/indexing-jobs/:id` | Poll an indexing job |
//! | `POST` | `/metadata-configurations` | Create a metadata configuration |
//! | `PATCH`| `/metadata-configurations/:id` | Update a metadata configuration |
//! | `POST` | `/metadata-groups` | Create a metadata group |
//! | `POST` | `/metadata-groups/:group_id/configurations/:config_id/order` | Reorder a configuration within a group |
//! | `POST` | `/collections/:id/extraction-jobs` | Start an extraction job |
//! | `GET`  | `/extraction-jobs/:id` | Poll an extraction job |
//! | `POST` | `/extraction-jobs/:id/stop` | Request cooperative cancellation |
//! | `GET`  | `/collections/:id/metadata` | List extracted metadata |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "source_uri must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so browser-based clients
//! can call this API directly.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::error::{classify, PipelineError};
use crate::groups::{ConfigPatch, GroupPatch};
use crate::models::{
    Collection, ConfigDataType, ExtractedMetadata, ExtractionJob, IndexingJob, IndexingJobType,
    MetadataConfiguration, MetadataGroup, SourceDocument,
};
use crate::service::PipelineService;

#[derive(Clone)]
struct AppState {
    service: Arc<PipelineService>,
}

/// Starts the HTTP server. Binds to `[server].bind` and serves until the
/// process is terminated.
pub async fn run_server(config: &Config, service: Arc<PipelineService>) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let state = AppState { service };

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/documents", post(handle_upload_document))
        .route("/documents/:id", get(handle_get_document))
        .route("/documents/:id/reprocess", post(handle_reprocess_document))
        .route("/collections", post(handle_create_collection))
        .route("/collections/:id", get(handle_get_collection))
        .route("/collections/:id/documents", post(handle_add_documents_to_collection))
        .route("/collections/:id/indexing-jobs", post(handle_start_indexing_job))
        .route("/indexing-jobs/:id", get(handle_get_indexing_job))
        .route("/metadata-configurations", post(handle_create_metadata_configuration))
        .route("/metadata-configurations/:id", patch(handle_update_metadata_configuration))
        .route("/metadata-groups", post(handle_create_metadata_group))
        .route(
            "/metadata-groups/:group_id/configurations/:config_id/order",
            post(handle_reorder_configuration),
        )
        .route("/collections/:id/extraction-jobs", post(handle_start_extraction_job))
        .route("/extraction-jobs/:id", get(handle_get_extraction_job))
        .route("/extraction-jobs/:id/stop", post(handle_stop_extraction_job))
        .route("/collections/:id/metadata", get(handle_list_extracted_metadata))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    info!(bind_addr, "pipeline server listening");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody { error: ErrorDetail { code: self.code, message: self.message } };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError { status: StatusCode::BAD_REQUEST, code: "bad_request".to_string(), message: message.into() }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError { status: StatusCode::NOT_FOUND, code: "not_found".to_string(), message: message.into() }
}

fn conflict(message: impl Into<String>) -> AppError {
    AppError { status: StatusCode::CONFLICT, code: "conflict".to_string(), message: message.into() }
}

fn internal_error(message: impl Into<String>) -> AppError {
    AppError { status: StatusCode::INTERNAL_SERVER_ERROR, code: "internal".to_string(), message: message.into() }
}

/// Maps a service-layer error to its HTTP representation via
/// [`PipelineError::classify`], falling back to `500` for anything
/// untyped (infrastructure failures, driver errors).
fn app_error(err: anyhow::Error) -> AppError {
    match classify(&err) {
        Some(PipelineError::NotFound(msg)) => not_found(msg.clone()),
        Some(PipelineError::Validation(msg)) => bad_request(msg.clone()),
        Some(PipelineError::Conflict(msg)) => conflict(msg.clone()),
        None => internal_error(err.to_string()),
    }
}

// ============ POST /documents ============

#[derive(Deserialize)]
struct UploadDocumentRequest {
    source_uri: String,
    display_name: String,
    #[serde(default)]
    entity_label: Option<String>,
}

async fn handle_upload_document(
    State(state): State<AppState>,
    Json(req): Json<UploadDocumentRequest>,
) -> Result<Json<SourceDocument>, AppError> {
    let doc = state
        .service
        .upload_document(&req.source_uri, &req.display_name, req.entity_label.as_deref())
        .await
        .map_err(app_error)?;
    Ok(Json(doc))
}

// ============ GET /documents/:id ============

async fn handle_get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SourceDocument>, AppError> {
    let doc = state.service.get_document(&id).await.map_err(app_error)?;
    Ok(Json(doc))
}

// ============ POST /documents/:id/reprocess ============

async fn handle_reprocess_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SourceDocument>, AppError> {
    let doc = state.service.reprocess_document(&id).await.map_err(app_error)?;
    Ok(Json(doc))
}

// ============ POST /collections ============

#[derive(Deserialize)]
struct CreateCollectionRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    created_by: Option<String>,
}

async fn handle_create_collection(
    State(state): State<AppState>,
    Json(req): Json<CreateCollectionRequest>,
) -> Result<Json<Collection>, AppError> {
    if req.name.trim().is_empty() {
        return Err(bad_request("name must not be empty"));
    }
    let collection = state
        .service
        .create_collection(&req.name, req.description.as_deref(), req.created_by.as_deref())
        .await
        .map_err(app_error)?;
    Ok(Json(collection))
}

// ============ GET /collections/:id ============

async fn handle_get_collection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Collection>, AppError> {
    let collection = state.service.get_collection(&id).await.map_err(app_error)?;
    Ok(Json(collection))
}

// ============ POST /collections/:id/documents ============

#[derive(Deserialize)]
struct AddDocumentsRequest {
    document_ids: Vec<String>,
}

#[derive(Serialize)]
struct AddDocumentsResponse {
    added: usize,
}

async fn handle_add_documents_to_collection(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<AddDocumentsRequest>,
) -> Result<Json<AddDocumentsResponse>, AppError> {
    let added = state
        .service
        .add_documents_to_collection(&id, &req.document_ids)
        .await
        .map_err(app_error)?;
    Ok(Json(AddDocumentsResponse { added }))
}

// ============ POST /collections/:id/indexing-jobs ============

#[derive(Deserialize)]
struct StartIndexingJobRequest {
    document_ids: Vec<String>,
    #[serde(default = "default_job_type")]
    job_type: String,
}

fn default_job_type() -> String {
    "index".to_string()
}

#[derive(Serialize)]
struct JobStartedResponse {
    job_id: String,
}

async fn handle_start_indexing_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<StartIndexingJobRequest>,
) -> Result<Json<JobStartedResponse>, AppError> {
    let job_type = IndexingJobType::parse(&req.job_type)
        .ok_or_else(|| bad_request(format!("unknown job_type: {}", req.job_type)))?;
    let job_id = state
        .service
        .start_indexing_job(&id, &req.document_ids, job_type)
        .await
        .map_err(app_error)?;
    Ok(Json(JobStartedResponse { job_id }))
}

// ============ GET /indexing-jobs/:id ============

async fn handle_get_indexing_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<IndexingJob>, AppError> {
    let job = state.service.get_indexing_job(&id).await.map_err(app_error)?;
    Ok(Json(job))
}

// ============ POST /metadata-configurations ============

#[derive(Deserialize)]
struct CreateMetadataConfigurationRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    data_type: String,
    extraction_prompt: String,
    #[serde(default)]
    validation_rules: Option<serde_json::Value>,
    #[serde(default)]
    created_by: Option<String>,
    group_ids: Vec<String>,
}

async fn handle_create_metadata_configuration(
    State(state): State<AppState>,
    Json(req): Json<CreateMetadataConfigurationRequest>,
) -> Result<Json<MetadataConfiguration>, AppError> {
    let data_type = ConfigDataType::parse(&req.data_type)
        .ok_or_else(|| bad_request(format!("unknown data_type: {}", req.data_type)))?;
    let config = state
        .service
        .create_metadata_configuration(
            &req.name,
            req.description.as_deref(),
            data_type,
            &req.extraction_prompt,
            req.validation_rules,
            req.created_by.as_deref(),
            &req.group_ids,
        )
        .await
        .map_err(app_error)?;
    Ok(Json(config))
}

// ============ PATCH /metadata-configurations/:id ============

#[derive(Deserialize, Default)]
struct UpdateMetadataConfigurationRequest {
    name: Option<String>,
    description: Option<String>,
    data_type: Option<String>,
    extraction_prompt: Option<String>,
    validation_rules: Option<serde_json::Value>,
    is_active: Option<bool>,
}

async fn handle_update_metadata_configuration(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateMetadataConfigurationRequest>,
) -> Result<Json<MetadataConfiguration>, AppError> {
    let data_type = match req.data_type {
        Some(s) => Some(ConfigDataType::parse(&s).ok_or_else(|| bad_request(format!("unknown data_type: {}", s)))?),
        None => None,
    };
    let patch = ConfigPatch {
        name: req.name,
        description: req.description,
        data_type,
        extraction_prompt: req.extraction_prompt,
        validation_rules: req.validation_rules,
        is_active: req.is_active,
    };
    let config = state.service.update_metadata_configuration(&id, patch).await.map_err(app_error)?;
    Ok(Json(config))
}

// ============ POST /metadata-groups ============

#[derive(Deserialize)]
struct CreateMetadataGroupRequest {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    color: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    created_by: Option<String>,
}

async fn handle_create_metadata_group(
    State(state): State<AppState>,
    Json(req): Json<CreateMetadataGroupRequest>,
) -> Result<Json<MetadataGroup>, AppError> {
    let group = state
        .service
        .create_metadata_group(&req.name, req.description.as_deref(), req.color.as_deref(), req.tags, req.created_by.as_deref())
        .await
        .map_err(app_error)?;
    Ok(Json(group))
}

// ============ POST /metadata-groups/:group_id/configurations/:config_id/order ============

#[derive(Deserialize)]
struct ReorderRequest {
    new_order: i64,
}

async fn handle_reorder_configuration(
    State(state): State<AppState>,
    Path((group_id, config_id)): Path<(String, String)>,
    Json(req): Json<ReorderRequest>,
) -> Result<StatusCode, AppError> {
    state
        .service
        .reorder_configuration_in_group(&group_id, &config_id, req.new_order)
        .await
        .map_err(app_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ POST /collections/:id/extraction-jobs ============

#[derive(Deserialize)]
struct StartExtractionJobRequest {
    group_id: String,
    #[serde(default)]
    created_by: Option<String>,
}

async fn handle_start_extraction_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<StartExtractionJobRequest>,
) -> Result<Json<JobStartedResponse>, AppError> {
    let job_id = state
        .service
        .start_extraction_job(&id, &req.group_id, req.created_by.as_deref())
        .await
        .map_err(app_error)?;
    Ok(Json(JobStartedResponse { job_id }))
}

// ============ GET /extraction-jobs/:id ============

async fn handle_get_extraction_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExtractionJob>, AppError> {
    let job = state.service.get_extraction_job(&id).await.map_err(app_error)?;
    Ok(Json(job))
}

// ============ POST /extraction-jobs/:id/stop ============

async fn handle_stop_extraction_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.service.stop_extraction_job(&id).await.map_err(app_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ GET /collections/:id/metadata ============

#[derive(Deserialize)]
struct ListMetadataQuery {
    group_id: Option<String>,
    document_id: Option<String>,
}

#[derive(Serialize)]
struct ListMetadataResponse {
    metadata: Vec<ExtractedMetadata>,
}

async fn handle_list_extracted_metadata(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ListMetadataQuery>,
) -> Result<Json<ListMetadataResponse>, AppError> {
    let metadata = state
        .service
        .list_extracted_metadata(&id, query.group_id.as_deref(), query.document_id.as_deref())
        .await
        .map_err(app_error)?;
    Ok(Json(ListMetadataResponse { metadata }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok".to_string(), version: env!("CARGO_PKG_VERSION").to_string() })
}
