//! # regdoc-pipeline
//!
//! **Document ingestion, indexing, and structured-metadata extraction for
//! long-form regulatory filings.**
//!
//! A source document moves through an explicit lifecycle — `PENDING` →
//! `PROCESSING` → `DOCUMENT_STORED` → `INDEXING` → `READY` (or `FAILED` at
//! any ingestion/indexing step) — driven by two background worker pools
//! plus a user-triggered extraction pass:
//!
//! ## Architecture
//!
//! ```text
//! upload ─▶ Ingestion Worker Pool ─▶ Chunker ─▶ Summarizer ─▶ SQLite
//!                                                                │
//!                              Indexing Job Coordinator ◀────────┘
//!                                       │
//!                                       ▼
//!                                Vector Index
//!                                       │
//!                  Extraction Job Coordinator ─▶ Extraction Executor
//!                                       │
//!                                       ▼
//!                             Extracted Metadata
//! ```
//!
//! Both the CLI (`main.rs`) and the HTTP server ([`server`]) are thin
//! wrappers over one [`service::PipelineService`] — neither touches
//! `sqlx` or the provider traits directly.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Core data types shared by every pipeline stage |
//! | [`db`] | SQLite connection pool with WAL mode |
//! | [`migrate`] | Database schema migrations (idempotent) |
//! | [`blob_store`] | Resolves a `source_uri` to raw document bytes |
//! | [`chunk`] | Markdown-aware, table-preserving text chunker |
//! | [`summarizer`] | Per-chunk title/summary/embedding generation |
//! | [`ingest`] | Ingestion worker pool: fetch → extract → chunk → summarize |
//! | [`vector_index`] | Vector storage and similarity query |
//! | [`indexing`] | Indexing job coordinator: chunk summaries → vector points |
//! | [`collections`] | Collection CRUD and document membership |
//! | [`documents`] | Document upload, status polling, and reprocess |
//! | [`groups`] | Metadata configuration and group CRUD |
//! | [`extractor`] | Query rewriting and single-field extraction |
//! | [`extraction`] | Extraction job coordinator and executor |
//! | [`sentinels`] | Extracted-value normalization (`Not Found`, etc.) |
//! | [`state_machine`] | Document status transition rules |
//! | [`retry`] | Shared exponential-backoff retry helper |
//! | [`error`] | The one typed error seam (`PipelineError`) |
//! | [`service`] | `PipelineService`: the façade over every operation above |
//! | [`server`] | HTTP API (Axum) with CORS |
//!
//! ## Configuration
//!
//! Configured via a TOML file (default: `config/regdoc.toml`). See
//! [`config`] for all available options and [`config::load_config`] for
//! validation rules.

pub mod blob_store;
pub mod chunk;
pub mod collections;
pub mod config;
pub mod db;
pub mod documents;
pub mod error;
pub mod extraction;
pub mod extractor;
pub mod groups;
pub mod indexing;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod retry;
pub mod sentinels;
pub mod server;
pub mod service;
pub mod state_machine;
pub mod summarizer;
pub mod vector_index;
