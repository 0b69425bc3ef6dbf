//! The one typed error seam in the pipeline.
//!
//! Every internal function returns `anyhow::Result<T>` (spec §7's "bubbles
//! up" error kind), matching the teacher's convention throughout. But the
//! HTTP layer (`server.rs`) needs to tell a validation failure apart from a
//! not-found apart from an invariant conflict so it can pick the right
//! status code — that's the one seam [`PipelineError`] exists for. Callers
//! that care construct one of these and wrap it in `anyhow::Error::from`;
//! callers that don't care just propagate with `?` as usual.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl PipelineError {
    pub fn not_found(what: impl Into<String>) -> anyhow::Error {
        anyhow::Error::from(PipelineError::NotFound(what.into()))
    }

    pub fn validation(what: impl Into<String>) -> anyhow::Error {
        anyhow::Error::from(PipelineError::Validation(what.into()))
    }

    pub fn conflict(what: impl Into<String>) -> anyhow::Error {
        anyhow::Error::from(PipelineError::Conflict(what.into()))
    }
}

/// Downcast an `anyhow::Error` to find a [`PipelineError`] anywhere in its
/// chain, for the HTTP layer's status-code mapping.
pub fn classify(err: &anyhow::Error) -> Option<&PipelineError> {
    err.chain().find_map(|c| c.downcast_ref::<PipelineError>())
}
