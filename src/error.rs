// src/error.rs

use thiserror::Error;

/// Crate-wide error enum.
/// Centralizes the failure modes of the staging workflow so callers can
/// distinguish recoverable operator mistakes from hard refusals.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Validation(String),

    /// Two pages claimed the same (paper, page) slot. The operator must
    /// choose which page to keep.
    #[error("slot paper {paper_number} page {page_number} is already claimed by another page")]
    SlotCollision {
        paper_number: i64,
        page_number: i64,
    },

    #[error("invalid extra-page data: {0}")]
    InvalidExtraData(String),

    /// Push refused because the bundle still has unresolved pages.
    /// Recoverable: the operator can fix the pages and push again.
    #[error("cannot push bundle: {0}")]
    PushBlockedIncomplete(String),

    /// Mutation attempted on a pushed bundle. Not retryable.
    #[error("bundle has been pushed and is immutable: {0}")]
    PushBlockedImmutable(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StagingError>;
