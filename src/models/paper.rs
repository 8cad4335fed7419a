// src/models/paper.rs

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Represents the 'papers' table: one expected (physical) test-paper.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Paper {
    pub paper_number: i64,
}

/// Represents the 'paper_pages' table: one expected page slot of a paper,
/// with the version assigned to it by the question-version map.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PaperPageSlot {
    pub paper_number: i64,
    pub page_number: i64,
    pub version: i64,
}
