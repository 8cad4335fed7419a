// src/models/bundle.rs

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

/// Represents the 'bundles' table: one uploaded PDF sitting in staging.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Bundle {
    pub id: i64,
    pub slug: String,
    /// Upload time, also the bundle's unique external identity.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub pdf_hash: String,
    pub uploaded_by: String,
    pub number_of_pages: i64,
    /// True once the background split job has produced every page image.
    pub has_page_images: bool,
    /// True once the background QR-read job has triaged every page.
    pub has_qr_codes: bool,
    /// One-way flag: a pushed bundle and its pages are immutable.
    pub pushed: bool,
}

/// DTO for uploading a new bundle.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UploadBundleRequest {
    #[validate(length(min = 1, max = 100))]
    pub slug: String,

    /// sha256 of the PDF, used to reject duplicate uploads.
    #[validate(custom(function = validate_sha256))]
    pub pdf_hash: String,

    #[validate(range(min = 1, max = 10000))]
    pub number_of_pages: i64,

    pub uploaded_by: String,
}

fn validate_sha256(hash: &str) -> Result<(), validator::ValidationError> {
    if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(validator::ValidationError::new("invalid_sha256"));
    }
    Ok(())
}

/// Lifecycle of a background job (bundle split or QR read), polled by the
/// operator-facing interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Complete,
    Error,
}

/// One row of the staging status summary, across all bundles.
#[derive(Debug, Clone, Serialize)]
pub struct BundleStatusSummary {
    pub slug: String,
    pub id: i64,
    pub total_pages: String,
    pub n_unknowns: i64,
    pub n_knowns: i64,
    pub n_extras_with_data: i64,
    pub n_discards: i64,
    pub n_errors: i64,
    pub qr_read: String,
    pub pushed: bool,
    pub uploaded_by: String,
}
