// src/services/papers.rs

use crate::error::{Result, StagingError};
use crate::models::paper::PaperPageSlot;
use crate::state::AppState;

/// Registry of expected papers and their page slots. Populated before
/// scanning starts; the triage machinery matches decoded pages against it.
pub struct PaperRegistry {
    state: AppState,
}

impl PaperRegistry {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Register one paper with the version assigned to each of its pages.
    /// The slice must cover every page of the assessment, in page order.
    pub async fn register_paper(&self, paper_number: i64, page_versions: &[i64]) -> Result<()> {
        let spec = &self.state.config.assessment;
        if page_versions.len() as i64 != spec.pages_per_paper {
            return Err(StagingError::Validation(format!(
                "expected {} page versions, got {}",
                spec.pages_per_paper,
                page_versions.len()
            )));
        }
        if let Some(&v) = page_versions
            .iter()
            .find(|&&v| v < 1 || v > spec.n_versions)
        {
            return Err(StagingError::Validation(format!(
                "version {v} out of range [1, {}]",
                spec.n_versions
            )));
        }

        let mut tx = self.state.pool.begin().await?;
        sqlx::query("INSERT INTO papers (paper_number) VALUES (?)")
            .bind(paper_number)
            .execute(&mut *tx)
            .await?;
        for (i, &version) in page_versions.iter().enumerate() {
            sqlx::query(
                "INSERT INTO paper_pages (paper_number, page_number, version) VALUES (?, ?, ?)",
            )
            .bind(paper_number)
            .bind(i as i64 + 1)
            .bind(version)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Register papers 1..=n with every page at version 1.
    pub async fn register_papers(&self, n_papers: i64) -> Result<()> {
        let pages = self.state.config.assessment.pages_per_paper;
        let versions = vec![1; pages as usize];
        for paper_number in 1..=n_papers {
            self.register_paper(paper_number, &versions).await?;
        }
        Ok(())
    }

    pub async fn paper_exists(&self, paper_number: i64) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT paper_number FROM papers WHERE paper_number = ?")
                .bind(paper_number)
                .fetch_optional(&self.state.pool)
                .await?;
        Ok(row.is_some())
    }

    /// Look up the expected slot for a (paper, page) pair, if any.
    pub async fn expected_slot(
        &self,
        paper_number: i64,
        page_number: i64,
    ) -> Result<Option<PaperPageSlot>> {
        let slot = sqlx::query_as::<_, PaperPageSlot>(
            "SELECT paper_number, page_number, version FROM paper_pages
             WHERE paper_number = ? AND page_number = ?",
        )
        .bind(paper_number)
        .bind(page_number)
        .fetch_optional(&self.state.pool)
        .await?;
        Ok(slot)
    }
}
