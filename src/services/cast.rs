// src/services/cast.rs

use sqlx::types::Json;

use crate::error::{Result, StagingError};
use crate::models::page::{Page, PageStatus};
use crate::models::paper::PaperPageSlot;
use crate::services::qr::{self, TriageDecision};
use crate::services::scan::{fetch_bundle, fetch_page, is_unique_violation};
use crate::state::AppState;
use crate::utils::questions::canonicalize_question_list;

/// Operator-driven casts between triage states. Every operation checks the
/// bundle's pushed flag and re-validates the page's current state inside
/// its own transaction.
pub struct ScanCastService {
    state: AppState,
}

impl ScanCastService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Discard a page. Accepted from unknown, known, extra and error;
    /// the prior state and acting user are recorded in the reason.
    pub async fn discard_page(&self, user: &str, bundle_id: i64, order: i64) -> Result<()> {
        let mut tx = self.state.pool.begin().await?;
        let page = self.page_for_cast(&mut tx, bundle_id, order).await?;

        match page.status {
            PageStatus::Discard => {
                return Err(StagingError::Validation(format!(
                    "page {order} is already a discard"
                )));
            }
            PageStatus::Unread => {
                return Err(StagingError::Validation(format!(
                    "page {order} has not been read yet"
                )));
            }
            _ => {}
        }

        clear_side_row(&mut tx, &page).await?;
        let reason = format!("{} page discarded by {}", status_label(page.status), user);
        sqlx::query("INSERT INTO discard_pages (page_id, discard_reason) VALUES (?, ?)")
            .bind(page.id)
            .bind(&reason)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE pages SET status = ? WHERE id = ?")
            .bind(PageStatus::Discard)
            .bind(page.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!("bundle {} page {}: {}", bundle_id, order, reason);
        Ok(())
    }

    /// Cast a page back to unknown. Accepted from known, extra, discard and
    /// error; a known page's slot claim is released.
    pub async fn unknowify_page(&self, user: &str, bundle_id: i64, order: i64) -> Result<()> {
        let mut tx = self.state.pool.begin().await?;
        let page = self.page_for_cast(&mut tx, bundle_id, order).await?;

        match page.status {
            PageStatus::Unknown => {
                return Err(StagingError::Validation(format!(
                    "page {order} is already unknown"
                )));
            }
            PageStatus::Unread => {
                return Err(StagingError::Validation(format!(
                    "page {order} has not been read yet"
                )));
            }
            _ => {}
        }

        clear_side_row(&mut tx, &page).await?;
        sqlx::query("UPDATE pages SET status = ? WHERE id = ?")
            .bind(PageStatus::Unknown)
            .bind(page.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(
            "bundle {} page {}: {} page cast to unknown by {}",
            bundle_id,
            order,
            status_label(page.status),
            user
        );
        Ok(())
    }

    /// Cast an unknown or discarded page to an extra page with no data yet.
    /// The page stays incomplete until `set_extra_page_data` is called.
    pub async fn extralise_page(&self, user: &str, bundle_id: i64, order: i64) -> Result<()> {
        let mut tx = self.state.pool.begin().await?;
        let page = self.page_for_cast(&mut tx, bundle_id, order).await?;

        match page.status {
            PageStatus::Unknown | PageStatus::Discard => {}
            _ => {
                return Err(StagingError::Validation(format!(
                    "cannot cast a {} page to extra",
                    page.status
                )));
            }
        }

        clear_side_row(&mut tx, &page).await?;
        sqlx::query("INSERT INTO extra_pages (page_id) VALUES (?)")
            .bind(page.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE pages SET status = ? WHERE id = ?")
            .bind(PageStatus::Extra)
            .bind(page.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(
            "bundle {} page {} cast to extra by {}",
            bundle_id,
            order,
            user
        );
        Ok(())
    }

    /// Cast an unknown or discarded page to known, claiming the given slot.
    /// The claim is atomic with the status change: if another page already
    /// holds the slot the whole operation fails with `SlotCollision` and
    /// the page is left as it was.
    pub async fn knowify_page(
        &self,
        user: &str,
        bundle_id: i64,
        order: i64,
        paper_number: i64,
        page_number: i64,
        version: i64,
    ) -> Result<()> {
        let mut tx = self.state.pool.begin().await?;
        let page = self.page_for_cast(&mut tx, bundle_id, order).await?;

        match page.status {
            PageStatus::Unknown | PageStatus::Discard => {}
            _ => {
                return Err(StagingError::Validation(format!(
                    "cannot cast a {} page to known",
                    page.status
                )));
            }
        }

        let slot = sqlx::query_as::<_, PaperPageSlot>(
            "SELECT paper_number, page_number, version FROM paper_pages
             WHERE paper_number = ? AND page_number = ?",
        )
        .bind(paper_number)
        .bind(page_number)
        .fetch_optional(&mut *tx)
        .await?;
        let slot = slot.ok_or_else(|| {
            StagingError::Validation(format!(
                "paper {paper_number} page {page_number} is not in the database"
            ))
        })?;
        if slot.version != version {
            return Err(StagingError::Validation(format!(
                "paper {paper_number} page {page_number} is version {}, not {version}",
                slot.version
            )));
        }

        clear_side_row(&mut tx, &page).await?;
        let claim = sqlx::query(
            "INSERT INTO known_pages (page_id, paper_number, page_number, version)
             VALUES (?, ?, ?, ?)",
        )
        .bind(page.id)
        .bind(paper_number)
        .bind(page_number)
        .bind(version)
        .execute(&mut *tx)
        .await;
        match claim {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StagingError::SlotCollision {
                    paper_number,
                    page_number,
                });
            }
            Err(e) => return Err(e.into()),
        }
        sqlx::query("UPDATE pages SET status = ? WHERE id = ?")
            .bind(PageStatus::Known)
            .bind(page.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(
            "bundle {} page {} cast to known (paper {}, page {}) by {}",
            bundle_id,
            order,
            paper_number,
            page_number,
            user
        );
        Ok(())
    }

    /// Attach paper and question data to an extra page, completing it.
    pub async fn set_extra_page_data(
        &self,
        bundle_id: i64,
        order: i64,
        paper_number: i64,
        questions: &[i64],
    ) -> Result<()> {
        let question_list = canonicalize_question_list(
            questions,
            self.state.config.assessment.questions_per_paper,
        )?;

        let mut tx = self.state.pool.begin().await?;
        let page = self.page_for_cast(&mut tx, bundle_id, order).await?;
        if page.status != PageStatus::Extra {
            return Err(StagingError::Validation(format!(
                "page {order} is {}, not an extra page",
                page.status
            )));
        }

        let paper: Option<(i64,)> =
            sqlx::query_as("SELECT paper_number FROM papers WHERE paper_number = ?")
                .bind(paper_number)
                .fetch_optional(&mut *tx)
                .await?;
        if paper.is_none() {
            return Err(StagingError::InvalidExtraData(format!(
                "paper {paper_number} is not in the database"
            )));
        }

        sqlx::query("UPDATE extra_pages SET paper_number = ?, question_list = ? WHERE page_id = ?")
            .bind(paper_number)
            .bind(Json(&question_list))
            .bind(page.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Clear an extra page's data, flagging it incomplete again.
    pub async fn clear_extra_page_data(&self, bundle_id: i64, order: i64) -> Result<()> {
        let mut tx = self.state.pool.begin().await?;
        let page = self.page_for_cast(&mut tx, bundle_id, order).await?;
        if page.status != PageStatus::Extra {
            return Err(StagingError::Validation(format!(
                "page {order} is {}, not an extra page",
                page.status
            )));
        }
        sqlx::query(
            "UPDATE extra_pages SET paper_number = NULL, question_list = NULL WHERE page_id = ?",
        )
        .bind(page.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Resolve a slot collision in favour of this error page: the competing
    /// claimant is discarded and the slot is claimed by this page.
    pub async fn keep_collision_page(&self, user: &str, bundle_id: i64, order: i64) -> Result<()> {
        let mut tx = self.state.pool.begin().await?;
        let bundle = fetch_bundle(&mut *tx, bundle_id).await?;
        if bundle.pushed {
            return Err(StagingError::PushBlockedImmutable(format!(
                "bundle '{}' has been pushed",
                bundle.slug
            )));
        }
        let page = fetch_page(&mut *tx, bundle_id, order).await?;
        if page.status != PageStatus::Error {
            return Err(StagingError::Validation(format!(
                "page {order} is {}, not an error page",
                page.status
            )));
        }

        // Work out the slot this page wanted from its stored QR payload.
        let parsed = match &page.parsed_qr {
            Some(Json(codes)) => codes.clone(),
            None => Vec::new(),
        };
        let decision = qr::evaluate_page(&parsed, &self.state.config.assessment);
        let (paper_number, page_number, version) = match decision {
            TriageDecision::Known {
                paper_number,
                page_number,
                version,
            } => (paper_number, page_number, version),
            _ => {
                return Err(StagingError::Validation(format!(
                    "page {order} does not carry a readable slot claim"
                )));
            }
        };

        // Discard whoever currently holds the slot.
        let claimant: Option<(i64,)> =
            sqlx::query_as("SELECT page_id FROM known_pages WHERE paper_number = ? AND page_number = ?")
                .bind(paper_number)
                .bind(page_number)
                .fetch_optional(&mut *tx)
                .await?;
        if let Some((claimant_id,)) = claimant {
            let claimant_page =
                sqlx::query_as::<_, Page>("SELECT * FROM pages WHERE id = ?")
                    .bind(claimant_id)
                    .fetch_one(&mut *tx)
                    .await?;
            if claimant_page.pushed {
                return Err(StagingError::PushBlockedImmutable(format!(
                    "the competing page for paper {paper_number} page {page_number} has been pushed"
                )));
            }
            sqlx::query("DELETE FROM known_pages WHERE page_id = ?")
                .bind(claimant_id)
                .execute(&mut *tx)
                .await?;
            let reason = format!(
                "lost slot paper {paper_number} page {page_number} to bundle '{}' page {order}, discarded by {user}",
                bundle.slug
            );
            sqlx::query("INSERT INTO discard_pages (page_id, discard_reason) VALUES (?, ?)")
                .bind(claimant_id)
                .bind(&reason)
                .execute(&mut *tx)
                .await?;
            sqlx::query("UPDATE pages SET status = ? WHERE id = ?")
                .bind(PageStatus::Discard)
                .bind(claimant_id)
                .execute(&mut *tx)
                .await?;
        }

        // Claim the slot for this page.
        sqlx::query("DELETE FROM error_pages WHERE page_id = ?")
            .bind(page.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO known_pages (page_id, paper_number, page_number, version)
             VALUES (?, ?, ?, ?)",
        )
        .bind(page.id)
        .bind(paper_number)
        .bind(page_number)
        .bind(version)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE pages SET status = ? WHERE id = ?")
            .bind(PageStatus::Known)
            .bind(page.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(
            "bundle {} page {} kept for paper {} page {} by {}",
            bundle_id,
            order,
            paper_number,
            page_number,
            user
        );
        Ok(())
    }

    /// Fetch the page behind a cast, refusing if the bundle was pushed.
    async fn page_for_cast(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        bundle_id: i64,
        order: i64,
    ) -> Result<Page> {
        let bundle = fetch_bundle(&mut **tx, bundle_id).await?;
        if bundle.pushed {
            return Err(StagingError::PushBlockedImmutable(format!(
                "bundle '{}' has been pushed, its pages cannot be modified",
                bundle.slug
            )));
        }
        fetch_page(&mut **tx, bundle_id, order).await
    }
}

fn status_label(status: PageStatus) -> &'static str {
    match status {
        PageStatus::Unread => "Unread",
        PageStatus::Known => "Known",
        PageStatus::Extra => "Extra",
        PageStatus::Unknown => "Unknown",
        PageStatus::Discard => "Discard",
        PageStatus::Error => "Error",
    }
}

/// Remove the side-table row matching the page's current status, releasing
/// a known page's slot claim in the process.
async fn clear_side_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    page: &Page,
) -> Result<()> {
    let sql = match page.status {
        PageStatus::Known => "DELETE FROM known_pages WHERE page_id = ?",
        PageStatus::Extra => "DELETE FROM extra_pages WHERE page_id = ?",
        PageStatus::Discard => "DELETE FROM discard_pages WHERE page_id = ?",
        PageStatus::Error => "DELETE FROM error_pages WHERE page_id = ?",
        PageStatus::Unread | PageStatus::Unknown => return Ok(()),
    };
    sqlx::query(sql).bind(page.id).execute(&mut **tx).await?;
    Ok(())
}
