// src/services/scan.rs

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::types::Json;
use tokio::task::JoinSet;
use validator::Validate;

use crate::error::{Result, StagingError};
use crate::models::bundle::{Bundle, JobStatus, UploadBundleRequest};
use crate::models::page::{Page, PageStatus};
use crate::models::paper::PaperPageSlot;
use crate::services::qr::{self, DecodedPage, QrDecoder, TriageDecision};
use crate::state::AppState;

/// One rendered page image, produced by the ingestion collaborator.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub path: String,
    pub hash: String,
}

/// External bundle-ingestion collaborator: renders one 1-indexed page of
/// an uploaded PDF to a raster image.
#[async_trait]
pub trait PageImageSource: Send + Sync {
    async fn render_page(&self, bundle_slug: &str, index: i64) -> std::io::Result<PageImage>;
}

/// Staging workflow for scanned bundles: upload, background split and
/// QR-read jobs, error-page rescans, and the final push.
pub struct ScanService {
    pub(crate) state: AppState,
}

impl ScanService {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Upload a bundle and start the background job that renders its page
    /// images. Returns the new bundle's id immediately; progress is polled
    /// via `is_bundle_mid_splitting` / `get_bundle_split_completions`.
    pub async fn upload_bundle(
        &self,
        req: &UploadBundleRequest,
        source: Arc<dyn PageImageSource>,
    ) -> Result<i64> {
        req.validate()
            .map_err(|e| StagingError::Validation(e.to_string()))?;

        if self.check_for_duplicate_hash(&req.pdf_hash).await? {
            return Err(StagingError::Validation(format!(
                "a bundle with hash {} has already been uploaded",
                req.pdf_hash
            )));
        }

        let timestamp = chrono::Utc::now();
        let bundle_id = sqlx::query(
            "INSERT INTO bundles (slug, timestamp, pdf_hash, uploaded_by, number_of_pages)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&req.slug)
        .bind(timestamp)
        .bind(&req.pdf_hash)
        .bind(&req.uploaded_by)
        .bind(req.number_of_pages)
        .execute(&self.state.pool)
        .await?
        .last_insert_rowid();

        sqlx::query("INSERT INTO split_tasks (bundle_id, status, created_at) VALUES (?, ?, ?)")
            .bind(bundle_id)
            .bind(JobStatus::Queued)
            .bind(timestamp)
            .execute(&self.state.pool)
            .await?;

        tracing::info!("bundle '{}' uploaded by {}", req.slug, req.uploaded_by);

        let state = self.state.clone();
        tokio::spawn(async move {
            if let Err(e) = split_bundle(&state, bundle_id, source).await {
                tracing::error!("split job for bundle {} failed: {:?}", bundle_id, e);
                let _ = sqlx::query("UPDATE split_tasks SET status = ? WHERE bundle_id = ?")
                    .bind(JobStatus::Error)
                    .bind(bundle_id)
                    .execute(&state.pool)
                    .await;
            }
        });

        Ok(bundle_id)
    }

    pub async fn check_for_duplicate_hash(&self, pdf_hash: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM bundles WHERE pdf_hash = ?")
            .bind(pdf_hash)
            .fetch_optional(&self.state.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Remove a bundle and all its staged pages, releasing any slot claims.
    /// Refused once the bundle has been pushed.
    pub async fn remove_bundle(&self, bundle_id: i64) -> Result<()> {
        let bundle = fetch_bundle(&self.state.pool, bundle_id).await?;
        if bundle.pushed {
            return Err(StagingError::PushBlockedImmutable(format!(
                "bundle '{}' has been pushed, cannot remove it",
                bundle.slug
            )));
        }
        sqlx::query("DELETE FROM bundles WHERE id = ?")
            .bind(bundle_id)
            .execute(&self.state.pool)
            .await?;
        tracing::info!("bundle '{}' removed from staging", bundle.slug);
        Ok(())
    }

    /// Start the background QR-read job for a bundle: one concurrent decode
    /// per page, each page triaged independently as its result lands.
    /// A no-op if a QR-read job was already started for this bundle.
    pub async fn read_qr_codes(&self, bundle_id: i64, decoder: Arc<dyn QrDecoder>) -> Result<()> {
        let bundle = fetch_bundle(&self.state.pool, bundle_id).await?;
        if bundle.pushed {
            return Err(StagingError::PushBlockedImmutable(format!(
                "bundle '{}' has been pushed",
                bundle.slug
            )));
        }
        if !bundle.has_page_images {
            return Err(StagingError::Validation(format!(
                "bundle '{}' page images are not ready yet",
                bundle.slug
            )));
        }

        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT bundle_id FROM qr_read_tasks WHERE bundle_id = ?")
                .bind(bundle_id)
                .fetch_optional(&self.state.pool)
                .await?;
        if existing.is_some() {
            return Ok(());
        }

        sqlx::query("INSERT INTO qr_read_tasks (bundle_id, status, created_at) VALUES (?, ?, ?)")
            .bind(bundle_id)
            .bind(JobStatus::Queued)
            .bind(chrono::Utc::now())
            .execute(&self.state.pool)
            .await?;

        let state = self.state.clone();
        tokio::spawn(async move {
            if let Err(e) = process_qr_codes(&state, bundle_id, decoder).await {
                tracing::error!("qr-read job for bundle {} failed: {:?}", bundle_id, e);
                let _ = sqlx::query("UPDATE qr_read_tasks SET status = ? WHERE bundle_id = ?")
                    .bind(JobStatus::Error)
                    .bind(bundle_id)
                    .execute(&state.pool)
                    .await;
            }
        });

        Ok(())
    }

    /// Send an error page back through the decode pipeline: reset it to
    /// unread, decode its image again and re-apply triage. Used after the
    /// operator replaces the image or resolves whatever caused the error.
    pub async fn rescan_page(
        &self,
        bundle_id: i64,
        order: i64,
        decoder: Arc<dyn QrDecoder>,
    ) -> Result<()> {
        let bundle = fetch_bundle(&self.state.pool, bundle_id).await?;
        if bundle.pushed {
            return Err(StagingError::PushBlockedImmutable(format!(
                "bundle '{}' has been pushed",
                bundle.slug
            )));
        }
        let page = fetch_page(&self.state.pool, bundle_id, order).await?;
        if page.status != PageStatus::Error {
            return Err(StagingError::Validation(format!(
                "page {order} of bundle '{}' is {}, only error pages can be re-scanned",
                bundle.slug, page.status
            )));
        }

        let mut tx = self.state.pool.begin().await?;
        sqlx::query("DELETE FROM error_pages WHERE page_id = ?")
            .bind(page.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE pages SET status = ?, parsed_qr = NULL WHERE id = ?")
            .bind(PageStatus::Unread)
            .bind(page.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let page = fetch_page(&self.state.pool, bundle_id, order).await?;
        let decoded = decoder.decode_page(&page.image_path).await;
        apply_page_triage(&self.state, &page, decoded).await
    }

    /// Push a bundle into the official record. All-or-nothing: the bundle
    /// and every page flip to pushed in one transaction, or nothing does.
    ///
    /// Refused while any page is unread/unknown/error or any extra page
    /// lacks data. Papers missing some of their known pages only warn:
    /// `confirm_incomplete` pushes anyway.
    pub async fn push_bundle(
        &self,
        user: &str,
        bundle_id: i64,
        confirm_incomplete: bool,
    ) -> Result<()> {
        let mut tx = self.state.pool.begin().await?;

        let bundle = fetch_bundle(&mut *tx, bundle_id).await?;
        if bundle.pushed {
            return Err(StagingError::PushBlockedImmutable(format!(
                "bundle '{}' has already been pushed, cannot push again",
                bundle.slug
            )));
        }
        if !bundle.has_qr_codes {
            return Err(StagingError::PushBlockedIncomplete(format!(
                "QR codes of bundle '{}' are not all read",
                bundle.slug
            )));
        }

        let n_unresolved: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pages
             WHERE bundle_id = ? AND status IN ('unread', 'unknown', 'error')",
        )
        .bind(bundle_id)
        .fetch_one(&mut *tx)
        .await?;
        if n_unresolved > 0 {
            return Err(StagingError::PushBlockedIncomplete(format!(
                "bundle '{}' has {} unresolved pages",
                bundle.slug, n_unresolved
            )));
        }

        let n_extra_without_data: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pages p
             JOIN extra_pages e ON e.page_id = p.id
             WHERE p.bundle_id = ? AND (e.paper_number IS NULL OR e.question_list IS NULL)",
        )
        .bind(bundle_id)
        .fetch_one(&mut *tx)
        .await?;
        if n_extra_without_data > 0 {
            return Err(StagingError::PushBlockedIncomplete(format!(
                "bundle '{}' has {} extra pages without data",
                bundle.slug, n_extra_without_data
            )));
        }

        if !confirm_incomplete {
            let n_incomplete = count_incomplete_papers_in_tx(
                &mut tx,
                bundle_id,
                self.state.config.assessment.pages_per_paper,
            )
            .await?;
            if n_incomplete > 0 {
                return Err(StagingError::PushBlockedIncomplete(format!(
                    "bundle '{}' has {} incomplete papers, confirm to push anyway",
                    bundle.slug, n_incomplete
                )));
            }
        }

        sqlx::query("UPDATE bundles SET pushed = 1 WHERE id = ?")
            .bind(bundle_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE pages SET pushed = 1 WHERE bundle_id = ?")
            .bind(bundle_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!("bundle '{}' pushed by {}", bundle.slug, user);
        Ok(())
    }
}

async fn count_incomplete_papers_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    bundle_id: i64,
    pages_per_paper: i64,
) -> Result<i64> {
    let counts: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT k.paper_number, COUNT(*) FROM known_pages k
         JOIN pages p ON p.id = k.page_id
         WHERE p.bundle_id = ?
         GROUP BY k.paper_number",
    )
    .bind(bundle_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(counts
        .iter()
        .filter(|&&(_, n)| n > 0 && n < pages_per_paper)
        .count() as i64)
}

pub(crate) async fn fetch_bundle<'e, E>(executor: E, bundle_id: i64) -> Result<Bundle>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query_as::<_, Bundle>("SELECT * FROM bundles WHERE id = ?")
        .bind(bundle_id)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| StagingError::NotFound(format!("bundle {bundle_id} does not exist")))
}

pub(crate) async fn fetch_page<'e, E>(executor: E, bundle_id: i64, order: i64) -> Result<Page>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query_as::<_, Page>("SELECT * FROM pages WHERE bundle_id = ? AND bundle_order = ?")
        .bind(bundle_id)
        .bind(order)
        .fetch_optional(executor)
        .await?
        .ok_or_else(|| {
            StagingError::NotFound(format!("bundle {bundle_id} has no page {order}"))
        })
}

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

// ----------------------------------------
// The background jobs, factored out of the service impl.
// ----------------------------------------

/// Render every page of a bundle concurrently, then land the page rows and
/// the processing-complete flag in one transaction. The per-page progress
/// counter is updated as renders finish.
pub async fn split_bundle(
    state: &AppState,
    bundle_id: i64,
    source: Arc<dyn PageImageSource>,
) -> Result<()> {
    let bundle = fetch_bundle(&state.pool, bundle_id).await?;
    sqlx::query("UPDATE split_tasks SET status = ? WHERE bundle_id = ?")
        .bind(JobStatus::Running)
        .bind(bundle_id)
        .execute(&state.pool)
        .await?;

    let mut join_set = JoinSet::new();
    for index in 1..=bundle.number_of_pages {
        let source = Arc::clone(&source);
        let slug = bundle.slug.clone();
        join_set.spawn(async move {
            let image = source.render_page(&slug, index).await;
            (index, image)
        });
    }

    let mut rendered = Vec::with_capacity(bundle.number_of_pages as usize);
    while let Some(joined) = join_set.join_next().await {
        let (index, image) = joined
            .map_err(|e| StagingError::Internal(format!("render task panicked: {e}")))?;
        let image = image.map_err(|e| {
            StagingError::Internal(format!("rendering page {index} failed: {e}"))
        })?;
        rendered.push((index, image));
        sqlx::query("UPDATE split_tasks SET completed_pages = ? WHERE bundle_id = ?")
            .bind(rendered.len() as i64)
            .bind(bundle_id)
            .execute(&state.pool)
            .await?;
    }

    let mut tx = state.pool.begin().await?;
    for (index, image) in &rendered {
        sqlx::query(
            "INSERT INTO pages (bundle_id, bundle_order, image_path, image_hash)
             VALUES (?, ?, ?, ?)",
        )
        .bind(bundle_id)
        .bind(index)
        .bind(&image.path)
        .bind(&image.hash)
        .execute(&mut *tx)
        .await?;
    }
    sqlx::query("UPDATE bundles SET has_page_images = 1 WHERE id = ?")
        .bind(bundle_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE split_tasks SET status = ? WHERE bundle_id = ?")
        .bind(JobStatus::Complete)
        .bind(bundle_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    tracing::info!(
        "bundle '{}' split into {} page images",
        bundle.slug,
        bundle.number_of_pages
    );
    Ok(())
}

/// Decode every unread page of a bundle concurrently and triage each one
/// as its result lands. The bundle-level has_qr_codes flag is only set
/// after every per-page result is in.
pub async fn process_qr_codes(
    state: &AppState,
    bundle_id: i64,
    decoder: Arc<dyn QrDecoder>,
) -> Result<()> {
    sqlx::query("UPDATE qr_read_tasks SET status = ? WHERE bundle_id = ?")
        .bind(JobStatus::Running)
        .bind(bundle_id)
        .execute(&state.pool)
        .await?;

    let pages = sqlx::query_as::<_, Page>(
        "SELECT * FROM pages WHERE bundle_id = ? AND status = 'unread' ORDER BY bundle_order",
    )
    .bind(bundle_id)
    .fetch_all(&state.pool)
    .await?;

    let mut join_set = JoinSet::new();
    for page in pages {
        let decoder = Arc::clone(&decoder);
        join_set.spawn(async move {
            let decoded = decoder.decode_page(&page.image_path).await;
            (page, decoded)
        });
    }

    let mut done: i64 = 0;
    while let Some(joined) = join_set.join_next().await {
        let (page, decoded) =
            joined.map_err(|e| StagingError::Internal(format!("decode task panicked: {e}")))?;
        // One page failing to triage must not abort its siblings.
        if let Err(e) = apply_page_triage(state, &page, decoded).await {
            tracing::error!(
                "triage of page {} in bundle {} failed: {:?}",
                page.bundle_order,
                bundle_id,
                e
            );
        }
        done += 1;
        sqlx::query("UPDATE qr_read_tasks SET completed_pages = ? WHERE bundle_id = ?")
            .bind(done)
            .bind(bundle_id)
            .execute(&state.pool)
            .await?;
    }

    let mut tx = state.pool.begin().await?;
    sqlx::query("UPDATE bundles SET has_qr_codes = 1 WHERE id = ?")
        .bind(bundle_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE qr_read_tasks SET status = ? WHERE bundle_id = ?")
        .bind(JobStatus::Complete)
        .bind(bundle_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    tracing::info!("bundle {} qr-read complete", bundle_id);
    Ok(())
}

/// Apply the decode result for one page: store the parsed codes and move
/// the page out of `unread`. The slot claim for a known page is made inside
/// the same transaction as the status change, with the unique slot index
/// re-validating the claim no matter what was checked earlier.
pub async fn apply_page_triage(
    state: &AppState,
    page: &Page,
    decoded: DecodedPage,
) -> Result<()> {
    let parsed = qr::parse_codes(&decoded.codes);
    let decision = qr::evaluate_page(&parsed, &state.config.assessment);

    let mut tx = state.pool.begin().await?;
    sqlx::query("UPDATE pages SET parsed_qr = ?, rotation = ? WHERE id = ?")
        .bind(Json(&parsed))
        .bind(decoded.rotation)
        .bind(page.id)
        .execute(&mut *tx)
        .await?;

    match decision {
        TriageDecision::Unknown => {
            set_page_status(&mut tx, page.id, PageStatus::Unknown).await?;
        }
        TriageDecision::Extra => {
            sqlx::query("INSERT INTO extra_pages (page_id) VALUES (?)")
                .bind(page.id)
                .execute(&mut *tx)
                .await?;
            set_page_status(&mut tx, page.id, PageStatus::Extra).await?;
        }
        TriageDecision::Scrap => {
            sqlx::query("INSERT INTO discard_pages (page_id, discard_reason) VALUES (?, ?)")
                .bind(page.id)
                .bind("scrap paper")
                .execute(&mut *tx)
                .await?;
            set_page_status(&mut tx, page.id, PageStatus::Discard).await?;
        }
        TriageDecision::Error { reason } => {
            set_page_error(&mut tx, page.id, &reason).await?;
        }
        TriageDecision::Known {
            paper_number,
            page_number,
            version,
        } => {
            let slot = sqlx::query_as::<_, PaperPageSlot>(
                "SELECT paper_number, page_number, version FROM paper_pages
                 WHERE paper_number = ? AND page_number = ?",
            )
            .bind(paper_number)
            .bind(page_number)
            .fetch_optional(&mut *tx)
            .await?;

            match slot {
                None => {
                    let reason = format!(
                        "paper {paper_number} page {page_number} is not in the database"
                    );
                    set_page_error(&mut tx, page.id, &reason).await?;
                }
                Some(slot) if slot.version != version => {
                    let reason = format!(
                        "paper {paper_number} page {page_number} should be version {}, code says {version}",
                        slot.version
                    );
                    set_page_error(&mut tx, page.id, &reason).await?;
                }
                Some(_) => {
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
                        Ok(_) => {
                            set_page_status(&mut tx, page.id, PageStatus::Known).await?;
                        }
                        Err(e) if is_unique_violation(&e) => {
                            let reason = format!(
                                "collision: paper {paper_number} page {page_number} is already claimed by another page"
                            );
                            set_page_error(&mut tx, page.id, &reason).await?;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
    }

    tx.commit().await?;
    Ok(())
}

async fn set_page_status(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    page_id: i64,
    status: PageStatus,
) -> Result<()> {
    sqlx::query("UPDATE pages SET status = ? WHERE id = ?")
        .bind(status)
        .bind(page_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn set_page_error(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    page_id: i64,
    reason: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO error_pages (page_id, error_reason) VALUES (?, ?)")
        .bind(page_id)
        .bind(reason)
        .execute(&mut **tx)
        .await?;
    set_page_status(tx, page_id, PageStatus::Error).await
}
