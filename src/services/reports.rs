// src/services/reports.rs
//
// Read-only queries over the staging area: page snapshots for operator
// review, job-progress polling, and the bundle status summary.

use std::collections::{BTreeMap, HashMap};

use crate::error::{Result, StagingError};
use crate::models::bundle::{Bundle, BundleStatusSummary, JobStatus};
use crate::models::page::{
    DiscardPage, ErrorPage, ExtraPage, KnownPage, Page, PageDetail, PageSnapshot, PageStatus,
    PageView,
};
use crate::services::scan::{ScanService, fetch_bundle, fetch_page};

impl ScanService {
    pub async fn get_bundle(&self, bundle_id: i64) -> Result<Bundle> {
        fetch_bundle(&self.state.pool, bundle_id).await
    }

    pub async fn get_bundle_by_slug(&self, slug: &str) -> Result<Bundle> {
        sqlx::query_as::<_, Bundle>("SELECT * FROM bundles WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.state.pool)
            .await?
            .ok_or_else(|| StagingError::NotFound(format!("bundle '{slug}' does not exist")))
    }

    /// Look a bundle up by its upload timestamp, its external identity.
    pub async fn get_bundle_from_timestamp(
        &self,
        timestamp: chrono::DateTime<chrono::Utc>,
    ) -> Result<Bundle> {
        sqlx::query_as::<_, Bundle>("SELECT * FROM bundles WHERE timestamp = ?")
            .bind(timestamp)
            .fetch_optional(&self.state.pool)
            .await?
            .ok_or_else(|| {
                StagingError::NotFound(format!("no bundle uploaded at {timestamp}"))
            })
    }

    pub async fn get_page(&self, bundle_id: i64, order: i64) -> Result<Page> {
        fetch_page(&self.state.pool, bundle_id, order).await
    }

    pub async fn get_all_pages(&self, bundle_id: i64) -> Result<Vec<Page>> {
        Ok(sqlx::query_as::<_, Page>(
            "SELECT * FROM pages WHERE bundle_id = ? ORDER BY bundle_order",
        )
        .bind(bundle_id)
        .fetch_all(&self.state.pool)
        .await?)
    }

    pub async fn count_pages(&self, bundle_id: i64, status: PageStatus) -> Result<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM pages WHERE bundle_id = ? AND status = ?")
                .bind(bundle_id)
                .bind(status)
                .fetch_one(&self.state.pool)
                .await?,
        )
    }

    /// Extra pages with both paper number and question list set.
    pub async fn count_extras_with_data(&self, bundle_id: i64) -> Result<i64> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM pages p
             JOIN extra_pages e ON e.page_id = p.id
             WHERE p.bundle_id = ?
               AND e.paper_number IS NOT NULL AND e.question_list IS NOT NULL",
        )
        .bind(bundle_id)
        .fetch_one(&self.state.pool)
        .await?)
    }

    /// A bundle is perfect when it has no unread, unknown or error pages
    /// and every extra page carries data: everything is known, discarded,
    /// or an extra page with data.
    pub async fn is_bundle_perfect(&self, bundle_id: i64) -> Result<bool> {
        let n_bad: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pages
             WHERE bundle_id = ? AND status IN ('unread', 'unknown', 'error')",
        )
        .bind(bundle_id)
        .fetch_one(&self.state.pool)
        .await?;
        if n_bad > 0 {
            return Ok(false);
        }
        let n_incomplete_extra: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM pages p
             JOIN extra_pages e ON e.page_id = p.id
             WHERE p.bundle_id = ? AND (e.paper_number IS NULL OR e.question_list IS NULL)",
        )
        .bind(bundle_id)
        .fetch_one(&self.state.pool)
        .await?;
        Ok(n_incomplete_extra == 0)
    }

    pub async fn get_bundle_split_completions(&self, bundle_id: i64) -> Result<i64> {
        job_completions(&self.state.pool, "split_tasks", bundle_id).await
    }

    pub async fn get_bundle_qr_completions(&self, bundle_id: i64) -> Result<i64> {
        job_completions(&self.state.pool, "qr_read_tasks", bundle_id).await
    }

    pub async fn is_bundle_mid_splitting(&self, bundle_id: i64) -> Result<bool> {
        let bundle = self.get_bundle(bundle_id).await?;
        if bundle.has_page_images {
            return Ok(false);
        }
        job_in_flight(&self.state.pool, "split_tasks", bundle_id).await
    }

    pub async fn is_bundle_mid_qr_read(&self, bundle_id: i64) -> Result<bool> {
        let bundle = self.get_bundle(bundle_id).await?;
        if bundle.has_qr_codes {
            return Ok(false);
        }
        job_in_flight(&self.state.pool, "qr_read_tasks", bundle_id).await
    }

    /// The pages of a bundle in bundle order, each with its per-status info.
    pub async fn get_bundle_pages_info(&self, bundle_id: i64) -> Result<Vec<PageSnapshot>> {
        let bundle = self.get_bundle(bundle_id).await?;
        let n_digits = bundle.number_of_pages.to_string().len();
        let pages = self.get_all_pages(bundle_id).await?;
        let views = self.page_views(bundle_id, &pages).await?;

        Ok(pages
            .iter()
            .map(|page| PageSnapshot {
                order: format!("{:0width$}", page.bundle_order, width = n_digits),
                rotation: page.rotation,
                view: views[&page.id].clone(),
            })
            .collect())
    }

    /// Everything the operator review screen shows for one page, including
    /// its raw QR payload.
    pub async fn get_bundle_single_page_info(
        &self,
        bundle_id: i64,
        order: i64,
    ) -> Result<PageDetail> {
        let bundle = self.get_bundle(bundle_id).await?;
        let n_digits = bundle.number_of_pages.to_string().len();
        let page = self.get_page(bundle_id, order).await?;
        let views = self.page_views(bundle_id, std::slice::from_ref(&page)).await?;

        Ok(PageDetail {
            order: format!("{:0width$}", page.bundle_order, width = n_digits),
            rotation: page.rotation,
            qr_codes: page
                .parsed_qr
                .as_ref()
                .map(|json| json.0.clone())
                .unwrap_or_default(),
            view: views[&page.id].clone(),
        })
    }

    /// Snapshot listing restricted to one status (unknown, discard, extra
    /// review screens).
    pub async fn get_bundle_pages_info_for_status(
        &self,
        bundle_id: i64,
        status: PageStatus,
    ) -> Result<Vec<PageSnapshot>> {
        Ok(self
            .get_bundle_pages_info(bundle_id)
            .await?
            .into_iter()
            .filter(|snapshot| snapshot.view.status() == status)
            .collect())
    }

    /// Sorted paper numbers present in the bundle, from known pages and
    /// extra pages with data.
    pub async fn get_bundle_paper_numbers(&self, bundle_id: i64) -> Result<Vec<i64>> {
        let mut numbers: Vec<i64> = sqlx::query_scalar(
            "SELECT DISTINCT paper_number FROM (
                 SELECT k.paper_number FROM known_pages k
                 JOIN pages p ON p.id = k.page_id WHERE p.bundle_id = ?
                 UNION
                 SELECT e.paper_number FROM extra_pages e
                 JOIN pages p ON p.id = e.page_id
                 WHERE p.bundle_id = ?
                   AND e.paper_number IS NOT NULL AND e.question_list IS NOT NULL
             )",
        )
        .bind(bundle_id)
        .bind(bundle_id)
        .fetch_all(&self.state.pool)
        .await?;
        numbers.sort_unstable();
        Ok(numbers)
    }

    /// Papers in this bundle that have some but not all of their known
    /// pages, with the missing page numbers.
    pub async fn get_bundle_missing_paper_page_numbers(
        &self,
        bundle_id: i64,
    ) -> Result<Vec<(i64, Vec<i64>)>> {
        let n_pages = self.state.config.assessment.pages_per_paper;
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT k.paper_number, k.page_number FROM known_pages k
             JOIN pages p ON p.id = k.page_id
             WHERE p.bundle_id = ?
             ORDER BY k.paper_number, k.page_number",
        )
        .bind(bundle_id)
        .fetch_all(&self.state.pool)
        .await?;

        let mut papers: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
        for (paper, page) in rows {
            papers.entry(paper).or_default().push(page);
        }

        Ok(papers
            .into_iter()
            .filter(|(_, present)| !present.is_empty() && (present.len() as i64) < n_pages)
            .map(|(paper, present)| {
                let missing = (1..=n_pages).filter(|pg| !present.contains(pg)).collect();
                (paper, missing)
            })
            .collect())
    }

    /// Number of papers in this bundle with more than zero but fewer than
    /// all of their known pages.
    pub async fn count_incomplete_papers(&self, bundle_id: i64) -> Result<i64> {
        Ok(self
            .get_bundle_missing_paper_page_numbers(bundle_id)
            .await?
            .len() as i64)
    }

    /// One summary row per staged bundle, for the status overview.
    pub async fn staging_status_summary(&self) -> Result<Vec<BundleStatusSummary>> {
        let bundles = sqlx::query_as::<_, Bundle>("SELECT * FROM bundles ORDER BY id")
            .fetch_all(&self.state.pool)
            .await?;

        let mut summary = Vec::with_capacity(bundles.len());
        for bundle in bundles {
            let total_pages = if self.is_bundle_mid_splitting(bundle.id).await? {
                let done = self.get_bundle_split_completions(bundle.id).await?;
                format!("in progress: {done} of {}", bundle.number_of_pages)
            } else {
                let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pages WHERE bundle_id = ?")
                    .bind(bundle.id)
                    .fetch_one(&self.state.pool)
                    .await?;
                n.to_string()
            };

            let qr_read = if self.is_bundle_mid_qr_read(bundle.id).await? {
                let done = self.get_bundle_qr_completions(bundle.id).await?;
                format!("in progress ({done})")
            } else {
                bundle.has_qr_codes.to_string()
            };

            summary.push(BundleStatusSummary {
                slug: bundle.slug.clone(),
                id: bundle.id,
                total_pages,
                n_unknowns: self.count_pages(bundle.id, PageStatus::Unknown).await?,
                n_knowns: self.count_pages(bundle.id, PageStatus::Known).await?,
                n_extras_with_data: self.count_extras_with_data(bundle.id).await?,
                n_discards: self.count_pages(bundle.id, PageStatus::Discard).await?,
                n_errors: self.count_pages(bundle.id, PageStatus::Error).await?,
                qr_read,
                pushed: bundle.pushed,
                uploaded_by: bundle.uploaded_by,
            });
        }
        Ok(summary)
    }

    /// Build the per-status view for each given page of a bundle, fetching
    /// each side table once rather than querying per page.
    async fn page_views(
        &self,
        bundle_id: i64,
        pages: &[Page],
    ) -> Result<HashMap<i64, PageView>> {
        let knowns = sqlx::query_as::<_, KnownPage>(
            "SELECT k.* FROM known_pages k JOIN pages p ON p.id = k.page_id WHERE p.bundle_id = ?",
        )
        .bind(bundle_id)
        .fetch_all(&self.state.pool)
        .await?;
        let extras = sqlx::query_as::<_, ExtraPage>(
            "SELECT e.* FROM extra_pages e JOIN pages p ON p.id = e.page_id WHERE p.bundle_id = ?",
        )
        .bind(bundle_id)
        .fetch_all(&self.state.pool)
        .await?;
        let discards = sqlx::query_as::<_, DiscardPage>(
            "SELECT d.* FROM discard_pages d JOIN pages p ON p.id = d.page_id WHERE p.bundle_id = ?",
        )
        .bind(bundle_id)
        .fetch_all(&self.state.pool)
        .await?;
        let errors = sqlx::query_as::<_, ErrorPage>(
            "SELECT e.* FROM error_pages e JOIN pages p ON p.id = e.page_id WHERE p.bundle_id = ?",
        )
        .bind(bundle_id)
        .fetch_all(&self.state.pool)
        .await?;

        let knowns: HashMap<i64, KnownPage> =
            knowns.into_iter().map(|k| (k.page_id, k)).collect();
        let extras: HashMap<i64, ExtraPage> =
            extras.into_iter().map(|e| (e.page_id, e)).collect();
        let discards: HashMap<i64, DiscardPage> =
            discards.into_iter().map(|d| (d.page_id, d)).collect();
        let errors: HashMap<i64, ErrorPage> =
            errors.into_iter().map(|e| (e.page_id, e)).collect();

        let mut views = HashMap::with_capacity(pages.len());
        for page in pages {
            let view = match page.status {
                PageStatus::Unread => PageView::Unread,
                PageStatus::Unknown => PageView::Unknown,
                PageStatus::Known => {
                    let k = knowns.get(&page.id).ok_or_else(|| missing_side_row(page))?;
                    PageView::Known {
                        paper_number: k.paper_number,
                        page_number: k.page_number,
                        version: k.version,
                    }
                }
                PageStatus::Extra => {
                    let e = extras.get(&page.id).ok_or_else(|| missing_side_row(page))?;
                    PageView::Extra {
                        paper_number: e.paper_number,
                        question_list: e.question_list.as_ref().map(|json| json.0.clone()),
                    }
                }
                PageStatus::Discard => {
                    let d = discards.get(&page.id).ok_or_else(|| missing_side_row(page))?;
                    PageView::Discard {
                        reason: d.discard_reason.clone(),
                    }
                }
                PageStatus::Error => {
                    let e = errors.get(&page.id).ok_or_else(|| missing_side_row(page))?;
                    PageView::Error {
                        reason: e.error_reason.clone(),
                    }
                }
            };
            views.insert(page.id, view);
        }
        Ok(views)
    }
}

fn missing_side_row(page: &Page) -> StagingError {
    StagingError::Internal(format!(
        "page {} is {} but has no matching side data",
        page.id, page.status
    ))
}

async fn job_completions(
    pool: &sqlx::SqlitePool,
    table: &str,
    bundle_id: i64,
) -> Result<i64> {
    let sql = format!("SELECT completed_pages FROM {table} WHERE bundle_id = ?");
    sqlx::query_scalar(&sql)
        .bind(bundle_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| {
            StagingError::NotFound(format!("bundle {bundle_id} has no {table} job"))
        })
}

async fn job_in_flight(pool: &sqlx::SqlitePool, table: &str, bundle_id: i64) -> Result<bool> {
    let sql = format!("SELECT status FROM {table} WHERE bundle_id = ?");
    let status: Option<JobStatus> = sqlx::query_scalar(&sql)
        .bind(bundle_id)
        .fetch_optional(pool)
        .await?;
    Ok(matches!(status, Some(JobStatus::Queued) | Some(JobStatus::Running)))
}
