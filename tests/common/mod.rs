// tests/common/mod.rs

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use scanstage::config::{AssessmentSpec, Config};
use scanstage::models::page::PageStatus;
use scanstage::services::qr::{DecodedPage, QrDecoder};
use scanstage::services::scan::{PageImage, PageImageSource, ScanService};
use scanstage::state::AppState;
use scanstage::utils::tpv;

pub const PUBLIC_CODE: &str = "93849";

pub fn test_assessment() -> AssessmentSpec {
    AssessmentSpec {
        pages_per_paper: 6,
        questions_per_paper: 4,
        n_versions: 2,
        public_code: PUBLIC_CODE.to_string(),
    }
}

/// Fresh in-memory database with the migrations applied.
pub async fn test_state() -> AppState {
    test_state_with(test_assessment()).await
}

pub async fn test_state_with(assessment: AssessmentSpec) -> AppState {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("bad sqlite url")
        .foreign_keys(true);
    // A single connection kept alive for the whole test: an in-memory
    // database lives and dies with its connection.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .expect("failed to open in-memory database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("failed to run migrations");

    AppState {
        pool,
        config: Config {
            database_url: "sqlite::memory:".to_string(),
            rust_log: "error".to_string(),
            assessment,
        },
    }
}

/// Deterministic stand-in for a PDF sha256.
pub fn fake_hash(seed: &str) -> String {
    let mixed = seed
        .bytes()
        .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
    format!("{mixed:064x}")
}

/// The path the fake image source gives page `index` of a bundle; decoder
/// scripts are keyed by it.
pub fn page_path(slug: &str, index: i64) -> String {
    format!("{slug}/page{index:05}.png")
}

/// Ingestion stand-in: "renders" page images by naming them.
pub struct FakeImageSource;

#[async_trait]
impl PageImageSource for FakeImageSource {
    async fn render_page(&self, bundle_slug: &str, index: i64) -> std::io::Result<PageImage> {
        Ok(PageImage {
            path: page_path(bundle_slug, index),
            hash: fake_hash(&page_path(bundle_slug, index)),
        })
    }
}

/// Decoder stand-in: hands back whatever the test scripted for each image
/// path; unscripted pages decode to nothing.
#[derive(Default)]
pub struct ScriptedDecoder {
    pages: HashMap<String, DecodedPage>,
}

impl ScriptedDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(mut self, image_path: &str, codes: Vec<String>) -> Self {
        self.pages.insert(
            image_path.to_string(),
            DecodedPage { codes, rotation: 0 },
        );
        self
    }

    pub fn script_rotated(mut self, image_path: &str, codes: Vec<String>, rotation: i64) -> Self {
        self.pages
            .insert(image_path.to_string(), DecodedPage { codes, rotation });
        self
    }
}

#[async_trait]
impl QrDecoder for ScriptedDecoder {
    async fn decode_page(&self, image_path: &str) -> DecodedPage {
        self.pages
            .get(image_path)
            .cloned()
            .unwrap_or(DecodedPage {
                codes: Vec::new(),
                rotation: 0,
            })
    }
}

/// The three corner codes a well-printed test page carries.
pub fn tpv_codes(paper: i64, page: i64, version: i64) -> Vec<String> {
    [1, 2, 3]
        .iter()
        .map(|&q| tpv::encode_tpv(paper, page, version, q, PUBLIC_CODE))
        .collect()
}

pub fn extra_codes() -> Vec<String> {
    vec![tpv::encode_extra_code(1), tpv::encode_extra_code(3)]
}

pub fn scrap_codes() -> Vec<String> {
    vec![tpv::encode_scrap_code(1), tpv::encode_scrap_code(3)]
}

/// Upload a bundle through the service and wait for the split job.
pub async fn upload_and_split(
    scanner: &ScanService,
    slug: &str,
    n_pages: i64,
) -> i64 {
    let req = scanstage::models::bundle::UploadBundleRequest {
        slug: slug.to_string(),
        pdf_hash: fake_hash(slug),
        number_of_pages: n_pages,
        uploaded_by: "user0".to_string(),
    };
    let bundle_id = scanner
        .upload_bundle(&req, Arc::new(FakeImageSource))
        .await
        .expect("upload failed");
    wait_for_split(scanner, bundle_id).await;
    bundle_id
}

pub async fn wait_for_split(scanner: &ScanService, bundle_id: i64) {
    for _ in 0..500 {
        if scanner.get_bundle(bundle_id).await.unwrap().has_page_images {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("bundle {bundle_id} split did not finish in time");
}

pub async fn wait_for_qr_read(scanner: &ScanService, bundle_id: i64) {
    for _ in 0..500 {
        if scanner.get_bundle(bundle_id).await.unwrap().has_qr_codes {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("bundle {bundle_id} qr read did not finish in time");
}

/// Insert a bundle directly, past the upload workflow, ready for casts.
pub async fn make_bundle(state: &AppState, slug: &str) -> i64 {
    sqlx::query(
        "INSERT INTO bundles
         (slug, timestamp, pdf_hash, uploaded_by, number_of_pages, has_page_images, has_qr_codes)
         VALUES (?, ?, ?, ?, 0, 1, 1)",
    )
    .bind(slug)
    .bind(chrono::Utc::now())
    .bind(fake_hash(slug))
    .bind("user0")
    .execute(&state.pool)
    .await
    .expect("insert bundle failed")
    .last_insert_rowid()
}

/// Insert a page directly in the given status, with a plausible side row.
/// Known pages claim slot (100 + order, 1) to stay collision-free.
pub async fn make_page(state: &AppState, bundle_id: i64, status: PageStatus) -> i64 {
    let order: i64 =
        sqlx::query_scalar("SELECT COUNT(*) + 1 FROM pages WHERE bundle_id = ?")
            .bind(bundle_id)
            .fetch_one(&state.pool)
            .await
            .expect("count pages failed");

    let page_id = sqlx::query(
        "INSERT INTO pages (bundle_id, bundle_order, image_path, image_hash, status)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(bundle_id)
    .bind(order)
    .bind(format!("bundle{bundle_id}/page{order:05}.png"))
    .bind(fake_hash(&format!("{bundle_id}-{order}")))
    .bind(status)
    .execute(&state.pool)
    .await
    .expect("insert page failed")
    .last_insert_rowid();

    match status {
        PageStatus::Known => {
            sqlx::query(
                "INSERT INTO known_pages (page_id, paper_number, page_number, version)
                 VALUES (?, ?, 1, 1)",
            )
            .bind(page_id)
            .bind(100 + order)
            .execute(&state.pool)
            .await
            .expect("insert known side row failed");
        }
        PageStatus::Extra => {
            sqlx::query("INSERT INTO extra_pages (page_id) VALUES (?)")
                .bind(page_id)
                .execute(&state.pool)
                .await
                .expect("insert extra side row failed");
        }
        PageStatus::Discard => {
            sqlx::query(
                "INSERT INTO discard_pages (page_id, discard_reason) VALUES (?, 'seeded discard')",
            )
            .bind(page_id)
            .execute(&state.pool)
            .await
            .expect("insert discard side row failed");
        }
        PageStatus::Error => {
            sqlx::query(
                "INSERT INTO error_pages (page_id, error_reason) VALUES (?, 'seeded error')",
            )
            .bind(page_id)
            .execute(&state.pool)
            .await
            .expect("insert error side row failed");
        }
        PageStatus::Unread | PageStatus::Unknown => {}
    }

    page_id
}

/// First page of the bundle currently in the given status.
pub async fn first_page_with_status(
    state: &AppState,
    bundle_id: i64,
    status: PageStatus,
) -> i64 {
    sqlx::query_scalar(
        "SELECT bundle_order FROM pages
         WHERE bundle_id = ? AND status = ? ORDER BY bundle_order LIMIT 1",
    )
    .bind(bundle_id)
    .bind(status)
    .fetch_one(&state.pool)
    .await
    .expect("no page with wanted status")
}

pub async fn side_row_count(state: &AppState, table: &str, page_id: i64) -> i64 {
    let sql = format!("SELECT COUNT(*) FROM {table} WHERE page_id = ?");
    sqlx::query_scalar(&sql)
        .bind(page_id)
        .fetch_one(&state.pool)
        .await
        .expect("side row count failed")
}
