// src/models/page.rs

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, types::Json};

/// Triage state of a staged page.
///
/// `Unread` is transient, pending QR decode. `Unknown` and `Error` require
/// manager intervention. `Known`, `Extra` and `Discard` are workflow-terminal
/// but stay mutable until the owning bundle is pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    Unread,
    Known,
    Extra,
    Unknown,
    Discard,
    Error,
}

impl PageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageStatus::Unread => "unread",
            PageStatus::Known => "known",
            PageStatus::Extra => "extra",
            PageStatus::Unknown => "unknown",
            PageStatus::Discard => "discard",
            PageStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for PageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One QR code read off a page, after parsing the raw string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParsedQr {
    /// A regular test-page code: "TTTTTPPPVVVOCCCCC".
    TestPage {
        paper_number: i64,
        page_number: i64,
        version: i64,
        public_code: String,
        quadrant: u8,
    },
    /// The printed extra-page code ("scanX" plus corner digit).
    ExtraPage { quadrant: u8 },
    /// The printed scrap-paper code ("scanS" plus corner digit).
    ScrapPaper { quadrant: u8 },
    /// A string that decoded but matches no known grammar.
    Unparseable { raw: String },
}

/// Represents the 'pages' table: one position within a bundle.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Page {
    pub id: i64,
    pub bundle_id: i64,
    /// 1-based position in the bundle; unique and contiguous over [1, n].
    pub bundle_order: i64,
    pub image_path: String,
    pub image_hash: String,
    /// Rotation in degrees, one of 0/90/180/270.
    pub rotation: i64,
    pub status: PageStatus,
    pub parsed_qr: Option<Json<Vec<ParsedQr>>>,
    pub pushed: bool,
}

/// Side data for a page in `known` state: its claimed slot.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct KnownPage {
    pub page_id: i64,
    pub paper_number: i64,
    pub page_number: i64,
    pub version: i64,
}

/// Side data for a page in `extra` state. Both fields must be set before
/// the page counts as "complete".
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ExtraPage {
    pub page_id: i64,
    pub paper_number: Option<i64>,
    pub question_list: Option<Json<Vec<i64>>>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DiscardPage {
    pub page_id: i64,
    pub discard_reason: String,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ErrorPage {
    pub page_id: i64,
    pub error_reason: String,
}

/// View-model for one page, as shown to the operator. One variant per
/// triage state so presentation code matches on this instead of comparing
/// status strings.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum PageView {
    Unread,
    Known {
        paper_number: i64,
        page_number: i64,
        version: i64,
    },
    Extra {
        paper_number: Option<i64>,
        question_list: Option<Vec<i64>>,
    },
    Unknown,
    Discard { reason: String },
    Error { reason: String },
}

impl PageView {
    pub fn status(&self) -> PageStatus {
        match self {
            PageView::Unread => PageStatus::Unread,
            PageView::Known { .. } => PageStatus::Known,
            PageView::Extra { .. } => PageStatus::Extra,
            PageView::Unknown => PageStatus::Unknown,
            PageView::Discard { .. } => PageStatus::Discard,
            PageView::Error { .. } => PageStatus::Error,
        }
    }
}

/// One entry of a bundle's page listing, in bundle order.
#[derive(Debug, Clone, Serialize)]
pub struct PageSnapshot {
    /// Zero-padded 1-based order, padded to the width of the page count.
    pub order: String,
    pub rotation: i64,
    #[serde(flatten)]
    pub view: PageView,
}

/// Full detail for one page on the operator review screen, including the
/// raw QR payload.
#[derive(Debug, Clone, Serialize)]
pub struct PageDetail {
    pub order: String,
    pub rotation: i64,
    pub qr_codes: Vec<ParsedQr>,
    #[serde(flatten)]
    pub view: PageView,
}
