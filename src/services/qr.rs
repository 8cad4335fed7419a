// src/services/qr.rs

use async_trait::async_trait;

use crate::config::AssessmentSpec;
use crate::models::page::ParsedQr;
use crate::utils::tpv;

/// Raw result of decoding one page image: the QR strings found on it plus
/// the rotation (degrees, multiple of 90) needed to bring the page upright.
#[derive(Debug, Clone)]
pub struct DecodedPage {
    pub codes: Vec<String>,
    pub rotation: i64,
}

/// External QR decode collaborator. Purely functional: the triage machinery
/// applies results, the decoder never touches page state.
#[async_trait]
pub trait QrDecoder: Send + Sync {
    async fn decode_page(&self, image_path: &str) -> DecodedPage;
}

/// Where a freshly decoded page should be routed.
#[derive(Debug, Clone, PartialEq)]
pub enum TriageDecision {
    /// No codes at all. Needs manager attention but is not an error.
    Unknown,
    /// Extra-page stickers: becomes an extra page with no data yet.
    Extra,
    /// Scrap-paper stickers: discarded outright.
    Scrap,
    /// A consistent set of test-page codes. The slot claim itself is
    /// checked atomically at transition time, not here.
    Known {
        paper_number: i64,
        page_number: i64,
        version: i64,
    },
    Error { reason: String },
}

pub fn parse_codes(codes: &[String]) -> Vec<ParsedQr> {
    codes.iter().map(|raw| tpv::parse_code(raw)).collect()
}

/// Classify one page from its parsed QR codes.
///
/// A readable test page must carry exactly three matching codes (the fourth
/// corner is stapled) whose public code equals the assessment's; anything
/// short of that is routed to `error` with a reason the operator can act on.
pub fn evaluate_page(parsed: &[ParsedQr], spec: &AssessmentSpec) -> TriageDecision {
    if parsed.is_empty() {
        return TriageDecision::Unknown;
    }

    if parsed
        .iter()
        .any(|c| matches!(c, ParsedQr::Unparseable { .. }))
    {
        return TriageDecision::Error {
            reason: "invalid QR code".to_string(),
        };
    }

    let n_extra = parsed
        .iter()
        .filter(|c| matches!(c, ParsedQr::ExtraPage { .. }))
        .count();
    let n_scrap = parsed
        .iter()
        .filter(|c| matches!(c, ParsedQr::ScrapPaper { .. }))
        .count();

    if n_extra == parsed.len() {
        return TriageDecision::Extra;
    }
    if n_scrap == parsed.len() {
        return TriageDecision::Scrap;
    }
    if n_extra + n_scrap > 0 {
        return TriageDecision::Error {
            reason: "mix of test-page and extra/scrap codes".to_string(),
        };
    }

    // All codes are test-page codes from here on.
    if parsed.len() < 3 {
        return TriageDecision::Error {
            reason: format!(
                "only {} of 3 QR codes read, page may be folded",
                parsed.len()
            ),
        };
    }
    if parsed.len() > 3 {
        return TriageDecision::Error {
            reason: "more than 3 QR codes read".to_string(),
        };
    }

    let mut slots = parsed.iter().filter_map(|c| match c {
        ParsedQr::TestPage {
            paper_number,
            page_number,
            version,
            public_code,
            ..
        } => Some((*paper_number, *page_number, *version, public_code.clone())),
        _ => None,
    });

    let (paper_number, page_number, version, public_code) = slots.next().unwrap();
    for (p, pg, v, code) in slots {
        if (p, pg, v) != (paper_number, page_number, version) {
            return TriageDecision::Error {
                reason: "QR codes do not match".to_string(),
            };
        }
        if code != public_code {
            return TriageDecision::Error {
                reason: "QR codes do not match".to_string(),
            };
        }
    }

    if public_code != spec.public_code {
        return TriageDecision::Error {
            reason: format!(
                "public code {} does not match assessment code {}, wrong test scanned?",
                public_code, spec.public_code
            ),
        };
    }

    TriageDecision::Known {
        paper_number,
        page_number,
        version,
    }
}
