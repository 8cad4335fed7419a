// src/utils/tpv.rs

use std::sync::OnceLock;

use regex::Regex;

use crate::models::page::ParsedQr;

// A test-page code is 17 digits: "TTTTTPPPVVVOCCCCC" = 5-digit paper
// number, 3-digit page number, 3-digit version, 1-digit corner, 5-digit
// public code. Extra-page and scrap-paper stickers carry "scanX"/"scanS"
// plus the corner digit instead.

fn tpv_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{5})(\d{3})(\d{3})([1-4])(\d{5})$").unwrap())
}

fn extra_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^scanX([1-4])$").unwrap())
}

fn scrap_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^scanS([1-4])$").unwrap())
}

/// Parse one raw QR string into its page-code variant.
/// Strings matching no grammar come back as `Unparseable`.
pub fn parse_code(raw: &str) -> ParsedQr {
    if let Some(caps) = tpv_re().captures(raw) {
        return ParsedQr::TestPage {
            paper_number: caps[1].parse().unwrap(),
            page_number: caps[2].parse().unwrap(),
            version: caps[3].parse().unwrap(),
            quadrant: caps[4].parse().unwrap(),
            public_code: caps[5].to_string(),
        };
    }
    if let Some(caps) = extra_re().captures(raw) {
        return ParsedQr::ExtraPage {
            quadrant: caps[1].parse().unwrap(),
        };
    }
    if let Some(caps) = scrap_re().captures(raw) {
        return ParsedQr::ScrapPaper {
            quadrant: caps[1].parse().unwrap(),
        };
    }
    ParsedQr::Unparseable {
        raw: raw.to_string(),
    }
}

/// Render the test-page code for a (paper, page, version) slot, as printed
/// in the given corner.
pub fn encode_tpv(
    paper_number: i64,
    page_number: i64,
    version: i64,
    quadrant: u8,
    public_code: &str,
) -> String {
    format!("{paper_number:05}{page_number:03}{version:03}{quadrant}{public_code}")
}

pub fn encode_extra_code(quadrant: u8) -> String {
    format!("scanX{quadrant}")
}

pub fn encode_scrap_code(quadrant: u8) -> String {
    format!("scanS{quadrant}")
}
