//! Lenient publication-date parsing for metadata fields.

use chrono::{DateTime, NaiveDate};

/// Parse the date part of the common forms found in meta tags and PDF info
/// dictionaries. Times and zones are discarded.
pub(crate) fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Some(pdf) = raw.strip_prefix("D:") {
        return parse_compact(pdf);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.date_naive());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.date_naive());
    }

    // `2024-03-05T10:00:00` without a zone, or a bare date.
    let date_part = raw.split(['T', ' ']).next().unwrap_or(raw);
    for fmt in ["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(date_part, fmt) {
            return Some(date);
        }
    }
    for fmt in ["%B %d, %Y", "%b %d, %Y", "%d %B %Y", "%d %b %Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(date);
        }
    }

    // Year-month or year only: first day of the period.
    let parts: Vec<&str> = date_part.split(['-', '/']).collect();
    match parts.as_slice() {
        [y, m] if y.len() == 4 => NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, 1),
        [y] if y.len() == 4 => NaiveDate::from_ymd_opt(y.parse().ok()?, 1, 1),
        _ if raw.chars().all(|c| c.is_ascii_digit()) => parse_compact(raw),
        _ => None,
    }
}

/// `YYYYMMDD...` with optional trailing time fields.
fn parse_compact(raw: &str) -> Option<NaiveDate> {
    let digits: String = raw.chars().take_while(char::is_ascii_digit).collect();
    if digits.len() < 4 {
        return None;
    }
    let year = digits.get(0..4)?.parse().ok()?;
    let month = digits.get(4..6).and_then(|m| m.parse().ok()).unwrap_or(1);
    let day = digits.get(6..8).and_then(|d| d.parse().ok()).unwrap_or(1);
    NaiveDate::from_ymd_opt(year, month, day)
}
