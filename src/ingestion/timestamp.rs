//! Timestamp assembly and date/time parsing.
//!
//! A row's timestamp is built from one or more designated columns, joined with a single space
//! in the listed order (`"9/29/2009"` + `"15:00"` -> `"9/29/2009 15:00"`). The text is then
//! parsed with an explicit strftime format when the datamap declares one, or by trying a list of
//! common layouts. Values without an offset are taken to be UTC.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;

use crate::error::ValidationErrors;

/// A timestamp that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("could not parse timestamp '{text}': {reason}")]
pub struct TimestampError {
    pub text: String,
    pub reason: String,
}

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f %z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M%:z",
];

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M",
    "%m/%d/%Y %H:%M:%S%.f",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%y %H:%M:%S",
    "%m/%d/%y %H:%M",
    "%d-%b-%Y %H:%M:%S",
    "%d-%b-%Y %H:%M",
    "%b %d %Y %H:%M:%S",
    "%b %d, %Y %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d", "%m/%d/%y", "%d-%b-%Y"];

/// Parse a date/time string.
///
/// With `format`, only that layout is tried (falling back to a date-only parse at midnight when
/// the layout has no time fields). Without it, RFC 3339 / RFC 2822 are tried first, then the
/// built-in layouts.
pub fn parse_datetime(text: &str, format: Option<&str>) -> Result<DateTime<Utc>, TimestampError> {
    let trimmed = text.trim();
    let fail = |reason: String| TimestampError {
        text: text.to_owned(),
        reason,
    };
    if trimmed.is_empty() {
        return Err(fail("empty timestamp".to_string()));
    }

    if let Some(fmt) = format {
        return parse_with_format(trimmed, fmt).map_err(fail);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::<FixedOffset>::parse_from_str(trimmed, fmt) {
            return Ok(dt.with_timezone(&Utc));
        }
    }

    let naive_text = strip_utc_suffix(trimmed);
    for fmt in NAIVE_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(naive_text, fmt) {
            return Ok(dt.and_utc());
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(naive_text, fmt) {
            if let Some(dt) = d.and_hms_opt(0, 0, 0) {
                return Ok(dt.and_utc());
            }
        }
    }

    Err(fail("unrecognized date/time layout".to_string()))
}

fn parse_with_format(text: &str, fmt: &str) -> Result<DateTime<Utc>, String> {
    if fmt.contains("%z") || fmt.contains("%:z") || fmt.contains("%#z") {
        return DateTime::parse_from_str(text, fmt)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| format!("does not match format '{fmt}': {e}"));
    }
    match NaiveDateTime::parse_from_str(text, fmt) {
        Ok(dt) => Ok(dt.and_utc()),
        Err(e) => NaiveDate::parse_from_str(text, fmt)
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
            .ok_or_else(|| format!("does not match format '{fmt}': {e}")),
    }
}

fn strip_utc_suffix(text: &str) -> &str {
    for suffix in [" UTC", " GMT", "Z"] {
        if let Some(stripped) = text.strip_suffix(suffix) {
            return stripped.trim_end();
        }
    }
    text
}

/// Builds a row timestamp from its designated columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampAssembler {
    indices: Vec<usize>,
    format: Option<String>,
}

impl TimestampAssembler {
    /// Validate `indices` against the number of declared headers.
    ///
    /// An out-of-range index is reported once here, as `{"columns": ["invalid column: N"]}`,
    /// instead of failing every row.
    pub fn new(
        indices: Vec<usize>,
        format: Option<String>,
        header_count: usize,
    ) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        if indices.is_empty() {
            errors.add("columns", "at least one timestamp column is required");
        }
        for idx in &indices {
            if *idx >= header_count {
                errors.add("columns", format!("invalid column: {idx}"));
            }
        }
        errors.into_result()?;
        Ok(Self { indices, format })
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// The raw text the timestamp is parsed from. Missing fields contribute empty strings.
    pub fn text<S: AsRef<str>>(&self, fields: &[S]) -> String {
        self.indices
            .iter()
            .map(|&i| fields.get(i).map(|f| f.as_ref().trim()).unwrap_or(""))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Assemble and parse the timestamp of one row.
    pub fn assemble<S: AsRef<str>>(&self, fields: &[S]) -> Result<DateTime<Utc>, TimestampError> {
        parse_datetime(&self.text(fields), self.format.as_deref())
    }
}
