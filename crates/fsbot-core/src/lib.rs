//! Core domain model for funding opportunities and their dedupe history.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;

/// Normalized funding opportunity shared by every source.
///
/// Values are immutable once a source has produced them. The canonical
/// external id is not stored here; the dedupe store derives it from
/// `external_id`/`raw_guid` or the url so normalization lives in one place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opportunity {
    pub source_id: String,
    pub source_display_name: Option<String>,
    /// Source-provided identifier, before normalization.
    pub external_id: Option<String>,
    pub raw_guid: Option<String>,
    pub title: String,
    pub summary: String,
    pub url: String,
    pub funder: Option<String>,
    pub funding_type: Option<String>,
    pub total_fund: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub opening_date: Option<NaiveDate>,
    pub deadline: Option<NaiveDate>,
}

impl Opportunity {
    /// Minimal record with the required fields; everything optional is empty.
    pub fn new(
        source_id: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            source_display_name: None,
            external_id: None,
            raw_guid: None,
            title: title.into(),
            summary: String::new(),
            url: url.into(),
            funder: None,
            funding_type: None,
            total_fund: None,
            published_at: None,
            opening_date: None,
            deadline: None,
        }
    }

    /// `title` and `url` must be non-empty. Dates are typed, so a present
    /// deadline is always a calendar date.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle);
        }
        if self.url.trim().is_empty() {
            return Err(ValidationError::EmptyUrl {
                title: self.title.clone(),
            });
        }
        Ok(())
    }

    /// Name used when presenting the source to people.
    pub fn source_label(&self) -> &str {
        self.source_display_name
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.source_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("opportunity title is empty")]
    EmptyTitle,
    #[error("opportunity '{title}' has no url")]
    EmptyUrl { title: String },
    #[error("deadline '{0}' is not a calendar date")]
    InvalidDeadline(String),
}

/// Persisted dedupe history row. Never deleted; `posted_at` moves from
/// `None` to a timestamp exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupeRecord {
    pub external_id: String,
    pub source_id: String,
    pub first_seen_at: DateTime<Utc>,
    pub posted_at: Option<DateTime<Utc>>,
    pub title: String,
    pub url: String,
    pub match_reason: Option<String>,
}

impl DedupeRecord {
    pub fn is_posted(&self) -> bool {
        self.posted_at.is_some()
    }
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%d %B %Y",
    "%d %b %Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%A %d %B %Y",
    "%d/%m/%Y",
];

/// Parse the date part of free-form feed text such as `30 March 2026`,
/// `2026-03-30`, `Tue, 06 Jan 2026 10:00:00 +0000` or
/// `30 March 2026 4:00pm UK time`.
pub fn parse_calendar_date(text: &str) -> Result<NaiveDate, ValidationError> {
    let cleaned = text.trim().trim_end_matches('.');
    if let Some(ts) = parse_timestamp(cleaned) {
        return Ok(ts.date_naive());
    }

    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    for take in (1..=tokens.len().min(4)).rev() {
        let candidate = tokens[..take].join(" ");
        for format in DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(&candidate, format) {
                return Ok(date);
            }
        }
    }
    Err(ValidationError::InvalidDeadline(text.to_string()))
}

/// RFC 2822 / RFC 3339 / naive ISO timestamps, all normalized to UTC.
/// Date-only values become midnight UTC.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.format("%Y-%m-%d %H:%M UTC").to_string()
}
