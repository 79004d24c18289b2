//! Helpers for turning feed HTML into plain text and mining labelled lines.

use chrono::NaiveDate;
use fsbot_core::parse_calendar_date;
use scraper::{Html, Node};
use tracing::debug;

const BREAK_TAGS: &[&str] = &[
    "br", "p", "li", "div", "tr", "h1", "h2", "h3", "h4", "h5", "h6", "ul", "ol", "table",
];

fn is_break_tag(name: &str) -> bool {
    BREAK_TAGS.contains(&name)
}

pub fn normalize_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Flatten an HTML fragment to text. Block-level tags become line breaks,
/// entities are decoded, and blank lines are dropped.
pub fn html_to_text(html: &str) -> String {
    let fragment = Html::parse_fragment(html);
    let mut out = String::new();

    for node in fragment.root_element().descendants() {
        match node.value() {
            Node::Element(element) if is_break_tag(element.name()) => out.push('\n'),
            Node::Text(text) => {
                let after_block = node
                    .prev_sibling()
                    .and_then(|sibling| sibling.value().as_element())
                    .is_some_and(|element| is_break_tag(element.name()));
                if after_block {
                    out.push('\n');
                }
                out.push_str(text);
            }
            _ => {}
        }
    }

    out.lines()
        .map(normalize_whitespace)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Optional metadata some feeds embed in the summary as `Label: value` lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelledFields {
    pub opening_date: Option<NaiveDate>,
    pub closing_date: Option<NaiveDate>,
    pub funder: Option<String>,
    pub funding_type: Option<String>,
    pub total_fund: Option<String>,
}

pub fn extract_labelled_fields(summary: &str) -> LabelledFields {
    let mut fields = LabelledFields::default();

    for line in summary.lines() {
        let line = normalize_whitespace(line);
        if line.is_empty() {
            continue;
        }
        let lowered = line.to_lowercase();
        let value = line
            .split_once(':')
            .map(|(_, v)| v.trim().to_string())
            .unwrap_or_default();

        if lowered.starts_with("opening date") {
            if let Some(date) = lenient_date(&value) {
                fields.opening_date = Some(date);
            }
        } else if lowered.starts_with("closing date") {
            if let Some(date) = lenient_date(&value) {
                fields.closing_date = Some(date);
            }
        } else if lowered.starts_with("funder") || lowered.starts_with("council") {
            if !value.is_empty() {
                fields.funder = Some(value);
            }
        } else if lowered.starts_with("funding type") {
            fields.funding_type = non_empty(value);
        } else if lowered.starts_with("total fund") {
            fields.total_fund = non_empty(value);
        }
    }

    fields
}

/// Dates that fail to parse are dropped rather than rejecting the item.
pub fn lenient_date(value: &str) -> Option<NaiveDate> {
    if value.trim().is_empty() {
        return None;
    }
    match parse_calendar_date(value) {
        Ok(date) => Some(date),
        Err(err) => {
            debug!(%err, "ignoring unparseable date");
            None
        }
    }
}

pub fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
