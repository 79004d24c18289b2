//! Wellcome funding schemes listing page, read from its embedded
//! `__NEXT_DATA__` JSON payload.

use async_trait::async_trait;
use fsbot_core::Opportunity;
use fsbot_storage::{canonicalize_url, HttpFetcher};
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use url::Url;

use crate::text::{html_to_text, lenient_date, non_empty, normalize_whitespace};
use crate::{fetch_body, FetchContext, FetchError, Source, SourceSettings};

const OPEN_STATUS: &str = "open to applications";

fn json_str<'a>(value: &'a JsonValue, key: &str) -> Option<&'a str> {
    value.get(key).and_then(JsonValue::as_str)
}

/// Ids may be numbers or strings in the payload.
fn json_id(value: &JsonValue) -> Option<String> {
    match value.get("id")? {
        JsonValue::String(s) => non_empty(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn extract_listings(source_id: &str, page: &str) -> Result<Vec<JsonValue>, FetchError> {
    let document = Html::parse_document(page);
    let selector = Selector::parse("script#__NEXT_DATA__")
        .map_err(|e| FetchError::parse(source_id, e.to_string()))?;
    let script = document
        .select(&selector)
        .next()
        .ok_or_else(|| FetchError::parse(source_id, "response missing __NEXT_DATA__ payload"))?;

    let payload: JsonValue =
        serde_json::from_str(&script.text().collect::<String>()).map_err(|e| {
            FetchError::parse(source_id, format!("__NEXT_DATA__ is not valid JSON: {e}"))
        })?;

    let listings = payload
        .pointer("/props/pageProps/initialListings")
        .or_else(|| payload.pointer("/pageProps/initialListings"));
    Ok(match listings {
        Some(JsonValue::Array(items)) => {
            items.iter().filter(|v| v.is_object()).cloned().collect()
        }
        _ => Vec::new(),
    })
}

#[derive(Debug, Clone)]
pub struct WellcomeSchemesSource {
    settings: SourceSettings,
}

impl WellcomeSchemesSource {
    pub fn new(settings: SourceSettings) -> Self {
        Self { settings }
    }

    /// Open schemes only, sorted by title.
    pub fn parse_page(&self, page: &str) -> Result<Vec<Opportunity>, FetchError> {
        let listings = extract_listings(&self.settings.id, page)?;

        let mut opportunities = Vec::new();
        for listing in &listings {
            let Some(opportunity) = self.listing_to_opportunity(listing) else {
                continue;
            };
            match opportunity.validate() {
                Ok(()) => opportunities.push(opportunity),
                Err(err) => warn!(source_id = %self.settings.id, %err, "skipping listing"),
            }
        }

        opportunities.sort_by_key(|o| o.title.to_lowercase());
        Ok(opportunities)
    }

    fn listing_to_opportunity(&self, listing: &JsonValue) -> Option<Opportunity> {
        let status = normalize_whitespace(json_str(listing, "scheme_accepting_applications")?);
        if !status.eq_ignore_ascii_case(OPEN_STATUS) {
            return None;
        }

        let title = html_to_text(json_str(listing, "title").unwrap_or("Untitled opportunity"));
        let url = self.absolute_url(json_str(listing, "url").unwrap_or_default());

        let mut opportunity =
            Opportunity::new(&self.settings.id, normalize_whitespace(&title), url);
        opportunity.source_display_name = self.settings.display_name.clone();
        opportunity.external_id = json_id(listing);
        opportunity.summary =
            html_to_text(json_str(listing, "listing_summary").unwrap_or_default());
        opportunity.deadline =
            json_str(listing, "scheme_closes_for_applications").and_then(lenient_date);
        opportunity.opening_date =
            json_str(listing, "scheme_opens_for_applications").and_then(lenient_date);
        opportunity.total_fund = json_str(listing, "level_of_funding")
            .map(html_to_text)
            .and_then(non_empty);
        opportunity.funder = Some("Wellcome".to_string());
        opportunity.funding_type = json_str(listing, "frequency")
            .map(normalize_whitespace)
            .and_then(non_empty);
        Some(opportunity)
    }

    fn absolute_url(&self, raw: &str) -> String {
        let raw = raw.trim();
        if raw.is_empty() || raw.starts_with("http://") || raw.starts_with("https://") {
            return canonicalize_url(raw);
        }
        Url::parse(&self.settings.url)
            .and_then(|base| base.join(raw))
            .map(|joined| canonicalize_url(joined.as_str()))
            .unwrap_or_else(|_| raw.to_string())
    }
}

#[async_trait]
impl Source for WellcomeSchemesSource {
    fn source_id(&self) -> &str {
        &self.settings.id
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<Vec<Opportunity>, FetchError> {
        let body = fetch_body(&self.settings, http, ctx).await?;
        let opportunities = self.parse_page(&body)?;
        info!(
            source_id = %self.settings.id,
            count = opportunities.len(),
            "parsed scheme listings"
        );
        Ok(opportunities)
    }
}
