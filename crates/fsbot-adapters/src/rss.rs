//! RSS 2.0, RSS 1.0 (RDF) and Atom feed reader.

use async_trait::async_trait;
use fsbot_core::{parse_timestamp, Opportunity};
use fsbot_storage::{canonicalize_url, HttpFetcher};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;
use tracing::{info, warn};

use crate::text::{extract_labelled_fields, html_to_text, normalize_whitespace};
use crate::{fetch_body, FetchContext, FetchError, Source, SourceSettings};

const UNTITLED: &str = "Untitled opportunity";

#[derive(Debug, Default, Deserialize)]
struct Text {
    #[serde(rename = "$text", default)]
    value: String,
}

fn text_of(node: &Option<Text>) -> Option<&str> {
    node.as_ref()
        .map(|t| t.value.trim())
        .filter(|v| !v.is_empty())
}

#[derive(Debug, Deserialize)]
struct RssDocument {
    #[serde(default)]
    channel: RssChannel,
}

#[derive(Debug, Default, Deserialize)]
struct RssChannel {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RdfDocument {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Default, Deserialize)]
struct RssItem {
    title: Option<Text>,
    link: Option<Text>,
    guid: Option<Text>,
    #[serde(rename = "pubDate")]
    pub_date: Option<Text>,
    description: Option<Text>,
    #[serde(rename = "category", default)]
    categories: Vec<Text>,
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct AtomEntry {
    title: Option<Text>,
    id: Option<Text>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
    published: Option<Text>,
    updated: Option<Text>,
    summary: Option<Text>,
    content: Option<Text>,
    #[serde(rename = "category", default)]
    categories: Vec<AtomCategory>,
}

#[derive(Debug, Default, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href", default)]
    href: String,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AtomCategory {
    #[serde(rename = "@term", default)]
    term: String,
}

/// Format-neutral view of one feed entry.
#[derive(Debug, Default)]
struct FeedEntry {
    title: Option<String>,
    link: Option<String>,
    identifier: Option<String>,
    published: Option<String>,
    summary_html: Option<String>,
    tags: Vec<String>,
}

impl From<RssItem> for FeedEntry {
    fn from(item: RssItem) -> Self {
        Self {
            title: text_of(&item.title).map(str::to_string),
            link: text_of(&item.link).map(str::to_string),
            identifier: text_of(&item.guid).map(str::to_string),
            published: text_of(&item.pub_date).map(str::to_string),
            summary_html: text_of(&item.description).map(str::to_string),
            tags: item
                .categories
                .into_iter()
                .map(|c| c.value.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
        }
    }
}

impl From<AtomEntry> for FeedEntry {
    fn from(entry: AtomEntry) -> Self {
        let link = entry
            .links
            .iter()
            .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")))
            .or(entry.links.first())
            .map(|l| l.href.trim().to_string())
            .filter(|href| !href.is_empty());
        Self {
            title: text_of(&entry.title).map(str::to_string),
            link,
            identifier: text_of(&entry.id).map(str::to_string),
            published: text_of(&entry.published)
                .or(text_of(&entry.updated))
                .map(str::to_string),
            summary_html: text_of(&entry.summary)
                .or(text_of(&entry.content))
                .map(str::to_string),
            tags: entry
                .categories
                .into_iter()
                .map(|c| c.term.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
        }
    }
}

fn root_element_name(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase();
                return Some(name);
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

fn parse_entries(source_id: &str, xml: &str) -> Result<Vec<FeedEntry>, FetchError> {
    let root = root_element_name(xml)
        .ok_or_else(|| FetchError::parse(source_id, "response is not an XML feed"))?;
    let malformed = |err: quick_xml::de::DeError| {
        FetchError::parse(source_id, format!("malformed {root} feed: {err}"))
    };

    let entries = match root.as_str() {
        "rss" => quick_xml::de::from_str::<RssDocument>(xml)
            .map_err(malformed)?
            .channel
            .items
            .into_iter()
            .map(FeedEntry::from)
            .collect(),
        "rdf" => quick_xml::de::from_str::<RdfDocument>(xml)
            .map_err(malformed)?
            .items
            .into_iter()
            .map(FeedEntry::from)
            .collect(),
        "feed" => quick_xml::de::from_str::<AtomFeed>(xml)
            .map_err(malformed)?
            .entries
            .into_iter()
            .map(FeedEntry::from)
            .collect(),
        other => {
            return Err(FetchError::parse(
                source_id,
                format!("unsupported feed root element <{other}>"),
            ))
        }
    };
    Ok(entries)
}

#[derive(Debug, Clone)]
pub struct RssSource {
    settings: SourceSettings,
}

impl RssSource {
    pub fn new(settings: SourceSettings) -> Self {
        Self { settings }
    }

    /// Map a feed document to opportunities, newest first. Entries that fail
    /// validation are skipped.
    pub fn parse_feed(&self, xml: &str) -> Result<Vec<Opportunity>, FetchError> {
        let entries = parse_entries(&self.settings.id, xml)?;

        let mut opportunities = Vec::with_capacity(entries.len());
        for entry in entries {
            let opportunity = self.entry_to_opportunity(entry);
            match opportunity.validate() {
                Ok(()) => opportunities.push(opportunity),
                Err(err) => warn!(source_id = %self.settings.id, %err, "skipping feed entry"),
            }
        }

        opportunities.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        Ok(opportunities)
    }

    fn entry_to_opportunity(&self, entry: FeedEntry) -> Opportunity {
        let title = entry
            .title
            .map(|t| normalize_whitespace(&html_to_text(&t)))
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| UNTITLED.to_string());
        let url = canonicalize_url(entry.link.as_deref().unwrap_or_default());
        let summary = entry
            .summary_html
            .as_deref()
            .map(html_to_text)
            .unwrap_or_default();

        let fields = extract_labelled_fields(&summary);
        let funder = fields
            .funder
            .or_else(|| (!entry.tags.is_empty()).then(|| entry.tags.join(", ")));

        let mut opportunity = Opportunity::new(&self.settings.id, title, url);
        opportunity.source_display_name = self.settings.display_name.clone();
        opportunity.raw_guid = entry.identifier;
        opportunity.summary = summary;
        opportunity.published_at = entry.published.as_deref().and_then(parse_timestamp);
        opportunity.opening_date = fields.opening_date;
        opportunity.deadline = fields.closing_date;
        opportunity.funder = funder;
        opportunity.funding_type = fields.funding_type;
        opportunity.total_fund = fields.total_fund;
        opportunity
    }
}

#[async_trait]
impl Source for RssSource {
    fn source_id(&self) -> &str {
        &self.settings.id
    }

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<Vec<Opportunity>, FetchError> {
        let body = fetch_body(&self.settings, http, ctx).await?;
        let opportunities = self.parse_feed(&body)?;
        info!(source_id = %self.settings.id, count = opportunities.len(), "parsed feed");
        Ok(opportunities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings;
    use chrono::{NaiveDate, TimeZone, Utc};
    use fsbot_storage::DedupeStore;

    fn source() -> RssSource {
        RssSource::new(settings("rss", "https://www.ukri.org/opportunity/feed/"))
    }

    #[test]
    fn rss_item_maps_to_opportunity_with_guid() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
        <rss version="2.0">
          <channel>
            <title>Example</title>
            <link>https://www.ukri.org/</link>
            <item>
              <title>AI for health systems</title>
              <link>https://www.ukri.org/opportunity/example-opportunity/?utm_source=rss</link>
              <guid isPermaLink="true">https://www.ukri.org/opportunity/example-opportunity/?utm_source=rss</guid>
              <pubDate>Tue, 06 Jan 2026 10:00:00 +0000</pubDate>
              <description><![CDATA[<p>Closing date: 30 March 2026</p><p>Funding type: Grant</p>]]></description>
              <category>MRC</category>
            </item>
          </channel>
        </rss>"#;

        let items = source().parse_feed(xml).unwrap();
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.source_id, "ukri_rss");
        assert_eq!(item.title, "AI for health systems");
        assert_eq!(item.url, "https://www.ukri.org/opportunity/example-opportunity");
        assert_eq!(
            item.published_at,
            Some(Utc.with_ymd_and_hms(2026, 1, 6, 10, 0, 0).unwrap())
        );
        assert_eq!(item.deadline, NaiveDate::from_ymd_opt(2026, 3, 30));
        assert_eq!(item.funding_type.as_deref(), Some("Grant"));
        assert_eq!(item.funder.as_deref(), Some("MRC"));
        assert_eq!(DedupeStore::canonical_id(item), item.url);
    }

    #[test]
    fn missing_guid_falls_back_to_stable_url_hash() {
        let xml = r#"<rss version="2.0"><channel>
            <item>
              <title>Digital twin innovation</title>
              <link>https://www.ukri.org/opportunity/another/?utm_medium=rss&amp;utm_campaign=test</link>
              <description>Funding type: Grant</description>
            </item>
        </channel></rss>"#;

        let first = source().parse_feed(xml).unwrap().remove(0);
        let second = source().parse_feed(xml).unwrap().remove(0);
        assert!(first.raw_guid.is_none());
        let id = DedupeStore::canonical_id(&first);
        assert!(id.starts_with("urlhash:"));
        assert_eq!(id, DedupeStore::canonical_id(&second));
    }

    #[test]
    fn entries_without_link_are_skipped_and_order_is_newest_first() {
        let xml = r#"<rss version="2.0"><channel>
            <item><title>Older</title><link>https://example.org/old</link><pubDate>Mon, 05 Jan 2026 10:00:00 +0000</pubDate></item>
            <item><title>No link</title></item>
            <item><title>Undated</title><link>https://example.org/undated</link></item>
            <item><title>Newer</title><link>https://example.org/new</link><pubDate>Wed, 07 Jan 2026 10:00:00 +0000</pubDate></item>
        </channel></rss>"#;

        let titles: Vec<String> = source()
            .parse_feed(xml)
            .unwrap()
            .into_iter()
            .map(|o| o.title)
            .collect();
        assert_eq!(titles, vec!["Newer", "Older", "Undated"]);
    }

    #[test]
    fn atom_entries_are_supported() {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
        <feed xmlns="http://www.w3.org/2005/Atom">
          <title>Funding</title>
          <entry>
            <title type="text">Research Software Fund</title>
            <id>tag:example.org,2026:fund-7</id>
            <link rel="alternate" href="https://example.org/funds/7/"/>
            <updated>2026-01-08T09:30:00Z</updated>
            <summary type="html">&lt;p&gt;Funder: EPSRC&lt;/p&gt;</summary>
            <category term="software"/>
          </entry>
        </feed>"#;

        let items = source().parse_feed(xml).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].url, "https://example.org/funds/7");
        assert_eq!(items[0].raw_guid.as_deref(), Some("tag:example.org,2026:fund-7"));
        assert_eq!(items[0].funder.as_deref(), Some("EPSRC"));
        assert!(items[0].published_at.is_some());
    }

    #[test]
    fn non_feed_documents_are_parse_errors() {
        let err = source().parse_feed("<html><body>nope</body></html>").unwrap_err();
        assert!(matches!(err, FetchError::Parse { .. }));
        assert!(source().parse_feed("").is_err());
    }
}
