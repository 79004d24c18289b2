//! Source contracts, the static source registry and the concrete feed readers.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fsbot_core::Opportunity;
use fsbot_storage::{HttpError, HttpFetcher};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

mod rss;
pub mod text;
mod wellcome;

pub use rss::RssSource;
pub use wellcome::WellcomeSchemesSource;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// One `sources[]` entry from the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SourceSettings {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl SourceSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl FetchContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("source {source_id}: {source}")]
    Http {
        source_id: String,
        #[source]
        source: HttpError,
    },
    #[error("source {source_id}: {message}")]
    Parse { source_id: String, message: String },
}

impl FetchError {
    pub fn parse(source_id: &str, message: impl Into<String>) -> Self {
        Self::Parse {
            source_id: source_id.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait Source: Send + Sync {
    fn source_id(&self) -> &str;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
    ) -> Result<Vec<Opportunity>, FetchError>;
}

/// Registered source types. Lookup is by the `type` key used in config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Rss,
    WellcomeSchemes,
}

pub type SourceFactory = fn(&SourceSettings) -> Box<dyn Source>;

fn build_rss(settings: &SourceSettings) -> Box<dyn Source> {
    Box::new(RssSource::new(settings.clone()))
}

fn build_wellcome_schemes(settings: &SourceSettings) -> Box<dyn Source> {
    Box::new(WellcomeSchemesSource::new(settings.clone()))
}

impl SourceKind {
    pub const ALL: [SourceKind; 2] = [SourceKind::Rss, SourceKind::WellcomeSchemes];

    pub fn key(self) -> &'static str {
        match self {
            SourceKind::Rss => "rss",
            SourceKind::WellcomeSchemes => "wellcome_schemes",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.key() == key.trim())
    }

    pub fn factory(self) -> SourceFactory {
        match self {
            SourceKind::Rss => build_rss,
            SourceKind::WellcomeSchemes => build_wellcome_schemes,
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown source type '{kind}'. Registered source types: {available}")]
pub struct UnknownSourceType {
    pub kind: String,
    pub available: String,
}

pub fn registered_source_types() -> Vec<&'static str> {
    let mut keys: Vec<_> = SourceKind::ALL.iter().map(|kind| kind.key()).collect();
    keys.sort_unstable();
    keys
}

pub fn create_source(settings: &SourceSettings) -> Result<Box<dyn Source>, UnknownSourceType> {
    let kind = SourceKind::from_key(&settings.kind).ok_or_else(|| UnknownSourceType {
        kind: settings.kind.clone(),
        available: registered_source_types().join(", "),
    })?;
    Ok((kind.factory())(settings))
}

pub(crate) async fn fetch_body(
    settings: &SourceSettings,
    http: &HttpFetcher,
    ctx: &FetchContext,
) -> Result<String, FetchError> {
    let body = http
        .fetch_bytes(ctx.run_id, &settings.id, &settings.url, Some(settings.timeout()))
        .await
        .map_err(|source| FetchError::Http {
            source_id: settings.id.clone(),
            source,
        })?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}

#[cfg(test)]
pub(crate) fn settings(kind: &str, url: &str) -> SourceSettings {
    SourceSettings {
        id: "ukri_rss".to_string(),
        kind: kind.to_string(),
        url: url.to_string(),
        display_name: None,
        timeout_seconds: Some(5),
    }
}
