//! Dedupe persistence, URL canonicalization and HTTP fetch utilities.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use fsbot_core::{DedupeRecord, Opportunity};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, Instrument};
use url::Url;
use uuid::Uuid;

const TRACKING_QUERY_PARAMS: &[&str] = &[
    "fbclid", "gclid", "igshid", "mc_cid", "mc_eid", "mkt_tok", "ref", "source",
];

fn is_tracking_param(key: &str) -> bool {
    let lowered = key.to_ascii_lowercase();
    lowered.starts_with("utm_") || TRACKING_QUERY_PARAMS.contains(&lowered.as_str())
}

/// Normalize a URL for stable hashing: lowercase scheme/host, drop the
/// fragment and tracking parameters, sort what remains of the query and
/// strip a trailing slash from non-root paths. Values that are not absolute
/// URLs come back trimmed but otherwise untouched.
pub fn canonicalize_url(raw: &str) -> String {
    let value = raw.trim();
    if value.is_empty() {
        return String::new();
    }
    let Ok(mut parsed) = Url::parse(value) else {
        return value.to_string();
    };
    if parsed.cannot_be_a_base() || parsed.host_str().is_none() {
        return value.to_string();
    }

    parsed.set_fragment(None);

    let path = parsed.path().to_string();
    if path != "/" && path.ends_with('/') {
        parsed.set_path(path.trim_end_matches('/'));
    }

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&pairs)
            .finish();
        parsed.set_query(Some(&query));
    }

    parsed.to_string()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Source-provided ids win. URL-shaped ids are canonicalized so that
/// tracking noise in a guid does not split history; anything else is used
/// trimmed. Without an id the canonical url is hashed.
pub fn derive_external_id(raw_id: Option<&str>, canonical_url: &str) -> String {
    match raw_id.map(str::trim).filter(|id| !id.is_empty()) {
        Some(id) if id.starts_with("http://") || id.starts_with("https://") => {
            canonicalize_url(id)
        }
        Some(id) => id.to_string(),
        None => format!("urlhash:{}", sha256_hex(canonical_url.as_bytes())),
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{external_id} was already posted")]
    AlreadyPosted { external_id: String },
    #[error("no dedupe record for {external_id}")]
    UnknownRecord { external_id: String },
    #[error("creating store directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, FromRow)]
struct RecordRow {
    external_id: String,
    source_id: String,
    first_seen_at: DateTime<Utc>,
    posted_at: Option<DateTime<Utc>>,
    title: String,
    url: String,
    match_reason: Option<String>,
}

impl From<RecordRow> for DedupeRecord {
    fn from(row: RecordRow) -> Self {
        Self {
            external_id: row.external_id,
            source_id: row.source_id,
            first_seen_at: row.first_seen_at,
            posted_at: row.posted_at,
            title: row.title,
            url: row.url,
            match_reason: row.match_reason,
        }
    }
}

/// SQLite-backed table of every external id ever observed.
///
/// One connection, opened once per run. Each write touches a single row.
#[derive(Debug, Clone)]
pub struct DedupeStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl DedupeStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the `opportunities` table and its `posted_at` index if absent.
    pub async fn init_db(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS opportunities (
                external_id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL,
                first_seen_at TEXT NOT NULL,
                posted_at TEXT NULL,
                title TEXT NOT NULL,
                url TEXT NOT NULL,
                match_reason TEXT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_opportunities_posted_at ON opportunities (posted_at)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn canonical_id(opportunity: &Opportunity) -> String {
        let raw_id = opportunity
            .external_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .or(opportunity.raw_guid.as_deref());
        derive_external_id(raw_id, &canonicalize_url(&opportunity.url))
    }

    /// True unless a record for `external_id` already has `posted_at` set.
    pub async fn is_new(&self, external_id: &str) -> Result<bool, StoreError> {
        let posted_at: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar("SELECT posted_at FROM opportunities WHERE external_id = ?")
                .bind(external_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(!matches!(posted_at, Some(Some(_))))
    }

    /// First write wins: returns `false` and leaves the row untouched when the
    /// id is already known.
    pub async fn record_seen(
        &self,
        opportunity: &Opportunity,
        external_id: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO opportunities (external_id, source_id, first_seen_at, posted_at, title, url, match_reason)
            VALUES (?, ?, ?, NULL, ?, ?, NULL)
            ON CONFLICT(external_id) DO NOTHING
            "#,
        )
        .bind(external_id)
        .bind(&opportunity.source_id)
        .bind(Utc::now())
        .bind(&opportunity.title)
        .bind(&opportunity.url)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        debug!(external_id, inserted, "recorded opportunity as seen");
        Ok(inserted)
    }

    pub async fn mark_posted(
        &self,
        external_id: &str,
        match_reason: &str,
    ) -> Result<DateTime<Utc>, StoreError> {
        let posted_at = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE opportunities
            SET posted_at = ?, match_reason = ?
            WHERE external_id = ? AND posted_at IS NULL
            "#,
        )
        .bind(posted_at)
        .bind(match_reason)
        .bind(external_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(posted_at);
        }

        match self.get(external_id).await? {
            Some(_) => Err(StoreError::AlreadyPosted {
                external_id: external_id.to_string(),
            }),
            None => Err(StoreError::UnknownRecord {
                external_id: external_id.to_string(),
            }),
        }
    }

    pub async fn get(&self, external_id: &str) -> Result<Option<DedupeRecord>, StoreError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT external_id, source_id, first_seen_at, posted_at, title, url, match_reason
            FROM opportunities
            WHERE external_id = ?
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(DedupeRecord::from))
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(concat!("funding-bot/", env!("CARGO_PKG_VERSION")).to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin GET client. One attempt per call; the client's own timeout is the
/// only cancellation.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// GET `url` and return the body of a 2xx response.
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, HttpError> {
        let span = tracing::info_span!("http_fetch", %run_id, source_id, url);
        async move {
            let mut request = self.client.get(url);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            let resp = request.send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(HttpError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }

            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), %status, "fetched");
            Ok(body)
        }
        .instrument(span)
        .await
    }
}
