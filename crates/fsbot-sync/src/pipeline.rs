use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use fsbot_adapters::{create_source, FetchContext, Source};
use fsbot_core::Opportunity;
use fsbot_notify::Notifier;
use fsbot_storage::{DedupeStore, HttpClientConfig, HttpFetcher, StoreError};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::filter::{FilterDecision, FilterEngine};

pub const BACKFILL_REASON: &str = "backfill --mark-seen";

#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub run_id: Uuid,
    pub dry_run: bool,
    pub fetched: usize,
    pub processed: usize,
    pub matched: usize,
    pub filtered_out: usize,
    pub posted: usize,
    pub previewed: usize,
    pub skipped_already_posted: usize,
    /// Recorded as seen after the posting cap was reached; left for a later run.
    pub deferred_by_limit: usize,
    pub failed_sources: usize,
    pub errors: Vec<String>,
}

impl RunStats {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Items that count against the posting cap.
    pub fn delivered(&self) -> usize {
        self.posted + self.previewed
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackfillStats {
    pub run_id: Uuid,
    pub fetched: usize,
    pub recorded: usize,
    pub marked_posted: usize,
    pub already_posted: usize,
    pub failed_sources: usize,
    pub errors: Vec<String>,
}

/// One invocation's worth of wiring: the configured sources, the shared
/// fetcher, the dedupe store and the filter chain.
pub struct RunPipeline {
    sources: Vec<Box<dyn Source>>,
    http: HttpFetcher,
    store: DedupeStore,
    filter: FilterEngine,
    max_posts_per_run: usize,
}

impl RunPipeline {
    pub fn new(
        sources: Vec<Box<dyn Source>>,
        http: HttpFetcher,
        store: DedupeStore,
        filter: FilterEngine,
        max_posts_per_run: usize,
    ) -> Self {
        Self {
            sources,
            http,
            store,
            filter,
            max_posts_per_run: max_posts_per_run.max(1),
        }
    }

    pub fn from_config(config: &AppConfig, store: DedupeStore) -> Result<Self> {
        let sources = config
            .sources
            .iter()
            .map(create_source)
            .collect::<Result<Vec<_>, _>>()?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(fsbot_adapters::DEFAULT_TIMEOUT_SECS),
            ..Default::default()
        })?;
        let filter =
            FilterEngine::from_settings(&config.filters).context("compiling keyword filters")?;
        Ok(Self::new(
            sources,
            http,
            store,
            filter,
            config.max_posts_per_run(),
        ))
    }

    async fn fetch_source(
        &self,
        source: &dyn Source,
        ctx: &FetchContext,
    ) -> std::result::Result<Vec<Opportunity>, String> {
        match source.fetch(&self.http, ctx).await {
            Ok(items) => {
                info!(
                    source_id = source.source_id(),
                    count = items.len(),
                    "source returned opportunities"
                );
                Ok(items)
            }
            Err(err) => {
                warn!(source_id = source.source_id(), error = %err, "source fetch failed");
                Err(format!("source {} fetch failed: {err}", source.source_id()))
            }
        }
    }

    /// Fetch every source once and notify about new matches. Per-source and
    /// per-item failures are recorded in the returned stats and never abort
    /// the run.
    pub async fn run_once(&self, notifier: &dyn Notifier) -> RunStats {
        let run_id = Uuid::new_v4();
        let dry_run = notifier.is_dry_run();
        let span = info_span!("run", %run_id, dry_run, notifier = notifier.name());
        self.run_inner(run_id, notifier).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, notifier: &dyn Notifier) -> RunStats {
        let mut stats = RunStats {
            run_id,
            dry_run: notifier.is_dry_run(),
            ..Default::default()
        };
        let ctx = FetchContext::new(run_id);
        let today = ctx.fetched_at.date_naive();

        for source in &self.sources {
            let items = match self.fetch_source(source.as_ref(), &ctx).await {
                Ok(items) => items,
                Err(message) => {
                    stats.failed_sources += 1;
                    stats.errors.push(message);
                    continue;
                }
            };
            stats.fetched += items.len();

            for opportunity in items {
                stats.processed += 1;
                if let Err(err) = self
                    .process_item(&opportunity, notifier, today, &mut stats)
                    .await
                {
                    warn!(source_id = %opportunity.source_id, title = %opportunity.title, error = %err, "failed to process opportunity");
                    stats.errors.push(format!("{}: {err:#}", opportunity.title));
                }
            }
        }

        if stats.deferred_by_limit > 0 {
            info!(
                limit = self.max_posts_per_run,
                deferred = stats.deferred_by_limit,
                "posting limit reached; remaining items only recorded as seen"
            );
        }
        info!(
            fetched = stats.fetched,
            processed = stats.processed,
            matched = stats.matched,
            posted = stats.posted,
            previewed = stats.previewed,
            filtered_out = stats.filtered_out,
            skipped_already_posted = stats.skipped_already_posted,
            deferred_by_limit = stats.deferred_by_limit,
            failed_sources = stats.failed_sources,
            errors = stats.errors.len(),
            "run complete"
        );
        stats
    }

    async fn process_item(
        &self,
        opportunity: &Opportunity,
        notifier: &dyn Notifier,
        today: NaiveDate,
        stats: &mut RunStats,
    ) -> Result<()> {
        let external_id = DedupeStore::canonical_id(opportunity);
        self.store
            .record_seen(opportunity, &external_id)
            .await
            .with_context(|| format!("recording {external_id} as seen"))?;

        if stats.delivered() >= self.max_posts_per_run {
            debug!(%external_id, "posting limit reached; deferring");
            stats.deferred_by_limit += 1;
            return Ok(());
        }

        let reason = match self.filter.evaluate(opportunity, today) {
            FilterDecision::Reject { reason } => {
                debug!(%external_id, %reason, "opportunity filtered out");
                stats.filtered_out += 1;
                return Ok(());
            }
            FilterDecision::Accept { reason } => reason,
        };
        stats.matched += 1;

        if !self.store.is_new(&external_id).await? {
            debug!(%external_id, "already posted; skipping");
            stats.skipped_already_posted += 1;
            return Ok(());
        }

        notifier
            .notify(opportunity, &reason)
            .await
            .with_context(|| format!("delivering {external_id}"))?;

        if notifier.is_dry_run() {
            stats.previewed += 1;
            return Ok(());
        }

        match self.store.mark_posted(&external_id, &reason).await {
            Ok(posted_at) => {
                info!(%external_id, %posted_at, "opportunity posted");
                stats.posted += 1;
                Ok(())
            }
            Err(err @ StoreError::AlreadyPosted { .. }) => {
                warn!(%external_id, "posted twice in one run");
                Err(err.into())
            }
            Err(err) => Err(err).with_context(|| format!("marking {external_id} posted")),
        }
    }

    /// Seed the store with everything the sources currently return. With
    /// `mark_seen` each item is also marked posted so later runs stay quiet.
    pub async fn backfill(&self, mark_seen: bool) -> BackfillStats {
        let run_id = Uuid::new_v4();
        let span = info_span!("backfill", %run_id, mark_seen);
        async {
            let mut stats = BackfillStats {
                run_id,
                ..Default::default()
            };
            let ctx = FetchContext::new(run_id);

            for source in &self.sources {
                let items = match self.fetch_source(source.as_ref(), &ctx).await {
                    Ok(items) => items,
                    Err(message) => {
                        stats.failed_sources += 1;
                        stats.errors.push(message);
                        continue;
                    }
                };
                for opportunity in items {
                    stats.fetched += 1;
                    if let Err(err) = self.seed_item(&opportunity, mark_seen, &mut stats).await {
                        warn!(source_id = %opportunity.source_id, error = %err, "backfill failed for opportunity");
                        stats.errors.push(format!("{}: {err:#}", opportunity.title));
                    }
                }
            }

            info!(
                fetched = stats.fetched,
                recorded = stats.recorded,
                marked_posted = stats.marked_posted,
                already_posted = stats.already_posted,
                failed_sources = stats.failed_sources,
                errors = stats.errors.len(),
                "backfill complete"
            );
            stats
        }
        .instrument(span)
        .await
    }

    async fn seed_item(
        &self,
        opportunity: &Opportunity,
        mark_seen: bool,
        stats: &mut BackfillStats,
    ) -> Result<()> {
        let external_id = DedupeStore::canonical_id(opportunity);
        if self.store.record_seen(opportunity, &external_id).await? {
            stats.recorded += 1;
        }
        if !mark_seen {
            return Ok(());
        }
        match self.store.mark_posted(&external_id, BACKFILL_REASON).await {
            Ok(_) => stats.marked_posted += 1,
            Err(StoreError::AlreadyPosted { .. }) => stats.already_posted += 1,
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }
}
