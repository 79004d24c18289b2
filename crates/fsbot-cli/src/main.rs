use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fsbot_notify::{DryRunNotifier, Notifier, SlackWebhookNotifier};
use fsbot_storage::DedupeStore;
use fsbot_sync::{
    load_config, log_level_directive, resolve_webhook_url, AppConfig, ConfigError, RunPipeline,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "funding-bot")]
#[command(about = "Poll funding sources and post matching opportunities to Slack")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Override the configured log level (e.g. info, debug).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
enum Commands {
    /// Create the SQLite schema if it does not exist.
    InitDb,
    /// Fetch once and print matches without posting.
    DryRun,
    /// Fetch once and post new matches.
    Run,
    /// Record current items as seen without notifying.
    Backfill {
        /// Also mark every item posted so later runs never announce it.
        #[arg(long)]
        mark_seen: bool,
    },
}

fn init_tracing(fallback_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn open_store(config: &AppConfig) -> Result<DedupeStore> {
    let store = DedupeStore::open(&config.storage.path)
        .await
        .with_context(|| format!("opening store at {}", config.storage.path.display()))?;
    store.init_db().await.context("initializing schema")?;
    Ok(store)
}

/// Pick the preview or webhook notifier. Runs before anything is fetched so a
/// missing webhook variable fails the command up front.
fn select_notifier(dry_run: bool, config: &AppConfig) -> Result<Box<dyn Notifier>> {
    if dry_run {
        return Ok(Box::new(DryRunNotifier::new(true)));
    }
    let url = resolve_webhook_url(&config.slack)?;
    Ok(Box::new(SlackWebhookNotifier::new(url, WEBHOOK_TIMEOUT)?))
}

fn exit_status(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<ConfigError>().is_some() {
        2
    } else {
        1
    }
}

async fn execute(command: Commands, config: AppConfig) -> Result<()> {
    match command {
        Commands::InitDb => {
            let store = open_store(&config).await?;
            info!(path = %store.path().display(), "initialized database");
            println!("database ready: {}", store.path().display());
            store.close().await;
        }
        Commands::DryRun | Commands::Run => {
            let dry_run = command == Commands::DryRun || config.posting.dry_run;
            let notifier = select_notifier(dry_run, &config)?;

            let store = open_store(&config).await?;
            let pipeline = RunPipeline::from_config(&config, store.clone())?;
            let stats = pipeline.run_once(notifier.as_ref()).await;
            println!(
                "run complete: run_id={} fetched={} processed={} matched={} posted={} previewed={} filtered_out={} skipped_already_posted={} deferred_by_limit={} failed_sources={} errors={}",
                stats.run_id,
                stats.fetched,
                stats.processed,
                stats.matched,
                stats.posted,
                stats.previewed,
                stats.filtered_out,
                stats.skipped_already_posted,
                stats.deferred_by_limit,
                stats.failed_sources,
                stats.errors.len()
            );
            store.close().await;
        }
        Commands::Backfill { mark_seen } => {
            let store = open_store(&config).await?;
            let pipeline = RunPipeline::from_config(&config, store.clone())?;
            let stats = pipeline.backfill(mark_seen).await;
            println!(
                "backfill complete: run_id={} fetched={} recorded={} marked_posted={} already_posted={} failed_sources={} errors={}",
                stats.run_id,
                stats.fetched,
                stats.recorded,
                stats.marked_posted,
                stats.already_posted,
                stats.failed_sources,
                stats.errors.len()
            );
            store.close().await;
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = dotenvy::dotenv();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config error: {err}");
            return ExitCode::from(2);
        }
    };
    let level = match cli.log_level.as_deref() {
        Some(raw) => match log_level_directive(raw) {
            Some(directive) => directive.to_string(),
            None => {
                eprintln!("config error: unknown --log-level '{raw}'");
                return ExitCode::from(2);
            }
        },
        None => config.log_directive(),
    };
    init_tracing(&level);

    match execute(cli.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = exit_status(&err);
            if code == 2 {
                error!(error = %err, "configuration error");
                eprintln!("config error: {err}");
            } else {
                error!(error = format!("{err:#}"), "command failed");
                eprintln!("error: {err:#}");
            }
            ExitCode::from(code)
        }
    }
}
