//! Run orchestration: configuration, the relevance filter and the
//! fetch → filter → dedupe → notify pipeline.

pub mod config;
pub mod filter;
pub mod pipeline;

pub use config::{
    load_config, log_level_directive, resolve_webhook_url, AppConfig, ConfigError,
};
pub use filter::{FilterDecision, FilterEngine, Rule, WhitelistField};
pub use pipeline::{BackfillStats, RunPipeline, RunStats};
