use std::collections::HashSet;
use std::path::{Path, PathBuf};

use fsbot_adapters::{registered_source_types, SourceKind, SourceSettings, UnknownSourceType};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_WEBHOOK_ENV_VAR: &str = "SLACK_WEBHOOK_URL";
const DEFAULT_STORAGE_PATH: &str = "data/state.sqlite";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    UnknownSourceType(#[from] UnknownSourceType),
    #[error("unsupported storage type '{0}'; only 'sqlite' is available")]
    UnsupportedStorage(String),
    #[error("missing Slack webhook URL in environment variable {0}")]
    MissingWebhook(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub sources: Vec<SourceSettings>,
    #[serde(default)]
    pub filters: FilterSettings,
    #[serde(default)]
    pub slack: SlackSettings,
    #[serde(default)]
    pub posting: PostingSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    #[serde(rename = "type", default = "default_storage_type")]
    pub kind: String,
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            kind: default_storage_type(),
            path: default_storage_path(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FilterSettings {
    #[serde(default)]
    pub include_keywords: Vec<String>,
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
    #[serde(default, alias = "include_councils")]
    pub funder_whitelist: Vec<String>,
    #[serde(default, alias = "include_funding_types")]
    pub funding_type_whitelist: Vec<String>,
    #[serde(default, alias = "min_days_until_deadline")]
    pub min_days_to_deadline: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackSettings {
    #[serde(default = "default_webhook_env_var")]
    pub webhook_env_var: String,
}

impl Default for SlackSettings {
    fn default() -> Self {
        Self {
            webhook_env_var: default_webhook_env_var(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostingSettings {
    #[serde(default = "default_max_posts")]
    pub max_posts_per_run: i64,
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for PostingSettings {
    fn default() -> Self {
        Self {
            max_posts_per_run: default_max_posts(),
            dry_run: false,
        }
    }
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn default_storage_type() -> String {
    "sqlite".to_string()
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(DEFAULT_STORAGE_PATH)
}

fn default_webhook_env_var() -> String {
    DEFAULT_WEBHOOK_ENV_VAR.to_string()
}

fn default_max_posts() -> i64 {
    10
}

/// Map a level name, including the `WARNING`/`CRITICAL` spellings common in
/// existing configs, to a tracing level directive.
pub fn log_level_directive(raw: &str) -> Option<&'static str> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "trace" => Some("trace"),
        "debug" => Some("debug"),
        "info" => Some("info"),
        "warn" | "warning" => Some("warn"),
        "error" | "critical" | "fatal" => Some("error"),
        "off" => Some("off"),
        _ => None,
    }
}

fn clean_list(values: &mut Vec<String>) {
    values.iter_mut().for_each(|v| *v = v.trim().to_string());
    values.retain(|v| !v.is_empty());
}

impl AppConfig {
    pub fn max_posts_per_run(&self) -> usize {
        usize::try_from(self.posting.max_posts_per_run).unwrap_or(1)
    }

    /// Lowercase level name suitable for an `EnvFilter` directive.
    pub fn log_directive(&self) -> String {
        self.log_level.trim().to_ascii_lowercase()
    }

    fn normalize(&mut self, config_dir: &Path) -> Result<(), ConfigError> {
        if self.log_level.trim().is_empty() {
            self.log_level = default_log_level();
        }
        let directive = log_level_directive(&self.log_level).ok_or_else(|| {
            ConfigError::Invalid(format!("unknown log_level '{}'", self.log_level.trim()))
        })?;
        self.log_level = directive.to_ascii_uppercase();

        self.storage.kind = self.storage.kind.trim().to_ascii_lowercase();
        if self.storage.kind != "sqlite" {
            return Err(ConfigError::UnsupportedStorage(self.storage.kind.clone()));
        }
        if self.storage.path.as_os_str().is_empty() {
            self.storage.path = default_storage_path();
        }
        if self.storage.path.is_relative() {
            self.storage.path = config_dir.join(&self.storage.path);
        }

        if self.sources.is_empty() {
            return Err(ConfigError::Invalid(
                "config must define at least one source".into(),
            ));
        }
        let mut seen_ids = HashSet::new();
        for (index, source) in self.sources.iter_mut().enumerate() {
            source.id = source.id.trim().to_string();
            source.kind = source.kind.trim().to_string();
            source.url = source.url.trim().to_string();
            if source.id.is_empty() || source.kind.is_empty() || source.url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "source entry #{} missing one of: id, type, url",
                    index + 1
                )));
            }
            if SourceKind::from_key(&source.kind).is_none() {
                return Err(UnknownSourceType {
                    kind: source.kind.clone(),
                    available: registered_source_types().join(", "),
                }
                .into());
            }
            if !seen_ids.insert(source.id.clone()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate source id '{}'",
                    source.id
                )));
            }
        }

        let filters = &mut self.filters;
        clean_list(&mut filters.include_keywords);
        clean_list(&mut filters.exclude_keywords);
        clean_list(&mut filters.funder_whitelist);
        clean_list(&mut filters.funding_type_whitelist);
        if matches!(filters.min_days_to_deadline, Some(days) if days < 0) {
            return Err(ConfigError::Invalid(
                "filters.min_days_to_deadline must be >= 0".into(),
            ));
        }

        self.slack.webhook_env_var = self.slack.webhook_env_var.trim().to_string();
        if self.slack.webhook_env_var.is_empty() {
            self.slack.webhook_env_var = default_webhook_env_var();
        }

        if self.posting.max_posts_per_run < 1 {
            return Err(ConfigError::Invalid(
                "posting.max_posts_per_run must be >= 1".into(),
            ));
        }
        Ok(())
    }
}

/// Read and validate a YAML configuration file. Relative storage paths are
/// resolved against the directory holding the file.
pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config: AppConfig =
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;

    let config_dir = path.parent().unwrap_or_else(|| Path::new(""));
    config.normalize(config_dir)?;
    Ok(config)
}

/// Webhook URL from the environment variable named in `slack.webhook_env_var`.
pub fn resolve_webhook_url(slack: &SlackSettings) -> Result<String, ConfigError> {
    webhook_url_from(slack, |name| std::env::var(name).ok())
}

fn webhook_url_from(
    slack: &SlackSettings,
    lookup: impl FnOnce(&str) -> Option<String>,
) -> Result<String, ConfigError> {
    lookup(&slack.webhook_env_var)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ConfigError::MissingWebhook(slack.webhook_env_var.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn loads_full_config_with_aliases() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
log_level: debug
storage:
  type: sqlite
  path: state/bot.sqlite
sources:
  - id: ukri_rss
    type: rss
    url: https://www.ukri.org/opportunity/feed/
    display_name: UKRI Funding Finder
filters:
  include_keywords: [" AI ", "", digital twin]
  exclude_keywords: [studentship]
  include_councils: [MRC]
  include_funding_types: [Grant]
  min_days_until_deadline: 7
slack:
  webhook_env_var: FUNDING_HOOK
posting:
  max_posts_per_run: 3
  dry_run: true
"#,
        );

        let config = load_config(&path).unwrap();
        assert_eq!(config.log_level, "DEBUG");
        assert_eq!(config.log_directive(), "debug");
        assert_eq!(config.storage.path, dir.path().join("state/bot.sqlite"));
        assert_eq!(config.sources.len(), 1);
        assert_eq!(
            config.sources[0].display_name.as_deref(),
            Some("UKRI Funding Finder")
        );
        assert_eq!(config.filters.include_keywords, vec!["AI", "digital twin"]);
        assert_eq!(config.filters.funder_whitelist, vec!["MRC"]);
        assert_eq!(config.filters.funding_type_whitelist, vec!["Grant"]);
        assert_eq!(config.filters.min_days_to_deadline, Some(7));
        assert_eq!(config.slack.webhook_env_var, "FUNDING_HOOK");
        assert_eq!(config.max_posts_per_run(), 3);
        assert!(config.posting.dry_run);
    }

    #[test]
    fn applies_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "sources:\n  - id: a\n    type: rss\n    url: https://example.org/feed\n",
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.log_level, "INFO");
        assert_eq!(config.storage.kind, "sqlite");
        assert_eq!(config.storage.path, dir.path().join("data/state.sqlite"));
        assert_eq!(config.slack.webhook_env_var, DEFAULT_WEBHOOK_ENV_VAR);
        assert_eq!(config.max_posts_per_run(), 10);
        assert!(!config.posting.dry_run);
        assert_eq!(config.filters, FilterSettings::default());
    }

    #[test]
    fn rejects_invalid_configs() {
        let dir = TempDir::new().unwrap();
        let cases = [
            ("sources: []\n", "at least one source"),
            (
                "sources:\n  - id: a\n    type: rss\n    url: ' '\n",
                "missing one of",
            ),
            (
                "sources:\n  - {id: a, type: rss, url: 'https://x.org'}\n  - {id: a, type: rss, url: 'https://y.org'}\n",
                "duplicate source id",
            ),
            (
                "sources:\n  - {id: a, type: atom, url: 'https://x.org'}\n",
                "Registered source types: rss, wellcome_schemes",
            ),
            (
                "storage:\n  type: postgres\nsources:\n  - {id: a, type: rss, url: 'https://x.org'}\n",
                "unsupported storage type",
            ),
            (
                "filters:\n  min_days_to_deadline: -1\nsources:\n  - {id: a, type: rss, url: 'https://x.org'}\n",
                "must be >= 0",
            ),
            (
                "posting:\n  max_posts_per_run: 0\nsources:\n  - {id: a, type: rss, url: 'https://x.org'}\n",
                "must be >= 1",
            ),
        ];

        for (body, expected) in cases {
            let path = write_config(&dir, body);
            let err = load_config(&path).unwrap_err();
            assert!(
                err.to_string().contains(expected),
                "{body:?} gave {err}"
            );
        }
    }

    #[test]
    fn log_levels_map_to_tracing_directives() {
        let dir = TempDir::new().unwrap();
        for (raw, expected) in [
            ("WARNING", "warn"),
            ("warn", "warn"),
            ("CRITICAL", "error"),
            ("Fatal", "error"),
            ("debug", "debug"),
            ("''", "info"),
        ] {
            let path = write_config(
                &dir,
                &format!(
                    "log_level: {raw}\nsources:\n  - {{id: a, type: rss, url: 'https://x.org'}}\n"
                ),
            );
            let config = load_config(&path).unwrap();
            assert_eq!(config.log_directive(), expected, "{raw}");
        }

        let path = write_config(
            &dir,
            "log_level: verbose\nsources:\n  - {id: a, type: rss, url: 'https://x.org'}\n",
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("unknown log_level 'verbose'"), "{err}");
        assert_eq!(log_level_directive("warning"), Some("warn"));
        assert_eq!(log_level_directive("loud"), None);
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let err = load_config(dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn webhook_url_must_be_present_and_non_blank() {
        let slack = SlackSettings::default();
        let url = webhook_url_from(&slack, |name| {
            assert_eq!(name, "SLACK_WEBHOOK_URL");
            Some(" https://hooks.slack.com/services/T/B/X ".into())
        })
        .unwrap();
        assert_eq!(url, "https://hooks.slack.com/services/T/B/X");

        let err = webhook_url_from(&slack, |_| Some("   ".into())).unwrap_err();
        assert!(matches!(err, ConfigError::MissingWebhook(ref var) if var == "SLACK_WEBHOOK_URL"));
        assert!(webhook_url_from(&slack, |_| None).is_err());
    }
}
