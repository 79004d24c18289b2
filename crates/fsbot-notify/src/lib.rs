//! Outbound notification of matched opportunities: the Slack webhook and a
//! dry-run stand-in that only renders what would have been posted.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use fsbot_core::{format_timestamp, Opportunity};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

const NOT_SPECIFIED: &str = "Not specified";
const SUMMARY_LIMIT: usize = 300;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("webhook request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("webhook returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    /// Dry-run notifiers report success without delivering anything; callers
    /// must not record such items as posted.
    fn is_dry_run(&self) -> bool {
        false
    }

    async fn notify(&self, opportunity: &Opportunity, match_reason: &str)
        -> Result<(), DeliveryError>;
}

fn format_date(value: Option<NaiveDate>) -> String {
    value
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| NOT_SPECIFIED.to_string())
}

fn or_not_specified(value: Option<&str>) -> &str {
    value.filter(|v| !v.trim().is_empty()).unwrap_or(NOT_SPECIFIED)
}

fn truncate_summary(summary: &str) -> String {
    if summary.chars().count() <= SUMMARY_LIMIT {
        return summary.to_string();
    }
    let head: String = summary.chars().take(SUMMARY_LIMIT - 3).collect();
    format!("{head}...")
}

fn metadata_lines(opportunity: &Opportunity) -> Vec<String> {
    vec![
        format!("*Source:* {}", opportunity.source_label()),
        format!("*Funder:* {}", or_not_specified(opportunity.funder.as_deref())),
        format!(
            "*Funding Type:* {}",
            or_not_specified(opportunity.funding_type.as_deref())
        ),
        format!(
            "*Total Fund:* {}",
            or_not_specified(opportunity.total_fund.as_deref())
        ),
        format!("*Opens:* {}", format_date(opportunity.opening_date)),
        format!("*Closes:* {}", format_date(opportunity.deadline)),
        format!(
            "*Published:* {}",
            opportunity
                .published_at
                .map(format_timestamp)
                .unwrap_or_else(|| NOT_SPECIFIED.to_string())
        ),
    ]
}

fn mrkdwn_section(text: String) -> JsonValue {
    json!({
        "type": "section",
        "text": { "type": "mrkdwn", "text": text },
    })
}

/// Slack Block Kit payload: plain `text` fallback plus title, metadata,
/// match reason and summary sections.
pub fn build_slack_payload(opportunity: &Opportunity, match_reason: &str) -> JsonValue {
    let fallback = format!(
        "{} ({}) | Closes: {} | Source: {}",
        opportunity.title,
        opportunity.url,
        format_date(opportunity.deadline),
        opportunity.source_label()
    );
    let title_link = format!("*<{}|{}>*", opportunity.url, opportunity.title);
    let summary = if opportunity.summary.trim().is_empty() {
        "(no summary provided)".to_string()
    } else {
        truncate_summary(&opportunity.summary)
    };

    json!({
        "text": fallback,
        "blocks": [
            mrkdwn_section(title_link),
            mrkdwn_section(metadata_lines(opportunity).join("\n")),
            mrkdwn_section(format!("*Why it matched:* {match_reason}")),
            mrkdwn_section(summary),
        ],
    })
}

/// The payload flattened to lines, as shown in previews.
pub fn render_message_text(opportunity: &Opportunity, match_reason: &str) -> String {
    let payload = build_slack_payload(opportunity, match_reason);
    let mut lines = vec![payload["text"].as_str().unwrap_or_default().to_string()];
    if let Some(blocks) = payload["blocks"].as_array() {
        lines.extend(
            blocks
                .iter()
                .filter_map(|block| block["text"]["text"].as_str())
                .map(str::to_string),
        );
    }
    lines.join("\n")
}

pub struct SlackWebhookNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl fmt::Debug for SlackWebhookNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlackWebhookNotifier")
            .field("webhook_url", &"<redacted>")
            .finish()
    }
}

impl SlackWebhookNotifier {
    pub fn new(webhook_url: impl Into<String>, timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            webhook_url: webhook_url.into(),
        })
    }
}

#[async_trait]
impl Notifier for SlackWebhookNotifier {
    fn name(&self) -> &str {
        "slack-webhook"
    }

    async fn notify(
        &self,
        opportunity: &Opportunity,
        match_reason: &str,
    ) -> Result<(), DeliveryError> {
        let payload = build_slack_payload(opportunity, match_reason);
        let resp = self.client.post(&self.webhook_url).json(&payload).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        debug!(title = %opportunity.title, "slack notification sent");
        Ok(())
    }
}

/// Renders each would-be message, keeps it for inspection and optionally
/// echoes it to stdout. Never touches the network.
#[derive(Debug, Default)]
pub struct DryRunNotifier {
    echo: bool,
    previews: Mutex<Vec<String>>,
}

impl DryRunNotifier {
    pub fn new(echo: bool) -> Self {
        Self {
            echo,
            previews: Mutex::new(Vec::new()),
        }
    }

    pub async fn previews(&self) -> Vec<String> {
        self.previews.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for DryRunNotifier {
    fn name(&self) -> &str {
        "dry-run"
    }

    fn is_dry_run(&self) -> bool {
        true
    }

    async fn notify(
        &self,
        opportunity: &Opportunity,
        match_reason: &str,
    ) -> Result<(), DeliveryError> {
        let text = render_message_text(opportunity, match_reason);
        if self.echo {
            println!("[DRY RUN] WOULD POST TEXT:\n{text}\n");
        }
        self.previews.lock().await.push(text);
        Ok(())
    }
}
