use std::path::PathBuf;
use std::time::Duration;

use fsbot_notify::{DryRunNotifier, SlackWebhookNotifier};
use fsbot_storage::DedupeStore;
use fsbot_sync::{load_config, RunPipeline};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fixture(name: &str) -> String {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

async fn feed_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/opportunity/feed/"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/rss+xml")
                .set_body_string(fixture("ukri-rss/feed.xml")),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;
    server
}

fn write_config(dir: &TempDir, server: &MockServer) -> PathBuf {
    let body = format!(
        r#"
storage:
  path: state.sqlite
sources:
  - id: ukri_rss
    type: rss
    url: {}/opportunity/feed/
    display_name: UKRI Funding Finder
filters:
  include_keywords: [AI, digital twin]
  exclude_keywords: [studentship]
posting:
  max_posts_per_run: 10
"#,
        server.uri()
    );
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, body).unwrap();
    path
}

async fn webhook_posts(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|req| req.url.path() == "/hook")
        .count()
}

#[tokio::test]
async fn posts_new_matches_once_and_records_everything() {
    let server = feed_server().await;
    let dir = TempDir::new().unwrap();
    let config = load_config(write_config(&dir, &server)).unwrap();
    assert_eq!(config.storage.path, dir.path().join("state.sqlite"));

    let store = DedupeStore::open(&config.storage.path).await.unwrap();
    store.init_db().await.unwrap();
    let pipeline = RunPipeline::from_config(&config, store.clone()).unwrap();
    let notifier =
        SlackWebhookNotifier::new(format!("{}/hook", server.uri()), Duration::from_secs(5))
            .unwrap();

    let first = pipeline.run_once(&notifier).await;
    assert!(first.ok(), "{:?}", first.errors);
    assert_eq!(first.fetched, 3);
    assert_eq!(first.processed, 3);
    assert_eq!(first.matched, 2);
    assert_eq!(first.filtered_out, 1);
    assert_eq!(first.posted, 2);
    assert_eq!(webhook_posts(&server).await, 2);

    let posted = store.get("ukri-opp-1001").await.unwrap().unwrap();
    assert!(posted.is_posted());
    assert_eq!(posted.match_reason.as_deref(), Some("keywords: AI"));

    let twin = store
        .get("https://www.ukri.org/opportunity/digital-twin-infrastructure")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(twin.match_reason.as_deref(), Some("keywords: digital twin"));

    let second = pipeline.run_once(&notifier).await;
    assert_eq!(second.posted, 0);
    assert_eq!(second.skipped_already_posted, 2);
    assert_eq!(second.filtered_out, 1);
    assert_eq!(webhook_posts(&server).await, 2);
}

#[tokio::test]
async fn dry_run_previews_without_touching_the_webhook() {
    let server = feed_server().await;
    let dir = TempDir::new().unwrap();
    let config = load_config(write_config(&dir, &server)).unwrap();
    let store = DedupeStore::open(&config.storage.path).await.unwrap();
    store.init_db().await.unwrap();
    let pipeline = RunPipeline::from_config(&config, store.clone()).unwrap();

    let preview = DryRunNotifier::new(false);
    let stats = pipeline.run_once(&preview).await;
    assert_eq!(stats.previewed, 2);
    assert_eq!(stats.posted, 0);
    assert_eq!(webhook_posts(&server).await, 0);

    let previews = preview.previews().await;
    assert!(previews[0].starts_with(
        "AI for NHS diagnostics (https://www.ukri.org/opportunity/ai-for-nhs-diagnostics) | Closes: 2026-03-30 | Source: UKRI Funding Finder"
    ));
    assert!(previews[0].contains("*Funder:* Medical Research Council (MRC)"));
    assert!(!store.get("ukri-opp-1001").await.unwrap().unwrap().is_posted());
}
