//! Resume semantics: interrupted crawls continue instead of restarting.

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use deepharvest::checkpoint::{self, CheckpointHeader, CHECKPOINT_VERSION};
use deepharvest::config::CrawlConfig;
use deepharvest::frontier::FrontierSnapshot;
use deepharvest::models::{CrawlStats, UrlRecord};
use deepharvest::orchestration::build_crawler;

fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("content-type", "text/html; charset=utf-8")
        .set_body_string(body.to_string())
}

fn test_config(server_uri: &str, dir: &TempDir) -> CrawlConfig {
    let mut config = CrawlConfig::default();
    config.seed_urls = vec![format!("{}/a", server_uri)];
    config.respect_robots = false;
    config.min_request_gap_ms = 0;
    config.checkpoint_interval = 1;
    config.output_dir = dir.path().join("out").to_string_lossy().into_owned();
    config.state_file = dir.path().join("state.chk").to_string_lossy().into_owned();
    config
}

async fn mount_site(server: &MockServer) {
    let links: String = (0..10)
        .map(|i| format!(r#"<a href="/page{}">page {}</a>"#, i, i))
        .collect();
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(html(&format!(
            "<html><body><p>Seed hub enumerating ten article pages.</p>{}</body></html>",
            links
        )))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/page[0-9]+$"))
        .respond_with(html("<html><body><p>Article body without onward references.</p></body></html>"))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_resume_after_interruption_reaches_full_coverage() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_site(&server).await;

    let config = test_config(&server.uri(), &dir);
    let state_file = PathBuf::from(&config.state_file);

    // A checkpoint captured mid-crawl: the seed was processed, two pages
    // are done, the rest are still pending.
    let seed = format!("{}/a", server.uri());
    let visited: Vec<String> = vec![
        seed.clone(),
        format!("{}/page0", server.uri()),
        format!("{}/page1", server.uri()),
    ];
    let pending: Vec<UrlRecord> = (2..10)
        .map(|i| {
            UrlRecord::new(
                format!("{}/page{}", server.uri(), i),
                "127.0.0.1".to_string(),
                1,
                0.0,
                Some(seed.clone()),
            )
        })
        .collect();

    let header = CheckpointHeader {
        version: CHECKPOINT_VERSION,
        config_digest: config.compat_digest(),
        options_digest: config.options_digest(),
        stats: CrawlStats {
            processed: 3,
            succeeded: 3,
            errored: 0,
        },
        timestamp: 1,
        host_backoffs: Default::default(),
    };
    let snapshot = FrontierSnapshot {
        visited,
        pending,
        host_backoffs: Default::default(),
    };
    checkpoint::save(&state_file, &header, &snapshot).unwrap();

    let crawler = Arc::new(build_crawler(config, None).await.unwrap());
    crawler.restore_checkpoint(&state_file).await.unwrap();

    // The seed is in the checkpoint's visited set: not re-admitted.
    let seeded = crawler.admit_seeds().await.unwrap();
    assert_eq!(seeded, 0);

    let report = crawler.run().await.unwrap();

    // Full coverage: 1 seed + 10 pages, with prior progress preserved.
    assert_eq!(report.admitted, 11);
    assert_eq!(report.stats.processed, 11);
    assert_eq!(report.stats.errored, 0);

    // Only the eight outstanding pages were fetched after the restore.
    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 8);
}

#[tokio::test]
async fn test_completed_run_resumes_to_noop() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    mount_site(&server).await;

    let config = test_config(&server.uri(), &dir);
    let state_file = PathBuf::from(&config.state_file);

    let crawler = Arc::new(build_crawler(config.clone(), None).await.unwrap());
    crawler.admit_seeds().await.unwrap();
    let first = crawler.run().await.unwrap();
    assert_eq!(first.admitted, 11);
    assert!(state_file.exists(), "run should leave a checkpoint behind");

    let requests_after_first = server.received_requests().await.unwrap().len();

    // Resume from the final checkpoint: nothing pending, nothing fetched.
    let resumed = Arc::new(build_crawler(config, None).await.unwrap());
    resumed.restore_checkpoint(&state_file).await.unwrap();
    assert_eq!(resumed.admit_seeds().await.unwrap(), 0);
    let second = resumed.run().await.unwrap();

    assert_eq!(second.admitted, 11);
    assert_eq!(second.stats.processed, first.stats.processed);
    let requests_after_second = server.received_requests().await.unwrap().len();
    assert_eq!(requests_after_first, requests_after_second);
}

#[tokio::test]
async fn test_restore_refuses_incompatible_domain_policy() {
    let dir = TempDir::new().unwrap();
    let state_file = dir.path().join("state.chk");

    let mut original = CrawlConfig::default();
    original.allowed_domains = vec!["example.com".to_string()];

    let header = CheckpointHeader {
        version: CHECKPOINT_VERSION,
        config_digest: original.compat_digest(),
        options_digest: original.options_digest(),
        stats: CrawlStats::default(),
        timestamp: 1,
        host_backoffs: Default::default(),
    };
    checkpoint::save(&state_file, &header, &FrontierSnapshot::default()).unwrap();

    let mut changed = CrawlConfig::default();
    changed.allowed_domains = vec!["other.org".to_string()];
    changed.output_dir = dir.path().join("out").to_string_lossy().into_owned();
    changed.state_file = state_file.to_string_lossy().into_owned();

    let crawler = Arc::new(build_crawler(changed, None).await.unwrap());
    assert!(crawler.restore_checkpoint(&state_file).await.is_err());
}

#[tokio::test]
async fn test_restore_carries_host_backoff() {
    let dir = TempDir::new().unwrap();
    let state_file = dir.path().join("state.chk");

    let mut config = CrawlConfig::default();
    config.output_dir = dir.path().join("out").to_string_lossy().into_owned();
    config.state_file = state_file.to_string_lossy().into_owned();

    let mut backoffs = std::collections::HashMap::new();
    backoffs.insert("slow.example".to_string(), 6.75);

    let header = CheckpointHeader {
        version: CHECKPOINT_VERSION,
        config_digest: config.compat_digest(),
        options_digest: config.options_digest(),
        stats: CrawlStats::default(),
        timestamp: 1,
        host_backoffs: backoffs.clone(),
    };
    let snapshot = FrontierSnapshot {
        visited: Vec::new(),
        pending: Vec::new(),
        host_backoffs: backoffs,
    };
    checkpoint::save(&state_file, &header, &snapshot).unwrap();

    let crawler = Arc::new(build_crawler(config, None).await.unwrap());
    crawler.restore_checkpoint(&state_file).await.unwrap();
    assert!((crawler.scheduler.backoff_multiplier("slow.example") - 6.75).abs() < 1e-9);
}
