//! Browser-mode fetching: fallback heuristics, context pooling, and the
//! engine seam.
//!
//! Rendering itself is delegated: production deployments register a
//! [`RenderEngine`] (a headless-browser binding) through the plugin
//! loader; the core owns everything around it: when to fall back, the
//! shared context pool, scroll passes, and making sure pages are closed
//! on every exit path.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::CrawlError;
use crate::models::{FetchBody, FetchMode, PageFetch};

/// What the engine is asked to do for one page.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub url: String,
    /// Network-idle wait budget.
    pub wait_for_js_ms: u64,
    /// Bounded lazy-load scroll passes; 0 disables scrolling.
    pub scroll_passes: u32,
    pub capture_screenshot: bool,
}

/// What the engine produced.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub html: String,
    pub final_url: String,
    pub screenshot: Option<Vec<u8>>,
}

/// Headless-browser seam. One call renders one page; implementations own
/// browser process management.
#[async_trait]
pub trait RenderEngine: Send + Sync {
    async fn render(&self, request: RenderRequest) -> Result<RenderedPage, CrawlError>;
}

/// Number of browser contexts the pool keeps open at once.
const CONTEXT_POOL_SIZE: usize = 4;
const MAX_SCROLL_PASSES: u32 = 5;

/// SPA framework markers that make a thin HTTP body worth re-fetching in
/// a browser.
const SPA_MARKERS: &[&str] = &[
    "window.__NEXT_DATA__",
    "window.__NUXT__",
    "data-reactroot",
    "ng-app",
    "ng-version",
    "id=\"root\"></div>",
    "id=\"app\"></div>",
    "react",
    "vue",
    "angular",
    "next.js",
    "nuxt",
];

/// Minimum body size below which HTTP output is suspect.
const THIN_BODY_BYTES: usize = 500;
/// Fewer discovered links than this (on a non-trivial page) hints at a
/// client-rendered shell.
const MIN_EXPECTED_LINKS: usize = 1;

/// Decide whether an HTTP fetch should be retried through the browser.
pub fn wants_browser_retry(body: &str, discovered_links: usize) -> bool {
    if body.len() < THIN_BODY_BYTES {
        return true;
    }

    let head = &body[..body.len().min(10_000)];
    let head_lower = head.to_ascii_lowercase();
    if SPA_MARKERS.iter().any(|m| head_lower.contains(&m.to_ascii_lowercase())) {
        // Framework marker plus an effectively empty body root
        if discovered_links < MIN_EXPECTED_LINKS || has_empty_root(&head_lower) {
            return true;
        }
    }

    false
}

fn has_empty_root(lower_html: &str) -> bool {
    lower_html.contains(r#"<div id="root"></div>"#)
        || lower_html.contains(r#"<div id="app"></div>"#)
}

/// Browser-mode fetcher wrapping a pooled [`RenderEngine`].
pub struct BrowserFetcher {
    engine: Arc<dyn RenderEngine>,
    contexts: Arc<Semaphore>,
    wait_for_js_ms: u64,
    scroll_passes: u32,
}

impl BrowserFetcher {
    pub fn new(engine: Arc<dyn RenderEngine>, wait_for_js_ms: u64, infinite_scroll: bool) -> Self {
        Self {
            engine,
            contexts: Arc::new(Semaphore::new(CONTEXT_POOL_SIZE)),
            wait_for_js_ms,
            scroll_passes: if infinite_scroll { MAX_SCROLL_PASSES } else { 0 },
        }
    }

    async fn claim_context(&self) -> Result<OwnedSemaphorePermit, CrawlError> {
        self.contexts
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CrawlError::Render("context pool closed".into()))
    }

    /// Render one page. The context permit is held for the whole render
    /// and released on every exit path, which is what keeps "one page per
    /// fetch, always closed" true.
    pub async fn fetch(&self, url: &str, capture_screenshot: bool) -> Result<PageFetch, CrawlError> {
        let _context = self.claim_context().await?;
        let start = Instant::now();

        let rendered = self
            .engine
            .render(RenderRequest {
                url: url.to_string(),
                wait_for_js_ms: self.wait_for_js_ms,
                scroll_passes: self.scroll_passes,
                capture_screenshot,
            })
            .await?;

        let mut fetch = PageFetch::success(
            url.to_string(),
            200,
            rendered.final_url,
            Vec::new(),
            FetchBody::Bytes(rendered.html.into_bytes()),
            Some("text/html".to_string()),
            start.elapsed(),
            FetchMode::Browser,
        );
        fetch.screenshot = rendered.screenshot;
        Ok(fetch)
    }
}

/// Engine stub for deployments without a browser: every render fails with
/// a clear message. Keeps mode selection total without hiding the missing
/// dependency.
pub struct NoBrowserEngine;

#[async_trait]
impl RenderEngine for NoBrowserEngine {
    async fn render(&self, request: RenderRequest) -> Result<RenderedPage, CrawlError> {
        Err(CrawlError::Render(format!(
            "no render engine registered (wanted for {})",
            request.url
        )))
    }
}

/// Deterministic engine used by tests: echoes canned HTML after an
/// optional simulated delay.
#[cfg(test)]
pub struct StubEngine {
    pub html: String,
    pub delay: Duration,
}

#[cfg(test)]
#[async_trait]
impl RenderEngine for StubEngine {
    async fn render(&self, request: RenderRequest) -> Result<RenderedPage, CrawlError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(RenderedPage {
            html: self.html.clone(),
            final_url: request.url,
            screenshot: if request.capture_screenshot {
                Some(vec![0x89, b'P', b'N', b'G'])
            } else {
                None
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thin_body_triggers_retry() {
        assert!(wants_browser_retry("<html></html>", 10));
    }

    #[test]
    fn test_spa_shell_triggers_retry() {
        let shell = format!(
            r#"<html><head><script src="/app.js"></script></head><body><div id="root"></div>{}</body></html>"#,
            "x".repeat(1_000)
        );
        assert!(wants_browser_retry(&shell, 0));
    }

    #[test]
    fn test_rich_static_page_does_not_retry() {
        let page = format!(
            "<html><body><h1>Products</h1>{}<a href='/a'>a</a><a href='/b'>b</a></body></html>",
            "Plenty of server-rendered text here. ".repeat(50)
        );
        assert!(!wants_browser_retry(&page, 2));
    }

    #[test]
    fn test_framework_marker_with_links_does_not_retry() {
        // Server-rendered Next.js page with real content and links
        let page = format!(
            "<html><body>window.__NEXT_DATA__ = {{}};<main>{}</main><a href='/a'>a</a></body></html>",
            "Hydrated but fully rendered content. ".repeat(50)
        );
        assert!(!wants_browser_retry(&page, 12));
    }

    #[tokio::test]
    async fn test_browser_fetch_builds_page_fetch() {
        let engine = Arc::new(StubEngine {
            html: "<html><body>rendered</body></html>".to_string(),
            delay: Duration::ZERO,
        });
        let fetcher = BrowserFetcher::new(engine, 2_000, true);

        let fetch = fetcher.fetch("https://h/spa", true).await.unwrap();
        assert_eq!(fetch.mode, FetchMode::Browser);
        assert_eq!(fetch.status, 200);
        assert!(fetch.screenshot.is_some());
        let body = fetch.body.as_ref().unwrap().bytes().unwrap().to_vec();
        assert!(String::from_utf8(body).unwrap().contains("rendered"));
    }

    #[tokio::test]
    async fn test_context_pool_bounds_concurrency() {
        let engine = Arc::new(StubEngine {
            html: "<html></html>".to_string(),
            delay: Duration::from_millis(100),
        });
        let fetcher = Arc::new(BrowserFetcher::new(engine, 0, false));

        // Pool size renders run concurrently; one more must wait.
        let start = Instant::now();
        let mut tasks = Vec::new();
        for i in 0..CONTEXT_POOL_SIZE + 1 {
            let fetcher = Arc::clone(&fetcher);
            tasks.push(tokio::spawn(async move {
                fetcher.fetch(&format!("https://h/{}", i), false).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_missing_engine_errors_cleanly() {
        let fetcher = BrowserFetcher::new(Arc::new(NoBrowserEngine), 0, false);
        assert!(fetcher.fetch("https://h/", false).await.is_err());
    }
}
