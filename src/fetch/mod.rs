//! Fetch pipeline: mode selection, retry with jittered exponential
//! backoff, and `Retry-After` handling.
//!
//! Mode order is rule-first: a site rule demanding the browser skips the
//! HTTP attempt entirely; the post-HTTP heuristic
//! ([`browser::wants_browser_retry`]) only applies when no rule forced a
//! mode.

pub mod browser;
pub mod http;

use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{CrawlConfig, Tuning};
use crate::error::ErrorKind;
use crate::metrics::SharedMetrics;
use crate::models::{FetchMode, PageFetch};
use crate::site_rules::RuleSet;

use browser::BrowserFetcher;
use http::{HttpFetcher, RawFetch};

/// Jittered exponential backoff: `base × 2^attempt × uniform(0.5, 1.5)`,
/// capped.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff {
    base_ms: u64,
    cap_ms: u64,
}

impl RetryBackoff {
    pub const fn new(base_ms: u64, cap_ms: u64) -> Self {
        Self { base_ms, cap_ms }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_ms
            .saturating_mul(2u64.saturating_pow(attempt.min(16)));
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let with_jitter = (exponential as f64 * jitter) as u64;
        Duration::from_millis(with_jitter.min(self.cap_ms))
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new(Tuning::RETRY_BASE_MS, Tuning::RETRY_CAP_MS)
    }
}

pub struct Fetcher {
    http: HttpFetcher,
    browser: Option<BrowserFetcher>,
    rules: Arc<RuleSet>,
    backoff: RetryBackoff,
    max_retries: u32,
    metrics: SharedMetrics,
}

impl Fetcher {
    pub fn new(
        config: &CrawlConfig,
        client: reqwest::Client,
        rules: Arc<RuleSet>,
        browser: Option<BrowserFetcher>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            http: HttpFetcher::new(client, config),
            browser,
            rules,
            backoff: RetryBackoff::default(),
            max_retries: config.max_retries,
            metrics,
        }
    }

    pub fn has_browser(&self) -> bool {
        self.browser.is_some()
    }

    /// Fetch a URL under the matching site rule. Never panics or errors:
    /// terminal failures come back as a `PageFetch` with `error` set.
    pub async fn fetch(
        &self,
        url: &Url,
        hop_allowed: &(dyn Fn(&Url) -> bool + Send + Sync),
        cancel: &CancellationToken,
    ) -> PageFetch {
        let rule = self.rules.matching(url.as_str());

        if (rule.use_browser_directly || rule.require_js) && self.browser.is_some() {
            match self.browser_fetch(url.as_str(), false).await {
                Ok(fetch) => return fetch,
                Err(e) => {
                    tracing::warn!(url = %url, error = %e, "browser fetch failed, falling back to http");
                }
            }
        }

        self.http_fetch_with_retries(url, rule, hop_allowed, cancel)
            .await
    }

    async fn http_fetch_with_retries(
        &self,
        url: &Url,
        rule: &crate::site_rules::SiteRule,
        hop_allowed: &(dyn Fn(&Url) -> bool + Send + Sync),
        cancel: &CancellationToken,
    ) -> PageFetch {
        let start = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return PageFetch::failure(
                    url.to_string(),
                    0,
                    start.elapsed(),
                    FetchMode::Http,
                    ErrorKind::Cancelled,
                    "cancelled before fetch",
                );
            }

            match self.http.fetch(url, rule, hop_allowed).await {
                Ok(raw) => {
                    let fetch = Self::raw_to_page(url, raw, start.elapsed());
                    self.metrics.record_fetch(fetch.status, FetchMode::Http, fetch.duration);
                    return fetch;
                }
                Err(failure) => {
                    if failure.kind.is_retryable() && attempt < self.max_retries {
                        // Retried attempts are counted here; terminal
                        // failures are counted once by the caller.
                        self.metrics.failures_total.inc(failure.kind.as_str());
                        let delay = failure
                            .retry_after
                            .unwrap_or_else(|| self.backoff.delay(attempt));
                        attempt += 1;
                        tracing::debug!(
                            url = %url,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            kind = failure.kind.as_str(),
                            "retrying after backoff"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = cancel.cancelled() => {
                                return PageFetch::failure(
                                    url.to_string(),
                                    failure.status.unwrap_or(0),
                                    start.elapsed(),
                                    FetchMode::Http,
                                    ErrorKind::Cancelled,
                                    "cancelled during backoff",
                                );
                            }
                        }
                        continue;
                    }

                    let status = failure.status.unwrap_or(0);
                    let fetch = PageFetch::failure(
                        url.to_string(),
                        status,
                        start.elapsed(),
                        FetchMode::Http,
                        failure.kind,
                        failure.message,
                    );
                    self.metrics.record_fetch(status, FetchMode::Http, fetch.duration);
                    return fetch;
                }
            }
        }
    }

    /// Browser-mode fetch, used for rule-forced pages and heuristic
    /// retries.
    pub async fn browser_fetch(
        &self,
        url: &str,
        capture_screenshot: bool,
    ) -> Result<PageFetch, crate::error::CrawlError> {
        let Some(browser) = &self.browser else {
            return Err(crate::error::CrawlError::Render(
                "browser mode disabled".into(),
            ));
        };
        let fetch = browser.fetch(url, capture_screenshot).await?;
        self.metrics
            .record_fetch(fetch.status, FetchMode::Browser, fetch.duration);
        Ok(fetch)
    }

    fn raw_to_page(url: &Url, raw: RawFetch, duration: Duration) -> PageFetch {
        PageFetch::success(
            url.to_string(),
            raw.status,
            raw.final_url,
            raw.headers,
            raw.body,
            raw.mime,
            duration,
            FetchMode::Http,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_with_attempts() {
        let backoff = RetryBackoff::new(100, 60_000);
        // Jitter is in [0.5, 1.5): bound each attempt's range
        for attempt in 0..4 {
            let delay = backoff.delay(attempt).as_millis() as u64;
            let base = 100 * 2u64.pow(attempt);
            assert!(delay >= base / 2, "attempt {}: {} too small", attempt, delay);
            assert!(delay < base * 3 / 2, "attempt {}: {} too large", attempt, delay);
        }
    }

    #[test]
    fn test_backoff_cap() {
        let backoff = RetryBackoff::new(1_000, 2_000);
        for attempt in 0..10 {
            assert!(backoff.delay(attempt) <= Duration::from_millis(2_000));
        }
    }
}
