//! robots.txt handling: fetch-once-per-host caching, allow checks, and
//! crawl-delay extraction.

use lru::LruCache;
use parking_lot::Mutex;
use robotstxt::DefaultMatcher;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

const CACHE_CAPACITY: usize = 10_000;
const ROBOTS_TTL: Duration = Duration::from_secs(24 * 60 * 60);
// Failed fetches retry sooner
const FAILURE_TTL: Duration = Duration::from_secs(60 * 60);
const ROBOTS_MAX_BYTES: usize = 512 * 1024;

#[derive(Debug, Clone)]
struct CachedRobots {
    /// Raw robots.txt content; empty means allow-all.
    content: String,
    crawl_delay: Option<Duration>,
    fetched_at: Instant,
    ttl: Duration,
}

impl CachedRobots {
    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < self.ttl
    }
}

/// Per-host robots directives with an LRU cache in front of the network.
pub struct RobotsCache {
    cache: Mutex<LruCache<String, CachedRobots>>,
    client: reqwest::Client,
    user_agent: String,
}

impl RobotsCache {
    pub fn new(client: reqwest::Client, user_agent: String) -> Self {
        let capacity = NonZeroUsize::new(CACHE_CAPACITY).expect("non-zero capacity");
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            client,
            user_agent,
        }
    }

    /// Whether `url` may be fetched. Unknown hosts trigger a robots.txt
    /// fetch; failures are treated as allow-all with a shorter TTL.
    pub async fn is_allowed(&self, url: &url::Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let key = format!("{}://{}", url.scheme(), host);

        let robots = self.get_or_fetch(&key, url.scheme(), host).await;
        if robots.content.is_empty() {
            return true;
        }

        let mut matcher = DefaultMatcher::default();
        matcher.one_agent_allowed_by_robots(&robots.content, &self.user_agent, url.as_str())
    }

    /// Crawl-delay directive for a host, if its robots.txt declares one.
    pub async fn crawl_delay(&self, url: &url::Url) -> Option<Duration> {
        let host = url.host_str()?;
        let key = format!("{}://{}", url.scheme(), host);
        self.get_or_fetch(&key, url.scheme(), host).await.crawl_delay
    }

    async fn get_or_fetch(&self, key: &str, scheme: &str, host: &str) -> CachedRobots {
        if let Some(cached) = self.cache.lock().get(key) {
            if cached.is_fresh() {
                return cached.clone();
            }
        }

        let robots_url = format!("{}://{}/robots.txt", scheme, host);
        let fetched = self.fetch_robots(&robots_url).await;

        let entry = match fetched {
            Some(content) => CachedRobots {
                crawl_delay: extract_crawl_delay(&content, &self.user_agent),
                content,
                fetched_at: Instant::now(),
                ttl: ROBOTS_TTL,
            },
            None => CachedRobots {
                content: String::new(),
                crawl_delay: None,
                fetched_at: Instant::now(),
                ttl: FAILURE_TTL,
            },
        };

        self.cache.lock().put(key.to_string(), entry.clone());
        entry
    }

    async fn fetch_robots(&self, robots_url: &str) -> Option<String> {
        let response = self.client.get(robots_url).send().await.ok()?;
        if !response.status().is_success() {
            // 4xx/5xx on robots.txt means no restrictions
            return Some(String::new());
        }
        let body = response.text().await.ok()?;
        if body.len() > ROBOTS_MAX_BYTES {
            tracing::warn!(url = robots_url, "oversized robots.txt truncated");
            return Some(body[..ROBOTS_MAX_BYTES].to_string());
        }
        Some(body)
    }
}

/// Extract the Crawl-delay for a specific user agent (or `*`).
fn extract_crawl_delay(robots_txt: &str, user_agent: &str) -> Option<Duration> {
    let mut in_matching_agent = false;
    let mut crawl_delay = None;

    for line in robots_txt.lines() {
        let line = line.trim();
        let lower = line.to_lowercase();

        if lower.starts_with("user-agent:") {
            let agent = line[11..].trim();
            in_matching_agent = agent == "*" || agent.eq_ignore_ascii_case(user_agent);
            continue;
        }

        if in_matching_agent && lower.starts_with("crawl-delay:") {
            if let Some(delay_str) = line[12..].trim().split_whitespace().next() {
                if let Ok(delay) = delay_str.parse::<f64>() {
                    if delay >= 0.0 {
                        crawl_delay = Some(Duration::from_secs_f64(delay));
                    }
                }
            }
        }
    }

    crawl_delay
}
