//! The admission pipeline: everything between "a link was discovered" and
//! "a URL record is in the frontier".
//!
//! Order: scheme check (inside normalization) → host policy → depth cap →
//! global URL cap → early dedup probe → backpressure → trap verdict →
//! atomic dedup + enqueue.
//! Every rejection is logged with its reason and counted under
//! `urls_dropped_total{reason}`.

use regex::Regex;
use std::sync::Arc;
use url::Url;

use crate::config::{CrawlConfig, CrawlStrategy, Tuning};
use crate::error::CrawlError;
use crate::frontier::{strategy_priority, Frontier};
use crate::metrics::SharedMetrics;
use crate::models::UrlRecord;
use crate::traps::{TrapDetector, TrapVerdict};
use crate::url_norm::UrlNormalizer;

/// Host allow-list entry.
#[derive(Debug, Clone)]
enum DomainRule {
    Exact(String),
    Suffix(String),
    Pattern(Regex),
}

/// Allowed-domains policy: exact entries (optionally with subdomains),
/// `*.suffix` entries, and `re:<regex>` entries.
#[derive(Debug, Clone)]
pub struct DomainPolicy {
    rules: Vec<DomainRule>,
    follow_subdomains: bool,
    follow_external: bool,
}

impl DomainPolicy {
    /// Build from config entries; empty entries fall back to the seed
    /// hosts.
    pub fn new(
        entries: &[String],
        seed_hosts: Vec<String>,
        follow_subdomains: bool,
        follow_external: bool,
    ) -> Result<Self, CrawlError> {
        let mut rules = Vec::new();

        let sources: Vec<String> = if entries.is_empty() {
            seed_hosts
        } else {
            entries.to_vec()
        };

        for entry in sources {
            let entry = entry.trim().to_ascii_lowercase();
            if entry.is_empty() {
                continue;
            }
            if let Some(pattern) = entry.strip_prefix("re:") {
                let regex = Regex::new(pattern).map_err(|e| {
                    CrawlError::Config(format!("invalid allowed_domains regex '{}': {}", pattern, e))
                })?;
                rules.push(DomainRule::Pattern(regex));
            } else if let Some(suffix) = entry.strip_prefix("*.") {
                rules.push(DomainRule::Suffix(suffix.to_string()));
            } else {
                rules.push(DomainRule::Exact(entry));
            }
        }

        Ok(Self {
            rules,
            follow_subdomains,
            follow_external,
        })
    }

    pub fn allows(&self, host: &str) -> bool {
        if self.follow_external {
            return true;
        }
        let host = host.to_ascii_lowercase();

        self.rules.iter().any(|rule| match rule {
            DomainRule::Exact(exact) => {
                host == *exact
                    || (self.follow_subdomains && host.ends_with(&format!(".{}", exact)))
            }
            DomainRule::Suffix(suffix) => {
                host == *suffix || host.ends_with(&format!(".{}", suffix))
            }
            DomainRule::Pattern(regex) => regex.is_match(&host),
        })
    }
}

/// Result of admitting one raw URL.
#[derive(Debug, Clone)]
pub enum AdmitOutcome {
    Admitted(UrlRecord),
    /// Dropped with a metrics reason label.
    Dropped(&'static str),
}

pub struct Admission {
    normalizer: UrlNormalizer,
    policy: DomainPolicy,
    traps: Option<Arc<TrapDetector>>,
    frontier: Arc<dyn Frontier>,
    metrics: SharedMetrics,
    strategy: CrawlStrategy,
    max_depth: Option<u32>,
    max_urls: Option<u64>,
    soft_cap: usize,
}

impl Admission {
    pub fn new(
        config: &CrawlConfig,
        policy: DomainPolicy,
        traps: Option<Arc<TrapDetector>>,
        frontier: Arc<dyn Frontier>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            normalizer: UrlNormalizer::new(config.tracking_params.clone()),
            policy,
            traps,
            frontier,
            metrics,
            strategy: config.strategy,
            max_depth: config.max_depth,
            max_urls: config.max_urls,
            soft_cap: Tuning::FRONTIER_SOFT_CAP,
        }
    }

    pub fn normalizer(&self) -> &UrlNormalizer {
        &self.normalizer
    }

    pub fn policy(&self) -> &DomainPolicy {
        &self.policy
    }

    /// Whether a redirect hop stays inside the crawl.
    pub fn hop_allowed(&self, url: &Url) -> bool {
        matches!(url.scheme(), "http" | "https")
            && url.host_str().map(|h| self.policy.allows(h)).unwrap_or(false)
    }

    /// Run the full admission pipeline for one discovered URL.
    pub async fn admit(
        &self,
        raw: &str,
        depth: u32,
        parent: Option<&str>,
        score: f64,
    ) -> Result<AdmitOutcome, CrawlError> {
        let url = match self.normalizer.normalize(raw) {
            Ok(url) => url,
            Err(reason) => {
                tracing::debug!(url = raw, %reason, "dropped: unparseable or unsupported");
                return Ok(self.drop("invalid_url"));
            }
        };

        let host = url.host_str().unwrap_or_default().to_string();
        if !self.policy.allows(&host) {
            tracing::debug!(url = %url, host = %host, "dropped: outside domain policy");
            return Ok(self.drop("disallowed_by_policy"));
        }

        if let Some(max_depth) = self.max_depth {
            if depth > max_depth {
                tracing::debug!(url = %url, depth, "dropped: over max depth");
                return Ok(self.drop("max_depth"));
            }
        }

        let counts = self.frontier.counts().await?;

        if let Some(max_urls) = self.max_urls {
            if counts.admitted as u64 >= max_urls {
                tracing::debug!(url = %url, "dropped: crawl size cap reached");
                return Ok(self.drop("max_urls"));
            }
        }

        // Early dedup check; the frontier's atomic admit still guards the
        // race between concurrent admitters.
        if self.frontier.is_visited(url.as_str()).await? {
            self.metrics.duplicates_total.inc("url");
            return Ok(AdmitOutcome::Dropped("duplicate"));
        }

        let mut priority = strategy_priority(self.strategy, depth, score);

        // Soft cap: low-priority children are shed under backpressure.
        if depth > 0 && counts.pending >= self.soft_cap && priority <= 0.0 {
            self.metrics
                .backpressure_drops
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return Ok(self.drop("backpressure"));
        }

        if let Some(traps) = &self.traps {
            let (verdict, kind) = traps.inspect(&url, depth).await;
            if let Some(kind) = kind {
                self.metrics.traps_total.inc(kind.as_str());
            }
            match verdict {
                TrapVerdict::Block => {
                    tracing::debug!(url = %url, "dropped: trap detected");
                    return Ok(self.drop("trap_detected"));
                }
                TrapVerdict::Deprioritize => {
                    priority /= 2.0;
                }
                TrapVerdict::Allow => {}
            }
        }

        let canonical = String::from(url);
        let record = UrlRecord::new(
            canonical,
            host,
            depth,
            priority,
            parent.map(String::from),
        );

        // Visited insert + enqueue happen atomically inside the frontier.
        if self.frontier.admit(record.clone()).await? {
            self.metrics
                .urls_admitted_total
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            Ok(AdmitOutcome::Admitted(record))
        } else {
            self.metrics.duplicates_total.inc("url");
            Ok(AdmitOutcome::Dropped("duplicate"))
        }
    }

    fn drop(&self, reason: &'static str) -> AdmitOutcome {
        self.metrics.record_drop(reason);
        AdmitOutcome::Dropped(reason)
    }
}

/// Base priority score for the `priority` strategy: 0.5, boosted for
/// paths that usually matter.
pub fn priority_score(url: &str) -> f64 {
    const BOOSTED: &[&str] = &["/about", "/contact", "/products", "/services"];
    let mut score = 0.5;
    let path = Url::parse(url)
        .map(|u| u.path().to_ascii_lowercase())
        .unwrap_or_default();
    if BOOSTED.iter().any(|p| path.starts_with(p)) {
        score += 0.2;
    }
    score
}
