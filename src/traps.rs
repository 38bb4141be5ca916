//! Crawler-trap detection.
//!
//! Rule-based detectors run before admission; a pluggable scorer can add
//! its own verdict, combined with the rules by logical OR. `Block`
//! excludes admission, `Deprioritize` halves the priority score.

use async_trait::async_trait;
use dashmap::DashMap;
use regex::Regex;
use std::sync::Arc;
use url::Url;

/// Verdict for a candidate URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapVerdict {
    Allow,
    Deprioritize,
    Block,
}

/// Which detector fired; metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    Calendar,
    SessionId,
    Pagination,
    ParamExplosion,
    Recursion,
    Scorer,
}

impl TrapKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TrapKind::Calendar => "calendar",
            TrapKind::SessionId => "session_id",
            TrapKind::Pagination => "pagination",
            TrapKind::ParamExplosion => "param_explosion",
            TrapKind::Recursion => "recursion",
            TrapKind::Scorer => "scorer",
        }
    }
}

/// Opaque ML scorer consulted after the rules. Implementations live
/// outside the core.
#[async_trait]
pub trait TrapScorer: Send + Sync {
    async fn score(&self, url: &Url, depth: u32) -> TrapVerdict;
}

#[derive(Debug, Clone)]
pub struct TrapConfig {
    /// Calendar paths inside this inclusive year window survive depth > 2.
    pub calendar_window: (i32, i32),
    pub session_entropy_threshold: f64,
    pub pagination_cap: u64,
    /// Consecutive content-stale pages before pagination blocks.
    pub pagination_stale_limit: u32,
    pub sibling_limit: usize,
    pub repeat_segment_limit: usize,
}

impl Default for TrapConfig {
    fn default() -> Self {
        Self {
            calendar_window: (2015, 2035),
            session_entropy_threshold: 4.0,
            pagination_cap: 50,
            pagination_stale_limit: 5,
            sibling_limit: 200,
            repeat_segment_limit: 3,
        }
    }
}

const SESSION_KEYS: &[&str] = &["sid", "sessionid", "phpsessid", "jsessionid", "s"];
const PAGE_KEYS: &[&str] = &["page", "p", "start", "offset"];

pub struct TrapDetector {
    config: TrapConfig,
    calendar_re: Regex,
    /// Distinct query strings seen per host+path, for parameter explosion.
    sibling_queries: DashMap<String, dashmap::DashSet<u64>>,
    /// Consecutive no-new-content observations per pagination family.
    stale_runs: DashMap<String, u32>,
    scorer: Option<Arc<dyn TrapScorer>>,
}

impl TrapDetector {
    pub fn new(config: TrapConfig) -> Self {
        Self {
            config,
            calendar_re: Regex::new(r"/((?:19|20)\d{2})/(\d{1,2})(?:/(\d{1,2}))?(?:/|$)")
                .expect("static regex"),
            sibling_queries: DashMap::new(),
            stale_runs: DashMap::new(),
            scorer: None,
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn TrapScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// Inspect a URL before admission. Returns the combined verdict and the
    /// detector that fired, if any.
    pub async fn inspect(&self, url: &Url, depth: u32) -> (TrapVerdict, Option<TrapKind>) {
        if let Some(kind) = self.rule_verdict(url, depth) {
            return (TrapVerdict::Block, Some(kind));
        }

        if let Some(scorer) = &self.scorer {
            match scorer.score(url, depth).await {
                TrapVerdict::Allow => {}
                verdict => return (verdict, Some(TrapKind::Scorer)),
            }
        }

        (TrapVerdict::Allow, None)
    }

    fn rule_verdict(&self, url: &Url, depth: u32) -> Option<TrapKind> {
        if self.is_calendar_trap(url, depth) {
            return Some(TrapKind::Calendar);
        }
        if self.is_session_id_trap(url) {
            return Some(TrapKind::SessionId);
        }
        if self.is_pagination_trap(url) {
            return Some(TrapKind::Pagination);
        }
        if self.is_param_explosion(url) {
            return Some(TrapKind::ParamExplosion);
        }
        if self.is_recursive_path(url) {
            return Some(TrapKind::Recursion);
        }
        None
    }

    /// Feed back whether a fetched page yielded previously-unseen content.
    /// Pagination families with long stale runs become traps.
    pub fn observe_content(&self, url: &Url, fresh: bool) {
        if Self::page_number(url).is_none() {
            return;
        }
        let family = Self::pagination_family(url);
        if fresh {
            self.stale_runs.remove(&family);
        } else {
            *self.stale_runs.entry(family).or_insert(0) += 1;
        }
    }

    fn is_calendar_trap(&self, url: &Url, depth: u32) -> bool {
        if depth <= 2 {
            return false;
        }
        let Some(caps) = self.calendar_re.captures(url.path()) else {
            return false;
        };
        let year: i32 = caps
            .get(1)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        let month: u32 = caps
            .get(2)
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0);
        if !(1..=12).contains(&month) {
            return false;
        }
        let (lo, hi) = self.config.calendar_window;
        year < lo || year > hi
    }

    fn is_session_id_trap(&self, url: &Url) -> bool {
        for (key, value) in url.query_pairs() {
            let key_lower = key.to_ascii_lowercase();
            if SESSION_KEYS.contains(&key_lower.as_str())
                && value.len() >= 8
                && shannon_entropy(&value) > self.config.session_entropy_threshold
            {
                return true;
            }
        }
        false
    }

    fn is_pagination_trap(&self, url: &Url) -> bool {
        let Some(page) = Self::page_number(url) else {
            return false;
        };
        if page <= self.config.pagination_cap {
            return false;
        }
        let family = Self::pagination_family(url);
        let stale = self.stale_runs.get(&family).map(|v| *v).unwrap_or(0);
        stale >= self.config.pagination_stale_limit
    }

    fn is_param_explosion(&self, url: &Url) -> bool {
        let Some(query) = url.query() else {
            return false;
        };
        let key = format!("{}{}", url.host_str().unwrap_or(""), url.path());
        let queries = self
            .sibling_queries
            .entry(key)
            .or_insert_with(dashmap::DashSet::new);
        queries.insert(xxhash_rust::xxh3::xxh3_64(query.as_bytes()));
        queries.len() >= self.config.sibling_limit
    }

    fn is_recursive_path(&self, url: &Url) -> bool {
        let mut counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
        if let Some(segments) = url.path_segments() {
            for segment in segments.filter(|s| !s.is_empty()) {
                let count = counts.entry(segment).or_insert(0);
                *count += 1;
                if *count >= self.config.repeat_segment_limit {
                    return true;
                }
            }
        }
        false
    }

    fn page_number(url: &Url) -> Option<u64> {
        for (key, value) in url.query_pairs() {
            let key_lower = key.to_ascii_lowercase();
            if PAGE_KEYS.contains(&key_lower.as_str()) {
                if let Ok(n) = value.parse::<u64>() {
                    return Some(n);
                }
            }
        }
        None
    }

    /// Host + path + non-pagination query keys: the identity of a paginated
    /// listing regardless of the page number.
    fn pagination_family(url: &Url) -> String {
        let mut other_keys: Vec<String> = url
            .query_pairs()
            .filter(|(k, _)| !PAGE_KEYS.contains(&k.to_ascii_lowercase().as_str()))
            .map(|(k, _)| k.into_owned())
            .collect();
        other_keys.sort();
        format!(
            "{}{}?{}",
            url.host_str().unwrap_or(""),
            url.path(),
            other_keys.join(",")
        )
    }
}

impl Default for TrapDetector {
    fn default() -> Self {
        Self::new(TrapConfig::default())
    }
}

/// Character-level Shannon entropy in bits per character.
fn shannon_entropy(value: &str) -> f64 {
    if value.is_empty() {
        return 0.0;
    }
    let mut counts: std::collections::HashMap<char, usize> = std::collections::HashMap::new();
    let mut total = 0usize;
    for c in value.chars() {
        *counts.entry(c).or_insert(0) += 1;
        total += 1;
    }
    let total = total as f64;
    counts
        .values()
        .map(|&count| {
            let p = count as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Soft-404 heuristics: a 200 page whose content says "not found".
/// Flagged pages keep their fetch result but are not link-expanded.
pub fn looks_like_soft404(title: Option<&str>, text: &str) -> bool {
    const PHRASES: &[&str] = &[
        "page not found",
        "404 not found",
        "does not exist",
        "no longer available",
        "nothing was found",
    ];

    if let Some(title) = title {
        let title_lower = title.to_lowercase();
        if title_lower.contains("404") || PHRASES.iter().any(|p| title_lower.contains(p)) {
            return true;
        }
    }

    let text_lower = text.to_lowercase();
    if text_lower.len() < 2_000 && PHRASES.iter().any(|p| text_lower.contains(p)) {
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_calendar_trap_blocks_deep_out_of_window_dates() {
        let detector = TrapDetector::default();

        let (verdict, kind) = detector.inspect(&url("https://h/2003/01/15/post"), 3).await;
        assert_eq!(verdict, TrapVerdict::Block);
        assert_eq!(kind, Some(TrapKind::Calendar));

        // Shallow calendar URLs pass
        let (verdict, _) = detector.inspect(&url("https://h/2003/01/15/post"), 2).await;
        assert_eq!(verdict, TrapVerdict::Allow);

        // Dates inside the window pass at any depth
        let (verdict, _) = detector.inspect(&url("https://h/2024/06/01/post"), 5).await;
        assert_eq!(verdict, TrapVerdict::Allow);
    }

    #[tokio::test]
    async fn test_calendar_range_sweep() {
        // The scenario from the test plan: /2020/01/01 .. /2030/12/31 at depth 3
        let detector = TrapDetector::default();
        let (in_window, _) = detector.inspect(&url("https://h/2020/01/01/"), 3).await;
        assert_eq!(in_window, TrapVerdict::Allow);
        let (out_of_window, _) = detector.inspect(&url("https://h/2040/01/01/"), 3).await;
        assert_eq!(out_of_window, TrapVerdict::Block);
    }

    #[tokio::test]
    async fn test_session_id_entropy() {
        let detector = TrapDetector::default();

        let (verdict, kind) = detector
            .inspect(&url("https://h/p?phpsessid=a8Xk2Lq9ZmWv4Tn7Qr"), 1)
            .await;
        assert_eq!(verdict, TrapVerdict::Block);
        assert_eq!(kind, Some(TrapKind::SessionId));

        // Low-entropy value for a session-looking key is fine
        let (verdict, _) = detector.inspect(&url("https://h/p?sid=aaaaaaaaaa"), 1).await;
        assert_eq!(verdict, TrapVerdict::Allow);

        // High-entropy value under a non-session key is fine
        let (verdict, _) = detector
            .inspect(&url("https://h/p?token=a8Xk2Lq9ZmWv4Tn7"), 1)
            .await;
        assert_eq!(verdict, TrapVerdict::Allow);
    }

    #[tokio::test]
    async fn test_pagination_needs_stale_run() {
        let detector = TrapDetector::default();
        let deep_page = url("https://h/list?page=99");

        // Over the cap but no stale history yet
        let (verdict, _) = detector.inspect(&deep_page, 1).await;
        assert_eq!(verdict, TrapVerdict::Allow);

        for n in 90..95 {
            detector.observe_content(&url(&format!("https://h/list?page={}", n)), false);
        }

        let (verdict, kind) = detector.inspect(&deep_page, 1).await;
        assert_eq!(verdict, TrapVerdict::Block);
        assert_eq!(kind, Some(TrapKind::Pagination));

        // Fresh content resets the run
        detector.observe_content(&url("https://h/list?page=96"), true);
        let (verdict, _) = detector.inspect(&deep_page, 1).await;
        assert_eq!(verdict, TrapVerdict::Allow);
    }

    #[tokio::test]
    async fn test_param_explosion() {
        let mut config = TrapConfig::default();
        config.sibling_limit = 5;
        let detector = TrapDetector::new(config);

        for i in 0..4 {
            let (verdict, _) = detector
                .inspect(&url(&format!("https://h/search?q={}", i)), 1)
                .await;
            assert_eq!(verdict, TrapVerdict::Allow, "sibling {} blocked early", i);
        }

        let (verdict, kind) = detector.inspect(&url("https://h/search?q=last"), 1).await;
        assert_eq!(verdict, TrapVerdict::Block);
        assert_eq!(kind, Some(TrapKind::ParamExplosion));
    }

    #[tokio::test]
    async fn test_recursive_path() {
        let detector = TrapDetector::default();
        let (verdict, kind) = detector.inspect(&url("https://h/a/b/a/c/a/d"), 1).await;
        assert_eq!(verdict, TrapVerdict::Block);
        assert_eq!(kind, Some(TrapKind::Recursion));

        let (verdict, _) = detector.inspect(&url("https://h/a/b/a/c"), 1).await;
        assert_eq!(verdict, TrapVerdict::Allow);
    }

    #[tokio::test]
    async fn test_scorer_or_combination() {
        struct AlwaysDeprioritize;

        #[async_trait]
        impl TrapScorer for AlwaysDeprioritize {
            async fn score(&self, _url: &Url, _depth: u32) -> TrapVerdict {
                TrapVerdict::Deprioritize
            }
        }

        let detector = TrapDetector::default().with_scorer(Arc::new(AlwaysDeprioritize));
        let (verdict, kind) = detector.inspect(&url("https://h/fine"), 1).await;
        assert_eq!(verdict, TrapVerdict::Deprioritize);
        assert_eq!(kind, Some(TrapKind::Scorer));

        // Rules still dominate when they block
        let (verdict, kind) = detector.inspect(&url("https://h/x/x/x"), 1).await;
        assert_eq!(verdict, TrapVerdict::Block);
        assert_eq!(kind, Some(TrapKind::Recursion));
    }

    #[test]
    fn test_entropy() {
        assert!(shannon_entropy("aaaaaaaa") < 0.1);
        assert!(shannon_entropy("a8Xk2Lq9ZmWv4Tn7") > 3.5);
        assert_eq!(shannon_entropy(""), 0.0);
    }

    #[test]
    fn test_soft404() {
        assert!(looks_like_soft404(Some("404 - Page Not Found"), ""));
        assert!(looks_like_soft404(None, "Sorry, this page does not exist."));
        assert!(!looks_like_soft404(
            Some("Product catalog"),
            "Our full catalog of products."
        ));
    }
}
