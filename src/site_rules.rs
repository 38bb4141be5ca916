//! Per-site behavior rules.
//!
//! Rules are regex patterns over the full URL, ordered by priority with the
//! highest first; the first match wins. A catch-all default at priority 0
//! always exists so lookups are total.

use regex::Regex;

use crate::config::SiteRuleConfig;
use crate::error::CrawlError;

#[derive(Debug, Clone)]
pub struct SiteRule {
    pub pattern: Regex,
    pub priority: i32,
    pub use_browser_directly: bool,
    pub require_js: bool,
    pub user_agent: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl SiteRule {
    fn default_rule() -> Self {
        Self {
            pattern: Regex::new(".*").expect("static regex"),
            priority: 0,
            use_browser_directly: false,
            require_js: false,
            user_agent: None,
            headers: Vec::new(),
        }
    }
}

/// Compiled, priority-ordered rule list.
#[derive(Debug)]
pub struct RuleSet {
    rules: Vec<SiteRule>,
}

impl RuleSet {
    pub fn compile(configs: &[SiteRuleConfig]) -> Result<Self, CrawlError> {
        let mut rules = Vec::with_capacity(configs.len() + 1);
        for cfg in configs {
            let pattern = Regex::new(&cfg.pattern).map_err(|e| {
                CrawlError::Config(format!("invalid site rule pattern '{}': {}", cfg.pattern, e))
            })?;
            rules.push(SiteRule {
                pattern,
                priority: cfg.priority,
                use_browser_directly: cfg.use_browser_directly,
                require_js: cfg.require_js,
                user_agent: cfg.user_agent.clone(),
                headers: cfg.headers.clone(),
            });
        }

        if !rules.iter().any(|r| r.priority == 0) {
            rules.push(SiteRule::default_rule());
        }

        // Highest priority first; equal priorities keep config order.
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        Ok(Self { rules })
    }

    /// First matching rule, highest priority first. Total because of the
    /// default rule.
    pub fn matching(&self, url: &str) -> &SiteRule {
        self.rules
            .iter()
            .find(|r| r.pattern.is_match(url))
            .unwrap_or_else(|| {
                // Unreachable: the default rule matches everything.
                &self.rules[self.rules.len() - 1]
            })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            rules: vec![SiteRule::default_rule()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, priority: i32, browser: bool) -> SiteRuleConfig {
        SiteRuleConfig {
            pattern: pattern.to_string(),
            priority,
            use_browser_directly: browser,
            require_js: false,
            user_agent: None,
            headers: Vec::new(),
        }
    }

    #[test]
    fn test_first_match_wins_by_priority() {
        let rules = RuleSet::compile(&[
            rule(r"example\.com/app/", 10, true),
            rule(r"example\.com/", 5, false),
        ])
        .unwrap();

        assert!(rules.matching("https://example.com/app/dashboard").use_browser_directly);
        assert!(!rules.matching("https://example.com/about").use_browser_directly);
    }

    #[test]
    fn test_default_rule_always_present() {
        let rules = RuleSet::compile(&[rule(r"special\.site/", 3, true)]).unwrap();
        let matched = rules.matching("https://unrelated.org/");
        assert_eq!(matched.priority, 0);
        assert!(!matched.use_browser_directly);
    }

    #[test]
    fn test_explicit_priority_zero_rule_replaces_default() {
        let rules = RuleSet::compile(&[rule(r".*", 0, true)]).unwrap();
        assert_eq!(rules.len(), 1);
        assert!(rules.matching("https://anything/").use_browser_directly);
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        assert!(RuleSet::compile(&[rule("(", 1, false)]).is_err());
    }

    #[test]
    fn test_custom_headers_carried() {
        let mut cfg = rule(r"api\.example\.com/", 2, false);
        cfg.headers = vec![("X-Crawl".into(), "1".into())];
        cfg.user_agent = Some("SpecialBot/2.0".into());
        let rules = RuleSet::compile(&[cfg]).unwrap();
        let matched = rules.matching("https://api.example.com/v1");
        assert_eq!(matched.user_agent.as_deref(), Some("SpecialBot/2.0"));
        assert_eq!(matched.headers[0].0, "X-Crawl");
    }
}
