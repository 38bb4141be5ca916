//! Crawl configuration: recognized keys, defaults, YAML loading, and the
//! digest used to validate checkpoint compatibility.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::CrawlError;

/// Fixed tuning knobs that are not per-crawl options.
pub struct Tuning;

impl Tuning {
    pub const POOL_IDLE_PER_HOST: usize = 64;
    pub const POOL_IDLE_TIMEOUT_SECS: u64 = 90;
    pub const LEASE_TIMEOUT_SECS: u64 = 120;
    pub const LEASE_SWEEP_INTERVAL_MS: u64 = 5_000;
    pub const CIRCUIT_WINDOW: usize = 20;
    pub const CIRCUIT_ERROR_RATE: f64 = 0.5;
    pub const CIRCUIT_PARK_SECS: u64 = 60;
    pub const BACKOFF_GROW: f64 = 1.5;
    pub const BACKOFF_DECAY: f64 = 0.9;
    pub const BACKOFF_CAP: f64 = 30.0;
    pub const RETRY_BASE_MS: u64 = 500;
    pub const RETRY_CAP_MS: u64 = 30_000;
    pub const SPILL_THRESHOLD_BYTES: u64 = 4 * 1024 * 1024;
    pub const FRONTIER_SOFT_CAP: usize = 1_000_000;
    /// Shard count for the shared store; must agree across the fleet.
    pub const DISTRIBUTED_SHARDS: usize = 16;
    pub const BLOOM_EXPECTED_ITEMS: usize = 10_000_000;
    pub const STORE_ERROR_LIMIT: u32 = 3;
    pub const LOOP_YIELD_DELAY_MS: u64 = 10;
}

/// Frontier ordering strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CrawlStrategy {
    #[default]
    Bfs,
    Dfs,
    Priority,
}

/// One site rule as written in config; compiled by `site_rules`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteRuleConfig {
    pub pattern: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub use_browser_directly: bool,
    #[serde(default)]
    pub require_js: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
}

fn default_concurrent_requests() -> usize {
    10
}
fn default_per_host_concurrency() -> usize {
    2
}
fn default_wait_for_js_ms() -> u64 {
    2_000
}
fn default_checkpoint_interval() -> u64 {
    100
}
fn default_user_agent() -> String {
    "DeepHarvest/1.0".to_string()
}
fn default_state_file() -> String {
    "crawl_state.json".to_string()
}
fn default_output_dir() -> String {
    "./crawl_output".to_string()
}
fn default_min_request_gap_ms() -> u64 {
    1_000
}
fn default_max_redirects() -> usize {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_body_bytes() -> u64 {
    10 * 1024 * 1024
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_read_timeout_secs() -> u64 {
    30
}
fn default_true() -> bool {
    true
}
fn default_tracking_params() -> Vec<String> {
    crate::url_norm::DEFAULT_TRACKING_PARAMS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Full crawl configuration. Every key here is a recognized config-file
/// key; anything else in the file produces a warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    #[serde(default)]
    pub seed_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_depth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_urls: Option<u64>,
    #[serde(default = "default_concurrent_requests")]
    pub concurrent_requests: usize,
    #[serde(default = "default_per_host_concurrency")]
    pub per_host_concurrency: usize,
    #[serde(default)]
    pub enable_js: bool,
    #[serde(default = "default_wait_for_js_ms")]
    pub wait_for_js_ms: u64,
    #[serde(default)]
    pub handle_infinite_scroll: bool,
    #[serde(default)]
    pub strategy: CrawlStrategy,
    #[serde(default)]
    pub distributed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub site_rules: Vec<SiteRuleConfig>,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Host policy entries: exact hostname, `*.suffix`, or `re:<regex>`.
    /// Empty means "hosts of the seed URLs".
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    #[serde(default = "default_true")]
    pub follow_subdomains: bool,
    #[serde(default)]
    pub follow_external: bool,
    #[serde(default = "default_true")]
    pub respect_robots: bool,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default = "default_min_request_gap_ms")]
    pub min_request_gap_ms: u64,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub enable_trap_detection: bool,
    #[serde(default = "default_true")]
    pub enable_soft404_detection: bool,
    #[serde(default = "default_tracking_params")]
    pub tracking_params: Vec<String>,
    #[serde(default)]
    pub shutdown_grace_secs: Option<u64>,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        // An empty mapping deserializes with every serde default applied.
        serde_yaml::from_str("{}").expect("defaults always deserialize")
    }
}

impl CrawlConfig {
    /// Load from a YAML file. Unknown top-level keys warn rather than fail,
    /// per the configuration contract.
    pub fn load(path: &Path) -> Result<Self, CrawlError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CrawlError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, CrawlError> {
        let value: serde_yaml::Value = serde_yaml::from_str(raw)
            .map_err(|e| CrawlError::Config(format!("invalid YAML: {}", e)))?;

        if let serde_yaml::Value::Mapping(map) = &value {
            for key in map.keys() {
                if let serde_yaml::Value::String(name) = key {
                    if !Self::is_recognized_key(name) {
                        tracing::warn!(key = %name, "unknown configuration key ignored");
                    }
                }
            }
        }

        serde_yaml::from_value(value).map_err(|e| CrawlError::Config(format!("invalid config: {}", e)))
    }

    fn is_recognized_key(key: &str) -> bool {
        const KEYS: &[&str] = &[
            "seed_urls",
            "max_depth",
            "max_urls",
            "concurrent_requests",
            "per_host_concurrency",
            "enable_js",
            "wait_for_js_ms",
            "handle_infinite_scroll",
            "strategy",
            "distributed",
            "redis_url",
            "site_rules",
            "checkpoint_interval",
            "user_agent",
            "allowed_domains",
            "follow_subdomains",
            "follow_external",
            "respect_robots",
            "output_dir",
            "state_file",
            "min_request_gap_ms",
            "max_redirects",
            "max_retries",
            "max_body_bytes",
            "connect_timeout_secs",
            "read_timeout_secs",
            "enable_trap_detection",
            "enable_soft404_detection",
            "tracking_params",
            "shutdown_grace_secs",
        ];
        KEYS.contains(&key)
    }

    /// Digest over the options that make checkpoints comparable: the host
    /// allow-list and the normalization rules. Two configs with equal
    /// compat digests may resume each other's checkpoints.
    pub fn compat_digest(&self) -> String {
        let mut domains = self.allowed_domains.clone();
        domains.sort();
        let mut tracking = self.tracking_params.clone();
        tracking.sort();

        let mut hasher = Sha256::new();
        hasher.update(domains.join("\n").as_bytes());
        hasher.update(b"|");
        hasher.update(tracking.join("\n").as_bytes());
        hasher.update(b"|");
        hasher.update([self.follow_subdomains as u8, self.follow_external as u8]);
        hex(&hasher.finalize()[..16])
    }

    /// Digest over everything else; a mismatch at restore time warns.
    pub fn options_digest(&self) -> String {
        let mut hasher = Sha256::new();
        // Serialization is stable because field order is fixed.
        if let Ok(json) = serde_json::to_vec(self) {
            hasher.update(&json);
        }
        hex(&hasher.finalize()[..16])
    }

    pub fn validate(&self) -> Result<(), CrawlError> {
        if self.concurrent_requests == 0 {
            return Err(CrawlError::Config("concurrent_requests must be > 0".into()));
        }
        if self.per_host_concurrency == 0 {
            return Err(CrawlError::Config("per_host_concurrency must be > 0".into()));
        }
        if self.distributed && self.redis_url.is_none() {
            return Err(CrawlError::Config(
                "distributed mode requires redis_url".into(),
            ));
        }
        if self.max_redirects > 50 {
            return Err(CrawlError::Config("max_redirects is unreasonably large".into()));
        }
        Ok(())
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
