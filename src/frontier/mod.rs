//! The frontier: URLs known but not yet fetched, ordered for dispatch.
//!
//! Two backends implement the same operations: [`local::LocalFrontier`]
//! keeps everything in-process behind sharded locks;
//! [`redis::RedisFrontier`] puts the queue, visited set, and leases in a
//! shared store so stateless workers can scale out.
//!
//! Dispatch is at-least-once: a lease that expires is re-admitted with an
//! incremented retry count, and the content deduper absorbs the duplicate
//! work.

pub mod bloom;
pub mod local;
pub mod redis;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::CrawlStrategy;
use crate::error::CrawlError;
use crate::models::UrlRecord;

/// A time-bounded claim on a frontier URL.
#[derive(Debug, Clone)]
pub struct Lease {
    pub id: String,
    pub record: UrlRecord,
    pub worker: String,
}

/// How a leased URL finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    /// Terminal: fetched or terminally failed. The URL stays visited.
    Done,
    /// Put the URL back with an incremented retry count (cancellation,
    /// worker handoff).
    Requeue,
}

/// Queue/visited totals for progress reporting and backpressure.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrontierCounts {
    pub pending: usize,
    pub leased: usize,
    /// Every URL ever admitted (pending, leased, or done).
    pub admitted: usize,
}

/// Serialized frontier state for checkpoints.
///
/// `visited` holds admitted URLs that are no longer pending; `pending`
/// holds the rest, priority-ordered. The two are disjoint and their union
/// is every URL ever admitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FrontierSnapshot {
    pub visited: Vec<String>,
    pub pending: Vec<UrlRecord>,
    /// Host backoff multipliers that survive a restart.
    #[serde(default)]
    pub host_backoffs: HashMap<String, f64>,
}

#[async_trait]
pub trait Frontier: Send + Sync {
    /// Atomically mark the URL visited and enqueue it. Returns false when
    /// the canonical form was already admitted.
    async fn admit(&self, record: UrlRecord) -> Result<bool, CrawlError>;

    /// Claim the best pending URL, preferring `host` when given. Returns
    /// `None` when nothing is pending (for that host).
    async fn lease(&self, worker_id: &str, host: Option<&str>)
        -> Result<Option<Lease>, CrawlError>;

    /// Resolve a lease.
    async fn complete(&self, lease: Lease, outcome: CompleteOutcome) -> Result<(), CrawlError>;

    /// Whether a canonical URL was ever admitted.
    async fn is_visited(&self, canonical: &str) -> Result<bool, CrawlError>;

    /// Re-admit URLs whose leases timed out. Returns how many were
    /// reclaimed.
    async fn reclaim_expired(&self) -> Result<usize, CrawlError>;

    async fn counts(&self) -> Result<FrontierCounts, CrawlError>;

    async fn snapshot(&self) -> Result<FrontierSnapshot, CrawlError>;

    async fn restore(&self, snapshot: FrontierSnapshot) -> Result<(), CrawlError>;

    /// Persist a host's adaptive backoff multiplier, for backends with
    /// durable host state. Local frontiers carry it in checkpoints
    /// instead.
    async fn save_host_backoff(&self, _host: &str, _multiplier: f64) -> Result<(), CrawlError> {
        Ok(())
    }

    /// Previously persisted backoff multiplier for a host, if any.
    async fn load_host_backoff(&self, _host: &str) -> Result<Option<f64>, CrawlError> {
        Ok(None)
    }
}

/// Priority assigned at admission under the configured strategy.
///
/// The queue pops highest priority first, then shallowest, then FIFO:
/// BFS keeps every entry at 0 so depth dominates; DFS scores by depth so
/// the deepest (most recently discovered) URLs pop first; `priority` uses
/// the caller-provided score.
pub fn strategy_priority(strategy: CrawlStrategy, depth: u32, score: f64) -> f64 {
    match strategy {
        CrawlStrategy::Bfs => 0.0,
        CrawlStrategy::Dfs => depth as f64,
        CrawlStrategy::Priority => score,
    }
}
