//! In-process frontier: per-host priority queues behind sharded locks.
//!
//! Shard = `hash(host) % S`, so a host's queue and the visited entries for
//! its URLs live under one lock and admission stays atomic. A lease table
//! re-admits anything a worker held past the lease timeout.

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use xxhash_rust::xxh3::xxh3_64;

use async_trait::async_trait;

use super::{CompleteOutcome, Frontier, FrontierCounts, FrontierSnapshot, Lease};
use crate::config::Tuning;
use crate::error::CrawlError;
use crate::models::{epoch_secs, UrlRecord};

/// Heap entry: highest priority first, then shallowest, then FIFO by
/// admission sequence.
#[derive(Debug, Clone)]
struct HeapEntry {
    record: UrlRecord,
    seq: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.record
            .priority
            .total_cmp(&other.record.priority)
            .then_with(|| other.record.depth.cmp(&self.record.depth))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Shard {
    host_queues: HashMap<String, BinaryHeap<HeapEntry>>,
    visited: HashSet<String>,
}

struct LeaseEntry {
    record: UrlRecord,
    deadline: u64,
}

pub struct LocalFrontier {
    shards: Vec<Mutex<Shard>>,
    leases: Mutex<HashMap<String, LeaseEntry>>,
    seq: AtomicU64,
    lease_seq: AtomicU64,
    pending: AtomicUsize,
    admitted: AtomicUsize,
    lease_timeout_secs: u64,
}

impl LocalFrontier {
    pub fn new(num_shards: usize) -> Self {
        let num_shards = num_shards.max(1);
        Self {
            shards: (0..num_shards).map(|_| Mutex::new(Shard::default())).collect(),
            leases: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
            lease_seq: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
            admitted: AtomicUsize::new(0),
            lease_timeout_secs: Tuning::LEASE_TIMEOUT_SECS,
        }
    }

    pub fn with_lease_timeout(mut self, secs: u64) -> Self {
        self.lease_timeout_secs = secs;
        self
    }

    fn shard_for(&self, host: &str) -> &Mutex<Shard> {
        let idx = xxh3_64(host.as_bytes()) as usize % self.shards.len();
        &self.shards[idx]
    }

    fn push_entry(&self, record: UrlRecord) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        let mut shard = self.shard_for(&record.host).lock();
        shard
            .host_queues
            .entry(record.host.clone())
            .or_default()
            .push(HeapEntry { record, seq });
        self.pending.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn pop_for_host(&self, host: &str) -> Option<UrlRecord> {
        let mut shard = self.shard_for(host).lock();
        let queue = shard.host_queues.get_mut(host)?;
        let entry = queue.pop()?;
        if queue.is_empty() {
            shard.host_queues.remove(host);
        }
        self.pending.fetch_sub(1, AtomicOrdering::Relaxed);
        Some(entry.record)
    }

    /// Best entry across every shard. O(shards × hosts); only the
    /// host-less lease path pays it.
    fn pop_best(&self) -> Option<UrlRecord> {
        let mut best_host: Option<String> = None;
        let mut best_entry: Option<HeapEntry> = None;

        for shard in &self.shards {
            let guard = shard.lock();
            for (host, queue) in &guard.host_queues {
                if let Some(top) = queue.peek() {
                    let better = match &best_entry {
                        Some(current) => top > current,
                        None => true,
                    };
                    if better {
                        best_host = Some(host.clone());
                        best_entry = Some(top.clone());
                    }
                }
            }
        }

        self.pop_for_host(&best_host?)
    }

    fn make_lease(&self, mut record: UrlRecord, worker: &str) -> Lease {
        let id = format!(
            "l{}",
            self.lease_seq.fetch_add(1, AtomicOrdering::Relaxed)
        );
        let deadline = epoch_secs() + self.lease_timeout_secs;
        record.lease_deadline = Some(deadline);
        self.leases.lock().insert(
            id.clone(),
            LeaseEntry {
                record: record.clone(),
                deadline,
            },
        );
        Lease {
            id,
            record,
            worker: worker.to_string(),
        }
    }
}

#[async_trait]
impl Frontier for LocalFrontier {
    async fn admit(&self, record: UrlRecord) -> Result<bool, CrawlError> {
        // Visited insert and enqueue under the same shard lock: no two
        // workers can admit the same canonical URL.
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        {
            let mut shard = self.shard_for(&record.host).lock();
            if !shard.visited.insert(record.url.clone()) {
                return Ok(false);
            }
            shard
                .host_queues
                .entry(record.host.clone())
                .or_default()
                .push(HeapEntry {
                    record,
                    seq,
                });
        }
        self.pending.fetch_add(1, AtomicOrdering::Relaxed);
        self.admitted.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(true)
    }

    async fn lease(
        &self,
        worker_id: &str,
        host: Option<&str>,
    ) -> Result<Option<Lease>, CrawlError> {
        let record = match host {
            Some(h) => self.pop_for_host(h),
            None => self.pop_best(),
        };
        Ok(record.map(|r| self.make_lease(r, worker_id)))
    }

    async fn complete(&self, lease: Lease, outcome: CompleteOutcome) -> Result<(), CrawlError> {
        let entry = self.leases.lock().remove(&lease.id);
        if let (Some(entry), CompleteOutcome::Requeue) = (entry, outcome) {
            let mut record = entry.record;
            record.retries += 1;
            record.lease_deadline = None;
            self.push_entry(record);
        }
        Ok(())
    }

    async fn is_visited(&self, canonical: &str) -> Result<bool, CrawlError> {
        let host = crate::url_norm::host_of(canonical).unwrap_or_default();
        Ok(self.shard_for(&host).lock().visited.contains(canonical))
    }

    async fn reclaim_expired(&self) -> Result<usize, CrawlError> {
        let now = epoch_secs();
        let expired: Vec<(String, UrlRecord)> = {
            let leases = self.leases.lock();
            leases
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(id, e)| (id.clone(), e.record.clone()))
                .collect()
        };

        let count = expired.len();
        for (id, mut record) in expired {
            self.leases.lock().remove(&id);
            record.retries += 1;
            record.lease_deadline = None;
            self.push_entry(record);
        }
        Ok(count)
    }

    async fn counts(&self) -> Result<FrontierCounts, CrawlError> {
        Ok(FrontierCounts {
            pending: self.pending.load(AtomicOrdering::Relaxed),
            leased: self.leases.lock().len(),
            admitted: self.admitted.load(AtomicOrdering::Relaxed),
        })
    }

    async fn snapshot(&self) -> Result<FrontierSnapshot, CrawlError> {
        // Pending = queued entries plus anything currently leased; a lease
        // that never completes must not lose its URL.
        let mut pending: Vec<UrlRecord> = Vec::new();
        let mut admitted: HashSet<String> = HashSet::new();

        for shard in &self.shards {
            let guard = shard.lock();
            admitted.extend(guard.visited.iter().cloned());
            for queue in guard.host_queues.values() {
                // into_sorted_vec would consume; clone and sort descending
                let mut entries: Vec<HeapEntry> = queue.iter().cloned().collect();
                entries.sort_by(|a, b| b.cmp(a));
                pending.extend(entries.into_iter().map(|e| e.record));
            }
        }

        for entry in self.leases.lock().values() {
            let mut record = entry.record.clone();
            record.lease_deadline = None;
            pending.push(record);
        }

        pending.sort_by(|a, b| {
            b.priority
                .total_cmp(&a.priority)
                .then_with(|| a.depth.cmp(&b.depth))
        });

        let pending_urls: HashSet<&str> = pending.iter().map(|r| r.url.as_str()).collect();
        let visited: Vec<String> = admitted
            .into_iter()
            .filter(|u| !pending_urls.contains(u.as_str()))
            .collect();

        Ok(FrontierSnapshot {
            visited,
            pending,
            host_backoffs: HashMap::new(),
        })
    }

    async fn restore(&self, snapshot: FrontierSnapshot) -> Result<(), CrawlError> {
        for url in &snapshot.visited {
            let host = crate::url_norm::host_of(url).unwrap_or_default();
            let mut shard = self.shard_for(&host).lock();
            if shard.visited.insert(url.clone()) {
                self.admitted.fetch_add(1, AtomicOrdering::Relaxed);
            }
        }

        for record in snapshot.pending {
            let newly_visited = {
                let mut shard = self.shard_for(&record.host).lock();
                shard.visited.insert(record.url.clone())
            };
            if newly_visited {
                self.admitted.fetch_add(1, AtomicOrdering::Relaxed);
            }
            self.push_entry(record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlStrategy;
    use crate::frontier::strategy_priority;

    fn record(url: &str, depth: u32, priority: f64) -> UrlRecord {
        let host = crate::url_norm::host_of(url).unwrap();
        UrlRecord::new(url.to_string(), host, depth, priority, None)
    }

    #[tokio::test]
    async fn test_admit_is_idempotent_per_canonical_url() {
        let frontier = LocalFrontier::new(4);
        assert!(frontier.admit(record("https://h/a", 0, 0.0)).await.unwrap());
        assert!(!frontier.admit(record("https://h/a", 0, 0.0)).await.unwrap());

        let counts = frontier.counts().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.admitted, 1);
        assert!(frontier.is_visited("https://h/a").await.unwrap());
    }

    #[tokio::test]
    async fn test_priority_then_depth_then_fifo() {
        let frontier = LocalFrontier::new(2);
        frontier.admit(record("https://h/low", 1, 0.1)).await.unwrap();
        frontier.admit(record("https://h/high", 3, 0.9)).await.unwrap();
        frontier.admit(record("https://h/shallow", 0, 0.1)).await.unwrap();
        frontier.admit(record("https://h/tie-first", 1, 0.5)).await.unwrap();
        frontier.admit(record("https://h/tie-second", 1, 0.5)).await.unwrap();

        let mut order = Vec::new();
        while let Some(lease) = frontier.lease("w0", Some("h")).await.unwrap() {
            order.push(lease.record.url.clone());
            frontier.complete(lease, CompleteOutcome::Done).await.unwrap();
        }

        assert_eq!(
            order,
            vec![
                "https://h/high",
                "https://h/tie-first",
                "https://h/tie-second",
                "https://h/shallow",
                "https://h/low",
            ]
        );
    }

    #[tokio::test]
    async fn test_dfs_strategy_pops_deepest_first() {
        let frontier = LocalFrontier::new(1);
        for (url, depth) in [("https://h/d0", 0u32), ("https://h/d2", 2), ("https://h/d1", 1)] {
            let priority = strategy_priority(CrawlStrategy::Dfs, depth, 0.0);
            frontier.admit(record(url, depth, priority)).await.unwrap();
        }
        let lease = frontier.lease("w0", Some("h")).await.unwrap().unwrap();
        assert_eq!(lease.record.url, "https://h/d2");
    }

    #[tokio::test]
    async fn test_requeue_increments_retries() {
        let frontier = LocalFrontier::new(1);
        frontier.admit(record("https://h/a", 0, 0.0)).await.unwrap();

        let lease = frontier.lease("w0", Some("h")).await.unwrap().unwrap();
        frontier.complete(lease, CompleteOutcome::Requeue).await.unwrap();

        let lease = frontier.lease("w0", Some("h")).await.unwrap().unwrap();
        assert_eq!(lease.record.retries, 1);
    }

    #[tokio::test]
    async fn test_expired_leases_are_reclaimed() {
        let frontier = LocalFrontier::new(1).with_lease_timeout(0);
        frontier.admit(record("https://h/a", 0, 0.0)).await.unwrap();

        let _lease = frontier.lease("w0", Some("h")).await.unwrap().unwrap();
        assert_eq!(frontier.counts().await.unwrap().pending, 0);

        let reclaimed = frontier.reclaim_expired().await.unwrap();
        assert_eq!(reclaimed, 1);

        let lease = frontier.lease("w1", Some("h")).await.unwrap().unwrap();
        assert_eq!(lease.record.retries, 1);
    }

    #[tokio::test]
    async fn test_snapshot_splits_visited_and_pending() {
        let frontier = LocalFrontier::new(2);
        frontier.admit(record("https://h/done", 0, 0.0)).await.unwrap();
        frontier.admit(record("https://h/pending", 1, 0.0)).await.unwrap();

        let lease = frontier.lease("w0", Some("h")).await.unwrap().unwrap();
        assert_eq!(lease.record.url, "https://h/done");
        frontier.complete(lease, CompleteOutcome::Done).await.unwrap();

        let snapshot = frontier.snapshot().await.unwrap();
        assert_eq!(snapshot.visited, vec!["https://h/done".to_string()]);
        assert_eq!(snapshot.pending.len(), 1);
        assert_eq!(snapshot.pending[0].url, "https://h/pending");
    }

    #[tokio::test]
    async fn test_snapshot_keeps_leased_urls_pending() {
        let frontier = LocalFrontier::new(1);
        frontier.admit(record("https://h/leased", 0, 0.0)).await.unwrap();
        let _lease = frontier.lease("w0", Some("h")).await.unwrap().unwrap();

        let snapshot = frontier.snapshot().await.unwrap();
        assert!(snapshot.visited.is_empty());
        assert_eq!(snapshot.pending.len(), 1);
        assert_eq!(snapshot.pending[0].url, "https://h/leased");
    }

    #[tokio::test]
    async fn test_restore_rebuilds_state() {
        let source = LocalFrontier::new(2);
        source.admit(record("https://h/done", 0, 0.0)).await.unwrap();
        source.admit(record("https://h/todo", 1, 0.0)).await.unwrap();
        let lease = source.lease("w0", Some("h")).await.unwrap().unwrap();
        source.complete(lease, CompleteOutcome::Done).await.unwrap();

        let snapshot = source.snapshot().await.unwrap();

        let restored = LocalFrontier::new(4);
        restored.restore(snapshot).await.unwrap();

        // The done URL must not be re-admittable; the pending one leases.
        assert!(!restored.admit(record("https://h/done", 0, 0.0)).await.unwrap());
        let lease = restored.lease("w0", Some("h")).await.unwrap().unwrap();
        assert_eq!(lease.record.url, "https://h/todo");
    }

    #[tokio::test]
    async fn test_lease_without_host_takes_global_best() {
        let frontier = LocalFrontier::new(4);
        frontier.admit(record("https://a.example/x", 1, 0.2)).await.unwrap();
        frontier.admit(record("https://b.example/y", 1, 0.8)).await.unwrap();

        let lease = frontier.lease("w0", None).await.unwrap().unwrap();
        assert_eq!(lease.record.url, "https://b.example/y");
    }
}
