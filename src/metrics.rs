//! Thread-safe metrics for crawl progress and health.
//!
//! Counters, gauges, and histograms follow Prometheus conventions; the
//! labeled families back the end-of-run summary and the failure report:
//! `fetches_total{status,mode}`, `urls_admitted_total`,
//! `urls_dropped_total{reason}`, `duplicates_total{tier}`,
//! `traps_total{kind}`, `fetch_duration_seconds{mode}`, `queue_depth`,
//! `inflight`, `hosts_parked`.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Histogram {
    /// Upper bound (seconds) and count per bucket; the last bucket is +Inf.
    buckets: Vec<(f64, u64)>,
    sum: f64,
    count: u64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: [0.005, 0.025, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, f64::INFINITY]
                .iter()
                .map(|b| (*b, 0))
                .collect(),
            sum: 0.0,
            count: 0,
        }
    }

    pub fn observe(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
        for (bound, count) in &mut self.buckets {
            if value <= *bound {
                *count += 1;
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter family keyed by a label value.
#[derive(Debug, Default)]
pub struct LabeledCounter {
    values: DashMap<String, AtomicU64>,
}

impl LabeledCounter {
    pub fn inc(&self, label: &str) {
        self.add(label, 1);
    }

    pub fn add(&self, label: &str, delta: u64) {
        self.values
            .entry(label.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self, label: &str) -> u64 {
        self.values
            .get(label)
            .map(|v| v.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.values.iter().map(|e| e.value().load(Ordering::Relaxed)).sum()
    }

    /// Snapshot of (label, value), sorted by label for stable output.
    pub fn snapshot(&self) -> Vec<(String, u64)> {
        let mut out: Vec<(String, u64)> = self
            .values
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

pub struct Metrics {
    /// `fetches_total{status,mode}`, labeled as "status/mode".
    pub fetches_total: LabeledCounter,
    pub urls_admitted_total: AtomicU64,
    pub urls_dropped_total: LabeledCounter,
    pub duplicates_total: LabeledCounter,
    pub traps_total: LabeledCounter,
    /// Failures by error kind, feeding the end-of-run summary.
    pub failures_total: LabeledCounter,

    pub fetch_duration_http: Mutex<Histogram>,
    pub fetch_duration_browser: Mutex<Histogram>,
    pub queue_depth: Mutex<Histogram>,

    pub inflight: AtomicI64,
    pub hosts_parked: AtomicI64,

    /// Link-extraction drops caused by the frontier soft cap.
    pub backpressure_drops: AtomicU64,
    /// Lease expirations that re-admitted a URL.
    pub leases_expired: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            fetches_total: LabeledCounter::default(),
            urls_admitted_total: AtomicU64::new(0),
            urls_dropped_total: LabeledCounter::default(),
            duplicates_total: LabeledCounter::default(),
            traps_total: LabeledCounter::default(),
            failures_total: LabeledCounter::default(),
            fetch_duration_http: Mutex::new(Histogram::new()),
            fetch_duration_browser: Mutex::new(Histogram::new()),
            queue_depth: Mutex::new(Histogram::new()),
            inflight: AtomicI64::new(0),
            hosts_parked: AtomicI64::new(0),
            backpressure_drops: AtomicU64::new(0),
            leases_expired: AtomicU64::new(0),
        }
    }

    pub fn record_fetch(&self, status: u16, mode: crate::models::FetchMode, duration: Duration) {
        self.fetches_total
            .inc(&format!("{}/{}", status, mode.as_str()));
        let hist = match mode {
            crate::models::FetchMode::Http => &self.fetch_duration_http,
            crate::models::FetchMode::Browser => &self.fetch_duration_browser,
        };
        hist.lock().observe(duration.as_secs_f64());
    }

    pub fn record_drop(&self, reason: &str) {
        self.urls_dropped_total.inc(reason);
    }

    pub fn record_queue_depth(&self, depth: usize) {
        self.queue_depth.lock().observe(depth as f64);
    }

    pub fn inflight_inc(&self) {
        self.inflight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inflight_dec(&self) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Prometheus text exposition of the counter families. Histograms are
    /// summarized as count/mean; a scraping endpoint is a collaborator
    /// concern, this just keeps the names wire-compatible.
    pub fn encode(&self) -> String {
        let mut out = String::new();

        for (label, value) in self.fetches_total.snapshot() {
            let mut parts = label.splitn(2, '/');
            let status = parts.next().unwrap_or("0");
            let mode = parts.next().unwrap_or("http");
            out.push_str(&format!(
                "fetches_total{{status=\"{}\",mode=\"{}\"}} {}\n",
                status, mode, value
            ));
        }

        out.push_str(&format!(
            "urls_admitted_total {}\n",
            self.urls_admitted_total.load(Ordering::Relaxed)
        ));

        for (reason, value) in self.urls_dropped_total.snapshot() {
            out.push_str(&format!(
                "urls_dropped_total{{reason=\"{}\"}} {}\n",
                reason, value
            ));
        }
        for (tier, value) in self.duplicates_total.snapshot() {
            out.push_str(&format!("duplicates_total{{tier=\"{}\"}} {}\n", tier, value));
        }
        for (kind, value) in self.traps_total.snapshot() {
            out.push_str(&format!("traps_total{{kind=\"{}\"}} {}\n", kind, value));
        }

        out.push_str(&format!("inflight {}\n", self.inflight.load(Ordering::Relaxed)));
        out.push_str(&format!(
            "hosts_parked {}\n",
            self.hosts_parked.load(Ordering::Relaxed)
        ));

        let http = self.fetch_duration_http.lock();
        out.push_str(&format!(
            "fetch_duration_seconds_count{{mode=\"http\"}} {}\n",
            http.count()
        ));
        drop(http);
        let browser = self.fetch_duration_browser.lock();
        out.push_str(&format!(
            "fetch_duration_seconds_count{{mode=\"browser\"}} {}\n",
            browser.count()
        ));

        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FetchMode;

    #[test]
    fn test_histogram_counts() {
        let mut hist = Histogram::new();
        hist.observe(0.05);
        hist.observe(0.2);
        hist.observe(3.0);
        assert_eq!(hist.count(), 3);
        assert!((hist.mean() - (0.05 + 0.2 + 3.0) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_labeled_counter() {
        let c = LabeledCounter::default();
        c.inc("trap_detected");
        c.add("trap_detected", 2);
        c.inc("timeout");
        assert_eq!(c.get("trap_detected"), 3);
        assert_eq!(c.get("timeout"), 1);
        assert_eq!(c.get("missing"), 0);
        assert_eq!(c.total(), 4);
    }

    #[test]
    fn test_encode_includes_label_pairs() {
        let m = Metrics::new();
        m.record_fetch(200, FetchMode::Http, Duration::from_millis(20));
        m.record_drop("trap_detected");
        let text = m.encode();
        assert!(text.contains("fetches_total{status=\"200\",mode=\"http\"} 1"));
        assert!(text.contains("urls_dropped_total{reason=\"trap_detected\"} 1"));
    }
}
