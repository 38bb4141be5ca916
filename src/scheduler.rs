//! Host politeness scheduler.
//!
//! Sits between the frontier and the fetcher. Enforces per-host
//! concurrency, a minimum inter-request gap scaled by an adaptive backoff
//! multiplier, and a circuit breaker that parks hosts whose recent error
//! rate crosses 50%. A heap of `(next_permitted, host)` lets idle workers
//! sleep until the earliest deadline or a completion wakes them.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::Tuning;
use crate::metrics::SharedMetrics;

#[derive(Debug)]
pub struct HostState {
    pub inflight: usize,
    pub next_permitted: Instant,
    /// Grows ×1.5 on error (cap ×30), decays ×0.9 on success (floor ×1.0).
    pub backoff_multiplier: f64,
    /// Rolling success/failure window for the circuit breaker.
    window: VecDeque<bool>,
    pub parked_until: Option<Instant>,
}

impl HostState {
    fn new() -> Self {
        Self {
            inflight: 0,
            next_permitted: Instant::now(),
            backoff_multiplier: 1.0,
            window: VecDeque::with_capacity(Tuning::CIRCUIT_WINDOW),
            parked_until: None,
        }
    }

    fn record(&mut self, success: bool) {
        if self.window.len() == Tuning::CIRCUIT_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(success);

        if success {
            self.backoff_multiplier = (self.backoff_multiplier * Tuning::BACKOFF_DECAY).max(1.0);
        } else {
            self.backoff_multiplier =
                (self.backoff_multiplier * Tuning::BACKOFF_GROW).min(Tuning::BACKOFF_CAP);
        }
    }

    fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let errors = self.window.iter().filter(|ok| !**ok).count();
        errors as f64 / self.window.len() as f64
    }

    fn circuit_open(&self) -> bool {
        self.window.len() == Tuning::CIRCUIT_WINDOW
            && self.error_rate() > Tuning::CIRCUIT_ERROR_RATE
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub per_host_concurrency: usize,
    pub min_gap: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            per_host_concurrency: 2,
            min_gap: Duration::from_secs(1),
        }
    }
}

pub struct HostScheduler {
    hosts: DashMap<String, HostState>,
    /// Hosts believed to have pending work, keyed by earliest dispatch time.
    ready_heap: Mutex<BinaryHeap<Reverse<(Instant, String)>>>,
    completion: Notify,
    config: SchedulerConfig,
    metrics: SharedMetrics,
}

impl HostScheduler {
    pub fn new(config: SchedulerConfig, metrics: SharedMetrics) -> Self {
        Self {
            hosts: DashMap::new(),
            ready_heap: Mutex::new(BinaryHeap::new()),
            completion: Notify::new(),
            config,
            metrics,
        }
    }

    /// Register that `host` has pending work, queueing it for dispatch.
    pub fn note_host(&self, host: &str) {
        let next = self
            .hosts
            .entry(host.to_string())
            .or_insert_with(HostState::new)
            .next_permitted;
        self.ready_heap
            .lock()
            .push(Reverse((next, host.to_string())));
    }

    /// Whether the scheduler has tracked this host before. False until the
    /// first acquire/note/restore, which is when persisted backoff state
    /// should be hydrated.
    pub fn knows_host(&self, host: &str) -> bool {
        self.hosts.contains_key(host)
    }

    /// Seed a host's backoff multiplier (checkpoint restore).
    pub fn restore_backoff(&self, host: &str, multiplier: f64) {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(HostState::new)
            .backoff_multiplier = multiplier.clamp(1.0, Tuning::BACKOFF_CAP);
    }

    /// Backoff multipliers worth persisting (anything above the floor).
    pub fn backoff_snapshot(&self) -> std::collections::HashMap<String, f64> {
        self.hosts
            .iter()
            .filter(|entry| entry.value().backoff_multiplier > 1.0)
            .map(|entry| (entry.key().clone(), entry.value().backoff_multiplier))
            .collect()
    }

    fn dispatchable(&self, host: &str, now: Instant) -> Result<(), Instant> {
        let Some(mut state) = self.hosts.get_mut(host) else {
            return Ok(());
        };

        if let Some(until) = state.parked_until {
            if now < until {
                return Err(until);
            }
            state.parked_until = None;
            self.metrics
                .hosts_parked
                .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
        }

        if state.inflight >= self.config.per_host_concurrency {
            // Wake on completion rather than a deadline; report a short
            // poll interval as the fallback.
            return Err(now + Duration::from_millis(50));
        }
        if now < state.next_permitted {
            return Err(state.next_permitted);
        }
        Ok(())
    }

    /// Pop the earliest host that can dispatch right now, if any; with the
    /// time to sleep until otherwise.
    pub fn next_ready_host(&self) -> Result<Option<String>, Duration> {
        let now = Instant::now();
        let mut heap = self.ready_heap.lock();
        let mut deferred: Vec<Reverse<(Instant, String)>> = Vec::new();
        let mut earliest: Option<Instant> = None;

        let result = loop {
            let Some(Reverse((_, host))) = heap.pop() else {
                break None;
            };
            match self.dispatchable(&host, now) {
                Ok(()) => break Some(host),
                Err(ready_at) => {
                    earliest = Some(earliest.map_or(ready_at, |e: Instant| e.min(ready_at)));
                    deferred.push(Reverse((ready_at, host)));
                }
            }
        };

        for entry in deferred {
            heap.push(entry);
        }

        match result {
            Some(host) => Ok(Some(host)),
            None => match earliest {
                Some(at) => Err(at.saturating_duration_since(now).max(Duration::from_millis(1))),
                None => Ok(None),
            },
        }
    }

    /// Wait until some host is dispatchable. `None` means the heap is empty
    /// (no known work) or cancellation fired.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> Option<String> {
        loop {
            match self.next_ready_host() {
                Ok(found) => return found,
                Err(sleep_for) => {
                    tokio::select! {
                        _ = tokio::time::sleep(sleep_for) => {}
                        _ = self.completion.notified() => {}
                        _ = cancel.cancelled() => return None,
                    }
                }
            }
        }
    }

    /// Block until `host` has a free slot and its gap has elapsed, then
    /// claim the dispatch: inflight goes up and the next permitted time
    /// moves out by `gap × backoff_multiplier`.
    pub async fn acquire(&self, host: &str, cancel: &CancellationToken) -> bool {
        loop {
            let now = Instant::now();
            let wait = {
                let mut state = self
                    .hosts
                    .entry(host.to_string())
                    .or_insert_with(HostState::new);

                if let Some(until) = state.parked_until {
                    if now >= until {
                        state.parked_until = None;
                        self.metrics
                            .hosts_parked
                            .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
                    }
                }

                if state.parked_until.is_none()
                    && state.inflight < self.config.per_host_concurrency
                    && now >= state.next_permitted
                {
                    state.inflight += 1;
                    let gap = self.config.min_gap.mul_f64(state.backoff_multiplier);
                    state.next_permitted = now + gap;
                    None
                } else if let Some(until) = state.parked_until {
                    Some(until.saturating_duration_since(now))
                } else if now < state.next_permitted {
                    Some(state.next_permitted.saturating_duration_since(now))
                } else {
                    // Slots exhausted; poll on completion
                    Some(Duration::from_millis(50))
                }
            };

            match wait {
                None => return true,
                Some(sleep_for) => {
                    tokio::select! {
                        _ = tokio::time::sleep(sleep_for.max(Duration::from_millis(1))) => {}
                        _ = self.completion.notified() => {}
                        _ = cancel.cancelled() => return false,
                    }
                }
            }
        }
    }

    /// Release a dispatch slot and fold the outcome into the adaptive
    /// backoff and circuit-breaker state.
    pub fn release(&self, host: &str, success: bool) {
        let mut parked = false;
        if let Some(mut state) = self.hosts.get_mut(host) {
            state.inflight = state.inflight.saturating_sub(1);
            state.record(success);

            if !success && state.circuit_open() && state.parked_until.is_none() {
                state.parked_until =
                    Some(Instant::now() + Duration::from_secs(Tuning::CIRCUIT_PARK_SECS));
                // A parked host starts its window fresh when it returns.
                state.window.clear();
                parked = true;
            }
        }

        if parked {
            tracing::warn!(host = host, "circuit open, parking host");
            self.metrics
                .hosts_parked
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }

        self.completion.notify_waiters();
    }

    pub fn inflight(&self, host: &str) -> usize {
        self.hosts.get(host).map(|s| s.inflight).unwrap_or(0)
    }

    pub fn backoff_multiplier(&self, host: &str) -> f64 {
        self.hosts.get(host).map(|s| s.backoff_multiplier).unwrap_or(1.0)
    }

    pub fn is_parked(&self, host: &str) -> bool {
        self.hosts
            .get(host)
            .and_then(|s| s.parked_until)
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }
}

pub type SharedScheduler = Arc<HostScheduler>;
