//! Builds a [`Crawler`] from configuration and drives the crawl to
//! completion.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::admission::{Admission, DomainPolicy};
use crate::checkpoint::Checkpointer;
use crate::config::{CrawlConfig, CrawlStrategy, Tuning};
use crate::dedup::ContentDeduper;
use crate::error::{CrawlError, ErrorKind};
use crate::fetch::browser::{BrowserFetcher, NoBrowserEngine, RenderEngine};
use crate::fetch::http::build_client;
use crate::fetch::Fetcher;
use crate::frontier::local::LocalFrontier;
use crate::frontier::redis::RedisFrontier;
use crate::frontier::Frontier;
use crate::graph::LinkGraph;
use crate::metrics::{Metrics, SharedMetrics};
use crate::models::{CrawlStats, UrlRecord};
use crate::output::FailureLog;
use crate::plugins::PluginRegistry;
use crate::robots::RobotsCache;
use crate::scheduler::{HostScheduler, SchedulerConfig};
use crate::site_rules::RuleSet;
use crate::traps::{TrapConfig, TrapDetector};
use crate::url_norm::UrlNormalizer;

use super::worker::worker_loop;

/// Final report of a crawl run.
#[derive(Debug, Clone)]
pub struct CrawlReport {
    pub stats: CrawlStats,
    pub admitted: usize,
    pub duration_secs: u64,
    pub graph_nodes: usize,
    pub graph_edges: usize,
}

pub struct Crawler {
    pub config: CrawlConfig,
    pub frontier: Arc<dyn Frontier>,
    pub scheduler: Arc<HostScheduler>,
    pub fetcher: Arc<Fetcher>,
    pub admission: Arc<Admission>,
    pub deduper: Arc<ContentDeduper>,
    pub traps: Option<Arc<TrapDetector>>,
    pub robots: Option<Arc<RobotsCache>>,
    pub metrics: SharedMetrics,
    pub plugins: Arc<PluginRegistry>,
    pub cancel: CancellationToken,
    /// Observed link structure, cycles included.
    pub graph: Mutex<LinkGraph>,

    checkpointer: Option<Arc<Checkpointer>>,
    checkpoint_write_lock: tokio::sync::Mutex<()>,
    failure_log: FailureLog,
    stats: Mutex<CrawlStats>,
    store_halted: AtomicBool,
}

/// Build the crawl core from config. `engine` supplies the browser
/// binding when one is available; `None` falls back to a stub that fails
/// renders cleanly.
pub async fn build_crawler(
    config: CrawlConfig,
    engine: Option<Arc<dyn RenderEngine>>,
) -> Result<Crawler, CrawlError> {
    config.validate()?;

    let metrics: SharedMetrics = Arc::new(Metrics::new());
    let client = build_client(&config)?;
    let rules = Arc::new(RuleSet::compile(&config.site_rules)?);

    let normalizer = UrlNormalizer::new(config.tracking_params.clone());
    let seed_hosts: Vec<String> = config
        .seed_urls
        .iter()
        .filter_map(|seed| normalizer.normalize(seed).ok())
        .filter_map(|url| url.host_str().map(|h| h.to_string()))
        .collect();

    let policy = DomainPolicy::new(
        &config.allowed_domains,
        seed_hosts,
        config.follow_subdomains,
        config.follow_external,
    )?;

    let frontier: Arc<dyn Frontier> = if config.distributed {
        let redis_url = config
            .redis_url
            .as_deref()
            .ok_or_else(|| CrawlError::Config("distributed mode requires redis_url".into()))?;
        let worker_tag = format!("crawler-{}", std::process::id());
        Arc::new(RedisFrontier::connect(redis_url, Tuning::DISTRIBUTED_SHARDS, worker_tag).await?)
    } else {
        Arc::new(LocalFrontier::new(num_cpus::get()))
    };

    let traps = if config.enable_trap_detection {
        Some(Arc::new(TrapDetector::new(TrapConfig::default())))
    } else {
        None
    };

    let admission = Arc::new(Admission::new(
        &config,
        policy,
        traps.clone(),
        Arc::clone(&frontier),
        Arc::clone(&metrics),
    ));

    let browser = if config.enable_js {
        let engine = engine.unwrap_or_else(|| Arc::new(NoBrowserEngine));
        Some(BrowserFetcher::new(
            engine,
            config.wait_for_js_ms,
            config.handle_infinite_scroll,
        ))
    } else {
        None
    };

    let fetcher = Arc::new(Fetcher::new(
        &config,
        client.clone(),
        rules,
        browser,
        Arc::clone(&metrics),
    ));

    let scheduler = Arc::new(HostScheduler::new(
        SchedulerConfig {
            per_host_concurrency: config.per_host_concurrency,
            min_gap: Duration::from_millis(config.min_request_gap_ms),
        },
        Arc::clone(&metrics),
    ));

    let robots = if config.respect_robots {
        Some(Arc::new(RobotsCache::new(client, config.user_agent.clone())))
    } else {
        None
    };

    // Checkpoints are a local-mode concept; the shared store is the source
    // of truth in distributed mode.
    let checkpointer = if config.distributed {
        None
    } else {
        Some(Arc::new(Checkpointer::new(
            std::path::PathBuf::from(&config.state_file),
            config.checkpoint_interval,
            config.compat_digest(),
            config.options_digest(),
        )))
    };

    let failure_log = FailureLog::spawn(std::path::Path::new(&config.output_dir))?;

    Ok(Crawler {
        frontier,
        scheduler,
        fetcher,
        admission,
        deduper: Arc::new(ContentDeduper::new()),
        traps,
        robots,
        metrics,
        plugins: Arc::new(PluginRegistry::new()),
        cancel: CancellationToken::new(),
        graph: Mutex::new(LinkGraph::new()),
        checkpointer,
        checkpoint_write_lock: tokio::sync::Mutex::new(()),
        failure_log,
        stats: Mutex::new(CrawlStats::default()),
        store_halted: AtomicBool::new(false),
        config,
    })
}

impl Crawler {
    pub fn strategy(&self) -> CrawlStrategy {
        self.config.strategy
    }

    pub fn soft404_enabled(&self) -> bool {
        self.config.enable_soft404_detection
    }

    pub fn browser_fallback_enabled(&self) -> bool {
        self.config.enable_js && self.fetcher.has_browser()
    }

    pub fn min_request_gap(&self) -> Duration {
        Duration::from_millis(self.config.min_request_gap_ms)
    }

    pub fn stats(&self) -> CrawlStats {
        self.stats.lock().clone()
    }

    pub fn note_success(&self, _record: &UrlRecord) {
        let mut stats = self.stats.lock();
        stats.processed += 1;
        stats.succeeded += 1;
    }

    /// Record a terminal per-URL failure: stats, metrics, failure log.
    /// Never un-counts visited membership.
    pub fn note_failure(&self, record: &UrlRecord, kind: ErrorKind, message: &str, status: u16) {
        {
            let mut stats = self.stats.lock();
            stats.processed += 1;
            stats.errored += 1;
        }
        self.metrics.failures_total.inc(kind.as_str());
        self.failure_log
            .record(&record.url, kind, message, status, record.retries);
    }

    /// Trip the store-failure breaker: stop the crawl, exit code 2 path.
    pub fn halt_on_store_error(&self) {
        if !self.store_halted.swap(true, Ordering::SeqCst) {
            tracing::error!(
                "halting: {} consecutive shared-store failures",
                Tuning::STORE_ERROR_LIMIT
            );
            self.cancel.cancel();
        }
    }

    pub fn halted_on_store_error(&self) -> bool {
        self.store_halted.load(Ordering::SeqCst)
    }

    /// Checkpoint when the admission interval has elapsed. Concurrent
    /// triggers collapse into one write.
    pub async fn maybe_checkpoint(&self) {
        let Some(checkpointer) = &self.checkpointer else {
            return;
        };
        if !checkpointer.note_admission() {
            return;
        }
        let Ok(_guard) = self.checkpoint_write_lock.try_lock() else {
            return;
        };
        let stats = self.stats();
        if let Err(e) = checkpointer
            .save_now(&self.frontier, &self.scheduler, &stats)
            .await
        {
            tracing::error!(error = %e, "periodic checkpoint failed");
        }
    }

    /// Write a checkpoint unconditionally (shutdown, end of run).
    pub async fn checkpoint_now(&self) -> Result<(), CrawlError> {
        let Some(checkpointer) = &self.checkpointer else {
            return Ok(());
        };
        let _guard = self.checkpoint_write_lock.lock().await;
        let stats = self.stats();
        checkpointer
            .save_now(&self.frontier, &self.scheduler, &stats)
            .await
    }

    /// Restore state from a checkpoint file before the run starts.
    pub async fn restore_checkpoint(&self, path: &std::path::Path) -> Result<(), CrawlError> {
        let data = crate::checkpoint::load(
            path,
            &self.config.compat_digest(),
            &self.config.options_digest(),
        )?;

        for (host, multiplier) in &data.snapshot.host_backoffs {
            self.scheduler.restore_backoff(host, *multiplier);
        }
        for record in &data.snapshot.pending {
            self.scheduler.note_host(&record.host);
        }

        *self.stats.lock() = data.header.stats.clone();
        self.frontier.restore(data.snapshot).await?;

        tracing::info!(path = %path.display(), "checkpoint restored");
        Ok(())
    }

    /// Admit the configured seeds. Seeds already in the visited set (from
    /// a restored checkpoint) are not re-admitted.
    pub async fn admit_seeds(&self) -> Result<usize, CrawlError> {
        let mut admitted = 0;
        for seed in self.config.seed_urls.clone() {
            let score = crate::admission::priority_score(&seed);
            match self.admission.admit(&seed, 0, None, score).await? {
                crate::admission::AdmitOutcome::Admitted(record) => {
                    self.scheduler.note_host(&record.host);
                    admitted += 1;
                }
                crate::admission::AdmitOutcome::Dropped(reason) => {
                    tracing::info!(seed = %seed, reason, "seed not admitted");
                }
            }
        }
        Ok(admitted)
    }

    /// Run the crawl to completion (or cancellation). Idempotent
    /// cancellation: signal handlers and the store breaker share one
    /// token.
    pub async fn run(self: &Arc<Self>) -> Result<CrawlReport, CrawlError> {
        let start = Instant::now();

        let counts = self.frontier.counts().await?;
        if counts.pending == 0 {
            // Empty seeds: clean exit with a zero report.
            tracing::info!("nothing to crawl");
            return Ok(self.report(counts.admitted, 0));
        }

        // Lease janitor: re-admits anything held past the lease timeout.
        let janitor = {
            let crawler = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_millis(
                    Tuning::LEASE_SWEEP_INTERVAL_MS,
                ));
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            match crawler.frontier.reclaim_expired().await {
                                Ok(0) => {}
                                Ok(reclaimed) => {
                                    crawler.metrics.leases_expired
                                        .fetch_add(reclaimed as u64, Ordering::Relaxed);
                                    tracing::warn!(reclaimed, "re-admitted expired leases");
                                }
                                Err(e) => tracing::error!(error = %e, "lease sweep failed"),
                            }
                            for (host, multiplier) in crawler.scheduler.backoff_snapshot() {
                                if let Err(e) =
                                    crawler.frontier.save_host_backoff(&host, multiplier).await
                                {
                                    tracing::debug!(error = %e, host = %host, "backoff persist failed");
                                }
                            }

                            let counts = crawler.frontier.counts().await.unwrap_or_default();
                            crawler.metrics.record_queue_depth(counts.pending);

                            let stats = crawler.stats();
                            tracing::info!(
                                pending = counts.pending,
                                leased = counts.leased,
                                admitted = counts.admitted,
                                processed = stats.processed,
                                errored = stats.errored,
                                "crawl progress"
                            );
                        }
                        _ = crawler.cancel.cancelled() => break,
                    }
                }
            })
        };

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.concurrent_requests {
            let crawler = Arc::clone(self);
            workers.spawn(async move { worker_loop(crawler, worker_id).await });
        }

        tracing::info!(
            workers = self.config.concurrent_requests,
            distributed = self.config.distributed,
            "crawl started"
        );

        // Workers exit on their own when the frontier drains; on
        // cancellation they stop within the grace period.
        let grace = Duration::from_secs(self.config.shutdown_grace_secs.unwrap_or(30));
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    tracing::error!("worker panicked: {}", e);
                }
            }
            if self.cancel.is_cancelled() {
                // Give the rest of the workers the grace period, then abort.
                let deadline = tokio::time::sleep(grace);
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        next = workers.join_next() => {
                            match next {
                                Some(_) => continue,
                                None => break,
                            }
                        }
                        _ = &mut deadline => {
                            tracing::warn!("shutdown grace elapsed, aborting workers");
                            workers.abort_all();
                            while workers.join_next().await.is_some() {}
                            break;
                        }
                    }
                }
                break;
            }
        }

        self.cancel.cancel();
        janitor.abort();
        let _ = janitor.await;

        // Emergency/final checkpoint covers both clean and cancelled ends.
        if let Err(e) = self.checkpoint_now().await {
            tracing::error!(error = %e, "final checkpoint failed");
        }

        let counts = self.frontier.counts().await.unwrap_or_default();
        let report = self.report(counts.admitted, start.elapsed().as_secs());

        if self.halted_on_store_error() {
            return Err(CrawlError::Store(
                "crawl halted after repeated shared-store failures".into(),
            ));
        }

        Ok(report)
    }

    fn report(&self, admitted: usize, duration_secs: u64) -> CrawlReport {
        let graph = self.graph.lock();
        CrawlReport {
            stats: self.stats(),
            admitted,
            duration_secs,
            graph_nodes: graph.node_count(),
            graph_edges: graph.edge_count(),
        }
    }

    pub fn print_summary(&self, report: &CrawlReport) {
        crate::output::print_summary(&report.stats, &self.metrics, report.duration_secs);
        println!(
            "  Link graph: {} nodes, {} edges",
            report.graph_nodes, report.graph_edges
        );
    }
}
