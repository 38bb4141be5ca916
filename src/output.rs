//! Run outputs: the newline-delimited JSON failure log and the end-of-run
//! summary.
//!
//! Failure records are handed to a dedicated writer thread over a bounded
//! channel so workers never block on disk. Dropping the handle closes the
//! channel and joins the thread, flushing everything.

use flume::{Receiver, Sender};
use serde::Serialize;
use std::io::Write;
use std::path::Path;
use std::thread;

use crate::error::{CrawlError, ErrorKind};
use crate::metrics::Metrics;
use crate::models::{epoch_secs, CrawlStats};

const CHANNEL_CAPACITY: usize = 10_000;

#[derive(Debug, Serialize)]
struct FailureRecord<'a> {
    url: &'a str,
    kind: &'a str,
    message: &'a str,
    status: u16,
    retries: u32,
    timestamp: u64,
}

/// Handle for the failure-log writer thread.
pub struct FailureLog {
    handle: Option<thread::JoinHandle<()>>,
    tx: Option<Sender<String>>,
}

impl FailureLog {
    /// Spawn the writer. The log lands at `<output_dir>/failures.ndjson`.
    pub fn spawn(output_dir: &Path) -> Result<Self, CrawlError> {
        std::fs::create_dir_all(output_dir)?;
        let path = output_dir.join("failures.ndjson");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        let (tx, rx) = flume::bounded::<String>(CHANNEL_CAPACITY);
        let handle = thread::spawn(move || Self::writer_loop(file, rx));

        Ok(Self {
            handle: Some(handle),
            tx: Some(tx),
        })
    }

    fn writer_loop(file: std::fs::File, rx: Receiver<String>) {
        let mut writer = std::io::BufWriter::new(file);
        while let Ok(line) = rx.recv() {
            if writer
                .write_all(line.as_bytes())
                .and_then(|_| writer.write_all(b"\n"))
                .is_err()
            {
                tracing::error!("failure log write error, dropping records");
            }
        }
        let _ = writer.flush();
    }

    /// Record one terminal per-URL failure. `cancelled` is never logged as
    /// a failure.
    pub fn record(&self, url: &str, kind: ErrorKind, message: &str, status: u16, retries: u32) {
        if kind == ErrorKind::Cancelled {
            return;
        }
        let record = FailureRecord {
            url,
            kind: kind.as_str(),
            message,
            status,
            retries,
            timestamp: epoch_secs(),
        };
        if let (Some(tx), Ok(line)) = (&self.tx, serde_json::to_string(&record)) {
            // A full channel sheds records rather than stalling workers
            let _ = tx.try_send(line);
        }
    }
}

impl Drop for FailureLog {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// End-of-run summary printed to stdout: totals and counts by error kind.
pub fn print_summary(stats: &CrawlStats, metrics: &Metrics, elapsed_secs: u64) {
    println!("================================================================================");
    println!("  CRAWL SUMMARY ({}s elapsed)", elapsed_secs);
    println!("================================================================================");
    println!(
        "  Processed: {} | Succeeded: {} | Errored: {}",
        stats.processed, stats.succeeded, stats.errored
    );

    let admitted = metrics
        .urls_admitted_total
        .load(std::sync::atomic::Ordering::Relaxed);
    println!("  Admitted:  {}", admitted);

    let failures = metrics.failures_total.snapshot();
    if !failures.is_empty() {
        println!("  Failures by kind:");
        for (kind, count) in failures {
            println!("    {:<22} {}", kind, count);
        }
    }

    let drops = metrics.urls_dropped_total.snapshot();
    if !drops.is_empty() {
        println!("  Drops by reason:");
        for (reason, count) in drops {
            println!("    {:<22} {}", reason, count);
        }
    }

    let duplicates = metrics.duplicates_total.snapshot();
    if !duplicates.is_empty() {
        println!("  Duplicates by tier:");
        for (tier, count) in duplicates {
            println!("    {:<22} {}", tier, count);
        }
    }

    println!("================================================================================");
}
