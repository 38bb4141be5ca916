//! The worker loop: lease → politeness → fetch → dedup/soft-404 → link
//! extraction → admission of children.
//!
//! Workers are stateless beyond local caches; every shared decision goes
//! through the frontier, scheduler, or deduper. Duplicate delivery (lease
//! expiry, at-least-once stores) is absorbed by the content deduper.

use std::sync::Arc;
use url::Url;

use crate::admission::{priority_score, AdmitOutcome};
use crate::config::{CrawlStrategy, Tuning};
use crate::error::{CrawlError, ErrorKind};
use crate::fetch::browser::wants_browser_retry;
use crate::fetch::http::decode_body;
use crate::frontier::{CompleteOutcome, Frontier, Lease};
use crate::models::{FetchMode, PageFetch};
use crate::traps;

use super::builder::Crawler;

pub async fn worker_loop(crawler: Arc<Crawler>, worker_id: usize) {
    let worker_name = format!("worker-{}", worker_id);
    let mut consecutive_store_errors: u32 = 0;

    loop {
        if crawler.cancel.is_cancelled() {
            break;
        }

        let host_hint = match crawler.scheduler.next_ready_host() {
            Ok(hint) => hint,
            Err(_) => None,
        };

        let lease = match crawler
            .frontier
            .lease(&worker_name, host_hint.as_deref())
            .await
        {
            Ok(lease) => {
                consecutive_store_errors = 0;
                lease
            }
            Err(e) => {
                consecutive_store_errors += 1;
                tracing::error!(error = %e, attempt = consecutive_store_errors, "frontier lease failed");
                if consecutive_store_errors >= Tuning::STORE_ERROR_LIMIT {
                    crawler.halt_on_store_error();
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                continue;
            }
        };

        let Some(lease) = lease else {
            // No work right now. Done only when nothing is pending or
            // leased anywhere.
            match crawler.frontier.counts().await {
                Ok(counts) if counts.pending == 0 && counts.leased == 0 => break,
                Ok(_) => {}
                Err(e) => {
                    consecutive_store_errors += 1;
                    tracing::error!(error = %e, "frontier counts failed");
                    if consecutive_store_errors >= Tuning::STORE_ERROR_LIMIT {
                        crawler.halt_on_store_error();
                        break;
                    }
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(
                Tuning::LOOP_YIELD_DELAY_MS * 5,
            ))
            .await;
            continue;
        };

        let host = lease.record.host.clone();
        if !crawler.scheduler.knows_host(&host) {
            // First contact with this host: pick up any backoff the fleet
            // already learned for it.
            if let Ok(Some(multiplier)) = crawler.frontier.load_host_backoff(&host).await {
                crawler.scheduler.restore_backoff(&host, multiplier);
            }
        }
        if !crawler.scheduler.acquire(&host, &crawler.cancel).await {
            // Cancelled while waiting for the dispatch slot
            let _ = crawler
                .frontier
                .complete(lease, CompleteOutcome::Requeue)
                .await;
            break;
        }

        crawler.metrics.inflight_inc();
        let outcome = tokio::select! {
            outcome = process_one(&crawler, &lease) => Some(outcome),
            _ = crawler.cancel.cancelled() => None,
        };
        crawler.metrics.inflight_dec();

        match outcome {
            Some(result) => {
                crawler.scheduler.release(&host, result.host_success);
                if let Err(e) = crawler
                    .frontier
                    .complete(lease, CompleteOutcome::Done)
                    .await
                {
                    tracing::error!(error = %e, "lease completion failed");
                }
                if result.store_error {
                    consecutive_store_errors += 1;
                    if consecutive_store_errors >= Tuning::STORE_ERROR_LIMIT {
                        crawler.halt_on_store_error();
                        break;
                    }
                } else {
                    consecutive_store_errors = 0;
                }
            }
            None => {
                // Fetch aborted by cancellation: hand the URL back
                crawler.scheduler.release(&host, true);
                let _ = crawler
                    .frontier
                    .complete(lease, CompleteOutcome::Requeue)
                    .await;
                break;
            }
        }
    }

    tracing::debug!(worker = worker_id, "worker exiting");
}

struct ProcessResult {
    /// Feeds the host's adaptive backoff.
    host_success: bool,
    /// A shared-store failure occurred while admitting children.
    store_error: bool,
}

async fn process_one(crawler: &Arc<Crawler>, lease: &Lease) -> ProcessResult {
    let record = &lease.record;

    let Ok(url) = Url::parse(&record.url) else {
        // Canonical URLs always parse; defect in the checkpoint otherwise.
        crawler.note_failure(record, ErrorKind::ParseError, "canonical url failed to parse", 0);
        return ProcessResult {
            host_success: true,
            store_error: false,
        };
    };

    // Robots verdict, when enabled.
    if let Some(robots) = &crawler.robots {
        if !robots.is_allowed(&url).await {
            crawler.note_failure(record, ErrorKind::DisallowedByPolicy, "disallowed by robots.txt", 0);
            return ProcessResult {
                host_success: true,
                store_error: false,
            };
        }
        if let Some(delay) = robots.crawl_delay(&url).await {
            // Robots crawl-delay stretches the politeness gap via the
            // backoff multiplier floor rather than blocking here.
            let gap = crawler.min_request_gap();
            if delay > gap {
                let multiplier = (delay.as_secs_f64() / gap.as_secs_f64()).min(30.0);
                if multiplier > crawler.scheduler.backoff_multiplier(&record.host) {
                    crawler.scheduler.restore_backoff(&record.host, multiplier);
                }
            }
        }
    }

    let admission = crawler.admission.clone();
    let hop_check = move |next: &Url| admission.hop_allowed(next);

    let mut page = crawler
        .fetcher
        .fetch(&url, &hop_check, &crawler.cancel)
        .await;

    if let Some(kind) = page.error {
        if kind != ErrorKind::Cancelled {
            crawler.note_failure(
                record,
                kind,
                page.error_message.as_deref().unwrap_or("fetch failed"),
                page.status,
            );
        }
        return ProcessResult {
            host_success: !kind.is_retryable() && kind != ErrorKind::HttpServerError,
            store_error: false,
        };
    }

    // Decode and, when the page looks client-rendered, retry via browser.
    let mut html_content: Option<String> = None;
    if page.is_html() {
        let mut html = match decoded_text(&page) {
            Ok(html) => html,
            Err(kind) => {
                crawler.note_failure(record, kind, "undecodable content", page.status);
                return ProcessResult {
                    host_success: true,
                    store_error: false,
                };
            }
        };

        if crawler.browser_fallback_enabled() && page.mode == FetchMode::Http {
            let link_count = crate::extract::extract_page(&html, &url).links.len();
            if wants_browser_retry(&html, link_count) {
                match crawler.fetcher.browser_fetch(record.url.as_str(), false).await {
                    Ok(rendered) => {
                        tracing::debug!(url = %record.url, "re-fetched via browser");
                        match decoded_text(&rendered) {
                            Ok(rendered_html) => {
                                page = rendered;
                                html = rendered_html;
                            }
                            Err(kind) => {
                                tracing::debug!(url = %record.url, %kind, "undecodable rendered page, keeping http body");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!(url = %record.url, error = %e, "browser retry unavailable");
                    }
                }
            }
        }

        html_content = Some(html);
    }

    let mut expand_links = false;
    let mut fresh_content = true;
    let mut child_links: Vec<String> = Vec::new();

    if let Some(html) = &html_content {
        let extracted = crate::extract::extract_page(html, &url);
        let text = crate::extract::extract_text(html);
        expand_links = true;
        child_links = extracted.links;

        // Fingerprints are computed once per fetch result.
        let fingerprint = crate::dedup::Fingerprint::of(&text);
        let verdict = crawler.deduper.check_and_insert(&record.url, &fingerprint);
        if let Some(tier) = verdict.tier() {
            crawler.metrics.duplicates_total.inc(tier);
            tracing::debug!(url = %record.url, tier, "duplicate content");
            expand_links = false;
            fresh_content = false;
        }

        if fresh_content
            && crawler.soft404_enabled()
            && page.status == 200
            && traps::looks_like_soft404(extracted.title.as_deref(), &text)
        {
            crawler.metrics.record_drop("soft404");
            tracing::debug!(url = %record.url, "soft 404 detected");
            expand_links = false;
        }

        if let Some(traps) = &crawler.traps {
            traps.observe_content(&url, fresh_content);
        }
    }

    let mut store_error = false;
    if expand_links {
        store_error = admit_children(crawler, record, child_links).await;
    }

    crawler.note_success(record);
    ProcessResult {
        host_success: true,
        store_error,
    }
}

fn decoded_text(page: &PageFetch) -> Result<String, ErrorKind> {
    let Some(body) = &page.body else {
        return Ok(String::new());
    };
    let bytes = body.bytes().map_err(|_| ErrorKind::EncodingError)?;
    decode_body(&bytes, page.header("content-type"))
}

/// Admit extracted links as children of `record`. Returns true when a
/// store error was observed.
async fn admit_children(crawler: &Arc<Crawler>, record: &crate::models::UrlRecord, links: Vec<String>) -> bool {
    let child_depth = record.depth + 1;
    let mut store_error = false;

    for link in links {
        let score = if crawler.strategy() == CrawlStrategy::Priority {
            priority_score(&link)
        } else {
            0.0
        };

        match crawler
            .admission
            .admit(&link, child_depth, Some(&record.url), score)
            .await
        {
            Ok(AdmitOutcome::Admitted(admitted)) => {
                crawler.graph.lock().add_edge(&record.url, &admitted.url);
                crawler.scheduler.note_host(&admitted.host);
                crawler.maybe_checkpoint().await;
            }
            Ok(AdmitOutcome::Dropped("duplicate")) => {
                // Cycles and cross-links to already-admitted pages still
                // belong in the link graph.
                if let Ok(canonical) = crawler.admission.normalizer().canonical(&link) {
                    crawler.graph.lock().add_edge(&record.url, &canonical);
                }
            }
            Ok(AdmitOutcome::Dropped(_)) => {}
            Err(CrawlError::Store(e)) => {
                tracing::error!(error = %e, "store error during admission");
                store_error = true;
            }
            Err(e) => {
                tracing::error!(error = %e, "admission failed");
            }
        }
    }

    store_error
}
