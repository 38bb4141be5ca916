//! Error taxonomy for the crawl core.
//!
//! Every failed fetch carries an [`ErrorKind`] that drives retry policy,
//! metrics labels, and the end-of-run summary. Infrastructure failures
//! (config, checkpoint, shared store) use [`CrawlError`].

use std::time::Duration;
use thiserror::Error;

/// Classification of a per-URL failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retryable network failure (connect reset, DNS hiccup, read error)
    NetworkTransient,
    /// Non-retryable network failure (TLS handshake, unreachable host)
    NetworkPermanent,
    /// 4xx status other than 408/425/429
    HttpClientError,
    /// 5xx status (retryable)
    HttpServerError,
    ParseError,
    EncodingError,
    Timeout,
    TooLarge,
    DisallowedByPolicy,
    TrapDetected,
    Cancelled,
    StoreError,
}

impl ErrorKind {
    /// Whether the fetch pipeline should retry after backoff.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkTransient | ErrorKind::HttpServerError | ErrorKind::Timeout
        )
    }

    /// Stable label used in metrics and the failure log.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NetworkTransient => "network_transient",
            ErrorKind::NetworkPermanent => "network_permanent",
            ErrorKind::HttpClientError => "http_client_error",
            ErrorKind::HttpServerError => "http_server_error",
            ErrorKind::ParseError => "parse_error",
            ErrorKind::EncodingError => "encoding_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::TooLarge => "too_large",
            ErrorKind::DisallowedByPolicy => "disallowed_by_policy",
            ErrorKind::TrapDetected => "trap_detected",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::StoreError => "store_error",
        }
    }

    /// Classify an HTTP status code. 408/425/429 count as transient because
    /// the server explicitly invites a retry.
    pub fn from_status(status: u16) -> Option<ErrorKind> {
        match status {
            200..=299 => None,
            408 | 425 | 429 => Some(ErrorKind::NetworkTransient),
            400..=499 => Some(ErrorKind::HttpClientError),
            500..=599 => Some(ErrorKind::HttpServerError),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed fetch attempt, before it is folded into a terminal `PageFetch`.
#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Server-requested delay (`Retry-After`), honored before the next attempt.
    pub retry_after: Option<Duration>,
    /// Status code when the failure came from an HTTP response.
    pub status: Option<u16>,
}

impl FetchFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_retry_after(mut self, delay: Option<Duration>) -> Self {
        self.retry_after = delay;
        self
    }

    /// Map a reqwest error into the taxonomy. Falls back to message text
    /// because reqwest does not expose the underlying cause uniformly
    /// across platforms.
    pub fn from_reqwest(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::new(ErrorKind::Timeout, "request timeout");
        }

        let message = error.to_string();
        let lower = message.to_lowercase();

        if error.is_connect() {
            if lower.contains("dns")
                || lower.contains("name resolution")
                || lower.contains("no such host")
            {
                return Self::new(ErrorKind::NetworkPermanent, message);
            }
            return Self::new(ErrorKind::NetworkTransient, message);
        }

        if lower.contains("certificate") || lower.contains("ssl") || lower.contains("tls") {
            return Self::new(ErrorKind::NetworkPermanent, message);
        }

        Self::new(ErrorKind::NetworkTransient, message)
    }
}

/// Infrastructure errors: anything that is not a per-URL fetch outcome.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("shared store error: {0}")]
    Store(String),

    #[error("browser engine error: {0}")]
    Render(String),

    #[error("crawl cancelled")]
    Cancelled,
}

impl From<redis::RedisError> for CrawlError {
    fn from(e: redis::RedisError) -> Self {
        CrawlError::Store(e.to_string())
    }
}

impl From<serde_json::Error> for CrawlError {
    fn from(e: serde_json::Error) -> Self {
        CrawlError::Checkpoint(e.to_string())
    }
}
