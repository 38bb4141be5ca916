//! Core data types shared across the crawl pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::ErrorKind;

/// How a page was (or should be) fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchMode {
    Http,
    Browser,
}

impl FetchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FetchMode::Http => "http",
            FetchMode::Browser => "browser",
        }
    }
}

/// Seconds since the Unix epoch; used for discovery ordering, lease
/// deadlines, and checkpoint timestamps.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A URL admitted to the frontier.
///
/// Two records with equal `url` (canonical form) never coexist in the
/// frontier; the admission path enforces this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlRecord {
    /// Canonical absolute URL. Idempotent under re-normalization.
    pub url: String,
    pub host: String,
    pub depth: u32,
    pub priority: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub discovered_at: u64,
    #[serde(default)]
    pub retries: u32,
    /// Epoch deadline of the current lease, if leased.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_deadline: Option<u64>,
}

impl UrlRecord {
    pub fn new(
        url: String,
        host: String,
        depth: u32,
        priority: f64,
        parent: Option<String>,
    ) -> Self {
        Self {
            url,
            host,
            depth,
            priority,
            parent,
            discovered_at: epoch_secs(),
            retries: 0,
            lease_deadline: None,
        }
    }
}

/// Response body, in memory or spilled to disk when it crossed the
/// streaming threshold.
#[derive(Debug, Clone)]
pub enum FetchBody {
    Bytes(Vec<u8>),
    Spilled { path: PathBuf, len: u64 },
}

impl FetchBody {
    pub fn len(&self) -> u64 {
        match self {
            FetchBody::Bytes(b) => b.len() as u64,
            FetchBody::Spilled { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// In-memory bytes, reading the spill file when necessary.
    pub fn bytes(&self) -> std::io::Result<std::borrow::Cow<'_, [u8]>> {
        match self {
            FetchBody::Bytes(b) => Ok(std::borrow::Cow::Borrowed(b)),
            FetchBody::Spilled { path, .. } => Ok(std::borrow::Cow::Owned(std::fs::read(path)?)),
        }
    }
}

/// Outcome of fetching one URL. Exactly one of `body` / `error` is set;
/// the constructors are the only way to build one.
#[derive(Debug, Clone)]
pub struct PageFetch {
    pub url: String,
    pub status: u16,
    pub final_url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<FetchBody>,
    pub mime: Option<String>,
    pub duration: Duration,
    pub mode: FetchMode,
    pub screenshot: Option<Vec<u8>>,
    pub error: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl PageFetch {
    pub fn success(
        url: String,
        status: u16,
        final_url: String,
        headers: Vec<(String, String)>,
        body: FetchBody,
        mime: Option<String>,
        duration: Duration,
        mode: FetchMode,
    ) -> Self {
        Self {
            url,
            status,
            final_url,
            headers,
            body: Some(body),
            mime,
            duration,
            mode,
            screenshot: None,
            error: None,
            error_message: None,
        }
    }

    /// A terminal failure is a first-class fetch result, not an exception.
    pub fn failure(
        url: String,
        status: u16,
        duration: Duration,
        mode: FetchMode,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            final_url: url.clone(),
            url,
            status,
            headers: Vec::new(),
            body: None,
            mime: None,
            duration,
            mode,
            screenshot: None,
            error: Some(kind),
            error_message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_html(&self) -> bool {
        match &self.mime {
            Some(m) => {
                let lower = m.to_ascii_lowercase();
                lower.starts_with("text/html") || lower.starts_with("application/xhtml+xml")
            }
            // Servers that omit Content-Type overwhelmingly serve HTML
            None => true,
        }
    }
}

/// Cumulative crawl statistics, serialized into every checkpoint header.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlStats {
    pub processed: u64,
    pub succeeded: u64,
    pub errored: u64,
}
