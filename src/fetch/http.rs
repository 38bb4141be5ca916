//! HTTP fetcher: manual redirect handling, size caps with disk spill,
//! and charset detection.
//!
//! Redirects are followed by the crawler, not the client, so every hop can
//! be re-checked against the admission policy. Decompression stays on
//! (gzip/brotli/deflate); redirect following is off.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

use crate::config::{CrawlConfig, Tuning};
use crate::error::{ErrorKind, FetchFailure};
use crate::models::FetchBody;
use crate::site_rules::SiteRule;

/// Build the shared reqwest client the way the crawl core needs it.
pub fn build_client(config: &CrawlConfig) -> Result<reqwest::Client, crate::error::CrawlError> {
    reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .timeout(Duration::from_secs(config.read_timeout_secs))
        .pool_max_idle_per_host(Tuning::POOL_IDLE_PER_HOST)
        .pool_idle_timeout(Duration::from_secs(Tuning::POOL_IDLE_TIMEOUT_SECS))
        .tcp_keepalive(Duration::from_secs(60))
        .tcp_nodelay(true)
        .gzip(true)
        .brotli(true)
        .deflate(true)
        .http2_adaptive_window(true)
        // The crawler decides what to do with each redirect hop.
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| crate::error::CrawlError::Config(format!("http client: {}", e)))
}

/// One successful HTTP exchange, after redirects.
#[derive(Debug)]
pub struct RawFetch {
    pub status: u16,
    pub final_url: String,
    pub headers: Vec<(String, String)>,
    pub body: FetchBody,
    pub mime: Option<String>,
}

pub struct HttpFetcher {
    client: reqwest::Client,
    max_redirects: usize,
    max_body_bytes: u64,
    spill_threshold: u64,
    spill_dir: PathBuf,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client, config: &CrawlConfig) -> Self {
        Self {
            client,
            max_redirects: config.max_redirects,
            max_body_bytes: config.max_body_bytes,
            spill_threshold: Tuning::SPILL_THRESHOLD_BYTES,
            spill_dir: PathBuf::from(&config.output_dir).join("spill"),
        }
    }

    /// Fetch one URL, following redirects within policy. `hop_allowed`
    /// decides whether a redirect target stays inside the crawl.
    pub async fn fetch(
        &self,
        url: &Url,
        rule: &SiteRule,
        hop_allowed: &(dyn Fn(&Url) -> bool + Send + Sync),
    ) -> Result<RawFetch, FetchFailure> {
        let mut current = url.clone();

        for _hop in 0..=self.max_redirects {
            let mut request = self.client.get(current.as_str()).header(
                reqwest::header::ACCEPT,
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            );
            if let Some(agent) = &rule.user_agent {
                request = request.header(reqwest::header::USER_AGENT, agent);
            }
            for (name, value) in &rule.headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let response = request
                .send()
                .await
                .map_err(|e| FetchFailure::from_reqwest(&e))?;

            let status = response.status();

            if status.is_redirection() {
                let Some(location) = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return Err(FetchFailure::new(
                        ErrorKind::HttpClientError,
                        format!("redirect {} without Location", status.as_u16()),
                    )
                    .with_status(status.as_u16()));
                };

                let next = current.join(location).map_err(|_| {
                    FetchFailure::new(
                        ErrorKind::ParseError,
                        format!("unparseable redirect target '{}'", location),
                    )
                })?;

                if !hop_allowed(&next) {
                    return Err(FetchFailure::new(
                        ErrorKind::DisallowedByPolicy,
                        format!("redirect to {} leaves the crawl policy", next),
                    ));
                }

                current = next;
                continue;
            }

            if let Some(kind) = ErrorKind::from_status(status.as_u16()) {
                let retry_after = parse_retry_after(
                    response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok()),
                );
                return Err(FetchFailure::new(
                    kind,
                    format!("HTTP status {}", status.as_u16()),
                )
                .with_status(status.as_u16())
                .with_retry_after(retry_after));
            }

            // Success: stream the body under the size cap.
            let headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .map(|(k, v)| {
                    (
                        k.as_str().to_string(),
                        v.to_str().unwrap_or_default().to_string(),
                    )
                })
                .collect();
            let mime = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
                .map(|(_, v)| v.split(';').next().unwrap_or(v).trim().to_string());

            if let Some(length) = response.content_length() {
                if length > self.max_body_bytes {
                    return Err(FetchFailure::new(
                        ErrorKind::TooLarge,
                        format!("content-length {} over cap {}", length, self.max_body_bytes),
                    ));
                }
            }

            let final_url = response.url().to_string();
            let body = self.read_body(response).await?;

            return Ok(RawFetch {
                status: status.as_u16(),
                final_url,
                headers,
                body,
                mime,
            });
        }

        Err(FetchFailure::new(
            ErrorKind::NetworkPermanent,
            format!("more than {} redirects", self.max_redirects),
        ))
    }

    async fn read_body(&self, mut response: reqwest::Response) -> Result<FetchBody, FetchFailure> {
        let mut buffer: Vec<u8> = Vec::new();
        let mut spill: Option<(std::fs::File, PathBuf)> = None;
        let mut total: u64 = 0;

        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => return Err(FetchFailure::from_reqwest(&e)),
            };

            total += chunk.len() as u64;
            if total > self.max_body_bytes {
                if let Some((_, path)) = &spill {
                    let _ = std::fs::remove_file(path);
                }
                return Err(FetchFailure::new(
                    ErrorKind::TooLarge,
                    format!("body exceeded cap {}", self.max_body_bytes),
                ));
            }

            match &mut spill {
                Some((file, path)) => {
                    if let Err(e) = file.write_all(&chunk) {
                        let _ = std::fs::remove_file(path);
                        return Err(FetchFailure::new(
                            ErrorKind::NetworkTransient,
                            format!("spill write failed: {}", e),
                        ));
                    }
                }
                None => {
                    buffer.extend_from_slice(&chunk);
                    if total > self.spill_threshold {
                        let (file, path) = self.open_spill_file(&buffer)?;
                        buffer.clear();
                        spill = Some((file, path));
                    }
                }
            }
        }

        match spill {
            Some((mut file, path)) => {
                file.flush().map_err(|e| {
                    FetchFailure::new(ErrorKind::NetworkTransient, format!("spill flush: {}", e))
                })?;
                Ok(FetchBody::Spilled { path, len: total })
            }
            None => Ok(FetchBody::Bytes(buffer)),
        }
    }

    fn open_spill_file(&self, prefix: &[u8]) -> Result<(std::fs::File, PathBuf), FetchFailure> {
        std::fs::create_dir_all(&self.spill_dir).map_err(|e| {
            FetchFailure::new(ErrorKind::NetworkTransient, format!("spill dir: {}", e))
        })?;
        let path = self.spill_dir.join(format!(
            "body-{}-{}.bin",
            std::process::id(),
            crate::models::epoch_secs()
        ));
        let mut file = std::fs::File::create(&path).map_err(|e| {
            FetchFailure::new(ErrorKind::NetworkTransient, format!("spill create: {}", e))
        })?;
        file.write_all(prefix).map_err(|e| {
            FetchFailure::new(ErrorKind::NetworkTransient, format!("spill write: {}", e))
        })?;
        Ok((file, path))
    }
}

/// Parse `Retry-After`: delta-seconds or an IMF-fixdate.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    let value = value?.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    // "Sun, 06 Nov 1994 08:49:37 GMT"; dates in the past clamp to zero.
    let target = parse_imf_fixdate(value)?;
    let now = crate::models::epoch_secs();
    Some(Duration::from_secs(target.saturating_sub(now)))
}

/// IMF-fixdate to Unix seconds. Returns None for anything malformed.
fn parse_imf_fixdate(value: &str) -> Option<u64> {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];

    // Strip "Sun, " and trailing " GMT"
    let rest = value.split_once(", ").map(|(_, r)| r).unwrap_or(value);
    let rest = rest.strip_suffix(" GMT").unwrap_or(rest);

    let mut parts = rest.split_whitespace();
    let day: i64 = parts.next()?.parse().ok()?;
    let month_token = parts.next()?;
    let month = MONTHS.iter().position(|m| *m == month_token)? as i64 + 1;
    let year: i64 = parts.next()?.parse().ok()?;

    let mut clock = parts.next()?.split(':');
    let hour: i64 = clock.next()?.parse().ok()?;
    let minute: i64 = clock.next()?.parse().ok()?;
    let second: i64 = clock.next()?.parse().ok()?;

    if !(1..=31).contains(&day) || hour > 23 || minute > 59 || second > 60 {
        return None;
    }

    // Days from civil (Howard Hinnant's algorithm)
    let y = if month <= 2 { year - 1 } else { year };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era * 146_097 + doe - 719_468;

    let secs = days * 86_400 + hour * 3_600 + minute * 60 + second;
    u64::try_from(secs).ok()
}

/// Decode a response body into text: BOM, then declared charset, then a
/// `<meta charset>` tag, then a UTF-8/Latin-1 statistical fallback.
pub fn decode_body(bytes: &[u8], content_type: Option<&str>) -> Result<String, ErrorKind> {
    // BOM first
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8(bytes[3..].to_vec()).map_err(|_| ErrorKind::EncodingError);
    }
    if bytes.starts_with(&[0xFF, 0xFE]) {
        return decode_utf16(&bytes[2..], true);
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        return decode_utf16(&bytes[2..], false);
    }

    // Declared charset from the HTTP header
    if let Some(charset) = content_type.and_then(charset_of) {
        return decode_with_charset(bytes, &charset);
    }

    // Meta tag within the first kilobyte
    let head = &bytes[..bytes.len().min(1024)];
    let head_text = String::from_utf8_lossy(head);
    if let Some(charset) = meta_charset(&head_text) {
        return decode_with_charset(bytes, &charset);
    }

    // Statistical fallback: valid UTF-8 wins, then Latin-1
    match std::str::from_utf8(bytes) {
        Ok(text) => Ok(text.to_string()),
        Err(_) => Ok(latin1(bytes)),
    }
}

fn charset_of(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("charset"))
        .map(|(_, value)| value.trim().trim_matches('"').to_ascii_lowercase())
}

fn meta_charset(head: &str) -> Option<String> {
    let lower = head.to_ascii_lowercase();
    let idx = lower.find("charset=")?;
    let rest = &lower[idx + "charset=".len()..];
    let value: String = rest
        .trim_start_matches(['"', '\''])
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn decode_with_charset(bytes: &[u8], charset: &str) -> Result<String, ErrorKind> {
    match charset {
        "utf-8" | "utf8" | "us-ascii" | "ascii" => {
            // Tolerate the occasional stray byte; refuse garbage
            match std::str::from_utf8(bytes) {
                Ok(text) => Ok(text.to_string()),
                Err(_) => {
                    let lossy = String::from_utf8_lossy(bytes);
                    let replacements = lossy.chars().filter(|c| *c == '\u{FFFD}').count();
                    if replacements * 10 > lossy.chars().count().max(1) {
                        Err(ErrorKind::EncodingError)
                    } else {
                        Ok(lossy.into_owned())
                    }
                }
            }
        }
        "iso-8859-1" | "latin-1" | "latin1" | "windows-1252" | "cp1252" => Ok(latin1(bytes)),
        "utf-16" | "utf-16le" => decode_utf16(bytes, true),
        "utf-16be" => decode_utf16(bytes, false),
        _ => {
            // Unknown charset: best effort, flag only if unusable
            match std::str::from_utf8(bytes) {
                Ok(text) => Ok(text.to_string()),
                Err(_) => Ok(latin1(bytes)),
            }
        }
    }
}

fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn decode_utf16(bytes: &[u8], little_endian: bool) -> Result<String, ErrorKind> {
    if bytes.len() % 2 != 0 {
        return Err(ErrorKind::EncodingError);
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| {
            if little_endian {
                u16::from_le_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16(&units).map_err(|_| ErrorKind::EncodingError)
}
