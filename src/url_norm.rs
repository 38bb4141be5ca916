//! URL canonicalization.
//!
//! The canonical form is the dedup key for the whole crawler, so it must be
//! idempotent: `normalize(normalize(u)) == normalize(u)`.
//!
//! Steps: lowercase scheme and host, drop default ports, collapse `.`/`..`
//! path segments, sort query parameters (stable), strip tracking
//! parameters, drop the fragment, re-encode consistently.

use url::Url;

/// Tracking parameters stripped during normalization unless overridden.
pub const DEFAULT_TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "gclid",
    "fbclid",
    "msclkid",
    "mc_eid",
    "ref_src",
];

/// Hard cap on raw URL length; anything longer is rejected before parsing.
pub const MAX_URL_LEN: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeError {
    TooLong,
    Unparseable,
    UnsupportedScheme,
    NoHost,
}

impl std::fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NormalizeError::TooLong => write!(f, "url exceeds {} bytes", MAX_URL_LEN),
            NormalizeError::Unparseable => write!(f, "url failed to parse"),
            NormalizeError::UnsupportedScheme => write!(f, "scheme is not http or https"),
            NormalizeError::NoHost => write!(f, "url has no host"),
        }
    }
}

/// Normalizer configured with the set of query parameters to strip.
#[derive(Debug, Clone)]
pub struct UrlNormalizer {
    tracking_params: Vec<String>,
}

impl Default for UrlNormalizer {
    fn default() -> Self {
        Self {
            tracking_params: DEFAULT_TRACKING_PARAMS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl UrlNormalizer {
    pub fn new(tracking_params: Vec<String>) -> Self {
        Self { tracking_params }
    }

    /// Digest input for config compatibility checks: the strip-set is part
    /// of what makes two checkpoints comparable.
    pub fn rules_fingerprint(&self) -> String {
        let mut params = self.tracking_params.clone();
        params.sort();
        params.join(",")
    }

    /// Canonicalize an absolute URL.
    pub fn normalize(&self, raw: &str) -> Result<Url, NormalizeError> {
        let trimmed = raw.trim();
        if trimmed.len() > MAX_URL_LEN {
            return Err(NormalizeError::TooLong);
        }

        // Url::parse already lowercases scheme and host and collapses
        // dot segments during path serialization.
        let mut url = Url::parse(trimmed).map_err(|_| NormalizeError::Unparseable)?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(NormalizeError::UnsupportedScheme);
        }
        if url.host_str().is_none() {
            return Err(NormalizeError::NoHost);
        }

        // Drop the default port explicitly; `Url` keeps e.g. `:80` if the
        // input spelled it out.
        if let Some(port) = url.port() {
            let default = match url.scheme() {
                "http" => 80,
                "https" => 443,
                _ => 0,
            };
            if port == default {
                let _ = url.set_port(None);
            }
        }

        url.set_fragment(None);

        // Sort surviving query pairs for a stable ordering; equal keys keep
        // their relative order.
        if url.query().is_some() {
            let mut pairs: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| !self.is_tracking_param(k))
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            pairs.sort_by(|a, b| a.0.cmp(&b.0));

            if pairs.is_empty() {
                url.set_query(None);
            } else {
                let query = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs)
                    .finish();
                url.set_query(Some(&query));
            }
        }

        // Empty path serializes as "/" so `http://h` and `http://h/` agree.
        if url.path().is_empty() {
            url.set_path("/");
        }

        Ok(url)
    }

    /// Normalize to the canonical string form.
    pub fn canonical(&self, raw: &str) -> Result<String, NormalizeError> {
        self.normalize(raw).map(|u| u.into())
    }

    fn is_tracking_param(&self, key: &str) -> bool {
        self.tracking_params.iter().any(|p| p == key)
    }
}

/// Extract the host portion of an already-canonical URL.
pub fn host_of(url: &str) -> Option<String> {
    Url::parse(url).ok().and_then(|u| u.host_str().map(|h| h.to_string()))
}

/// Resolve a possibly-relative link against its base page.
pub fn resolve(base: &Url, link: &str) -> Option<Url> {
    base.join(link.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(raw: &str) -> String {
        UrlNormalizer::default().canonical(raw).unwrap()
    }

    #[test]
    fn test_idempotent() {
        let cases = [
            "HTTP://Example.COM:80/a/../b?z=1&a=2#frag",
            "https://h/path/?b=2&a=1",
            "https://h/a%20b?x=%41",
        ];
        let n = UrlNormalizer::default();
        for case in cases {
            let once = n.canonical(case).unwrap();
            let twice = n.canonical(&once).unwrap();
            assert_eq!(once, twice, "not idempotent for {}", case);
        }
    }

    #[test]
    fn test_lowercases_and_drops_default_port() {
        assert_eq!(norm("HTTP://EXAMPLE.com:80/Page"), "http://example.com/Page");
        assert_eq!(norm("https://example.com:443/"), "https://example.com/");
        // Non-default port survives
        assert_eq!(norm("http://example.com:8080/"), "http://example.com:8080/");
    }

    #[test]
    fn test_sorts_query_and_strips_fragment() {
        assert_eq!(norm("https://h/p?z=1&a=2#sec"), "https://h/p?a=2&z=1");
    }

    #[test]
    fn test_strips_tracking_params() {
        assert_eq!(norm("https://h/p?utm_source=tw&id=5"), "https://h/p?id=5");
        // Query that becomes empty disappears entirely
        assert_eq!(norm("https://h/p?utm_source=tw"), "https://h/p");
    }

    #[test]
    fn test_collapses_dot_segments() {
        assert_eq!(norm("https://h/a/b/../c/./d"), "https://h/a/c/d");
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let n = UrlNormalizer::default();
        assert_eq!(n.canonical("ftp://h/a"), Err(NormalizeError::UnsupportedScheme));
        assert_eq!(n.canonical("not a url"), Err(NormalizeError::Unparseable));
        let long = format!("https://h/{}", "x".repeat(MAX_URL_LEN));
        assert_eq!(n.canonical(&long), Err(NormalizeError::TooLong));
    }

    #[test]
    fn test_empty_path_becomes_slash() {
        assert_eq!(norm("https://example.com"), "https://example.com/");
    }
}
