//! Link extraction from fetched HTML.
//!
//! Parsing stays on a synchronous path; callers must not hold the parsed
//! document across an await point.

use scraper::{Html, Selector};
use url::Url;

use crate::url_norm;

/// Links and metadata pulled from one page.
#[derive(Debug, Clone, Default)]
pub struct ExtractedPage {
    /// Absolute http(s) URLs, in document order, duplicates removed.
    pub links: Vec<String>,
    pub title: Option<String>,
    /// Count of raw anchors before filtering; feeds the browser-fallback
    /// heuristic.
    pub anchor_count: usize,
}

/// Extract outbound links and the title from an HTML document.
///
/// `<base href>` is honored when present. Non-navigational schemes
/// (javascript:, mailto:, tel:, data:, file:) are skipped.
pub fn extract_page(html: &str, page_url: &Url) -> ExtractedPage {
    let document = Html::parse_document(html);

    let base_selector = Selector::parse("base[href]").expect("static selector");
    let effective_base = document
        .select(&base_selector)
        .next()
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| page_url.join(href).ok())
        .unwrap_or_else(|| page_url.clone());

    let a_selector = Selector::parse("a[href]").expect("static selector");
    let mut links = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut anchor_count = 0usize;

    for element in document.select(&a_selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        anchor_count += 1;

        let href = href.trim();
        if href.is_empty()
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
            || href.starts_with("tel:")
            || href.starts_with("data:")
            || href.starts_with("file:")
        {
            continue;
        }

        if let Some(absolute) = url_norm::resolve(&effective_base, href) {
            if !matches!(absolute.scheme(), "http" | "https") {
                continue;
            }
            let as_string = absolute.to_string();
            if seen.insert(as_string.clone()) {
                links.push(as_string);
            }
        }
    }

    let title_selector = Selector::parse("title").expect("static selector");
    let title = document
        .select(&title_selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    ExtractedPage {
        links,
        title,
        anchor_count,
    }
}

/// Visible text of a document, used for content fingerprinting and
/// soft-404 heuristics. Script and style contents are excluded.
pub fn extract_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let body_selector = Selector::parse("body").expect("static selector");

    let mut text = String::new();
    if let Some(body) = document.select(&body_selector).next() {
        for chunk in body.text() {
            let trimmed = chunk.trim();
            if !trimmed.is_empty() {
                if !text.is_empty() {
                    text.push(' ');
                }
                text.push_str(trimmed);
            }
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/dir/page").unwrap()
    }

    #[test]
    fn test_absolute_and_relative_links() {
        let html = r#"<html><body>
            <a href="/root">Root</a>
            <a href="sibling">Sibling</a>
            <a href="https://other.org/x">Other</a>
        </body></html>"#;

        let page = extract_page(html, &base());
        assert_eq!(
            page.links,
            vec![
                "https://example.com/root",
                "https://example.com/dir/sibling",
                "https://other.org/x",
            ]
        );
        assert_eq!(page.anchor_count, 3);
    }

    #[test]
    fn test_base_href_overrides_page_url() {
        let html = r#"<html><head><base href="https://cdn.example.com/assets/"></head>
            <body><a href="style/page.html">x</a></body></html>"#;
        let page = extract_page(html, &base());
        assert_eq!(page.links, vec!["https://cdn.example.com/assets/style/page.html"]);
    }

    #[test]
    fn test_skips_non_navigational_schemes() {
        let html = r#"<body>
            <a href="javascript:void(0)">js</a>
            <a href="mailto:x@y.z">mail</a>
            <a href="tel:+123">tel</a>
            <a href="/ok">ok</a>
        </body>"#;
        let page = extract_page(html, &base());
        assert_eq!(page.links, vec!["https://example.com/ok"]);
        // Raw anchor count still sees all four
        assert_eq!(page.anchor_count, 4);
    }

    #[test]
    fn test_dedups_repeated_links() {
        let html = r#"<body><a href="/a">1</a><a href="/a">2</a></body>"#;
        let page = extract_page(html, &base());
        assert_eq!(page.links.len(), 1);
    }

    #[test]
    fn test_title_extraction() {
        let html = "<html><head><title>  Hello  </title></head><body></body></html>";
        let page = extract_page(html, &base());
        assert_eq!(page.title.as_deref(), Some("Hello"));

        let untitled = extract_page("<html><body></body></html>", &base());
        assert!(untitled.title.is_none());
    }

    #[test]
    fn test_extract_text_skips_markup() {
        let html = "<html><body><h1>Header</h1><p>Some body text.</p></body></html>";
        let text = extract_text(html);
        assert_eq!(text, "Header Some body text.");
    }
}
