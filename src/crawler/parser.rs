//! Link discovery for breadth-first crawling
//!
//! Pulls candidate links out of a fetched page (`<a href>` plus the canonical
//! link) and reduces them to the URLs a job may enqueue.

use crate::url::{is_denied, normalize_parsed, AllowedDomains};
use scraper::{Html, Selector};
use std::collections::HashSet;
use url::Url;

/// Elements whose text a reader never sees
const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];

/// Links and title found in a page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPage {
    pub title: Option<String>,
    /// Absolute http(s) links, document order, duplicates kept
    pub links: Vec<Url>,
}

/// Parses a page and resolves its links
///
/// A `<base href>` element, when present and valid, replaces `page_url` as
/// the resolution base. Links with a `download` attribute are skipped.
/// `rel="nofollow"` links are followed.
pub fn parse_html(html: &str, page_url: &Url) -> ParsedPage {
    let document = Html::parse_document(html);
    let base = base_href(&document, page_url).unwrap_or_else(|| page_url.clone());

    let mut links = Vec::new();
    if let Ok(anchors) = Selector::parse("a[href]") {
        for element in document.select(&anchors) {
            if element.value().attr("download").is_some() {
                continue;
            }
            if let Some(url) = element.value().attr("href").and_then(|h| resolve_link(h, &base)) {
                links.push(url);
            }
        }
    }
    if let Ok(canonical) = Selector::parse("link[rel='canonical'][href]") {
        links.extend(
            document
                .select(&canonical)
                .filter_map(|e| e.value().attr("href"))
                .filter_map(|h| resolve_link(h, &base)),
        );
    }

    ParsedPage {
        title: extract_title(&document),
        links,
    }
}

/// Extracts the trimmed `<title>` text
pub fn extract_title(document: &Html) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    document
        .select(&selector)
        .next()
        .map(|e| e.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Length of the trimmed text a reader sees in `<body>`
pub fn visible_text_len(document: &Html) -> usize {
    let Ok(selector) = Selector::parse("body") else {
        return 0;
    };
    document
        .select(&selector)
        .flat_map(|body| body.descendants())
        .filter(|node| {
            !node.ancestors().any(|a| {
                a.value()
                    .as_element()
                    .is_some_and(|e| HIDDEN_ELEMENTS.contains(&e.name()))
            })
        })
        .filter_map(|node| node.value().as_text().map(|text| text.trim().len()))
        .sum()
}

/// Returns the followable links of a page
///
/// Keeps links on the job's host (www twin included) that pass the deny
/// rules, normalized and deduplicated in document order.
pub fn extract_crawlable_links(html: &str, page_url: &Url, allowed: &AllowedDomains) -> Vec<Url> {
    let mut seen = HashSet::new();

    parse_html(html, page_url)
        .links
        .into_iter()
        .filter(|url| allowed.allows(url))
        .filter_map(|url| normalize_parsed(url).ok())
        .filter(|url| !is_denied(url))
        .filter(|url| seen.insert(url.to_string()))
        .collect()
}

fn base_href(document: &Html, page_url: &Url) -> Option<Url> {
    let selector = Selector::parse("base[href]").ok()?;
    let href = document.select(&selector).next()?.value().attr("href")?;
    page_url.join(href.trim()).ok()
}

/// Resolves an href against `base`, rejecting non-navigational links
fn resolve_link(href: &str, base: &Url) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let lower = href.to_ascii_lowercase();
    if ["javascript:", "mailto:", "tel:", "data:"]
        .iter()
        .any(|scheme| lower.starts_with(scheme))
    {
        return None;
    }

    base.join(href)
        .ok()
        .filter(|url| url.scheme() == "http" || url.scheme() == "https")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_url() -> Url {
        Url::parse("https://example.com/section/page").unwrap()
    }

    fn allowed() -> AllowedDomains {
        AllowedDomains::for_url(&Url::parse("https://example.com/").unwrap()).unwrap()
    }

    fn link_strings(html: &str) -> Vec<String> {
        parse_html(html, &page_url())
            .links
            .into_iter()
            .map(|u| u.to_string())
            .collect()
    }

    #[test]
    fn test_title() {
        let parsed = parse_html(
            "<html><head><title>  Test Page  </title></head></html>",
            &page_url(),
        );
        assert_eq!(parsed.title, Some("Test Page".to_string()));
        assert_eq!(parse_html("<html></html>", &page_url()).title, None);
    }

    #[test]
    fn test_visible_text_len_skips_hidden_elements() {
        let document = Html::parse_document(
            r#"<html><head><title>ignored</title></head><body>
                <script>var x = 'aaaaaaaaaaaaaaaaaaaa';</script>
                <style>p { color: red; }</style>
                <!-- a comment that is not text -->
                <noscript>Please enable JavaScript</noscript>
                <p>abc</p><p> de </p></body></html>"#,
        );
        assert_eq!(visible_text_len(&document), 5);
    }

    #[test]
    fn test_relative_and_absolute_links() {
        let links = link_strings(
            r#"<a href="/root">a</a><a href="sibling">b</a><a href="https://other.com/x">c</a>"#,
        );
        assert_eq!(
            links,
            vec![
                "https://example.com/root",
                "https://example.com/section/sibling",
                "https://other.com/x",
            ]
        );
    }

    #[test]
    fn test_non_navigational_links_skipped() {
        let links = link_strings(
            r##"<a href="javascript:void(0)">j</a>
                <a href="JavaScript:alert(1)">J</a>
                <a href="mailto:a@example.com">m</a>
                <a href="tel:+123">t</a>
                <a href="data:text/html,x">d</a>
                <a href="#top">f</a>
                <a href="ftp://example.com/file">ftp</a>
                <a href="/file.zip" download>dl</a>
                <a href="  ">blank</a>"##,
        );
        assert!(links.is_empty(), "{:?}", links);
    }

    #[test]
    fn test_canonical_and_nofollow() {
        let links = link_strings(
            r#"<head><link rel="canonical" href="/canonical"></head>
               <body><a href="/nf" rel="nofollow">x</a></body>"#,
        );
        assert_eq!(
            links,
            vec!["https://example.com/nf", "https://example.com/canonical"]
        );
    }

    #[test]
    fn test_base_href() {
        let links = link_strings(
            r#"<head><base href="https://example.com/docs/"></head><a href="intro">x</a>"#,
        );
        assert_eq!(links, vec!["https://example.com/docs/intro"]);
    }

    #[test]
    fn test_crawlable_links_filtering() {
        let html = r#"
            <a href="/about?utm_source=x">about</a>
            <a href="https://www.example.com/about">about again</a>
            <a href="https://blog.example.com/">other host</a>
            <a href="https://other.org/">external</a>
            <a href="/brochure.pdf">pdf</a>
            <a href="/tag/rust/">tag</a>
            <a href="/contact#form">contact</a>
        "#;
        let links: Vec<String> = extract_crawlable_links(html, &page_url(), &allowed())
            .into_iter()
            .map(|u| u.to_string())
            .collect();

        assert_eq!(
            links,
            vec![
                "https://example.com/about",
                "https://www.example.com/about",
                "https://example.com/contact",
            ]
        );
    }
}
