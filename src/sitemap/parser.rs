//! Sitemap document parser
//!
//! Parses `<urlset>` and `<sitemapindex>` documents with the HTML parser
//! from scraper, which tolerates the malformed XML many sites serve.

use crate::sitemap::SitemapError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use url::Url;

/// One `<url>` or `<sitemap>` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SitemapEntry {
    pub url: Url,
    pub lastmod: Option<DateTime<Utc>>,
}

/// A parsed sitemap document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SitemapDocument {
    /// Page entries
    UrlSet(Vec<SitemapEntry>),
    /// References to child sitemaps
    Index(Vec<SitemapEntry>),
}

/// Parses a sitemap or sitemap index
///
/// # Arguments
///
/// * `xml` - The document body
/// * `base_url` - URL the document was fetched from, for relative `<loc>` values
///
/// # Returns
///
/// * `Ok(SitemapDocument)` - The document's entries
/// * `Err(SitemapError::NotASitemap)` - Neither a urlset nor a sitemap index
pub fn parse_sitemap(xml: &str, base_url: &Url) -> Result<SitemapDocument, SitemapError> {
    // the HTML tokenizer turns CDATA sections into comments
    let cleaned = xml.replace("<![CDATA[", "").replace("]]>", "");
    let document = Html::parse_document(&cleaned);

    let index_selector = selector("sitemapindex")?;
    let urlset_selector = selector("urlset")?;

    if document.select(&index_selector).next().is_some() {
        let entries = extract_entries(&document, "sitemap", base_url)?;
        return Ok(SitemapDocument::Index(entries));
    }

    if document.select(&urlset_selector).next().is_some() {
        let entries = extract_entries(&document, "url", base_url)?;
        return Ok(SitemapDocument::UrlSet(entries));
    }

    Err(SitemapError::NotASitemap(base_url.to_string()))
}

fn selector(css: &str) -> Result<Selector, SitemapError> {
    Selector::parse(css).map_err(|e| SitemapError::Parse(format!("selector '{}': {:?}", css, e)))
}

fn extract_entries(
    document: &Html,
    entry_tag: &str,
    base_url: &Url,
) -> Result<Vec<SitemapEntry>, SitemapError> {
    let entry_selector = selector(entry_tag)?;
    let loc_selector = selector("loc")?;
    let lastmod_selector = selector("lastmod")?;

    let mut entries = Vec::new();
    for element in document.select(&entry_selector) {
        let Some(loc) = child_text(&element, &loc_selector) else {
            continue;
        };
        let Ok(url) = base_url.join(&loc) else {
            continue;
        };
        if url.scheme() != "http" && url.scheme() != "https" {
            continue;
        }

        let lastmod = child_text(&element, &lastmod_selector).and_then(|v| parse_lastmod(&v));
        entries.push(SitemapEntry { url, lastmod });
    }

    Ok(entries)
}

fn child_text(element: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .map(|e| e.text().collect::<String>().trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parses a W3C datetime as used by `<lastmod>`
pub fn parse_lastmod(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    // minute precision with offset, e.g. 2024-01-15T10:30+02:00
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M%:z") {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
