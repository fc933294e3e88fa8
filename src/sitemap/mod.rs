//! Sitemap discovery
//!
//! This module finds a domain's sitemap and turns it into a ranked list of
//! page URLs for the frontier:
//! - Locating the root sitemap (robots.txt `Sitemap:` lines, then well-known paths)
//! - Walking sitemap indexes with a visited set and depth/child limits
//! - Filtering stale entries and ranking the rest

mod discovery;
mod parser;

pub use discovery::{
    order_child_sitemaps, rank_entries, SitemapDiscovery, SitemapOptions, WELL_KNOWN_PATHS,
};
pub use parser::{parse_lastmod, parse_sitemap, SitemapDocument, SitemapEntry};

use thiserror::Error;

/// Errors that can occur while reading sitemaps
#[derive(Debug, Error)]
pub enum SitemapError {
    #[error("Sitemap parse error: {0}")]
    Parse(String),

    #[error("Not a sitemap: {0}")]
    NotASitemap(String),

    #[error("Failed to fetch sitemap {url}: {message}")]
    Fetch { url: String, message: String },
}
