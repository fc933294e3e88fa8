//! Sitemap location, index walking and ranking

use crate::config::FrontierConfig;
use crate::crawler::FetchBackend;
use crate::sitemap::{parse_sitemap, SitemapDocument, SitemapEntry, SitemapError};
use crate::state::FetchStage;
use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::{HashSet, VecDeque};
use url::Url;

/// Paths probed when robots.txt names no sitemap
pub const WELL_KNOWN_PATHS: &[&str] = &[
    "/sitemap.xml",
    "/sitemap_index.xml",
    "/sitemap-index.xml",
    "/sitemapindex.xml",
    "/sitemap/sitemap.xml",
];

/// Child sitemap names that usually list content pages
const PAGE_KEYWORDS: &[&str] = &[
    "page", "pages", "static", "content", "main", "post", "posts", "blog",
];

/// Child sitemap names that list taxonomy or feed pages
const NON_PAGE_KEYWORDS: &[&str] = &[
    "news",
    "newsletter",
    "newsletters",
    "article",
    "articles",
    "category",
    "categories",
    "tag",
    "tags",
    "author",
    "authors",
    "archive",
    "taxonomy",
    "feed",
];

/// Limits applied while walking sitemaps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SitemapOptions {
    /// Index nesting followed below the root
    pub max_depth: u32,
    /// Child sitemaps fetched in total
    pub max_children: usize,
    /// Entries older than this are dropped
    pub max_age_days: i64,
}

impl From<&FrontierConfig> for SitemapOptions {
    fn from(config: &FrontierConfig) -> Self {
        Self {
            max_depth: config.sitemap_max_depth,
            max_children: config.sitemap_max_children,
            max_age_days: config.sitemap_max_age_days,
        }
    }
}

/// Finds and reads a domain's sitemaps through a fetch backend
pub struct SitemapDiscovery<'a> {
    backend: &'a dyn FetchBackend,
    stage: FetchStage,
    options: SitemapOptions,
}

impl<'a> SitemapDiscovery<'a> {
    pub fn new(backend: &'a dyn FetchBackend, stage: FetchStage, options: SitemapOptions) -> Self {
        Self {
            backend,
            stage,
            options,
        }
    }

    /// Discovers the ranked page URLs of a site
    ///
    /// # Arguments
    ///
    /// * `homepage` - The site root
    /// * `declared` - Sitemaps named by robots.txt, tried before well-known paths
    /// * `now` - Reference time for the age filter
    ///
    /// # Returns
    ///
    /// Ranked page URLs; empty when no sitemap could be read
    pub async fn discover(
        &self,
        homepage: &Url,
        declared: &[Url],
        now: DateTime<Utc>,
    ) -> Vec<Url> {
        let Some((root_url, root)) = self.locate(homepage, declared).await else {
            tracing::debug!("No sitemap found for {}", homepage);
            return Vec::new();
        };

        tracing::info!("Using sitemap {}", root_url);
        let entries = self.walk(root_url, root).await;
        let total = entries.len();
        let ranked = rank_entries(entries, now, self.options.max_age_days);

        tracing::info!(
            "Sitemap discovery for {}: {} entries, {} after age filter",
            homepage,
            total,
            ranked.len()
        );
        ranked.into_iter().map(|e| e.url).collect()
    }

    /// Returns the first candidate that parses as a sitemap
    pub async fn locate(
        &self,
        homepage: &Url,
        declared: &[Url],
    ) -> Option<(Url, SitemapDocument)> {
        let mut candidates: Vec<Url> = declared.to_vec();
        if candidates.is_empty() {
            candidates.extend(WELL_KNOWN_PATHS.iter().filter_map(|p| homepage.join(p).ok()));
        }

        for candidate in candidates {
            match self.fetch_document(&candidate).await {
                Ok(document) => return Some((candidate, document)),
                Err(e) => tracing::debug!("Sitemap candidate rejected: {}", e),
            }
        }
        None
    }

    /// Collects page entries below `root`, following nested indexes
    ///
    /// Each sitemap URL is fetched at most once, so self-referencing or
    /// cyclic indexes terminate.
    pub async fn walk(&self, root_url: Url, root: SitemapDocument) -> Vec<SitemapEntry> {
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(root_url.to_string());

        let mut seen_pages: HashSet<String> = HashSet::new();
        let mut pages = Vec::new();
        let mut children_fetched = 0usize;

        let mut worklist: VecDeque<(Url, u32, SitemapDocument)> = VecDeque::new();
        worklist.push_back((root_url, 0, root));

        while let Some((url, depth, document)) = worklist.pop_front() {
            match document {
                SitemapDocument::UrlSet(entries) => {
                    for entry in entries {
                        if seen_pages.insert(entry.url.to_string()) {
                            pages.push(entry);
                        }
                    }
                }
                SitemapDocument::Index(children) => {
                    if depth >= self.options.max_depth {
                        tracing::debug!("Sitemap index {} exceeds max depth, skipping", url);
                        continue;
                    }

                    for child in order_child_sitemaps(children) {
                        if children_fetched >= self.options.max_children {
                            tracing::debug!(
                                "Child sitemap limit ({}) reached",
                                self.options.max_children
                            );
                            break;
                        }
                        if !visited.insert(child.url.to_string()) {
                            continue;
                        }

                        children_fetched += 1;
                        match self.fetch_document(&child.url).await {
                            Ok(document) => worklist.push_back((child.url, depth + 1, document)),
                            Err(e) => tracing::debug!("Skipping child sitemap: {}", e),
                        }
                    }
                }
            }
        }

        pages
    }

    async fn fetch_document(&self, url: &Url) -> Result<SitemapDocument, SitemapError> {
        let response = self
            .backend
            .fetch(url, self.stage)
            .await
            .map_err(|e| SitemapError::Fetch {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        if !(200..300).contains(&response.status_code) {
            return Err(SitemapError::Fetch {
                url: url.to_string(),
                message: format!("status {}", response.status_code),
            });
        }

        parse_sitemap(&response.body, &response.final_url)
    }
}

/// Orders index children page sitemaps first and drops taxonomy/feed sitemaps
///
/// A child whose name matches both lists is kept as a page sitemap.
pub fn order_child_sitemaps(children: Vec<SitemapEntry>) -> Vec<SitemapEntry> {
    let mut page_sitemaps = Vec::new();
    let mut others = Vec::new();

    for child in children {
        let name = child
            .url
            .path_segments()
            .and_then(|s| s.last())
            .unwrap_or("")
            .to_ascii_lowercase();

        if PAGE_KEYWORDS.iter().any(|k| name.contains(k)) {
            page_sitemaps.push(child);
        } else if NON_PAGE_KEYWORDS.iter().any(|k| name.contains(k)) {
            tracing::debug!("Skipping non-page sitemap {}", child.url);
        } else {
            others.push(child);
        }
    }

    page_sitemaps.extend(others);
    page_sitemaps
}

/// Drops stale entries and ranks the rest
///
/// Entries without a `lastmod` are kept. Order: shallower path first, then
/// newer `lastmod` (undated last), then URL.
pub fn rank_entries(
    entries: Vec<SitemapEntry>,
    now: DateTime<Utc>,
    max_age_days: i64,
) -> Vec<SitemapEntry> {
    let cutoff = now - Duration::days(max_age_days);

    let mut kept: Vec<SitemapEntry> = entries
        .into_iter()
        .filter(|e| e.lastmod.map_or(true, |m| m >= cutoff))
        .collect();

    kept.sort_by(|a, b| {
        path_depth(&a.url)
            .cmp(&path_depth(&b.url))
            .then_with(|| match (a.lastmod, b.lastmod) {
                (Some(x), Some(y)) => y.cmp(&x),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            })
            .then_with(|| a.url.as_str().cmp(b.url.as_str()))
    });

    kept
}

fn path_depth(url: &Url) -> usize {
    url.path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).count())
        .unwrap_or(0)
}
