//! Crawler module for running one crawl job
//!
//! This module contains the per-job crawling logic, including:
//! - The URL frontier with dedup and page budget
//! - Fetch backends and the Direct -> Proxy -> ProxyRender escalation
//! - Response classification (retry, escalate, drop)
//! - HTML link discovery
//! - The coordinator that ties a job's run together

mod classify;
mod coordinator;
mod escalation;
mod fetcher;
mod frontier;
mod parser;

pub use classify::{classify_error, classify_response, Action, Verdict};
pub use coordinator::{CrawlContext, CrawlOutcome, CrawlSummary, Coordinator};
pub use escalation::{Attempt, EscalationController, FetchOutcome};
pub use fetcher::{build_http_client, FetchBackend, FetchError, FetchResponse, HttpFetcher};
pub use frontier::{DiscoverySource, Frontier, FrontierEntry, Rejection};
pub use parser::{extract_crawlable_links, extract_title, parse_html, visible_text_len, ParsedPage};
