//! Per-job crawl frontier
//!
//! This module owns the URL bookkeeping of one running job:
//! - A priority heap of queued URLs (homepage > sitemap > link, then FIFO)
//! - The disjoint `queued` / `in_flight` / `done` sets used for dedup
//! - The page budget, counting in-flight URLs so `done` never overshoots
//!
//! A frontier belongs to exactly one job task and is never shared.

use crate::url::{has_denied_extension, normalize_parsed};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use url::Url;

/// How a URL entered the frontier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoverySource {
    Homepage,
    Sitemap,
    Link,
}

impl DiscoverySource {
    /// Scheduling priority; higher is dequeued first
    pub fn priority(self) -> u8 {
        match self {
            DiscoverySource::Homepage => 2,
            DiscoverySource::Sitemap => 1,
            DiscoverySource::Link => 0,
        }
    }
}

/// A URL waiting in (or taken from) the frontier
#[derive(Debug, Clone)]
pub struct FrontierEntry {
    /// Normalized URL, also the dedup key
    pub url: Url,
    pub depth: u32,
    pub priority: u8,
    pub source: DiscoverySource,
    pub discovered_at: DateTime<Utc>,
    /// Insertion order, breaks priority ties
    seq: u64,
}

// BinaryHeap is a max-heap: higher priority first, then the older entry
impl Ord for FrontierEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for FrontierEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for FrontierEntry {}

/// Why an enqueue was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Already queued, in flight or done
    Duplicate,
    DeniedExtension,
    /// Not an http(s) URL with a host
    Invalid,
    /// The queue holds `max_queue_size` entries
    QueueFull,
    /// Admitting it could push the job past `max_pages`
    PageBudget,
}

/// URL frontier of one job
#[derive(Debug)]
pub struct Frontier {
    heap: BinaryHeap<FrontierEntry>,
    queued: HashSet<String>,
    in_flight: HashSet<String>,
    done: HashSet<String>,
    max_pages: usize,
    max_queue_size: usize,
    next_seq: u64,
    unique_pages: u32,
    skipped: u32,
}

impl Frontier {
    /// Creates an empty frontier
    ///
    /// # Arguments
    ///
    /// * `max_pages` - Page budget of the job
    /// * `max_queue_size` - Bound on queued (not yet dequeued) entries
    pub fn new(max_pages: u32, max_queue_size: usize) -> Self {
        Self {
            heap: BinaryHeap::new(),
            queued: HashSet::new(),
            in_flight: HashSet::new(),
            done: HashSet::new(),
            max_pages: max_pages as usize,
            max_queue_size,
            next_seq: 0,
            unique_pages: 0,
            skipped: 0,
        }
    }

    /// Adds a URL; returns false (and counts a skip) when it is refused
    pub fn enqueue(&mut self, url: Url, depth: u32, source: DiscoverySource) -> bool {
        self.try_enqueue(url, depth, source).is_ok()
    }

    /// Adds a URL, reporting why it was refused
    pub fn try_enqueue(
        &mut self,
        url: Url,
        depth: u32,
        source: DiscoverySource,
    ) -> Result<(), Rejection> {
        let result = self.admit(url, depth, source);
        if result.is_err() {
            self.skipped += 1;
        }
        result
    }

    fn admit(&mut self, url: Url, depth: u32, source: DiscoverySource) -> Result<(), Rejection> {
        let url = normalize_parsed(url).map_err(|_| Rejection::Invalid)?;
        let key = url.to_string();

        if self.done.contains(&key) || self.in_flight.contains(&key) || self.queued.contains(&key)
        {
            return Err(Rejection::Duplicate);
        }
        if has_denied_extension(&url) {
            return Err(Rejection::DeniedExtension);
        }
        if self.queued.len() >= self.max_queue_size {
            return Err(Rejection::QueueFull);
        }
        if !self.has_budget() {
            return Err(Rejection::PageBudget);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.queued.insert(key);
        self.heap.push(FrontierEntry {
            url,
            depth,
            priority: source.priority(),
            source,
            discovered_at: Utc::now(),
            seq,
        });
        Ok(())
    }

    /// Takes the highest-priority entry and marks it in flight
    pub fn dequeue(&mut self) -> Option<FrontierEntry> {
        let entry = self.heap.pop()?;
        let key = entry.url.to_string();
        self.queued.remove(&key);
        self.in_flight.insert(key);
        Some(entry)
    }

    /// Marks an in-flight URL as fetched; returns false if it was not in flight
    pub fn complete(&mut self, url: &Url) -> bool {
        if self.finish(url) {
            self.unique_pages += 1;
            true
        } else {
            false
        }
    }

    /// Marks an in-flight URL as given up, without counting it as a page
    pub fn drop_url(&mut self, url: &Url) -> bool {
        self.finish(url)
    }

    fn finish(&mut self, url: &Url) -> bool {
        let key = url.to_string();
        if self.in_flight.remove(&key) {
            self.done.insert(key);
            true
        } else {
            false
        }
    }

    /// Clears everything still queued; returns how many entries were dropped
    pub fn discard_queued(&mut self) -> usize {
        let discarded = self.heap.len();
        self.heap.clear();
        self.queued.clear();
        discarded
    }

    /// Counts a candidate rejected before reaching the frontier (e.g. robots.txt)
    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    /// Whether another URL can be admitted without risking the page budget
    pub fn has_budget(&self) -> bool {
        self.done.len() + self.in_flight.len() + self.queued.len() < self.max_pages
    }

    /// Whether the job has fetched its full page budget
    pub fn reached_limit(&self) -> bool {
        self.unique_pages as usize >= self.max_pages
    }

    /// Whether nothing is queued or in flight
    pub fn is_drained(&self) -> bool {
        self.heap.is_empty() && self.in_flight.is_empty()
    }

    pub fn queued_len(&self) -> usize {
        self.heap.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn done_len(&self) -> usize {
        self.done.len()
    }

    pub fn unique_pages(&self) -> u32 {
        self.unique_pages
    }

    pub fn skipped(&self) -> u32 {
        self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn assert_disjoint(frontier: &Frontier) {
        assert!(frontier.queued.is_disjoint(&frontier.in_flight));
        assert!(frontier.queued.is_disjoint(&frontier.done));
        assert!(frontier.in_flight.is_disjoint(&frontier.done));
    }

    #[test]
    fn test_priority_then_insertion_order() {
        let mut frontier = Frontier::new(100, 100);
        frontier.enqueue(url("https://example.com/link-1"), 1, DiscoverySource::Link);
        frontier.enqueue(url("https://example.com/sitemap-1"), 1, DiscoverySource::Sitemap);
        frontier.enqueue(url("https://example.com/link-2"), 1, DiscoverySource::Link);
        frontier.enqueue(url("https://example.com/"), 0, DiscoverySource::Homepage);
        frontier.enqueue(url("https://example.com/sitemap-2"), 1, DiscoverySource::Sitemap);

        let order: Vec<String> = std::iter::from_fn(|| frontier.dequeue())
            .map(|e| e.url.path().to_string())
            .collect();
        assert_eq!(
            order,
            vec!["/", "/sitemap-1", "/sitemap-2", "/link-1", "/link-2"]
        );
    }

    #[test]
    fn test_enqueue_is_idempotent_across_states() {
        let mut frontier = Frontier::new(100, 100);
        let page = url("https://example.com/a");

        assert!(frontier.enqueue(page.clone(), 0, DiscoverySource::Link));
        assert_eq!(
            frontier.try_enqueue(page.clone(), 0, DiscoverySource::Link),
            Err(Rejection::Duplicate)
        );

        let entry = frontier.dequeue().unwrap();
        assert!(!frontier.enqueue(page.clone(), 0, DiscoverySource::Link));

        frontier.complete(&entry.url);
        assert!(!frontier.enqueue(page.clone(), 0, DiscoverySource::Homepage));
        // equivalent spellings share one key
        assert!(!frontier.enqueue(
            url("https://EXAMPLE.com/a?utm_source=x#frag"),
            0,
            DiscoverySource::Link
        ));

        assert_eq!(frontier.skipped(), 4);
        assert_disjoint(&frontier);
    }

    #[test]
    fn test_denied_extension_rejected() {
        let mut frontier = Frontier::new(100, 100);
        assert_eq!(
            frontier.try_enqueue(url("https://example.com/report.PDF"), 1, DiscoverySource::Link),
            Err(Rejection::DeniedExtension)
        );
        assert_eq!(frontier.skipped(), 1);
        assert_eq!(frontier.queued_len(), 0);
    }

    #[test]
    fn test_queue_bound() {
        let mut frontier = Frontier::new(100, 2);
        assert!(frontier.enqueue(url("https://example.com/1"), 1, DiscoverySource::Link));
        assert!(frontier.enqueue(url("https://example.com/2"), 1, DiscoverySource::Link));
        assert_eq!(
            frontier.try_enqueue(url("https://example.com/3"), 1, DiscoverySource::Link),
            Err(Rejection::QueueFull)
        );

        frontier.dequeue();
        assert!(frontier.enqueue(url("https://example.com/3"), 1, DiscoverySource::Link));
    }

    #[test]
    fn test_budget_counts_in_flight_and_done() {
        let mut frontier = Frontier::new(3, 100);
        for i in 0..3 {
            assert!(frontier.enqueue(
                url(&format!("https://example.com/{}", i)),
                1,
                DiscoverySource::Link
            ));
        }
        assert_eq!(
            frontier.try_enqueue(url("https://example.com/x"), 1, DiscoverySource::Link),
            Err(Rejection::PageBudget)
        );

        let first = frontier.dequeue().unwrap();
        frontier.drop_url(&first.url);
        // a dropped URL still occupies its slot
        assert!(!frontier.enqueue(url("https://example.com/y"), 1, DiscoverySource::Link));

        while let Some(entry) = frontier.dequeue() {
            frontier.complete(&entry.url);
        }
        assert_eq!(frontier.unique_pages(), 2);
        assert!(frontier.done_len() <= 3);
        assert!(frontier.is_drained());
        assert!(!frontier.reached_limit());
        assert_disjoint(&frontier);
    }

    #[test]
    fn test_done_never_exceeds_max_pages() {
        let mut frontier = Frontier::new(5, 1000);
        let mut next = 0;

        // each completed page "discovers" three more
        frontier.enqueue(url("https://example.com/"), 0, DiscoverySource::Homepage);
        while let Some(entry) = frontier.dequeue() {
            frontier.complete(&entry.url);
            for _ in 0..3 {
                next += 1;
                frontier.enqueue(
                    url(&format!("https://example.com/p{}", next)),
                    entry.depth + 1,
                    DiscoverySource::Link,
                );
            }
            assert!(frontier.done_len() <= 5);
            assert_disjoint(&frontier);
        }

        assert_eq!(frontier.unique_pages(), 5);
        assert!(frontier.reached_limit());
    }

    #[test]
    fn test_complete_requires_in_flight() {
        let mut frontier = Frontier::new(10, 10);
        assert!(!frontier.complete(&url("https://example.com/never")));
        assert_eq!(frontier.unique_pages(), 0);
    }

    #[test]
    fn test_discard_queued() {
        let mut frontier = Frontier::new(10, 10);
        frontier.enqueue(url("https://example.com/a"), 1, DiscoverySource::Link);
        frontier.enqueue(url("https://example.com/b"), 1, DiscoverySource::Link);
        frontier.dequeue();

        assert_eq!(frontier.discard_queued(), 1);
        assert_eq!(frontier.queued_len(), 0);
        assert_eq!(frontier.in_flight_len(), 1);
        assert!(!frontier.is_drained());
    }

    #[test]
    fn test_invalid_url_rejected() {
        let mut frontier = Frontier::new(10, 10);
        assert_eq!(
            frontier.try_enqueue(url("ftp://example.com/a"), 0, DiscoverySource::Link),
            Err(Rejection::Invalid)
        );
    }
}
