//! Storage traits and error types
//!
//! This module defines the job store interface shared by every worker
//! process. All cross-process coordination goes through it; the only write
//! that arbitrates between competing processes is
//! [`JobStore::compare_and_set_status`].

use crate::state::{CrawlJob, DomainConfig, FetchStage, JobStatus};
use crate::storage::{DispatchGate, JobFilter, PageRecord, WorkerHeartbeat};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Store lock poisoned")]
    Poisoned,
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Durable job store
///
/// Implementations must be safe to share between tasks (`&self` methods) and
/// between processes opening the same backing database.
pub trait JobStore: Send + Sync {
    /// Cheap round trip used by health probes and startup checks
    fn ping(&self) -> StoreResult<()>;

    // ===== Jobs =====

    /// Inserts a new job record
    fn insert_job(&self, job: &CrawlJob) -> StoreResult<()>;

    fn get_job(&self, crawl_id: &str) -> StoreResult<Option<CrawlJob>>;

    /// Lists jobs, newest first
    fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<CrawlJob>>;

    /// Atomically moves a job from `expected` to `next`
    ///
    /// # Arguments
    ///
    /// * `crawl_id` - The job to update
    /// * `expected` - Status the caller observed
    /// * `message` - Stored as the job's error message when present; completion clears it
    /// * `message` - Stored as the job's error message when present
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - This call performed the transition
    /// * `Ok(false)` - The job was not in `expected` (someone else won)
    /// * `Err(StoreError::InvalidTransition)` - `expected -> next` is not a legal move
    fn compare_and_set_status(
        &self,
        crawl_id: &str,
        expected: JobStatus,
        next: JobStatus,
        message: Option<&str>,
    ) -> StoreResult<bool>;

    /// Flushes a running job's counters and refreshes `updated_at`
    fn update_progress(&self, crawl_id: &str, pages_crawled: u32, pages_skipped: u32)
        -> StoreResult<()>;

    /// Increments and returns the job's stall-retry counter
    fn increment_retry_count(&self, crawl_id: &str) -> StoreResult<u32>;

    /// Sets the cooperative pause flag. Returns false if the job does not exist.
    fn request_pause(&self, crawl_id: &str) -> StoreResult<bool>;

    // ===== Crawled pages =====

    /// Records a fetched page; a repeat fetch of the same URL by the same job
    /// overwrites the earlier record
    fn record_page(&self, page: &PageRecord) -> StoreResult<()>;

    fn get_pages(&self, crawl_id: &str) -> StoreResult<Vec<PageRecord>>;

    // ===== Domain strategy =====

    fn get_domain_config(&self, domain: &str) -> StoreResult<Option<DomainConfig>>;

    /// Upserts the domain's strategy after a success at `stage`
    ///
    /// Flags are only ever raised: a `Direct` win never clears `use_proxy`.
    fn record_winning_stage(&self, domain: &str, stage: FetchStage) -> StoreResult<DomainConfig>;

    fn mark_sitemap_checked(&self, domain: &str, at: DateTime<Utc>) -> StoreResult<()>;

    // ===== Dispatch gate =====

    fn set_dispatch_paused(&self, paused: bool, reason: Option<&str>) -> StoreResult<()>;

    fn dispatch_gate(&self) -> StoreResult<DispatchGate>;

    // ===== Worker heartbeats =====

    fn record_heartbeat(&self, role: &str, slot: usize, pid: u32) -> StoreResult<()>;

    fn heartbeats(&self) -> StoreResult<Vec<WorkerHeartbeat>>;
}
