//! Storage module for the shared job store
//!
//! This module handles all durable state of the fleet:
//! - Crawl job records and their compare-and-set lifecycle
//! - Per-domain learned fetch strategy
//! - Per-job crawled page records
//! - The dispatch gate toggled by the health monitor
//! - Worker heartbeats read by the supervisor
//! - HTML bodies written to disk for extractor workers

mod html;
mod schema;
mod sqlite;
mod traits;

pub use html::HtmlStore;
pub use sqlite::SqliteStore;
pub use traits::{JobStore, StoreError, StoreResult};

use crate::state::{FetchStage, JobStatus};
use chrono::{DateTime, Utc};
use std::path::Path;

/// Opens (creating if needed) the job store database
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SqliteStore)` - Successfully opened store
/// * `Err(StoreError)` - Failed to open or initialize the database
pub fn open_store(path: &Path) -> StoreResult<SqliteStore> {
    SqliteStore::new(path)
}

/// A page fetched by a job
#[derive(Debug, Clone, PartialEq)]
pub struct PageRecord {
    pub crawl_id: String,
    pub url: String,
    pub fetch_stage: FetchStage,
    pub status_code: u16,
    /// Location of the stored HTML body
    pub html_ref: String,
    pub fetched_at: DateTime<Utc>,
}

/// Filter for listing jobs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            limit: None,
        }
    }
}

/// Persisted state of the dispatch circuit
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchGate {
    pub paused: bool,
    pub reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Last liveness beacon of one worker slot
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerHeartbeat {
    pub role: String,
    pub slot: usize,
    pub pid: u32,
    pub beat_at: DateTime<Utc>,
}
