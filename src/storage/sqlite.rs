//! SQLite job store implementation
//!
//! One database file is shared by the orchestrator and every worker process.
//! WAL journaling plus a busy timeout let readers and the single-statement
//! conditional writes of different processes interleave safely.

use crate::state::{CrawlJob, DomainConfig, FetchStage, JobStatus, JobType};
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{JobStore, StoreError, StoreResult};
use crate::storage::{DispatchGate, JobFilter, PageRecord, WorkerHeartbeat};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const JOB_COLUMNS: &str = "crawl_id, job_type, domain_or_url, max_pages, use_sitemap, \
     use_proxy, use_js_rendering, status, retry_count, pages_crawled, pages_skipped, \
     error_message, pause_requested, created_at, updated_at, started_at";

/// SQLite job store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens or creates the database at `path`
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStore)` - Successfully opened/created database
    /// * `Err(StoreError)` - Failed to open database
    pub fn new(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory database, private to this process
    pub fn new_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn now_string() -> String {
    Utc::now().to_rfc3339()
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn parse_time(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, format!("bad timestamp '{}': {}", value, e)))
}

fn parse_optional_time(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_time(idx, &v)).transpose()
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<CrawlJob> {
    let job_type: String = row.get(1)?;
    let status: String = row.get(7)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;

    Ok(CrawlJob {
        crawl_id: row.get(0)?,
        job_type: JobType::from_db_string(&job_type)
            .ok_or_else(|| conversion_error(1, format!("unknown job type '{}'", job_type)))?,
        domain_or_url: row.get(2)?,
        max_pages: row.get(3)?,
        use_sitemap: row.get(4)?,
        use_proxy: row.get(5)?,
        use_js_rendering: row.get(6)?,
        status: JobStatus::from_db_string(&status)
            .ok_or_else(|| conversion_error(7, format!("unknown status '{}'", status)))?,
        retry_count: row.get(8)?,
        pages_crawled: row.get(9)?,
        pages_skipped: row.get(10)?,
        error_message: row.get(11)?,
        pause_requested: row.get(12)?,
        created_at: parse_time(13, &created_at)?,
        updated_at: parse_time(14, &updated_at)?,
        started_at: parse_optional_time(15, row.get(15)?)?,
    })
}

fn domain_config_from_row(row: &Row<'_>) -> rusqlite::Result<DomainConfig> {
    let updated_at: String = row.get(4)?;
    Ok(DomainConfig {
        domain: row.get(0)?,
        use_proxy: row.get(1)?,
        use_js_rendering: row.get(2)?,
        last_sitemap_check_at: parse_optional_time(3, row.get(3)?)?,
        updated_at: parse_time(4, &updated_at)?,
    })
}

fn query_domain_config(conn: &Connection, domain: &str) -> StoreResult<Option<DomainConfig>> {
    let config = conn
        .query_row(
            "SELECT domain, use_proxy, use_js_rendering, last_sitemap_check_at, updated_at
             FROM domain_configs WHERE domain = ?1",
            params![domain],
            domain_config_from_row,
        )
        .optional()?;
    Ok(config)
}

impl JobStore for SqliteStore {
    fn ping(&self) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    // ===== Jobs =====

    fn insert_job(&self, job: &CrawlJob) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT INTO crawl_jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                JOB_COLUMNS
            ),
            params![
                job.crawl_id,
                job.job_type.to_db_string(),
                job.domain_or_url,
                job.max_pages,
                job.use_sitemap,
                job.use_proxy,
                job.use_js_rendering,
                job.status.to_db_string(),
                job.retry_count,
                job.pages_crawled,
                job.pages_skipped,
                job.error_message,
                job.pause_requested,
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
                job.started_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    fn get_job(&self, crawl_id: &str) -> StoreResult<Option<CrawlJob>> {
        let conn = self.lock()?;
        let job = conn
            .query_row(
                &format!("SELECT {} FROM crawl_jobs WHERE crawl_id = ?1", JOB_COLUMNS),
                params![crawl_id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    fn list_jobs(&self, filter: &JobFilter) -> StoreResult<Vec<CrawlJob>> {
        let conn = self.lock()?;
        let limit = filter.limit.map_or(-1, |l| l as i64);

        let jobs = match filter.status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM crawl_jobs WHERE status = ?1
                     ORDER BY created_at DESC, crawl_id LIMIT ?2",
                    JOB_COLUMNS
                ))?;
                let rows = stmt.query_map(params![status.to_db_string(), limit], job_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM crawl_jobs ORDER BY created_at DESC, crawl_id LIMIT ?1",
                    JOB_COLUMNS
                ))?;
                let rows = stmt.query_map(params![limit], job_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };

        Ok(jobs)
    }

    fn compare_and_set_status(
        &self,
        crawl_id: &str,
        expected: JobStatus,
        next: JobStatus,
        message: Option<&str>,
    ) -> StoreResult<bool> {
        if !expected.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                from: expected,
                to: next,
            });
        }

        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE crawl_jobs SET
                status = ?1,
                updated_at = ?2,
                started_at = CASE WHEN ?1 = 'running' THEN ?2 ELSE started_at END,
                pause_requested = CASE WHEN ?1 = 'paused' THEN 0 ELSE pause_requested END,
                error_message = CASE WHEN ?1 = 'completed' THEN NULL
                    ELSE COALESCE(?3, error_message) END
             WHERE crawl_id = ?4 AND status = ?5",
            params![
                next.to_db_string(),
                now_string(),
                message,
                crawl_id,
                expected.to_db_string()
            ],
        )?;

        Ok(changed == 1)
    }

    fn update_progress(
        &self,
        crawl_id: &str,
        pages_crawled: u32,
        pages_skipped: u32,
    ) -> StoreResult<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE crawl_jobs SET pages_crawled = ?1, pages_skipped = ?2, updated_at = ?3
             WHERE crawl_id = ?4",
            params![pages_crawled, pages_skipped, now_string(), crawl_id],
        )?;
        if changed == 0 {
            return Err(StoreError::JobNotFound(crawl_id.to_string()));
        }
        Ok(())
    }

    fn increment_retry_count(&self, crawl_id: &str) -> StoreResult<u32> {
        let conn = self.lock()?;
        let count = conn
            .query_row(
                "UPDATE crawl_jobs SET retry_count = retry_count + 1, updated_at = ?1
                 WHERE crawl_id = ?2 RETURNING retry_count",
                params![now_string(), crawl_id],
                |row| row.get::<_, u32>(0),
            )
            .optional()?;
        count.ok_or_else(|| StoreError::JobNotFound(crawl_id.to_string()))
    }

    fn request_pause(&self, crawl_id: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE crawl_jobs SET pause_requested = 1, updated_at = ?1 WHERE crawl_id = ?2",
            params![now_string(), crawl_id],
        )?;
        Ok(changed == 1)
    }

    // ===== Crawled pages =====

    fn record_page(&self, page: &PageRecord) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO crawled_pages (crawl_id, url, fetch_stage, status_code, html_ref, fetched_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(crawl_id, url) DO UPDATE SET
                fetch_stage = excluded.fetch_stage,
                status_code = excluded.status_code,
                html_ref = excluded.html_ref,
                fetched_at = excluded.fetched_at",
            params![
                page.crawl_id,
                page.url,
                page.fetch_stage.as_u8(),
                page.status_code,
                page.html_ref,
                page.fetched_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get_pages(&self, crawl_id: &str) -> StoreResult<Vec<PageRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT crawl_id, url, fetch_stage, status_code, html_ref, fetched_at
             FROM crawled_pages WHERE crawl_id = ?1 ORDER BY id",
        )?;

        let rows = stmt.query_map(params![crawl_id], |row| {
            let stage: u8 = row.get(2)?;
            let fetched_at: String = row.get(5)?;
            Ok(PageRecord {
                crawl_id: row.get(0)?,
                url: row.get(1)?,
                fetch_stage: FetchStage::from_u8(stage).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        Type::Integer,
                        format!("unknown fetch stage {}", stage).into(),
                    )
                })?,
                status_code: row.get(3)?,
                html_ref: row.get(4)?,
                fetched_at: parse_time(5, &fetched_at)?,
            })
        })?;

        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ===== Domain strategy =====

    fn get_domain_config(&self, domain: &str) -> StoreResult<Option<DomainConfig>> {
        let conn = self.lock()?;
        query_domain_config(&conn, domain)
    }

    fn record_winning_stage(&self, domain: &str, stage: FetchStage) -> StoreResult<DomainConfig> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO domain_configs (domain, use_proxy, use_js_rendering, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(domain) DO UPDATE SET
                use_proxy = MAX(use_proxy, excluded.use_proxy),
                use_js_rendering = MAX(use_js_rendering, excluded.use_js_rendering),
                updated_at = excluded.updated_at",
            params![
                domain,
                stage.uses_proxy(),
                stage.uses_rendering(),
                now_string()
            ],
        )?;

        query_domain_config(&conn, domain)?
            .ok_or_else(|| StoreError::Corrupt(format!("domain config '{}' vanished", domain)))
    }

    fn mark_sitemap_checked(&self, domain: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO domain_configs (domain, last_sitemap_check_at, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(domain) DO UPDATE SET
                last_sitemap_check_at = excluded.last_sitemap_check_at,
                updated_at = excluded.updated_at",
            params![domain, at.to_rfc3339(), now_string()],
        )?;
        Ok(())
    }

    // ===== Dispatch gate =====

    fn set_dispatch_paused(&self, paused: bool, reason: Option<&str>) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE dispatch_gate SET paused = ?1, reason = ?2, updated_at = ?3 WHERE id = 1",
            params![paused, reason, now_string()],
        )?;
        Ok(())
    }

    fn dispatch_gate(&self) -> StoreResult<DispatchGate> {
        let conn = self.lock()?;
        let gate = conn.query_row(
            "SELECT paused, reason, updated_at FROM dispatch_gate WHERE id = 1",
            [],
            |row| {
                let updated_at: String = row.get(2)?;
                Ok(DispatchGate {
                    paused: row.get(0)?,
                    reason: row.get(1)?,
                    updated_at: parse_time(2, &updated_at)?,
                })
            },
        )?;
        Ok(gate)
    }

    // ===== Worker heartbeats =====

    fn record_heartbeat(&self, role: &str, slot: usize, pid: u32) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO worker_heartbeats (role, slot, pid, beat_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(role, slot) DO UPDATE SET pid = excluded.pid, beat_at = excluded.beat_at",
            params![role, slot as i64, pid, now_string()],
        )?;
        Ok(())
    }

    fn heartbeats(&self) -> StoreResult<Vec<WorkerHeartbeat>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT role, slot, pid, beat_at FROM worker_heartbeats ORDER BY role, slot")?;
        let rows = stmt.query_map([], |row| {
            let slot: i64 = row.get(1)?;
            let beat_at: String = row.get(3)?;
            Ok(WorkerHeartbeat {
                role: row.get(0)?,
                slot: slot.max(0) as usize,
                pid: row.get(2)?,
                beat_at: parse_time(3, &beat_at)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
