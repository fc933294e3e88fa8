//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the shared job store.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Submitted crawl jobs and their lifecycle
CREATE TABLE IF NOT EXISTS crawl_jobs (
    crawl_id TEXT PRIMARY KEY,
    job_type TEXT NOT NULL,
    domain_or_url TEXT NOT NULL,
    max_pages INTEGER NOT NULL,
    use_sitemap INTEGER NOT NULL,
    use_proxy INTEGER,
    use_js_rendering INTEGER,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    pages_crawled INTEGER NOT NULL DEFAULT 0,
    pages_skipped INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    pause_requested INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_crawl_jobs_status ON crawl_jobs(status);
CREATE INDEX IF NOT EXISTS idx_crawl_jobs_created ON crawl_jobs(created_at);

-- Learned fetch strategy per domain
CREATE TABLE IF NOT EXISTS domain_configs (
    domain TEXT PRIMARY KEY,
    use_proxy INTEGER NOT NULL DEFAULT 0,
    use_js_rendering INTEGER NOT NULL DEFAULT 0,
    last_sitemap_check_at TEXT,
    updated_at TEXT NOT NULL
);

-- Every page a job fetched, with the stage that succeeded
CREATE TABLE IF NOT EXISTS crawled_pages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    crawl_id TEXT NOT NULL REFERENCES crawl_jobs(crawl_id),
    url TEXT NOT NULL,
    fetch_stage INTEGER NOT NULL,
    status_code INTEGER NOT NULL,
    html_ref TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    UNIQUE(crawl_id, url)
);

CREATE INDEX IF NOT EXISTS idx_crawled_pages_crawl ON crawled_pages(crawl_id);

-- Single-row gate toggled by the health monitor
CREATE TABLE IF NOT EXISTS dispatch_gate (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    paused INTEGER NOT NULL DEFAULT 0,
    reason TEXT,
    updated_at TEXT NOT NULL
);

-- Liveness beacons written by worker processes
CREATE TABLE IF NOT EXISTS worker_heartbeats (
    role TEXT NOT NULL,
    slot INTEGER NOT NULL,
    pid INTEGER NOT NULL,
    beat_at TEXT NOT NULL,
    PRIMARY KEY (role, slot)
);
"#;

/// Initializes the database schema
///
/// Creates all tables and indexes if they don't exist, and seeds the
/// dispatch gate row as open.
pub fn initialize_schema(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO dispatch_gate (id, paused, reason, updated_at)
         VALUES (1, 0, NULL, ?1)",
        [chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}
