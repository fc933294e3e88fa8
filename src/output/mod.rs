//! Human-readable reports for the CLI
//!
//! This module handles:
//! - Job listings with per-status totals
//! - Single job detail with its pages and learned domain strategy

use crate::state::{CrawlJob, DomainConfig, FetchStage, JobStatus};
use crate::storage::PageRecord;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Pages shown in a job detail before the list is cut
const DETAIL_PAGE_LIMIT: usize = 20;

/// Totals over a job listing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobStatistics {
    pub total_jobs: usize,
    pub jobs_by_status: BTreeMap<String, usize>,
    pub pages_crawled: u64,
    pub pages_skipped: u64,
}

impl JobStatistics {
    pub fn from_jobs(jobs: &[CrawlJob]) -> Self {
        let mut stats = Self {
            total_jobs: jobs.len(),
            ..Self::default()
        };
        for job in jobs {
            *stats
                .jobs_by_status
                .entry(job.status.to_db_string().to_string())
                .or_default() += 1;
            stats.pages_crawled += u64::from(job.pages_crawled);
            stats.pages_skipped += u64::from(job.pages_skipped);
        }
        stats
    }
}

/// Formats a job listing as a table followed by totals
pub fn render_job_table(jobs: &[CrawlJob]) -> String {
    let mut out = String::new();
    if jobs.is_empty() {
        out.push_str("No jobs found\n");
        return out;
    }

    let _ = writeln!(
        out,
        "{:<36}  {:<10}  {:<10}  {:>5}/{:<5}  {:>7}  {}",
        "CRAWL ID", "TYPE", "STATUS", "PAGES", "MAX", "RETRIES", "TARGET"
    );
    for job in jobs {
        let _ = writeln!(
            out,
            "{:<36}  {:<10}  {:<10}  {:>5}/{:<5}  {:>7}  {}",
            job.crawl_id,
            job.job_type.to_db_string(),
            job.status.to_db_string(),
            job.pages_crawled,
            job.max_pages,
            job.retry_count,
            job.domain_or_url
        );
    }

    let stats = JobStatistics::from_jobs(jobs);
    let _ = writeln!(out);
    let _ = writeln!(out, "Jobs: {}", stats.total_jobs);
    for (status, count) in &stats.jobs_by_status {
        let _ = writeln!(out, "  {}: {}", status, count);
    }
    let _ = writeln!(
        out,
        "Pages crawled: {} (skipped {})",
        stats.pages_crawled, stats.pages_skipped
    );
    out
}

/// Formats one job with its pages and the domain's learned strategy
pub fn render_job_detail(
    job: &CrawlJob,
    pages: &[PageRecord],
    domain: Option<&DomainConfig>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== Job {} ===\n", job.crawl_id);
    let _ = writeln!(out, "Target: {} ({})", job.domain_or_url, job.job_type.to_db_string());
    let _ = writeln!(out, "Status: {}", job.status.to_db_string());
    if job.pause_requested && job.status == JobStatus::Running {
        let _ = writeln!(out, "  pause requested");
    }
    let _ = writeln!(
        out,
        "Pages: {} crawled, {} skipped, budget {}",
        job.pages_crawled, job.pages_skipped, job.max_pages
    );
    let _ = writeln!(out, "Retries: {}", job.retry_count);
    let _ = writeln!(out, "Created: {}", job.created_at.to_rfc3339());
    if let Some(started) = job.started_at {
        let _ = writeln!(out, "Started: {}", started.to_rfc3339());
    }
    let _ = writeln!(out, "Updated: {}", job.updated_at.to_rfc3339());
    if let Some(error) = &job.error_message {
        let _ = writeln!(out, "Error: {}", error);
    }

    if let Some(domain) = domain {
        let _ = writeln!(out, "\nDomain strategy ({}):", domain.domain);
        let _ = writeln!(out, "  Start stage: {}", domain.start_stage());
        match domain.last_sitemap_check_at {
            Some(at) => {
                let _ = writeln!(out, "  Sitemap checked: {}", at.to_rfc3339());
            }
            None => {
                let _ = writeln!(out, "  Sitemap checked: never");
            }
        }
    }

    if !pages.is_empty() {
        let mut by_stage: BTreeMap<FetchStage, usize> = BTreeMap::new();
        for page in pages {
            *by_stage.entry(page.fetch_stage).or_default() += 1;
        }

        let _ = writeln!(out, "\nPages by stage:");
        for (stage, count) in &by_stage {
            let _ = writeln!(out, "  {}: {}", stage, count);
        }

        let _ = writeln!(out, "\nPages ({}):", pages.len());
        for page in pages.iter().take(DETAIL_PAGE_LIMIT) {
            let _ = writeln!(out, "  [{}] {} ({})", page.status_code, page.url, page.fetch_stage);
        }
        if pages.len() > DETAIL_PAGE_LIMIT {
            let _ = writeln!(out, "  ... {} more", pages.len() - DETAIL_PAGE_LIMIT);
        }
    }
    out
}

pub fn print_job_table(jobs: &[CrawlJob]) {
    print!("{}", render_job_table(jobs));
}

pub fn print_job_detail(job: &CrawlJob, pages: &[PageRecord], domain: Option<&DomainConfig>) {
    print!("{}", render_job_detail(job, pages, domain));
}
