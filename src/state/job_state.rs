/// Crawl job lifecycle definitions
///
/// A job moves forward through its statuses; the only cycle is
/// `running -> retrying -> running`, taken when the health monitor
/// re-enqueues a stalled job.
use crate::FleetError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Upper bound accepted for a job's page budget
pub const MAX_PAGES_LIMIT: u32 = 100_000;

/// Status of a crawl job in the job store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted, waiting for a listener to claim it
    Queued,

    /// Claimed by exactly one listener
    Running,

    /// Stalled run re-enqueued by the monitor
    Retrying,

    Completed,
    Failed,

    /// Halted cooperatively on request
    Paused,
}

impl JobStatus {
    /// Returns true if no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Paused)
    }

    /// Returns true if a listener may claim a job in this status
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Queued | Self::Retrying)
    }

    /// Validates a lifecycle transition
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Running, Retrying)
                | (Retrying, Running)
                | (Retrying, Failed)
        )
    }

    /// Converts the status to its database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }

    /// Parses a status from its database string representation
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "retrying" => Some(Self::Retrying),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Kind of crawl requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Crawl a whole domain starting at its homepage
    Domain,

    /// Fetch exactly one URL
    SingleUrl,
}

impl JobType {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Domain => "domain",
            Self::SingleUrl => "single_url",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "domain" => Some(Self::Domain),
            "single_url" => Some(Self::SingleUrl),
            _ => None,
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}

/// Parameters of a job submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    pub job_type: JobType,
    pub domain_or_url: String,
    /// `None` falls back to the configured default budget
    pub max_pages: Option<u32>,
    pub use_sitemap: bool,
    /// `None` leaves the decision to the learned domain config
    pub use_proxy: Option<bool>,
    pub use_js_rendering: Option<bool>,
}

impl JobParams {
    /// A whole-domain crawl with default settings
    pub fn domain(target: impl Into<String>) -> Self {
        Self {
            job_type: JobType::Domain,
            domain_or_url: target.into(),
            max_pages: None,
            use_sitemap: true,
            use_proxy: None,
            use_js_rendering: None,
        }
    }

    /// A single-page fetch
    pub fn single_url(url: impl Into<String>) -> Self {
        Self {
            job_type: JobType::SingleUrl,
            domain_or_url: url.into(),
            max_pages: Some(1),
            use_sitemap: false,
            use_proxy: None,
            use_js_rendering: None,
        }
    }

    /// Checks the parameters and returns the crawl's start URL
    ///
    /// # Returns
    ///
    /// * `Ok(Url)` - The homepage (domain jobs) or target (single-url jobs)
    /// * `Err(FleetError::Validation)` - The parameters cannot produce a job
    pub fn validate(&self) -> Result<Url, FleetError> {
        if let Some(max_pages) = self.max_pages {
            if max_pages < 1 || max_pages > MAX_PAGES_LIMIT {
                return Err(FleetError::Validation(format!(
                    "max_pages must be between 1 and {}, got {}",
                    MAX_PAGES_LIMIT, max_pages
                )));
            }
        }

        start_url(self.job_type, &self.domain_or_url)
    }
}

/// Derives the URL a crawl starts from
///
/// Domain jobs accept either a bare host (`example.com`, crawled over https)
/// or a full URL whose path is replaced by `/`. Single-url jobs require an
/// absolute http(s) URL.
pub fn start_url(job_type: JobType, domain_or_url: &str) -> Result<Url, FleetError> {
    let target = domain_or_url.trim();
    if target.is_empty() {
        return Err(FleetError::Validation(
            "domain_or_url cannot be empty".to_string(),
        ));
    }

    let has_scheme = target.contains("://");
    let parsed = match (job_type, has_scheme) {
        (JobType::SingleUrl, false) => {
            return Err(FleetError::Validation(format!(
                "single_url jobs need an absolute URL, got '{}'",
                target
            )))
        }
        (_, true) => Url::parse(target),
        (JobType::Domain, false) => Url::parse(&format!("https://{}/", target)),
    }
    .map_err(|e| FleetError::Validation(format!("invalid target '{}': {}", target, e)))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(FleetError::Validation(format!(
            "unsupported scheme '{}' in '{}'",
            parsed.scheme(),
            target
        )));
    }

    if parsed.host_str().map_or(true, |h| h.is_empty()) {
        return Err(FleetError::Validation(format!("'{}' has no host", target)));
    }

    match job_type {
        JobType::SingleUrl => Ok(parsed),
        JobType::Domain => {
            let mut home = parsed;
            home.set_path("/");
            home.set_query(None);
            home.set_fragment(None);
            Ok(home)
        }
    }
}

/// A crawl job as persisted in the job store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrawlJob {
    pub crawl_id: String,
    pub job_type: JobType,
    pub domain_or_url: String,
    pub max_pages: u32,
    pub use_sitemap: bool,
    pub use_proxy: Option<bool>,
    pub use_js_rendering: Option<bool>,
    pub status: JobStatus,
    pub retry_count: u32,
    pub pages_crawled: u32,
    pub pages_skipped: u32,
    pub error_message: Option<String>,
    pub pause_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set each time a listener claims the job
    pub started_at: Option<DateTime<Utc>>,
}

impl CrawlJob {
    /// Builds a freshly queued job from validated parameters
    pub fn new(crawl_id: String, params: &JobParams, default_max_pages: u32) -> Self {
        let now = Utc::now();
        let max_pages = match params.job_type {
            JobType::SingleUrl => 1,
            JobType::Domain => params.max_pages.unwrap_or(default_max_pages),
        };

        Self {
            crawl_id,
            job_type: params.job_type,
            domain_or_url: params.domain_or_url.trim().to_string(),
            max_pages,
            use_sitemap: params.use_sitemap && params.job_type == JobType::Domain,
            use_proxy: params.use_proxy,
            use_js_rendering: params.use_js_rendering,
            status: JobStatus::Queued,
            retry_count: 0,
            pages_crawled: 0,
            pages_skipped: 0,
            error_message: None,
            pause_requested: false,
            created_at: now,
            updated_at: now,
            started_at: None,
        }
    }

    /// Seconds since the current run was claimed, if it was
    pub fn running_for_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        self.started_at.map(|started| (now - started).num_seconds())
    }
}
