use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure for Sumi-Fleet
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub store: StoreConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub frontier: FrontierConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(rename = "user-agent")]
    pub user_agent: UserAgentConfig,

    #[serde(default)]
    pub listener: ListenerConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

/// Durable storage locations
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Path to the SQLite job store shared by every worker process
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Directory receiving fetched HTML bodies
    #[serde(rename = "html-dir")]
    pub html_dir: String,
}

/// Work queue broker (beanstalkd) connection
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,

    /// Tube carrying crawl job requests
    pub crawl_tube: String,

    /// Tube carrying fetched-page events for extractors
    pub page_tube: String,

    /// Time-to-run of a reserved message before the broker redelivers it
    pub visibility_timeout_secs: u64,

    /// How long a single reserve call blocks before returning empty
    pub reserve_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 11300,
            crawl_tube: "crawl_jobs".to_string(),
            page_tube: "page_fetched".to_string(),
            visibility_timeout_secs: 900,
            reserve_timeout_secs: 5,
        }
    }
}

impl BrokerConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn reserve_timeout(&self) -> Duration {
        Duration::from_secs(self.reserve_timeout_secs)
    }
}

/// Per-job frontier limits and discovery settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FrontierConfig {
    /// Upper bound on queued-but-not-fetched URLs
    pub max_queue_size: usize,

    /// Page budget applied when a submission does not name one
    pub default_max_pages: u32,

    /// Concurrent outstanding fetches inside one job
    pub concurrency_per_domain: usize,

    /// Sitemap entries older than this are ignored
    pub sitemap_max_age_days: i64,

    /// Maximum sitemap-index nesting followed during discovery
    pub sitemap_max_depth: u32,

    /// Maximum number of child sitemaps fetched from indexes
    pub sitemap_max_children: usize,

    /// Interval between pause/heartbeat checks while a job runs
    pub control_poll_secs: u64,

    /// Reject URLs disallowed by the target's robots.txt
    pub respect_robots: bool,
}

impl Default for FrontierConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            default_max_pages: 50,
            concurrency_per_domain: 8,
            sitemap_max_age_days: 90,
            sitemap_max_depth: 3,
            sitemap_max_children: 50,
            control_poll_secs: 5,
            respect_robots: false,
        }
    }
}

/// Fetch and escalation behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct FetchConfig {
    /// Total download timeout per request
    pub timeout_secs: u64,

    pub connect_timeout_secs: u64,

    /// Same-stage retries for retryable failures before escalating
    pub max_retries_per_stage: u32,

    /// Delay before the first same-stage retry
    pub retry_delay_ms: u64,

    /// Multiplier applied to the delay on each further retry
    pub backoff_factor: f64,

    /// Proxy used by the proxy and render stages
    pub proxy_url: Option<String>,

    /// Splash-compatible rendering endpoint (e.g. http://splash:8050/render.html)
    pub render_endpoint: Option<String>,

    /// Seconds the renderer waits for scripts before snapshotting
    pub render_wait_secs: f64,

    /// Refuse plain-http targets
    pub https_only: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            connect_timeout_secs: 10,
            max_retries_per_stage: 3,
            retry_delay_ms: 5000,
            backoff_factor: 2.0,
            proxy_url: None,
            render_endpoint: None,
            render_wait_secs: 2.0,
            https_only: false,
        }
    }
}

impl FetchConfig {
    /// Delay before same-stage retry number `attempt` (1-based)
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.retry_delay_ms as f64 * self.backoff_factor.powi(exponent);
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserAgentConfig {
    /// Name of the crawler
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the crawler
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for crawler-related contact
    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

impl UserAgentConfig {
    /// Format: CrawlerName/Version (+ContactURL; ContactEmail)
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}

/// Queue listener settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ListenerConfig {
    /// Maximum jobs a listener runs at once (MAX_CONCURRENT_CRAWLERS)
    pub max_concurrent_crawlers: usize,

    /// How long in-flight jobs may drain after a shutdown request
    pub shutdown_grace_secs: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_crawlers: 5,
            shutdown_grace_secs: 30,
        }
    }
}

/// Worker supervision settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SupervisorConfig {
    /// Number of extractor worker processes
    pub extractor_workers: usize,

    pub tick_interval_secs: u64,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,

    /// Restarts tolerated inside `restart_window_secs` before the role circuit opens
    pub max_restarts: u32,
    pub restart_window_secs: u64,

    /// Continuous uptime after which a role's failure counter resets
    pub stable_uptime_secs: u64,

    /// How often workers write their heartbeat
    pub heartbeat_interval_secs: u64,

    /// A heartbeat older than this marks the worker as stale
    pub heartbeat_stale_secs: u64,

    pub shutdown_grace_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            extractor_workers: 2,
            tick_interval_secs: 5,
            backoff_base_secs: 1,
            backoff_max_secs: 300,
            max_restarts: 4,
            restart_window_secs: 600,
            stable_uptime_secs: 300,
            heartbeat_interval_secs: 10,
            heartbeat_stale_secs: 60,
            shutdown_grace_secs: 30,
        }
    }
}

/// Health monitor settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MonitorConfig {
    pub probe_interval_secs: u64,

    /// Consecutive failed probes that open a dependency circuit
    pub failure_threshold: u32,

    /// Consecutive successful probes that close it again
    pub success_threshold: u32,

    /// Wall-clock budget of a running job before it counts as stalled
    pub job_timeout_secs: u64,

    /// Stall restarts allowed before a job is failed
    pub max_job_retries: u32,

    /// Ready crawl jobs above this count raise a backlog warning
    pub backlog_warning: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: 60,
            failure_threshold: 3,
            success_threshold: 2,
            job_timeout_secs: 900,
            max_job_retries: 3,
            backlog_warning: 100,
        }
    }
}
