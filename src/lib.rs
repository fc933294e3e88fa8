//! Sumi-Fleet: a distributed crawl orchestration engine
//!
//! Crawl jobs are submitted to a durable job store and a broker tube. A
//! supervised fleet of worker processes claims them, walks each target domain
//! through an isolated frontier, escalates failing fetches through proxy and
//! rendering stages, and hands every fetched page to extractor workers.

pub mod config;
pub mod crawler;
pub mod health;
pub mod jobs;
pub mod orchestrator;
pub mod output;
pub mod queue;
pub mod robots;
pub mod sitemap;
pub mod state;
pub mod storage;
pub mod supervisor;
pub mod url;
pub mod worker;

use thiserror::Error;

/// Main error type for Sumi-Fleet operations
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Transient fetch failure, retried inside an escalation stage
    #[error("Network error for {url}: {message}")]
    Network { url: String, message: String },

    /// Every escalation stage failed for one URL
    #[error("All fetch stages exhausted for {url}")]
    FetchExhausted { url: String },

    /// The job store or the broker cannot be reached
    #[error("{component} unavailable: {message}")]
    DependencyUnavailable { component: String, message: String },

    #[error("Invalid job parameters: {0}")]
    Validation(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Worker {role} crashed: {message}")]
    ProcessCrash { role: String, message: String },

    #[error("Job {crawl_id} stalled after {elapsed_secs}s")]
    Timeout { crawl_id: String, elapsed_secs: i64 },

    #[error("Store error: {0}")]
    Store(#[from] storage::StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] queue::BrokerError),

    #[error("Job {crawl_id} not found")]
    JobNotFound { crawl_id: String },

    #[error("URL error: {0}")]
    UrlError(#[from] UrlError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: state::JobStatus,
        to: state::JobStatus,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FleetError {
    /// Whether this failure comes from shared infrastructure rather than
    /// from the job itself. Only systemic failures dead-letter a message.
    pub fn is_systemic(&self) -> bool {
        matches!(
            self,
            FleetError::Store(_) | FleetError::Queue(_) | FleetError::DependencyUnavailable { .. }
        )
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// URL-specific errors
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("Failed to parse URL: {0}")]
    Parse(String),

    #[error("Invalid URL scheme: {0}")]
    InvalidScheme(String),

    #[error("Missing domain in URL")]
    MissingDomain,
}

/// Result type alias for Sumi-Fleet operations
pub type Result<T> = std::result::Result<T, FleetError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for URL operations
pub type UrlResult<T> = std::result::Result<T, UrlError>;

// Re-export commonly used types
pub use config::Config;
pub use state::{CrawlJob, DomainConfig, FetchStage, JobStatus, JobType};
pub use url::{domain_key, extract_domain, normalize_url};
