//! Shared data model for jobs and learned domain strategy
//!
//! # Components
//!
//! - `JobStatus` / `JobType` / `CrawlJob`: the persisted job record and its lifecycle
//! - `DomainConfig`: per-domain strategy learned from successful escalations
//! - `ResolvedJobConfig`: immutable per-run configuration built at claim time
//! - `FetchStage`: the Direct / Proxy / Proxy+Render escalation ladder
//! - `WorkerRole`: the supervised process kinds

mod domain_config;
mod fetch_stage;
mod job_state;
mod worker_role;

// Re-export main types
pub use domain_config::{DomainConfig, ResolvedJobConfig};
pub use fetch_stage::FetchStage;
pub use job_state::{start_url, CrawlJob, JobParams, JobStatus, JobType, MAX_PAGES_LIMIT};
pub use worker_role::WorkerRole;
