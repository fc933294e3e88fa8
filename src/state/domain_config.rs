/// Learned per-domain fetch strategy and the per-job configuration resolved from it
use crate::state::{start_url, CrawlJob, FetchStage, JobType};
use crate::url::domain_key;
use crate::FleetError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Strategy the fleet has learned for one domain
///
/// Flags only ever move from `false` to `true`: once a domain needed the
/// proxy, later jobs start there instead of re-discovering it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Lowercase host with any `www.` prefix stripped
    pub domain: String,
    pub use_proxy: bool,
    pub use_js_rendering: bool,
    pub last_sitemap_check_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl DomainConfig {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            use_proxy: false,
            use_js_rendering: false,
            last_sitemap_check_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Stage the next job on this domain should start from
    pub fn start_stage(&self) -> FetchStage {
        FetchStage::from_flags(self.use_proxy, self.use_js_rendering)
    }
}

/// Configuration of one claimed job, fixed for the job's lifetime
///
/// Explicit submission overrides win; unset flags fall back to the domain's
/// learned config, then to `false`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedJobConfig {
    pub crawl_id: String,
    pub job_type: JobType,
    pub start_url: Url,
    /// Domain key used for allowed-domain checks and domain config updates
    pub domain: String,
    pub max_pages: u32,
    pub use_sitemap: bool,
    pub use_proxy: bool,
    pub use_js_rendering: bool,
}

impl ResolvedJobConfig {
    /// Resolves a job against the learned config of its domain
    ///
    /// # Arguments
    ///
    /// * `job` - The job as loaded at claim time
    /// * `learned` - The domain's stored config, if any
    ///
    /// # Returns
    ///
    /// * `Ok(ResolvedJobConfig)` - Immutable configuration for the run
    /// * `Err(FleetError::Validation)` - The stored target is unusable
    pub fn resolve(job: &CrawlJob, learned: Option<&DomainConfig>) -> Result<Self, FleetError> {
        let start_url = start_url(job.job_type, &job.domain_or_url)?;
        let domain = domain_key(&start_url).ok_or_else(|| {
            FleetError::Validation(format!("'{}' has no host", job.domain_or_url))
        })?;

        let learned_proxy = learned.map_or(false, |c| c.use_proxy);
        let learned_render = learned.map_or(false, |c| c.use_js_rendering);

        let single = job.job_type == JobType::SingleUrl;

        Ok(Self {
            crawl_id: job.crawl_id.clone(),
            job_type: job.job_type,
            start_url,
            domain,
            max_pages: if single { 1 } else { job.max_pages.max(1) },
            use_sitemap: job.use_sitemap && !single,
            use_proxy: job.use_proxy.unwrap_or(learned_proxy),
            use_js_rendering: job.use_js_rendering.unwrap_or(learned_render),
        })
    }

    pub fn start_stage(&self) -> FetchStage {
        FetchStage::from_flags(self.use_proxy, self.use_js_rendering)
    }

    /// Whether link discovery runs after each page
    pub fn follows_links(&self) -> bool {
        self.job_type == JobType::Domain
    }
}
