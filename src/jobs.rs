//! Job submission, status and listing
//!
//! The thin contract used by the CLI and by producers embedding the crate.
//! A submitted job exists in the store before its message reaches the
//! broker, so a listener never sees a message for an unknown job unless the
//! record was removed.

use crate::config::{BrokerConfig, Config};
use crate::queue::{Broker, CrawlJobMessage, DEFAULT_PRIORITY};
use crate::state::{CrawlJob, JobParams, JobStatus};
use crate::storage::{JobFilter, JobStore};
use crate::{FleetError, Result};
use uuid::Uuid;

/// Validates, records and enqueues a new job
///
/// # Arguments
///
/// * `store` - Job store the record is written to
/// * `broker` - Broker the job message is published on
/// * `config` - Supplies the default page budget and the tube
/// * `params` - The submission
///
/// # Returns
///
/// * `Ok(String)` - The new job's `crawl_id`
/// * `Err(FleetError::Validation)` - Rejected; nothing was created
/// * `Err(FleetError)` - Store or broker failure
pub async fn submit(
    store: &dyn JobStore,
    broker: &dyn Broker,
    config: &Config,
    params: &JobParams,
) -> Result<String> {
    params.validate()?;

    let crawl_id = Uuid::new_v4().to_string();
    let job = CrawlJob::new(crawl_id.clone(), params, config.frontier.default_max_pages);
    store.insert_job(&job)?;

    if let Err(e) = publish_job(broker, &config.broker, &job).await {
        // a queued record without a message would never run
        let reason = format!("failed to enqueue: {}", e);
        if let Err(store_err) =
            store.compare_and_set_status(&crawl_id, JobStatus::Queued, JobStatus::Failed, Some(&reason))
        {
            tracing::warn!(crawl_id = %crawl_id, "Could not mark unpublished job failed: {}", store_err);
        }
        return Err(e);
    }

    tracing::info!(
        crawl_id = %crawl_id,
        job_type = %job.job_type,
        target = %job.domain_or_url,
        max_pages = job.max_pages,
        "Job submitted"
    );
    Ok(crawl_id)
}

/// Publishes a job's message on the crawl tube
pub async fn publish_job(broker: &dyn Broker, config: &BrokerConfig, job: &CrawlJob) -> Result<u64> {
    let body = CrawlJobMessage::from_job(job).to_bytes()?;
    let id = broker
        .put(
            &config.crawl_tube,
            &body,
            DEFAULT_PRIORITY,
            config.visibility_timeout(),
        )
        .await?;
    Ok(id)
}

/// Returns a job by id
pub fn status(store: &dyn JobStore, crawl_id: &str) -> Result<CrawlJob> {
    store
        .get_job(crawl_id)?
        .ok_or_else(|| FleetError::JobNotFound {
            crawl_id: crawl_id.to_string(),
        })
}

/// Lists jobs, newest first
pub fn list(store: &dyn JobStore, filter: &JobFilter) -> Result<Vec<CrawlJob>> {
    Ok(store.list_jobs(filter)?)
}

/// Asks a job to pause at its next control check
///
/// Terminal jobs are rejected with `InvalidTransition`.
pub fn request_pause(store: &dyn JobStore, crawl_id: &str) -> Result<()> {
    let job = status(store, crawl_id)?;
    if job.status.is_terminal() || job.status == JobStatus::Paused {
        return Err(FleetError::InvalidTransition {
            from: job.status,
            to: JobStatus::Paused,
        });
    }

    if !store.request_pause(crawl_id)? {
        return Err(FleetError::JobNotFound {
            crawl_id: crawl_id.to_string(),
        });
    }
    tracing::info!(crawl_id = %crawl_id, "Pause requested");
    Ok(())
}
