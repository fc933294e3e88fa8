//! Queue listener: claims crawl jobs and runs them
//!
//! The claim protocol for one delivery:
//! 1. Decode the message (malformed bodies are buried)
//! 2. Load the job (unknown ids are deleted)
//! 3. Skip and delete when the job is not `queued` or `retrying`
//! 4. Compare-and-set the observed status to `running`; a lost race deletes
//! 5. Resolve the job's configuration once and run a coordinator
//! 6. Write the final status, then acknowledge the message
//!
//! A crash between 4 and 6 leaves the message unacknowledged; the broker
//! redelivers it after the visibility timeout.

use crate::crawler::{Coordinator, CrawlContext, CrawlOutcome};
use crate::queue::{CrawlJobMessage, Reserved, DEFAULT_PRIORITY};
use crate::state::{start_url, JobStatus, ResolvedJobConfig};
use crate::url::domain_key;
use crate::{FleetError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// The job ran; carries its final status (`running` if the run was abandoned)
    Ran(JobStatus),
    /// Not claimable or claimed elsewhere; message deleted
    Skipped,
    /// Unknown job; message deleted
    Unknown,
    /// Dead-lettered
    Buried,
    /// Cancelled mid-run and handed back for redelivery
    Released,
}

/// Claims jobs from the crawl tube, bounded by `max-concurrent-crawlers`
pub struct Listener {
    ctx: CrawlContext,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Listener {
    /// Creates a listener
    ///
    /// # Arguments
    ///
    /// * `ctx` - Shared services for job runs
    /// * `shutdown` - Stops reserving; running jobs get `shutdown-grace-secs` to finish
    pub fn new(ctx: CrawlContext, shutdown: CancellationToken) -> Self {
        let slots = Arc::new(Semaphore::new(
            ctx.config.listener.max_concurrent_crawlers.max(1),
        ));
        Self {
            ctx,
            slots,
            shutdown,
        }
    }

    /// Reserves and runs jobs until shutdown
    pub async fn run(self) -> Result<()> {
        let broker_config = self.ctx.config.broker.clone();
        let idle = broker_config.reserve_timeout();
        let jobs_cancel = CancellationToken::new();
        let mut running: JoinSet<Delivery> = JoinSet::new();

        tracing::info!(
            tube = %broker_config.crawl_tube,
            max_concurrent = self.ctx.config.listener.max_concurrent_crawlers,
            "Listener started"
        );

        loop {
            // a slot is taken before reserving, so a reserved message always has a runner
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(joined) = running.join_next() => {
                    log_joined(joined);
                    continue;
                }
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match self.ctx.store.dispatch_gate() {
                Ok(gate) if gate.paused => {
                    tracing::debug!(
                        reason = gate.reason.as_deref().unwrap_or(""),
                        "Dispatch paused, not reserving"
                    );
                    drop(permit);
                    self.idle(idle).await;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Cannot read dispatch gate: {}", e);
                    drop(permit);
                    self.idle(idle).await;
                    continue;
                }
            }

            let reserved = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                reserved = self.ctx.broker.reserve(&broker_config.crawl_tube, idle) => reserved,
            };

            match reserved {
                Ok(Some(message)) => {
                    let ctx = self.ctx.clone();
                    let cancel = jobs_cancel.clone();
                    running.spawn(async move { handle_delivery(ctx, message, cancel, permit).await });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Reserve failed: {}", e);
                    drop(permit);
                    self.idle(idle).await;
                }
            }
        }

        self.drain(running, jobs_cancel).await;
        tracing::info!("Listener stopped");
        Ok(())
    }

    async fn idle(&self, duration: Duration) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// Waits for running jobs, cancelling them once the grace period ends
    async fn drain(&self, mut running: JoinSet<Delivery>, jobs_cancel: CancellationToken) {
        if running.is_empty() {
            return;
        }

        let grace = Duration::from_secs(self.ctx.config.listener.shutdown_grace_secs);
        tracing::info!("Waiting up to {:?} for {} running jobs", grace, running.len());

        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = running.join_next() => match joined {
                    Some(joined) => log_joined(joined),
                    None => return,
                },
                _ = &mut deadline => break,
            }
        }

        tracing::warn!("Grace period over, cancelling {} jobs", running.len());
        jobs_cancel.cancel();
        while let Some(joined) = running.join_next().await {
            log_joined(joined);
        }
    }
}

fn log_joined(joined: std::result::Result<Delivery, tokio::task::JoinError>) {
    match joined {
        Ok(delivery) => tracing::debug!("Delivery finished: {:?}", delivery),
        Err(e) => tracing::error!("Job task failed: {}", e),
    }
}

/// Runs the claim protocol for one reserved message
///
/// # Arguments
///
/// * `ctx` - Shared services
/// * `message` - The reserved broker message
/// * `cancel` - Cancels the job run (end of shutdown grace)
/// * `_permit` - Concurrency slot, released when this returns
pub async fn handle_delivery(
    ctx: CrawlContext,
    message: Reserved,
    cancel: CancellationToken,
    _permit: OwnedSemaphorePermit,
) -> Delivery {
    let job_message = match CrawlJobMessage::from_bytes(&message.body) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(message_id = message.id, "Burying malformed job message: {}", e);
            bury(&ctx, message.id).await;
            return Delivery::Buried;
        }
    };
    let crawl_id = job_message.crawl_id;

    let job = match ctx.store.get_job(&crawl_id) {
        Ok(Some(job)) => job,
        Ok(None) => {
            tracing::warn!(crawl_id = %crawl_id, "Deleting message for unknown job");
            delete(&ctx, message.id).await;
            return Delivery::Unknown;
        }
        Err(e) => {
            tracing::error!(crawl_id = %crawl_id, "Job store unavailable at claim: {}", e);
            bury(&ctx, message.id).await;
            return Delivery::Buried;
        }
    };

    if !job.status.is_claimable() {
        tracing::info!(crawl_id = %crawl_id, status = %job.status, "Job not claimable, skipping");
        delete(&ctx, message.id).await;
        return Delivery::Skipped;
    }

    match ctx
        .store
        .compare_and_set_status(&crawl_id, job.status, JobStatus::Running, None)
    {
        Ok(true) => {}
        Ok(false) => {
            tracing::info!(crawl_id = %crawl_id, "Job claimed by another listener");
            delete(&ctx, message.id).await;
            return Delivery::Skipped;
        }
        Err(e) => {
            tracing::error!(crawl_id = %crawl_id, "Claim failed: {}", e);
            bury(&ctx, message.id).await;
            return Delivery::Buried;
        }
    }
    tracing::info!(crawl_id = %crawl_id, from = %job.status, "Job claimed");

    let resolved = match resolve(&ctx, &job) {
        Ok(resolved) => resolved,
        Err(e) => {
            tracing::warn!(crawl_id = %crawl_id, "Cannot resolve job: {}", e);
            let systemic = e.is_systemic();
            set_status(&ctx, &crawl_id, JobStatus::Failed, Some(&e.to_string()));
            if systemic {
                bury(&ctx, message.id).await;
                return Delivery::Buried;
            }
            delete(&ctx, message.id).await;
            return Delivery::Ran(JobStatus::Failed);
        }
    };

    let outcome = match Coordinator::new(ctx.clone(), resolved, cancel) {
        Ok(coordinator) => coordinator.with_reservation(message.id).run().await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(CrawlOutcome::Completed(_)) => {
            set_status(&ctx, &crawl_id, JobStatus::Completed, None);
            delete(&ctx, message.id).await;
            Delivery::Ran(JobStatus::Completed)
        }
        Ok(CrawlOutcome::Paused(_)) => {
            set_status(&ctx, &crawl_id, JobStatus::Paused, None);
            delete(&ctx, message.id).await;
            Delivery::Ran(JobStatus::Paused)
        }
        Ok(CrawlOutcome::Failed { reason, .. }) => {
            set_status(&ctx, &crawl_id, JobStatus::Failed, Some(&reason));
            delete(&ctx, message.id).await;
            Delivery::Ran(JobStatus::Failed)
        }
        Ok(CrawlOutcome::Abandoned { .. }) => {
            // the job's owner is now whoever moved it out of running
            delete(&ctx, message.id).await;
            Delivery::Ran(JobStatus::Running)
        }
        Ok(CrawlOutcome::Cancelled(_)) => {
            set_status(&ctx, &crawl_id, JobStatus::Retrying, Some("interrupted by shutdown"));
            if let Err(e) = ctx
                .broker
                .release(message.id, DEFAULT_PRIORITY, Duration::ZERO)
                .await
            {
                tracing::warn!(crawl_id = %crawl_id, "Failed to release job message: {}", e);
            }
            Delivery::Released
        }
        Err(e) if e.is_systemic() => {
            tracing::error!(crawl_id = %crawl_id, "Job stopped by infrastructure failure: {}", e);
            set_status(&ctx, &crawl_id, JobStatus::Failed, Some(&e.to_string()));
            bury(&ctx, message.id).await;
            Delivery::Buried
        }
        Err(e) => {
            tracing::error!(crawl_id = %crawl_id, "Job failed: {}", e);
            set_status(&ctx, &crawl_id, JobStatus::Failed, Some(&e.to_string()));
            delete(&ctx, message.id).await;
            Delivery::Ran(JobStatus::Failed)
        }
    }
}

/// Builds the run configuration from the job and its domain's learned strategy
fn resolve(ctx: &CrawlContext, job: &crate::state::CrawlJob) -> Result<ResolvedJobConfig> {
    let target = start_url(job.job_type, &job.domain_or_url)?;
    let domain = domain_key(&target)
        .ok_or_else(|| FleetError::Validation(format!("'{}' has no host", job.domain_or_url)))?;
    let learned = ctx.store.get_domain_config(&domain)?;
    ResolvedJobConfig::resolve(job, learned.as_ref())
}

/// Moves a running job to `next`, logging rather than failing
fn set_status(ctx: &CrawlContext, crawl_id: &str, next: JobStatus, message: Option<&str>) {
    match ctx
        .store
        .compare_and_set_status(crawl_id, JobStatus::Running, next, message)
    {
        Ok(true) => tracing::info!(crawl_id = %crawl_id, status = %next, "Job status updated"),
        Ok(false) => tracing::warn!(
            crawl_id = %crawl_id,
            "Job left running before it could be marked {}",
            next
        ),
        Err(e) => tracing::error!(crawl_id = %crawl_id, "Failed to mark job {}: {}", next, e),
    }
}

async fn delete(ctx: &CrawlContext, id: u64) {
    if let Err(e) = ctx.broker.delete(id).await {
        tracing::warn!(message_id = id, "Failed to delete message: {}", e);
    }
}

async fn bury(ctx: &CrawlContext, id: u64) {
    if let Err(e) = ctx.broker.bury(id).await {
        tracing::warn!(message_id = id, "Failed to bury message: {}", e);
    }
}
