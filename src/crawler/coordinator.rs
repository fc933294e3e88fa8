//! Crawl coordinator - runs one claimed job to completion
//!
//! This module contains the per-job crawl loop:
//! - Seeding the frontier (homepage, robots.txt, sitemap discovery)
//! - Keeping up to `concurrency-per-domain` fetches in flight
//! - Storing each fetched page and publishing it for extraction
//! - Breadth-first link discovery
//! - Periodic control checks (reservation touch, progress, pause, stall)
//!
//! The coordinator reports how the run ended; the caller owns the job's
//! status transitions.

use crate::config::Config;
use crate::crawler::escalation::{EscalationController, FetchOutcome};
use crate::crawler::fetcher::{FetchBackend, FetchResponse};
use crate::crawler::frontier::{DiscoverySource, Frontier, FrontierEntry};
use crate::crawler::parser::extract_crawlable_links;
use crate::queue::{Broker, PageFetchedMessage, DEFAULT_PRIORITY};
use crate::robots::{robots_url, ParsedRobots};
use crate::sitemap::{SitemapDiscovery, SitemapOptions};
use crate::state::{FetchStage, JobStatus, ResolvedJobConfig};
use crate::storage::{HtmlStore, JobStore, PageRecord};
use crate::url::AllowedDomains;
use crate::FleetError;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Services a job runs against
#[derive(Clone)]
pub struct CrawlContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn JobStore>,
    pub broker: Arc<dyn Broker>,
    pub backend: Arc<dyn FetchBackend>,
    pub html: HtmlStore,
}

/// Counters of a finished run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlSummary {
    /// Unique pages fetched
    pub pages_crawled: u32,
    /// Frontier rejections
    pub pages_skipped: u32,
    /// URLs given up after dequeue (gone or exhausted)
    pub pages_dropped: u32,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum CrawlOutcome {
    Completed(CrawlSummary),
    /// A pause was requested; in-flight fetches were allowed to finish
    Paused(CrawlSummary),
    /// The homepage or single target could not be fetched
    Failed {
        reason: String,
        summary: CrawlSummary,
    },
    /// The job left `running` under the run (stall recovery or removal)
    Abandoned {
        reason: String,
        summary: CrawlSummary,
    },
    /// Cancelled by the process (shutdown)
    Cancelled(CrawlSummary),
}

enum Control {
    Continue,
    Pause,
    Abandon(String),
}

/// Runs a single job
pub struct Coordinator {
    ctx: CrawlContext,
    job: ResolvedJobConfig,
    frontier: Frontier,
    escalation: EscalationController,
    allowed: AllowedDomains,
    robots: ParsedRobots,
    cancel: CancellationToken,
    reservation: Option<u64>,
    dropped: u32,
}

impl Coordinator {
    /// Creates a coordinator for a resolved job
    ///
    /// # Arguments
    ///
    /// * `ctx` - Shared services
    /// * `job` - The job's fixed configuration
    /// * `cancel` - Cancels the run (process shutdown)
    ///
    /// # Returns
    ///
    /// * `Ok(Coordinator)` - Ready to run
    /// * `Err(FleetError::Validation)` - The start URL has no host
    pub fn new(
        ctx: CrawlContext,
        job: ResolvedJobConfig,
        cancel: CancellationToken,
    ) -> Result<Self, FleetError> {
        let allowed = AllowedDomains::for_url(&job.start_url).ok_or_else(|| {
            FleetError::Validation(format!("start URL {} has no host", job.start_url))
        })?;

        let frontier = Frontier::new(job.max_pages, ctx.config.frontier.max_queue_size);
        let escalation = EscalationController::new(
            ctx.backend.clone(),
            ctx.store.clone(),
            ctx.config.fetch.clone(),
            job.domain.clone(),
        );

        Ok(Self {
            ctx,
            job,
            frontier,
            escalation,
            allowed,
            robots: ParsedRobots::allow_all(),
            cancel,
            reservation: None,
            dropped: 0,
        })
    }

    /// Broker message to keep reserved while the job runs
    pub fn with_reservation(mut self, message_id: u64) -> Self {
        self.reservation = Some(message_id);
        self
    }

    /// Runs the job until it finishes, pauses, fails or is cancelled
    ///
    /// # Returns
    ///
    /// * `Ok(CrawlOutcome)` - How the run ended
    /// * `Err(FleetError)` - A store, broker or disk failure stopped the run
    pub async fn run(mut self) -> Result<CrawlOutcome, FleetError> {
        tracing::info!(
            crawl_id = %self.job.crawl_id,
            start_url = %self.job.start_url,
            max_pages = self.job.max_pages,
            stage = %self.job.start_stage(),
            "Starting crawl"
        );

        let cancel = self.cancel.clone();
        tokio::select! {
            _ = cancel.cancelled() => return Ok(CrawlOutcome::Cancelled(self.summary())),
            seeded = self.seed() => seeded?,
        }

        // fetch tasks observe this; cancelling it never cancels the caller's token
        let fetch_cancel = self.cancel.child_token();
        let mut fetches: JoinSet<(FrontierEntry, FetchOutcome)> = JoinSet::new();
        let concurrency = self.ctx.config.frontier.concurrency_per_domain.max(1);

        let period = Duration::from_secs(self.ctx.config.frontier.control_poll_secs.max(1));
        let mut control = interval_at(Instant::now() + period, period);
        control.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut paused = false;

        let outcome = loop {
            if !paused {
                while fetches.len() < concurrency && !self.frontier.reached_limit() {
                    let Some(entry) = self.frontier.dequeue() else {
                        break;
                    };
                    self.spawn_fetch(&mut fetches, entry, &fetch_cancel);
                }
            }

            if fetches.is_empty() {
                if paused {
                    tracing::info!(crawl_id = %self.job.crawl_id, "Crawl paused");
                    break CrawlOutcome::Paused(self.summary());
                }
                if self.frontier.queued_len() == 0 || self.frontier.reached_limit() {
                    self.frontier.discard_queued();
                    break CrawlOutcome::Completed(self.summary());
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    fetches.abort_all();
                    tracing::info!(crawl_id = %self.job.crawl_id, "Crawl cancelled");
                    break CrawlOutcome::Cancelled(self.summary());
                }
                _ = control.tick() => {
                    match self.poll_control().await {
                        Control::Continue => {}
                        Control::Pause => {
                            if !paused {
                                tracing::info!(
                                    crawl_id = %self.job.crawl_id,
                                    in_flight = fetches.len(),
                                    "Pause requested, draining in-flight fetches"
                                );
                            }
                            paused = true;
                        }
                        Control::Abandon(reason) => {
                            fetch_cancel.cancel();
                            fetches.abort_all();
                            tracing::warn!(crawl_id = %self.job.crawl_id, "Abandoning crawl: {}", reason);
                            break CrawlOutcome::Abandoned { reason, summary: self.summary() };
                        }
                    }
                }
                Some(joined) = fetches.join_next() => {
                    let (entry, outcome) = match joined {
                        Ok(result) => result,
                        Err(e) => {
                            tracing::error!(crawl_id = %self.job.crawl_id, "Fetch task failed: {}", e);
                            continue;
                        }
                    };
                    match self.handle_fetch(entry, outcome).await {
                        Ok(None) => {}
                        Ok(Some(end)) => {
                            fetch_cancel.cancel();
                            fetches.abort_all();
                            break end;
                        }
                        Err(e) => {
                            fetch_cancel.cancel();
                            fetches.abort_all();
                            return Err(e);
                        }
                    }
                }
            }
        };

        self.flush_progress();

        let summary = self.summary();
        tracing::info!(
            crawl_id = %self.job.crawl_id,
            pages_crawled = summary.pages_crawled,
            pages_skipped = summary.pages_skipped,
            pages_dropped = summary.pages_dropped,
            "Crawl finished: {:?}",
            OutcomeKind(&outcome)
        );
        Ok(outcome)
    }

    /// Enqueues the homepage, reads robots.txt and runs sitemap discovery
    async fn seed(&mut self) -> Result<(), FleetError> {
        let home = self.job.start_url.clone();
        self.frontier.enqueue(home.clone(), 0, DiscoverySource::Homepage);

        if !self.job.follows_links() {
            return Ok(());
        }

        let respect_robots = self.ctx.config.frontier.respect_robots;
        if self.job.use_sitemap || respect_robots {
            self.robots = self.fetch_robots().await;
        }

        if !self.job.use_sitemap {
            return Ok(());
        }

        let options = SitemapOptions::from(&self.ctx.config.frontier);
        let discovery = SitemapDiscovery::new(self.ctx.backend.as_ref(), self.support_stage(), options);
        let urls = discovery.discover(&home, &self.robots.sitemaps(), Utc::now()).await;

        let mut added = 0usize;
        for url in urls {
            if !self.frontier.has_budget() {
                break;
            }
            if !self.allowed.allows(&url) || !self.robots_allow(&url) {
                self.frontier.record_skip();
                continue;
            }
            if self.frontier.enqueue(url, 1, DiscoverySource::Sitemap) {
                added += 1;
            }
        }
        tracing::info!(crawl_id = %self.job.crawl_id, "Seeded {} URLs from sitemap", added);

        if let Err(e) = self.ctx.store.mark_sitemap_checked(&self.job.domain, Utc::now()) {
            tracing::warn!("Failed to record sitemap check for {}: {}", self.job.domain, e);
        }
        Ok(())
    }

    /// Stage used for robots.txt and sitemaps; XML is never rendered
    fn support_stage(&self) -> FetchStage {
        self.job.start_stage().min(FetchStage::Proxy)
    }

    async fn fetch_robots(&self) -> ParsedRobots {
        let url = robots_url(&self.job.start_url);
        match self.ctx.backend.fetch(&url, self.support_stage()).await {
            Ok(response) if (200..300).contains(&response.status_code) => {
                ParsedRobots::from_content(&response.body)
            }
            Ok(response) => {
                tracing::debug!("robots.txt returned {}, allowing all", response.status_code);
                ParsedRobots::allow_all()
            }
            Err(e) => {
                tracing::debug!("robots.txt unavailable ({}), allowing all", e);
                ParsedRobots::allow_all()
            }
        }
    }

    fn robots_allow(&self, url: &url::Url) -> bool {
        !self.ctx.config.frontier.respect_robots
            || self
                .robots
                .is_allowed(url.as_str(), &self.ctx.config.user_agent.crawler_name)
    }

    fn spawn_fetch(
        &self,
        fetches: &mut JoinSet<(FrontierEntry, FetchOutcome)>,
        entry: FrontierEntry,
        cancel: &CancellationToken,
    ) {
        let escalation = self.escalation.clone();
        let stage = self.job.start_stage();
        let cancel = cancel.clone();

        tracing::debug!(crawl_id = %self.job.crawl_id, url = %entry.url, "Fetching");
        fetches.spawn(async move {
            let outcome = escalation.fetch(&entry.url, stage, &cancel).await;
            (entry, outcome)
        });
    }

    /// Applies one fetch result; returns an outcome when the job must end
    async fn handle_fetch(
        &mut self,
        entry: FrontierEntry,
        outcome: FetchOutcome,
    ) -> Result<Option<CrawlOutcome>, FleetError> {
        let is_target = entry.source == DiscoverySource::Homepage;

        match outcome {
            FetchOutcome::Fetched {
                response, stage, ..
            } => {
                self.frontier.complete(&entry.url);
                self.store_page(&entry, &response, stage).await?;

                if self.job.follows_links() && response.is_html() && !self.frontier.reached_limit() {
                    self.discover_links(&entry, &response);
                }
                if self.frontier.reached_limit() {
                    let discarded = self.frontier.discard_queued();
                    tracing::info!(
                        crawl_id = %self.job.crawl_id,
                        "Reached max pages ({}), discarded {} queued URLs",
                        self.job.max_pages,
                        discarded
                    );
                }
                Ok(None)
            }
            FetchOutcome::Gone { status_code, .. } => {
                self.frontier.drop_url(&entry.url);
                self.dropped += 1;
                tracing::debug!(url = %entry.url, "Dropping URL ({})", status_code);
                if is_target {
                    return Ok(Some(self.fail(format!(
                        "{} returned {}",
                        entry.url, status_code
                    ))));
                }
                Ok(None)
            }
            FetchOutcome::Exhausted { attempts } => {
                self.frontier.drop_url(&entry.url);
                self.dropped += 1;
                tracing::warn!(
                    url = %entry.url,
                    attempts = attempts.len(),
                    "Dropping URL after exhausting fetch stages"
                );
                if is_target {
                    let error = FleetError::FetchExhausted {
                        url: entry.url.to_string(),
                    };
                    return Ok(Some(self.fail(error.to_string())));
                }
                Ok(None)
            }
            FetchOutcome::Cancelled { .. } => {
                self.frontier.drop_url(&entry.url);
                Ok(None)
            }
        }
    }

    fn fail(&self, reason: String) -> CrawlOutcome {
        CrawlOutcome::Failed {
            reason,
            summary: self.summary(),
        }
    }

    fn discover_links(&mut self, entry: &FrontierEntry, response: &FetchResponse) {
        let links = extract_crawlable_links(&response.body, &response.final_url, &self.allowed);
        let mut added = 0usize;

        for link in links {
            if !self.robots_allow(&link) {
                self.frontier.record_skip();
                continue;
            }
            if self
                .frontier
                .enqueue(link, entry.depth + 1, DiscoverySource::Link)
            {
                added += 1;
            }
        }

        tracing::debug!(url = %entry.url, "Discovered {} new links", added);
    }

    /// Writes the body to disk, records the page and publishes it
    async fn store_page(
        &self,
        entry: &FrontierEntry,
        response: &FetchResponse,
        stage: FetchStage,
    ) -> Result<(), FleetError> {
        let url = entry.url.as_str();
        let html_ref = self
            .ctx
            .html
            .save(&self.job.crawl_id, url, &response.body)
            .await?;

        self.ctx.store.record_page(&PageRecord {
            crawl_id: self.job.crawl_id.clone(),
            url: url.to_string(),
            fetch_stage: stage,
            status_code: response.status_code,
            html_ref: html_ref.clone(),
            fetched_at: Utc::now(),
        })?;

        let message = PageFetchedMessage {
            crawl_id: self.job.crawl_id.clone(),
            url: url.to_string(),
            html_ref,
            fetch_stage: stage.as_u8(),
            status_code: response.status_code,
            headers: response.headers.clone(),
        };
        let broker = &self.ctx.config.broker;
        self.ctx
            .broker
            .put(
                &broker.page_tube,
                &message.to_bytes()?,
                DEFAULT_PRIORITY,
                broker.visibility_timeout(),
            )
            .await?;

        tracing::info!(
            crawl_id = %self.job.crawl_id,
            url = %url,
            stage = %stage,
            "Page fetched"
        );
        Ok(())
    }

    /// Touches the reservation, flushes counters and reads the job's control state
    async fn poll_control(&self) -> Control {
        if let Some(id) = self.reservation {
            if let Err(e) = self.ctx.broker.touch(id).await {
                tracing::warn!(crawl_id = %self.job.crawl_id, "Failed to touch job message: {}", e);
            }
        }

        self.flush_progress();

        match self.ctx.store.get_job(&self.job.crawl_id) {
            Ok(Some(job)) if job.status != JobStatus::Running => {
                Control::Abandon(format!("job status is now {}", job.status))
            }
            Ok(Some(job)) if job.pause_requested => Control::Pause,
            Ok(Some(_)) => Control::Continue,
            Ok(None) => Control::Abandon("job record no longer exists".to_string()),
            Err(e) => {
                tracing::warn!(crawl_id = %self.job.crawl_id, "Control check failed: {}", e);
                Control::Continue
            }
        }
    }

    fn flush_progress(&self) {
        if let Err(e) = self.ctx.store.update_progress(
            &self.job.crawl_id,
            self.frontier.unique_pages(),
            self.frontier.skipped(),
        ) {
            tracing::warn!(crawl_id = %self.job.crawl_id, "Failed to flush progress: {}", e);
        }
    }

    fn summary(&self) -> CrawlSummary {
        CrawlSummary {
            pages_crawled: self.frontier.unique_pages(),
            pages_skipped: self.frontier.skipped(),
            pages_dropped: self.dropped,
        }
    }
}

/// Outcome name without the summary, for logging
struct OutcomeKind<'a>(&'a CrawlOutcome);

impl std::fmt::Debug for OutcomeKind<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self.0 {
            CrawlOutcome::Completed(_) => "completed",
            CrawlOutcome::Paused(_) => "paused",
            CrawlOutcome::Failed { .. } => "failed",
            CrawlOutcome::Abandoned { .. } => "abandoned",
            CrawlOutcome::Cancelled(_) => "cancelled",
        };
        f.write_str(name)
    }
}
