//! Health monitor loop
//!
//! Every probe interval the monitor:
//! - Probes each dependency and feeds its circuit breaker
//! - Pauses dispatch while any breaker is open or half-open, resumes otherwise
//! - Summarizes worker liveness from heartbeats
//! - Warns about crawl backlog and dead-lettered messages
//! - Moves stalled running jobs back to the queue, or fails them once their
//!   retries are spent
//!
//! The monitor never runs jobs itself.

use super::breaker::{BreakerState, CircuitBreaker};
use super::probes::{BrokerProbe, Probe, StoreProbe};
use super::report::{HealthReport, HealthSink, HealthStatus};
use crate::config::Config;
use crate::queue::Broker;
use crate::state::JobStatus;
use crate::storage::{JobFilter, JobStore};
use crate::{FleetError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Prefix of every gate reason the monitor writes
pub const GATE_REASON_PREFIX: &str = "circuit open";

struct Watched {
    probe: Arc<dyn Probe>,
    breaker: CircuitBreaker,
}

/// What one monitor cycle did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleSummary {
    pub dispatch_paused: bool,
    pub stale_workers: usize,
    pub stalled_requeued: usize,
    pub stalled_failed: usize,
}

pub struct HealthMonitor {
    config: Arc<Config>,
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    sink: Arc<dyn HealthSink>,
    watched: Vec<Watched>,
}

impl HealthMonitor {
    /// Creates a monitor probing the job store and the broker
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        sink: Arc<dyn HealthSink>,
    ) -> Self {
        let probes: Vec<Arc<dyn Probe>> = vec![
            Arc::new(StoreProbe::new(store.clone())),
            Arc::new(BrokerProbe::new(broker.clone())),
        ];
        Self::with_probes(config, store, broker, sink, probes)
    }

    /// Creates a monitor with an explicit probe set
    pub fn with_probes(
        config: Arc<Config>,
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        sink: Arc<dyn HealthSink>,
        probes: Vec<Arc<dyn Probe>>,
    ) -> Self {
        let watched = probes
            .into_iter()
            .map(|probe| Watched {
                probe,
                breaker: CircuitBreaker::new(
                    config.monitor.failure_threshold,
                    config.monitor.success_threshold,
                ),
            })
            .collect();

        Self {
            config,
            store,
            broker,
            sink,
            watched,
        }
    }

    /// Current breaker state of a component
    pub fn breaker_state(&self, component: &str) -> Option<BreakerState> {
        self.watched
            .iter()
            .find(|w| w.probe.component() == component)
            .map(|w| w.breaker.state())
    }

    /// Runs cycles every `probe-interval-secs` until cancelled
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let interval = Duration::from_secs(self.config.monitor.probe_interval_secs.max(1));
        let mut ticker = tokio::time::interval(interval);
        tracing::info!("Health monitor started (interval {:?})", interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let summary = self.run_cycle(Utc::now()).await;
                    tracing::debug!("Monitor cycle: {:?}", summary);
                }
            }
        }

        tracing::info!("Health monitor stopped");
        Ok(())
    }

    /// Runs one monitoring cycle as of `now`
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> CycleSummary {
        let blocking = self.probe_dependencies().await;
        let mut summary = CycleSummary {
            dispatch_paused: !blocking.is_empty(),
            ..CycleSummary::default()
        };

        self.sync_gate(&blocking);
        summary.stale_workers = self.check_workers(now);
        self.check_backlog().await;

        if blocking.is_empty() {
            let (requeued, failed) = self.recover_stalled(now).await;
            summary.stalled_requeued = requeued;
            summary.stalled_failed = failed;
        }
        summary
    }

    /// Returns the components whose breakers hold dispatch paused
    async fn probe_dependencies(&mut self) -> Vec<String> {
        let mut blocking = Vec::new();

        for watched in &mut self.watched {
            let component = watched.probe.component().to_string();
            let result = watched.probe.check().await;
            let before = watched.breaker.state();
            let after = watched.breaker.record(result.is_ok());

            let status = match (&result, after) {
                (Ok(()), BreakerState::Closed) => HealthStatus::Healthy,
                (Ok(()), _) => HealthStatus::Degraded,
                (Err(_), _) => HealthStatus::Unhealthy,
            };
            let detail = match &result {
                Ok(()) => format!("ok (circuit {})", after),
                Err(e) => format!("{} (circuit {})", e, after),
            };
            self.sink.report(&HealthReport::new(&component, status, detail));

            if before != after {
                tracing::warn!(component = %component, "Circuit {} -> {}", before, after);
            }
            if after.blocks_dispatch() {
                blocking.push(component);
            }
        }
        blocking
    }

    /// Writes the dispatch gate when it differs from the breakers' verdict
    ///
    /// Only gates the monitor closed itself are reopened; a pause written by
    /// the orchestrator or an operator stays.
    fn sync_gate(&self, blocking: &[String]) {
        let paused = !blocking.is_empty();
        let current = match self.store.dispatch_gate() {
            Ok(gate) => gate,
            Err(e) => {
                tracing::warn!("Cannot read dispatch gate: {}", e);
                return;
            }
        };
        if current.paused == paused {
            return;
        }
        let ours = current
            .reason
            .as_deref()
            .is_some_and(|r| r.starts_with(GATE_REASON_PREFIX));
        if !paused && !ours {
            tracing::debug!(
                reason = current.reason.as_deref().unwrap_or(""),
                "Dispatch paused elsewhere, leaving gate"
            );
            return;
        }

        let reason = if paused {
            Some(format!("{}: {}", GATE_REASON_PREFIX, blocking.join(", ")))
        } else {
            None
        };
        match self.store.set_dispatch_paused(paused, reason.as_deref()) {
            Ok(()) if paused => {
                tracing::warn!(reason = reason.as_deref().unwrap_or(""), "Dispatch paused");
                self.sink.report(&HealthReport::new(
                    "dispatch",
                    HealthStatus::Degraded,
                    reason.unwrap_or_default(),
                ));
            }
            Ok(()) => {
                tracing::info!("Dispatch resumed");
                self.sink.report(&HealthReport::new("dispatch", HealthStatus::Healthy, "resumed"));
            }
            Err(e) => tracing::error!("Failed to write dispatch gate: {}", e),
        }
    }

    /// Reports workers whose heartbeat went stale; returns their count
    fn check_workers(&self, now: DateTime<Utc>) -> usize {
        let beats = match self.store.heartbeats() {
            Ok(beats) => beats,
            Err(e) => {
                tracing::warn!("Cannot read heartbeats: {}", e);
                return 0;
            }
        };

        let stale_after = self.config.supervisor.heartbeat_stale_secs as i64;
        let stale: Vec<String> = beats
            .iter()
            .filter(|b| (now - b.beat_at).num_seconds() > stale_after)
            .map(|b| format!("{}#{}", b.role, b.slot))
            .collect();

        let (status, detail) = if stale.is_empty() {
            (HealthStatus::Healthy, format!("{} workers reporting", beats.len()))
        } else {
            (HealthStatus::Degraded, format!("stale heartbeats: {}", stale.join(", ")))
        };
        self.sink.report(&HealthReport::new("workers", status, detail));
        stale.len()
    }

    async fn check_backlog(&self) {
        let broker_config = &self.config.broker;
        for tube in [&broker_config.crawl_tube, &broker_config.page_tube] {
            let stats = match self.broker.stats_tube(tube).await {
                Ok(stats) => stats,
                Err(e) => {
                    tracing::debug!(tube = %tube, "Cannot read tube stats: {}", e);
                    continue;
                }
            };

            if *tube == broker_config.crawl_tube && stats.ready > self.config.monitor.backlog_warning {
                self.sink.report(&HealthReport::new(
                    "backlog",
                    HealthStatus::Degraded,
                    format!("{} ready jobs on {}", stats.ready, tube),
                ));
            }
            if stats.buried > 0 {
                self.sink.report(&HealthReport::new(
                    "backlog",
                    HealthStatus::Degraded,
                    format!("{} buried messages on {}", stats.buried, tube),
                ));
            }
        }
    }

    /// Handles running jobs past the job timeout; returns (requeued, failed)
    async fn recover_stalled(&self, now: DateTime<Utc>) -> (usize, usize) {
        let running = match self.store.list_jobs(&JobFilter::with_status(JobStatus::Running)) {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!("Cannot list running jobs: {}", e);
                return (0, 0);
            }
        };

        let timeout = self.config.monitor.job_timeout_secs as i64;
        let mut requeued = 0;
        let mut failed = 0;

        for job in running {
            let Some(elapsed) = job.running_for_secs(now) else {
                continue;
            };
            if elapsed <= timeout {
                continue;
            }

            if job.retry_count >= self.config.monitor.max_job_retries {
                let error = FleetError::Timeout {
                    crawl_id: job.crawl_id.clone(),
                    elapsed_secs: elapsed,
                };
                match self.store.compare_and_set_status(
                    &job.crawl_id,
                    JobStatus::Running,
                    JobStatus::Failed,
                    Some(&error.to_string()),
                ) {
                    Ok(true) => {
                        failed += 1;
                        self.sink.report(&HealthReport::new(
                            "jobs",
                            HealthStatus::Unhealthy,
                            format!("{} (retries exhausted)", error),
                        ));
                    }
                    Ok(false) => {}
                    Err(e) => tracing::error!(crawl_id = %job.crawl_id, "Failed to fail stalled job: {}", e),
                }
                continue;
            }

            match self.requeue(&job.crawl_id, elapsed).await {
                Ok(true) => requeued += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(crawl_id = %job.crawl_id, "Failed to requeue stalled job: {}", e),
            }
        }
        (requeued, failed)
    }

    /// Moves a stalled job to `retrying` and publishes it again
    async fn requeue(&self, crawl_id: &str, elapsed: i64) -> Result<bool> {
        let reason = format!("stalled after {}s", elapsed);
        if !self.store.compare_and_set_status(
            crawl_id,
            JobStatus::Running,
            JobStatus::Retrying,
            Some(&reason),
        )? {
            return Ok(false);
        }
        let retries = self.store.increment_retry_count(crawl_id)?;

        let job = crate::jobs::status(self.store.as_ref(), crawl_id)?;
        if let Err(e) = crate::jobs::publish_job(self.broker.as_ref(), &self.config.broker, &job).await {
            let message = format!("requeue failed: {}", e);
            self.store.compare_and_set_status(
                crawl_id,
                JobStatus::Retrying,
                JobStatus::Failed,
                Some(&message),
            )?;
            return Err(e);
        }

        tracing::warn!(crawl_id = %crawl_id, retries, elapsed_secs = elapsed, "Stalled job requeued");
        self.sink.report(&HealthReport::new(
            "jobs",
            HealthStatus::Degraded,
            format!("job {} {}, requeued (retry {})", crawl_id, reason, retries),
        ));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StoreConfig, UserAgentConfig};
    use crate::health::MemorySink;
    use crate::queue::{CrawlJobMessage, MemoryBroker};
    use crate::state::{CrawlJob, JobParams};
    use crate::storage::SqliteStore;

    fn create_test_config() -> Config {
        let mut config = Config {
            store: StoreConfig {
                database_path: ":memory:".to_string(),
                html_dir: "html".to_string(),
            },
            broker: Default::default(),
            frontier: Default::default(),
            fetch: Default::default(),
            user_agent: UserAgentConfig {
                crawler_name: "TestCrawler".to_string(),
                crawler_version: "1.0".to_string(),
                contact_url: "https://example.com/about".to_string(),
                contact_email: "admin@example.com".to_string(),
            },
            listener: Default::default(),
            supervisor: Default::default(),
            monitor: Default::default(),
        };
        config.monitor.job_timeout_secs = 60;
        config.monitor.max_job_retries = 1;
        config.monitor.backlog_warning = 1;
        config
    }

    struct Fixture {
        monitor: HealthMonitor,
        store: Arc<SqliteStore>,
        broker: Arc<MemoryBroker>,
        sink: Arc<MemorySink>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::new_in_memory().unwrap());
        let broker = Arc::new(MemoryBroker::new());
        let sink = Arc::new(MemorySink::new());
        let monitor = HealthMonitor::new(
            Arc::new(create_test_config()),
            store.clone(),
            broker.clone(),
            sink.clone(),
        );
        Fixture {
            monitor,
            store,
            broker,
            sink,
        }
    }

    fn running_job(store: &SqliteStore, crawl_id: &str) {
        let job = CrawlJob::new(crawl_id.to_string(), &JobParams::domain("example.com"), 50);
        store.insert_job(&job).unwrap();
        store
            .compare_and_set_status(crawl_id, JobStatus::Queued, JobStatus::Running, None)
            .unwrap();
    }

    #[tokio::test]
    async fn test_healthy_cycle_keeps_dispatch_open() {
        let mut f = fixture();
        let summary = f.monitor.run_cycle(Utc::now()).await;
        assert!(!summary.dispatch_paused);
        assert!(!f.store.dispatch_gate().unwrap().paused);
        assert_eq!(f.monitor.breaker_state("broker"), Some(BreakerState::Closed));
        assert!(f.sink.with_status(HealthStatus::Unhealthy).is_empty());
    }

    #[tokio::test]
    async fn test_healthy_cycle_keeps_foreign_pause() {
        let mut f = fixture();
        for reason in [crate::orchestrator::SHUTDOWN_REASON, "operator hold"] {
            f.store.set_dispatch_paused(true, Some(reason)).unwrap();
            f.monitor.run_cycle(Utc::now()).await;

            let gate = f.store.dispatch_gate().unwrap();
            assert!(gate.paused);
            assert_eq!(gate.reason.as_deref(), Some(reason));
        }
    }

    #[tokio::test]
    async fn test_broker_outage_pauses_then_resumes_dispatch() {
        let mut f = fixture();
        f.broker.set_available(false);

        for _ in 0..2 {
            assert!(!f.monitor.run_cycle(Utc::now()).await.dispatch_paused);
        }
        assert!(f.monitor.run_cycle(Utc::now()).await.dispatch_paused);
        let gate = f.store.dispatch_gate().unwrap();
        assert!(gate.paused);
        assert!(gate.reason.unwrap().contains("broker"));

        f.broker.set_available(true);
        assert!(f.monitor.run_cycle(Utc::now()).await.dispatch_paused);
        assert_eq!(f.monitor.breaker_state("broker"), Some(BreakerState::HalfOpen));
        assert!(!f.monitor.run_cycle(Utc::now()).await.dispatch_paused);
        assert!(!f.store.dispatch_gate().unwrap().paused);
    }

    #[tokio::test]
    async fn test_stalled_job_requeued_then_failed() {
        let mut f = fixture();
        running_job(&f.store, "c-1");
        let later = Utc::now() + chrono::Duration::seconds(120);

        let summary = f.monitor.run_cycle(later).await;
        assert_eq!(summary.stalled_requeued, 1);
        let job = f.store.get_job("c-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.retry_count, 1);

        let reserved = f
            .broker
            .reserve("crawl_jobs", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(CrawlJobMessage::from_bytes(&reserved.body).unwrap().crawl_id, "c-1");

        // claimed again, stalls again: retries are spent
        f.store
            .compare_and_set_status("c-1", JobStatus::Retrying, JobStatus::Running, None)
            .unwrap();
        let summary = f.monitor.run_cycle(later + chrono::Duration::seconds(120)).await;
        assert_eq!(summary.stalled_failed, 1);
        let job = f.store.get_job("c-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error_message.unwrap().contains("stalled"));
    }

    #[tokio::test]
    async fn test_job_within_timeout_untouched() {
        let mut f = fixture();
        running_job(&f.store, "c-1");
        let summary = f.monitor.run_cycle(Utc::now()).await;
        assert_eq!(summary.stalled_requeued + summary.stalled_failed, 0);
        assert_eq!(f.store.get_job("c-1").unwrap().unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_stale_heartbeat_reported() {
        let mut f = fixture();
        f.store.record_heartbeat("extractor", 0, 4242).unwrap();
        let later = Utc::now() + chrono::Duration::seconds(3600);
        assert_eq!(f.monitor.run_cycle(later).await.stale_workers, 1);
        assert!(f
            .sink
            .with_status(HealthStatus::Degraded)
            .iter()
            .any(|r| r.component == "workers" && r.detail.contains("extractor#0")));
    }

    #[tokio::test]
    async fn test_buried_messages_reported() {
        let mut f = fixture();
        f.broker
            .put("page_fetched", b"x", 1, Duration::from_secs(60))
            .await
            .unwrap();
        let id = f
            .broker
            .reserve("page_fetched", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap()
            .id;
        f.broker.bury(id).await.unwrap();

        f.monitor.run_cycle(Utc::now()).await;
        assert!(f
            .sink
            .reports()
            .iter()
            .any(|r| r.component == "backlog" && r.detail.contains("buried")));
    }
}
