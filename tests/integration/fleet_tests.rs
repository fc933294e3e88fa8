//! Integration tests for fleet coordination
//!
//! Stage escalation with learned domain strategy, the dispatch circuit
//! between monitor and listener, worker restart policy, and claim
//! exclusivity between concurrent deliveries.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sumi_fleet::config::{Config, StoreConfig, SupervisorConfig, UserAgentConfig};
use sumi_fleet::crawler::{CrawlContext, FetchBackend, FetchError, FetchResponse};
use sumi_fleet::health::{BreakerState, HealthMonitor, HealthStatus, MemorySink};
use sumi_fleet::jobs;
use sumi_fleet::queue::{Broker, CrawlJobMessage, MemoryBroker, DEFAULT_PRIORITY};
use sumi_fleet::state::{FetchStage, JobParams, JobStatus, WorkerRole};
use sumi_fleet::storage::{HtmlStore, JobStore, SqliteStore};
use sumi_fleet::supervisor::{
    ExitInfo, Supervisor, SupervisorEvent, WorkerHandle, WorkerLauncher, WorkerSpec,
};
use sumi_fleet::worker::{handle_delivery, Delivery, Listener};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use url::Url;

fn create_test_config(html_dir: &std::path::Path) -> Config {
    let mut config = Config {
        store: StoreConfig {
            database_path: ":memory:".to_string(),
            html_dir: html_dir.to_string_lossy().into_owned(),
        },
        broker: Default::default(),
        frontier: Default::default(),
        fetch: Default::default(),
        user_agent: UserAgentConfig {
            crawler_name: "TestBot".to_string(),
            crawler_version: "1.0.0".to_string(),
            contact_url: "https://example.com/contact".to_string(),
            contact_email: "test@example.com".to_string(),
        },
        listener: Default::default(),
        supervisor: Default::default(),
        monitor: Default::default(),
    };
    config.broker.reserve_timeout_secs = 1;
    config.frontier.control_poll_secs = 1;
    config.fetch.retry_delay_ms = 10;
    config.monitor.failure_threshold = 3;
    config.monitor.success_threshold = 2;
    config
}

fn html(links: &[&str]) -> String {
    let anchors: String = links
        .iter()
        .map(|href| format!(r#"<a href="{}">link</a> "#, href))
        .collect();
    format!(
        "<html><body><p>{}</p>{}</body></html>",
        "Readable page text for the crawler. ".repeat(10),
        anchors
    )
}

/// `shop.example` where `/app` is only served to the rendering stage
struct GuardedSite {
    requests: Mutex<Vec<(String, FetchStage)>>,
}

impl GuardedSite {
    fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
        }
    }

    fn stages_for(&self, path: &str) -> Vec<FetchStage> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, s)| *s)
            .collect()
    }
}

#[async_trait]
impl FetchBackend for GuardedSite {
    async fn fetch(&self, url: &Url, stage: FetchStage) -> Result<FetchResponse, FetchError> {
        self.requests
            .lock()
            .unwrap()
            .push((url.path().to_string(), stage));

        let (status_code, body) = match url.path() {
            "/" => (200, html(&["/app"])),
            "/app" if stage == FetchStage::ProxyRender => (200, html(&[])),
            "/app" => (403, "Forbidden".to_string()),
            _ => (404, String::new()),
        };

        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "text/html".to_string());
        Ok(FetchResponse {
            final_url: url.clone(),
            status_code,
            headers,
            body,
        })
    }
}

struct Harness {
    ctx: CrawlContext,
    store: Arc<SqliteStore>,
    broker: Arc<MemoryBroker>,
    _dir: tempfile::TempDir,
}

fn harness(backend: Arc<dyn FetchBackend>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::new_in_memory().unwrap());
    let broker = Arc::new(MemoryBroker::new());
    Harness {
        ctx: CrawlContext {
            config: Arc::new(create_test_config(dir.path())),
            store: store.clone(),
            broker: broker.clone(),
            backend,
            html: HtmlStore::new(dir.path()),
        },
        store,
        broker,
        _dir: dir,
    }
}

async fn reserve_job(broker: &MemoryBroker) -> sumi_fleet::queue::Reserved {
    broker
        .reserve("crawl_jobs", Duration::from_millis(50))
        .await
        .unwrap()
        .expect("job message")
}

fn permit() -> tokio::sync::OwnedSemaphorePermit {
    Arc::new(Semaphore::new(1)).try_acquire_owned().unwrap()
}

async fn wait_for_status(store: &SqliteStore, crawl_id: &str, wanted: JobStatus) -> JobStatus {
    let mut status = store.get_job(crawl_id).unwrap().unwrap().status;
    for _ in 0..100 {
        if status == wanted {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        status = store.get_job(crawl_id).unwrap().unwrap().status;
    }
    status
}

#[tokio::test]
async fn test_escalation_to_render_is_learned_by_domain() {
    let site = Arc::new(GuardedSite::new());
    let h = harness(site.clone());

    let mut params = JobParams::domain("shop.example");
    params.use_sitemap = false;
    let crawl_id = jobs::submit(h.store.as_ref(), h.broker.as_ref(), &h.ctx.config, &params)
        .await
        .unwrap();

    let message = reserve_job(&h.broker).await;
    let delivery = handle_delivery(h.ctx.clone(), message, CancellationToken::new(), permit()).await;
    assert_eq!(delivery, Delivery::Ran(JobStatus::Completed));

    let pages = h.store.get_pages(&crawl_id).unwrap();
    let app = pages.iter().find(|p| p.url.ends_with("/app")).expect("app page");
    assert_eq!(app.fetch_stage, FetchStage::ProxyRender);
    assert_eq!(app.fetch_stage.as_u8(), 2);
    let home = pages.iter().find(|p| p.url.ends_with("shop.example/")).expect("home page");
    assert_eq!(home.fetch_stage, FetchStage::Direct);

    // stages are never skipped or revisited
    let stages = site.stages_for("/app");
    assert_eq!(stages.first(), Some(&FetchStage::Direct));
    assert_eq!(stages.last(), Some(&FetchStage::ProxyRender));
    assert!(stages.windows(2).all(|w| w[0] <= w[1]));

    let domain = h.store.get_domain_config("shop.example").unwrap().unwrap();
    assert!(domain.use_proxy);
    assert!(domain.use_js_rendering);
}

#[tokio::test]
async fn test_learned_strategy_applies_to_next_job() {
    let site = Arc::new(GuardedSite::new());
    let h = harness(site.clone());
    h.store
        .record_winning_stage("shop.example", FetchStage::ProxyRender)
        .unwrap();

    let crawl_id = jobs::submit(
        h.store.as_ref(),
        h.broker.as_ref(),
        &h.ctx.config,
        &JobParams::single_url("https://shop.example/app"),
    )
    .await
    .unwrap();

    let message = reserve_job(&h.broker).await;
    handle_delivery(h.ctx.clone(), message, CancellationToken::new(), permit()).await;

    assert_eq!(site.stages_for("/app"), vec![FetchStage::ProxyRender]);
    assert_eq!(
        h.store.get_pages(&crawl_id).unwrap()[0].fetch_stage,
        FetchStage::ProxyRender
    );
}

#[tokio::test]
async fn test_broker_outage_pauses_listener_until_recovery() {
    let h = harness(Arc::new(GuardedSite::new()));
    let sink = Arc::new(MemorySink::new());
    let mut monitor = HealthMonitor::new(
        h.ctx.config.clone(),
        h.store.clone(),
        h.broker.clone(),
        sink.clone(),
    );

    h.broker.set_available(false);
    for _ in 0..3 {
        monitor.run_cycle(chrono::Utc::now()).await;
    }
    assert_eq!(monitor.breaker_state("broker"), Some(BreakerState::Open));
    assert!(h.store.dispatch_gate().unwrap().paused);

    // broker is back but the circuit has not closed yet
    h.broker.set_available(true);
    let mut params = JobParams::single_url("https://shop.example/");
    params.use_sitemap = false;
    let crawl_id = jobs::submit(h.store.as_ref(), h.broker.as_ref(), &h.ctx.config, &params)
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let listener = tokio::spawn(Listener::new(h.ctx.clone(), shutdown.clone()).run());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(h.store.get_job(&crawl_id).unwrap().unwrap().status, JobStatus::Queued);
    assert_eq!(h.broker.stats_tube("crawl_jobs").await.unwrap().ready, 1);

    monitor.run_cycle(chrono::Utc::now()).await;
    assert_eq!(monitor.breaker_state("broker"), Some(BreakerState::HalfOpen));
    assert!(h.store.dispatch_gate().unwrap().paused);

    monitor.run_cycle(chrono::Utc::now()).await;
    assert_eq!(monitor.breaker_state("broker"), Some(BreakerState::Closed));
    assert!(!h.store.dispatch_gate().unwrap().paused);

    assert_eq!(
        wait_for_status(&h.store, &crawl_id, JobStatus::Completed).await,
        JobStatus::Completed
    );
    shutdown.cancel();
    listener.await.unwrap().unwrap();

    assert!(sink
        .reports()
        .iter()
        .any(|r| r.component == "broker" && r.status == HealthStatus::Unhealthy));
}

#[tokio::test]
async fn test_duplicate_deliveries_run_job_once() {
    let site = Arc::new(GuardedSite::new());
    let h = harness(site.clone());

    let mut params = JobParams::single_url("https://shop.example/");
    params.use_sitemap = false;
    let crawl_id = jobs::submit(h.store.as_ref(), h.broker.as_ref(), &h.ctx.config, &params)
        .await
        .unwrap();

    // a producer retry published the same job twice
    let job = h.store.get_job(&crawl_id).unwrap().unwrap();
    h.broker
        .put(
            "crawl_jobs",
            &CrawlJobMessage::from_job(&job).to_bytes().unwrap(),
            DEFAULT_PRIORITY,
            Duration::from_secs(60),
        )
        .await
        .unwrap();

    let first = reserve_job(&h.broker).await;
    let second = reserve_job(&h.broker).await;
    let (a, b) = tokio::join!(
        handle_delivery(h.ctx.clone(), first, CancellationToken::new(), permit()),
        handle_delivery(h.ctx.clone(), second, CancellationToken::new(), permit()),
    );

    let mut outcomes = vec![a, b];
    outcomes.sort_by_key(|d| format!("{:?}", d));
    assert_eq!(outcomes, vec![Delivery::Ran(JobStatus::Completed), Delivery::Skipped]);
    assert_eq!(site.stages_for("/").len(), 1);
    assert_eq!(h.store.get_pages(&crawl_id).unwrap().len(), 1);

    let stats = h.broker.stats_tube("crawl_jobs").await.unwrap();
    assert_eq!(stats.ready + stats.reserved + stats.buried, 0);
}

/// Launcher whose extractor processes die right after starting
struct CrashingLauncher {
    next_pid: AtomicU32,
    /// Only this extractor slot crashes; `None` crashes every extractor
    crash_slot: Option<usize>,
    launches: Mutex<Vec<WorkerSpec>>,
}

impl CrashingLauncher {
    fn new(crash_slot: Option<usize>) -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            crash_slot,
            launches: Mutex::new(Vec::new()),
        }
    }

    fn launches_of(&self, spec: WorkerSpec) -> usize {
        self.launches.lock().unwrap().iter().filter(|s| **s == spec).count()
    }
}

struct CrashedHandle {
    pid: u32,
    crashed: bool,
}

impl WorkerHandle for CrashedHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_exit(&mut self) -> sumi_fleet::Result<Option<ExitInfo>> {
        Ok(self.crashed.then_some(ExitInfo {
            success: false,
            code: Some(101),
        }))
    }

    fn terminate(&mut self) {
        self.crashed = true;
    }

    fn kill(&mut self) {
        self.crashed = true;
    }
}

#[async_trait]
impl WorkerLauncher for CrashingLauncher {
    async fn launch(&self, spec: &WorkerSpec) -> sumi_fleet::Result<Box<dyn WorkerHandle>> {
        self.launches.lock().unwrap().push(*spec);
        Ok(Box::new(CrashedHandle {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            crashed: spec.role == WorkerRole::Extractor
                && self.crash_slot.map_or(true, |slot| slot == spec.slot),
        }))
    }
}

#[tokio::test]
async fn test_flapping_worker_opens_restart_circuit() {
    let launcher = Arc::new(CrashingLauncher::new(None));
    let sink = Arc::new(MemorySink::new());
    let config = SupervisorConfig {
        extractor_workers: 1,
        backoff_base_secs: 1,
        backoff_max_secs: 300,
        max_restarts: 4,
        restart_window_secs: 600,
        ..SupervisorConfig::default()
    };
    let mut supervisor = Supervisor::new(config, launcher.clone(), None, sink.clone());

    let mut now = Instant::now();
    supervisor.start(now).await;

    let mut delays = Vec::new();
    let mut opened = false;
    for _ in 0..10 {
        for event in supervisor.tick(now).await {
            match event {
                SupervisorEvent::RestartScheduled { spec, delay } => {
                    assert_eq!(spec.role, WorkerRole::Extractor);
                    delays.push(delay);
                    now += delay;
                }
                SupervisorEvent::CircuitOpened { spec } => {
                    assert_eq!(spec.role, WorkerRole::Extractor);
                    opened = true;
                }
                _ => {}
            }
        }
        if opened {
            break;
        }
        // the pending restart launches on this tick
        supervisor.tick(now).await;
    }

    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(8)
        ]
    );
    assert!(opened);
    assert!(supervisor.circuit_open(WorkerRole::Extractor));
    assert!(!supervisor.circuit_open(WorkerRole::Listener));

    let extractor_launches = |l: &CrashingLauncher| {
        l.launches
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.role == WorkerRole::Extractor)
            .count()
    };
    assert_eq!(extractor_launches(&launcher), 5);

    // no more automatic restarts
    supervisor.tick(now + Duration::from_secs(3600)).await;
    assert_eq!(extractor_launches(&launcher), 5);

    let fatal = sink.with_status(HealthStatus::Fatal);
    assert_eq!(fatal.len(), 1);
    assert_eq!(fatal[0].component, "extractor");
}

#[tokio::test]
async fn test_flapping_extractor_beside_stable_sibling_opens_circuit() {
    let launcher = Arc::new(CrashingLauncher::new(Some(1)));
    let sink = Arc::new(MemorySink::new());
    let config = SupervisorConfig {
        extractor_workers: 2,
        ..SupervisorConfig::default()
    };
    let mut supervisor = Supervisor::new(config, launcher.clone(), None, sink.clone());

    let t0 = Instant::now();
    supervisor.start(t0).await;

    // extractor#0 has been up longer than the stable uptime on every check
    let mut now = t0 + Duration::from_secs(301);
    let mut delays = Vec::new();
    let mut opened = None;
    for _ in 0..20 {
        for event in supervisor.tick(now).await {
            match event {
                SupervisorEvent::RestartScheduled { spec, delay } => {
                    assert_eq!(spec, WorkerSpec::new(WorkerRole::Extractor, 1));
                    delays.push(delay);
                    now += delay;
                }
                SupervisorEvent::CircuitOpened { spec } => opened = Some(spec),
                _ => {}
            }
        }
        if opened.is_some() {
            break;
        }
        supervisor.tick(now).await;
        now += Duration::from_secs(30);
    }

    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
            Duration::from_secs(8)
        ]
    );
    assert_eq!(opened, Some(WorkerSpec::new(WorkerRole::Extractor, 1)));
    assert_eq!(launcher.launches_of(WorkerSpec::new(WorkerRole::Extractor, 1)), 5);
    assert_eq!(launcher.launches_of(WorkerSpec::new(WorkerRole::Extractor, 0)), 1);

    let fatal = sink.with_status(HealthStatus::Fatal);
    assert_eq!(fatal.len(), 1);
    assert!(fatal[0].detail.contains("extractor#1"));
}
