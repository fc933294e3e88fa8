//! Integration tests for the crawl path
//!
//! These tests use wiremock to serve a small site and run jobs end-to-end:
//! submission, claim by a listener, real HTTP fetches, page events and
//! extraction.

use std::sync::Arc;
use std::time::Duration;
use sumi_fleet::config::{Config, StoreConfig, UserAgentConfig};
use sumi_fleet::crawler::{CrawlContext, HttpFetcher};
use sumi_fleet::jobs;
use sumi_fleet::queue::{Broker, MemoryBroker, PageFetchedMessage};
use sumi_fleet::state::{FetchStage, JobParams, JobStatus};
use sumi_fleet::storage::{HtmlStore, JobStore, SqliteStore};
use sumi_fleet::worker::{ExtractorWorker, Listener, PageOutcome, TitleExtractor};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Creates a test configuration writing HTML under `html_dir`
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
    config.frontier.concurrency_per_domain = 2;
    config.fetch.timeout_secs = 5;
    config.fetch.retry_delay_ms = 10;
    config
}

/// An HTML page with enough text to never look like a script shell
fn page(title: &str, links: &[&str]) -> String {
    let anchors: String = links
        .iter()
        .map(|href| format!(r#"<a href="{}">{}</a> "#, href, href))
        .collect();
    format!(
        "<html><head><title>{}</title></head><body><p>{}</p>{}</body></html>",
        title,
        "Plenty of readable article text. ".repeat(10),
        anchors
    )
}

async fn mount_page(server: &MockServer, at: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/html"))
        .mount(server)
        .await;
}

struct Fleet {
    ctx: CrawlContext,
    store: Arc<SqliteStore>,
    broker: Arc<MemoryBroker>,
    _dir: tempfile::TempDir,
}

fn fleet() -> Fleet {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = create_test_config(dir.path());
    let backend = HttpFetcher::new(&config.fetch, &config.user_agent).expect("Failed to build client");
    let store = Arc::new(SqliteStore::new_in_memory().expect("Failed to open store"));
    let broker = Arc::new(MemoryBroker::new());

    Fleet {
        ctx: CrawlContext {
            config: Arc::new(config),
            store: store.clone(),
            broker: broker.clone(),
            backend: Arc::new(backend),
            html: HtmlStore::new(dir.path()),
        },
        store,
        broker,
        _dir: dir,
    }
}

/// Runs a listener until the job leaves the queue and reaches a final status
async fn run_until_finished(fleet: &Fleet, crawl_id: &str) -> JobStatus {
    let shutdown = CancellationToken::new();
    let listener = tokio::spawn(Listener::new(fleet.ctx.clone(), shutdown.clone()).run());

    let mut status = JobStatus::Queued;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        status = fleet.store.get_job(crawl_id).unwrap().unwrap().status;
        if status.is_terminal() {
            break;
        }
    }

    shutdown.cancel();
    listener.await.unwrap().unwrap();
    status
}

async fn drain_page_events(broker: &MemoryBroker) -> Vec<(u64, PageFetchedMessage)> {
    let mut events = Vec::new();
    while let Some(reserved) = broker
        .reserve("page_fetched", Duration::from_millis(20))
        .await
        .unwrap()
    {
        let message = PageFetchedMessage::from_bytes(&reserved.body).unwrap();
        events.push((reserved.id, message));
    }
    events
}

#[tokio::test]
async fn test_bfs_crawl_stops_at_max_pages() {
    let server = MockServer::start().await;
    mount_page(&server, "/", page("Home", &["/a", "/b", "/c"])).await;
    mount_page(&server, "/a", page("A", &["/a1", "/a2"])).await;
    mount_page(&server, "/b", page("B", &["/b1"])).await;
    mount_page(&server, "/c", page("C", &["/"])).await;
    for leaf in ["/a1", "/a2", "/b1"] {
        mount_page(&server, leaf, page(leaf, &[])).await;
    }

    let fleet = fleet();
    let mut params = JobParams::domain(server.uri());
    params.max_pages = Some(5);
    params.use_sitemap = false;
    let crawl_id = jobs::submit(fleet.store.as_ref(), fleet.broker.as_ref(), &fleet.ctx.config, &params)
        .await
        .unwrap();

    assert_eq!(run_until_finished(&fleet, &crawl_id).await, JobStatus::Completed);

    let job = jobs::status(fleet.store.as_ref(), &crawl_id).unwrap();
    assert_eq!(job.pages_crawled, 5);
    let pages = fleet.store.get_pages(&crawl_id).unwrap();
    assert_eq!(pages.len(), 5);
    assert!(pages.iter().all(|p| p.fetch_stage == FetchStage::Direct));
    assert!(pages
        .iter()
        .any(|p| url::Url::parse(&p.url).unwrap().path() == "/"));

    let events = drain_page_events(&fleet.broker).await;
    assert_eq!(events.len(), 5);
    assert!(events.iter().all(|(_, e)| e.crawl_id == crawl_id && e.status_code == 200));
}

#[tokio::test]
async fn test_small_site_drains_queue() {
    let server = MockServer::start().await;
    mount_page(&server, "/", page("Home", &["/about", "/missing", "/logo.png"])).await;
    mount_page(&server, "/about", page("About", &["/"])).await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let fleet = fleet();
    let mut params = JobParams::domain(server.uri());
    params.max_pages = Some(50);
    params.use_sitemap = false;
    let crawl_id = jobs::submit(fleet.store.as_ref(), fleet.broker.as_ref(), &fleet.ctx.config, &params)
        .await
        .unwrap();

    assert_eq!(run_until_finished(&fleet, &crawl_id).await, JobStatus::Completed);

    let mut urls: Vec<String> = fleet
        .store
        .get_pages(&crawl_id)
        .unwrap()
        .into_iter()
        .map(|p| p.url)
        .collect();
    urls.sort();
    assert_eq!(urls.len(), 2);
    assert!(urls[1].ends_with("/about"));

    // the image link is never requested
    let requests = server.received_requests().await.unwrap();
    assert!(requests.iter().all(|r| r.url.path() != "/logo.png"));
}

#[tokio::test]
async fn test_sitemap_pages_are_crawled() {
    let server = MockServer::start().await;
    let base = server.uri();
    mount_page(&server, "/", page("Home", &[])).await;
    mount_page(&server, "/docs/guide", page("Guide", &[])).await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!(
            "User-agent: *\nAllow: /\nSitemap: {}/sitemap.xml\n",
            base
        )))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/sitemap.xml"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
                <urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
                  <url><loc>{base}/docs/guide</loc></url>
                </urlset>"#
            ),
            "application/xml",
        ))
        .mount(&server)
        .await;

    let fleet = fleet();
    let crawl_id = jobs::submit(
        fleet.store.as_ref(),
        fleet.broker.as_ref(),
        &fleet.ctx.config,
        &JobParams::domain(base.clone()),
    )
    .await
    .unwrap();

    assert_eq!(run_until_finished(&fleet, &crawl_id).await, JobStatus::Completed);
    let pages = fleet.store.get_pages(&crawl_id).unwrap();
    assert!(pages.iter().any(|p| p.url.ends_with("/docs/guide")));

    let host = url::Url::parse(&base).unwrap().host_str().unwrap().to_string();
    let domain = fleet.store.get_domain_config(&host).unwrap().unwrap();
    assert!(domain.last_sitemap_check_at.is_some());
}

#[tokio::test]
async fn test_single_url_job_fetches_one_page() {
    let server = MockServer::start().await;
    mount_page(&server, "/article", page("Article", &["/other"])).await;
    mount_page(&server, "/other", page("Other", &[])).await;

    let fleet = fleet();
    let crawl_id = jobs::submit(
        fleet.store.as_ref(),
        fleet.broker.as_ref(),
        &fleet.ctx.config,
        &JobParams::single_url(format!("{}/article", server.uri())),
    )
    .await
    .unwrap();

    assert_eq!(run_until_finished(&fleet, &crawl_id).await, JobStatus::Completed);
    let pages = fleet.store.get_pages(&crawl_id).unwrap();
    assert_eq!(pages.len(), 1);
    assert!(pages[0].url.ends_with("/article"));
}

#[tokio::test]
async fn test_fetched_pages_reach_extractor() {
    let server = MockServer::start().await;
    mount_page(&server, "/", page("Welcome", &["/next"])).await;
    mount_page(&server, "/next", page("Next", &[])).await;

    let fleet = fleet();
    let mut params = JobParams::domain(server.uri());
    params.use_sitemap = false;
    let crawl_id = jobs::submit(fleet.store.as_ref(), fleet.broker.as_ref(), &fleet.ctx.config, &params)
        .await
        .unwrap();
    assert_eq!(run_until_finished(&fleet, &crawl_id).await, JobStatus::Completed);

    let extractor = ExtractorWorker::new(
        fleet.broker.clone(),
        fleet.ctx.html.clone(),
        Arc::new(TitleExtractor),
        "page_fetched",
        Duration::from_millis(20),
        0,
    );

    let mut titles = Vec::new();
    for (id, event) in drain_page_events(&fleet.broker).await {
        let body = event.to_bytes().unwrap();
        match extractor.process(id, &body).await {
            PageOutcome::Extracted(record) => titles.push(record.title.unwrap_or_default()),
            PageOutcome::Buried => panic!("page {} was buried", event.url),
        }
    }
    titles.sort();
    assert_eq!(titles, vec!["Next", "Welcome"]);

    let stats = fleet.broker.stats_tube("page_fetched").await.unwrap();
    assert_eq!(stats.ready + stats.reserved + stats.buried, 0);
}
