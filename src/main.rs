//! Sumi-Fleet main entry point
//!
//! One binary serves every role: the orchestrator (`run`) re-executes it as
//! `listener`, `extractor --slot N` and `monitor` worker processes, and the
//! remaining subcommands are operator tools over the shared job store.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sumi_fleet::config::{load_config_with_hash, Config};
use sumi_fleet::crawler::{CrawlContext, HttpFetcher};
use sumi_fleet::health::{HealthMonitor, TracingSink};
use sumi_fleet::orchestrator::Orchestrator;
use sumi_fleet::queue::{BeanstalkBroker, Broker};
use sumi_fleet::state::{JobParams, JobStatus, WorkerRole};
use sumi_fleet::storage::{HtmlStore, JobFilter, JobStore, SqliteStore};
use sumi_fleet::supervisor::ProcessLauncher;
use sumi_fleet::worker::{shutdown_token, spawn_heartbeat, ExtractorWorker, Listener, TitleExtractor};
use sumi_fleet::{jobs, output};
use tracing_subscriber::EnvFilter;

/// Sumi-Fleet: a distributed crawl orchestration engine
///
/// Crawl jobs are claimed from a broker tube by a supervised fleet of worker
/// processes. Each job walks its domain through an isolated frontier and
/// escalates failing fetches through proxy and rendering stages.
#[derive(Parser, Debug)]
#[command(name = "sumi-fleet")]
#[command(version)]
#[command(about = "Distributed crawl orchestration engine", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(short, long, global = true, default_value = "sumi-fleet.toml")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Started by the supervisor; stop when stdin closes
    #[arg(long, global = true, hide = true)]
    supervised: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the supervised fleet (listener, extractors, monitor)
    Run,

    /// Claim and run crawl jobs
    Listener,

    /// Consume fetched pages
    Extractor {
        #[arg(long, default_value_t = 0)]
        slot: usize,
    },

    /// Probe dependencies, toggle dispatch and recover stalled jobs
    Monitor,

    /// Submit a crawl job
    Submit {
        /// Domain (e.g. example.com) or, with --single-url, a full URL
        target: String,

        /// Fetch exactly this URL instead of crawling the domain
        #[arg(long)]
        single_url: bool,

        /// Page budget (defaults to frontier.default-max-pages)
        #[arg(long)]
        max_pages: Option<u32>,

        /// Skip sitemap discovery
        #[arg(long)]
        no_sitemap: bool,

        /// Start at the proxy stage
        #[arg(long, conflicts_with = "no_proxy")]
        proxy: bool,

        /// Never start at the proxy stage, even if learned
        #[arg(long)]
        no_proxy: bool,

        /// Start at the proxy+render stage
        #[arg(long, conflicts_with = "no_render")]
        render: bool,

        /// Never start at the render stage, even if learned
        #[arg(long)]
        no_render: bool,
    },

    /// Show one job
    Status { crawl_id: String },

    /// List jobs, newest first
    List {
        /// Only jobs in this status (queued, running, retrying, completed, failed, paused)
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// Ask a running job to pause
    Pause { crawl_id: String },

    /// Validate the configuration and print it
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::debug!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    tracing::debug!("Configuration loaded (hash: {})", config_hash);
    let config = Arc::new(config);

    match &cli.command {
        Command::Run => handle_run(&cli, config).await,
        Command::Listener => handle_listener(config, cli.supervised).await,
        Command::Extractor { slot } => handle_extractor(config, *slot, cli.supervised).await,
        Command::Monitor => handle_monitor(config, cli.supervised).await,
        Command::Submit {
            target,
            single_url,
            max_pages,
            no_sitemap,
            proxy,
            no_proxy,
            render,
            no_render,
        } => {
            let mut params = if *single_url {
                JobParams::single_url(target.clone())
            } else {
                JobParams::domain(target.clone())
            };
            params.max_pages = *max_pages;
            params.use_sitemap = !no_sitemap;
            params.use_proxy = flag_override(*proxy, *no_proxy);
            params.use_js_rendering = flag_override(*render, *no_render);
            handle_submit(&config, &params).await
        }
        Command::Status { crawl_id } => handle_status(&config, crawl_id),
        Command::List { status, limit } => handle_list(&config, status.as_deref(), *limit),
        Command::Pause { crawl_id } => handle_pause(&config, crawl_id),
        Command::CheckConfig => handle_check_config(&config, &config_hash),
    }
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("sumi_fleet=info,warn"),
            1 => EnvFilter::new("sumi_fleet=debug,info"),
            2 => EnvFilter::new("sumi_fleet=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

fn flag_override(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

fn open_store(config: &Config) -> anyhow::Result<Arc<SqliteStore>> {
    let path = Path::new(&config.store.database_path);
    let store = SqliteStore::new(path)
        .with_context(|| format!("opening job store {}", path.display()))?;
    Ok(Arc::new(store))
}

fn open_broker(config: &Config) -> Arc<BeanstalkBroker> {
    Arc::new(BeanstalkBroker::new(&config.broker.host, config.broker.port))
}

fn heartbeat_interval(config: &Config) -> Duration {
    Duration::from_secs(config.supervisor.heartbeat_interval_secs.max(1))
}

/// Handles `run`: supervises the whole fleet
async fn handle_run(cli: &Cli, config: Arc<Config>) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let broker = open_broker(&config);

    // children inherit the config file and verbosity
    let mut child_args = vec!["--config".to_string(), cli.config.display().to_string()];
    if cli.quiet {
        child_args.push("--quiet".to_string());
    }
    for _ in 0..cli.verbose {
        child_args.push("--verbose".to_string());
    }
    let launcher = Arc::new(ProcessLauncher::current_exe(child_args)?);

    tracing::info!(
        "Starting fleet: 1 listener, {} extractors, 1 monitor",
        config.supervisor.extractor_workers
    );
    let shutdown = shutdown_token(false);
    Orchestrator::new(config, store, broker, launcher, Arc::new(TracingSink))
        .run(shutdown)
        .await?;
    tracing::info!("Fleet stopped");
    Ok(())
}

/// Handles `listener`: claims and runs crawl jobs
async fn handle_listener(config: Arc<Config>, supervised: bool) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let broker = open_broker(&config);
    let backend = HttpFetcher::new(&config.fetch, &config.user_agent)
        .context("building HTTP clients")?;
    let html = HtmlStore::new(&config.store.html_dir);

    let shutdown = shutdown_token(supervised);
    let heartbeat = spawn_heartbeat(
        store.clone(),
        WorkerRole::Listener,
        0,
        heartbeat_interval(&config),
        shutdown.clone(),
    );

    let ctx = CrawlContext {
        config,
        store,
        broker,
        backend: Arc::new(backend),
        html,
    };
    Listener::new(ctx, shutdown).run().await?;
    heartbeat.await.ok();
    Ok(())
}

/// Handles `extractor`: consumes fetched pages
async fn handle_extractor(config: Arc<Config>, slot: usize, supervised: bool) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let broker = open_broker(&config);

    let shutdown = shutdown_token(supervised);
    let heartbeat = spawn_heartbeat(
        store,
        WorkerRole::Extractor,
        slot,
        heartbeat_interval(&config),
        shutdown.clone(),
    );

    ExtractorWorker::new(
        broker,
        HtmlStore::new(&config.store.html_dir),
        Arc::new(TitleExtractor),
        config.broker.page_tube.clone(),
        config.broker.reserve_timeout(),
        slot,
    )
    .run(shutdown)
    .await?;
    heartbeat.await.ok();
    Ok(())
}

/// Handles `monitor`: the health loop
async fn handle_monitor(config: Arc<Config>, supervised: bool) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let broker = open_broker(&config);

    let shutdown = shutdown_token(supervised);
    let heartbeat = spawn_heartbeat(
        store.clone(),
        WorkerRole::Monitor,
        0,
        heartbeat_interval(&config),
        shutdown.clone(),
    );

    HealthMonitor::new(config, store, broker, Arc::new(TracingSink))
        .run(shutdown)
        .await?;
    heartbeat.await.ok();
    Ok(())
}

/// Handles `submit`
async fn handle_submit(config: &Config, params: &JobParams) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let broker = open_broker(config);
    broker
        .ping()
        .await
        .with_context(|| format!("connecting to broker {}:{}", config.broker.host, config.broker.port))?;

    let crawl_id = jobs::submit(store.as_ref(), broker.as_ref(), config, params).await?;
    println!("{}", crawl_id);
    Ok(())
}

/// Handles `status`
fn handle_status(config: &Config, crawl_id: &str) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let job = jobs::status(store.as_ref(), crawl_id)?;
    let pages = store.get_pages(crawl_id)?;

    let domain = sumi_fleet::state::start_url(job.job_type, &job.domain_or_url)
        .ok()
        .and_then(|url| sumi_fleet::domain_key(&url));
    let learned = match domain {
        Some(domain) => store.get_domain_config(&domain)?,
        None => None,
    };

    output::print_job_detail(&job, &pages, learned.as_ref());
    Ok(())
}

/// Handles `list`
fn handle_list(config: &Config, status: Option<&str>, limit: usize) -> anyhow::Result<()> {
    let status = match status {
        Some(name) => Some(
            JobStatus::from_db_string(name)
                .with_context(|| format!("unknown status '{}'", name))?,
        ),
        None => None,
    };
    let filter = JobFilter {
        status,
        limit: Some(limit),
    };

    let store = open_store(config)?;
    let jobs = jobs::list(store.as_ref(), &filter)?;
    output::print_job_table(&jobs);
    Ok(())
}

/// Handles `pause`
fn handle_pause(config: &Config, crawl_id: &str) -> anyhow::Result<()> {
    let store = open_store(config)?;
    jobs::request_pause(store.as_ref(), crawl_id)?;
    println!("Pause requested for {}", crawl_id);
    Ok(())
}

/// Handles `check-config`: prints the resolved configuration
fn handle_check_config(config: &Config, config_hash: &str) -> anyhow::Result<()> {
    println!("=== Sumi-Fleet Configuration ===\n");

    println!("Store:");
    println!("  Database: {}", config.store.database_path);
    println!("  HTML directory: {}", config.store.html_dir);

    println!("\nBroker:");
    println!("  Address: {}:{}", config.broker.host, config.broker.port);
    println!("  Crawl tube: {}", config.broker.crawl_tube);
    println!("  Page tube: {}", config.broker.page_tube);
    println!("  Visibility timeout: {}s", config.broker.visibility_timeout_secs);

    println!("\nFrontier:");
    println!("  Default max pages: {}", config.frontier.default_max_pages);
    println!("  Max queue size: {}", config.frontier.max_queue_size);
    println!("  Concurrency per domain: {}", config.frontier.concurrency_per_domain);
    println!(
        "  Sitemaps: depth {}, {} children, {} days",
        config.frontier.sitemap_max_depth,
        config.frontier.sitemap_max_children,
        config.frontier.sitemap_max_age_days
    );
    println!("  Respect robots.txt: {}", config.frontier.respect_robots);

    println!("\nFetch:");
    println!("  Timeout: {}s", config.fetch.timeout_secs);
    println!(
        "  Retries per stage: {} (delay {}ms, backoff {})",
        config.fetch.max_retries_per_stage, config.fetch.retry_delay_ms, config.fetch.backoff_factor
    );
    println!("  Proxy: {}", config.fetch.proxy_url.as_deref().unwrap_or("(none)"));
    println!(
        "  Render endpoint: {}",
        config.fetch.render_endpoint.as_deref().unwrap_or("(none)")
    );

    println!("\nUser Agent:");
    println!("  {}", config.user_agent.header_value());

    println!("\nFleet:");
    println!("  Max concurrent crawlers: {}", config.listener.max_concurrent_crawlers);
    println!("  Extractor workers: {}", config.supervisor.extractor_workers);
    println!(
        "  Restarts: {} per {}s, backoff {}s..{}s",
        config.supervisor.max_restarts,
        config.supervisor.restart_window_secs,
        config.supervisor.backoff_base_secs,
        config.supervisor.backoff_max_secs
    );
    println!(
        "  Monitor: every {}s, job timeout {}s, {} retries",
        config.monitor.probe_interval_secs, config.monitor.job_timeout_secs, config.monitor.max_job_retries
    );

    println!("\n✓ Configuration is valid (hash: {})", config_hash);
    Ok(())
}
