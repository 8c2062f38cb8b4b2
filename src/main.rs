use site_sentinel::baseline::{BaselineBuilder, BaselineError, BaselineManager};
use site_sentinel::cli::{Cli, Commands, CrawlArgs};
use site_sentinel::config::{ConfigError, MonitorConfig};
use site_sentinel::crawler::{CrawlError, CrawlMode, CrawlSettings, CrawlerDeps, MonitorCrawler};
use site_sentinel::detection::DetectionEngine;
use site_sentinel::fingerprint::Fingerprinter;
use site_sentinel::frontier::Frontier;
use site_sentinel::logging::init_logging_in_data_dir;
use site_sentinel::metrics::MonitorMetrics;
use site_sentinel::models::now_millis;
use site_sentinel::network::{FetchError, HttpClient};
use site_sentinel::store::{RedbStore, StoreError, VerdictStore};
use site_sentinel::traffic::TrafficController;
use site_sentinel::url_utils::{extract_host, normalize_url, normalize_url_for_cli, UrlPolicy};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MainError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("HTTP client error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Baseline error: {0}")]
    Baseline(#[from] BaselineError),

    #[error("Crawl error: {0}")]
    Crawl(#[from] CrawlError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Not a crawlable URL: {0}")]
    InvalidUrl(String),

    #[error("Site {0} has no active baseline; run `baseline --promote` first")]
    NoActiveBaseline(u64),

    #[error("Baseline crawl for site {0} fingerprinted no pages")]
    EmptyBaseline(u64),
}

const CONFIG_FILE: &str = "sentinel.toml";

fn load_config(args: &CrawlArgs) -> Result<MonitorConfig, MainError> {
    let path = match &args.config {
        Some(path) => Path::new(path).to_path_buf(),
        None => Path::new(&args.data_dir).join(CONFIG_FILE),
    };
    let mut config = MonitorConfig::load(&path)?;

    if let Some(workers) = args.workers {
        config.max_workers = workers;
        config.min_workers = config.min_workers.min(workers);
    }
    if let Some(user_agent) = &args.user_agent {
        config.user_agent = user_agent.clone();
    }
    if let Some(max_depth) = args.max_depth {
        config.max_depth = max_depth;
    }
    config.validate()?;
    Ok(config)
}

async fn run_crawl_command(args: CrawlArgs, baseline: bool, promote: bool) -> Result<(), MainError> {
    let config = load_config(&args)?;
    std::fs::create_dir_all(&args.data_dir)?;
    let _log_guards = init_logging_in_data_dir(&args.data_dir).map_err(|e| MainError::Logging(e.to_string()))?;

    let root_url = normalize_url(&normalize_url_for_cli(&args.url))
        .ok_or_else(|| MainError::InvalidUrl(args.url.clone()))?;
    let host = extract_host(&root_url).ok_or_else(|| MainError::InvalidUrl(args.url.clone()))?;
    let site_id = args.site_id;

    let store = Arc::new(RedbStore::new(&args.data_dir)?);
    let baselines = Arc::new(BaselineManager::new(store.clone()));
    if !baseline && baselines.get_active(site_id)?.is_none() {
        return Err(MainError::NoActiveBaseline(site_id));
    }

    let mode_name = if baseline { "baseline" } else { "monitor" };
    let session = args
        .session
        .clone()
        .unwrap_or_else(|| format!("{mode_name}-{site_id}-{}", now_millis()));

    let policy = Arc::new(UrlPolicy::new(&host, config.blocked_paths.clone(), config.max_depth));
    let frontier = Arc::new(Frontier::new(store.clone(), policy, session.clone(), config.max_retries));
    let fetcher = Arc::new(HttpClient::with_content_limit(
        config.user_agent.clone(),
        config.timeout_secs,
        config.max_content_size,
    )?);

    let builder = Arc::new(BaselineBuilder::new(site_id, root_url.clone(), config.extraction_version.clone()));
    let mode = if baseline {
        CrawlMode::Baseline(builder.clone())
    } else {
        CrawlMode::Monitor
    };

    let deps = CrawlerDeps {
        frontier,
        fetcher,
        renderer: None,
        traffic: Arc::new(TrafficController::new(Duration::from_millis(config.request_delay_ms))),
        fingerprinter: Fingerprinter::new(config.extraction_version.clone()),
        engine: DetectionEngine::new(config.extraction_version.clone(), config.thresholds),
        baselines: baselines.clone(),
        verdicts: store.clone(),
        fingerprints: store.clone(),
        metrics: Arc::new(MonitorMetrics::new()),
    };

    let crawler = MonitorCrawler::new(deps, CrawlSettings::from_config(&config, site_id), mode);

    let stopper = crawler.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nReceived Ctrl+C, finishing in-flight pages...");
            stopper.stop();

            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nForce quit requested, exiting immediately...");
                std::process::exit(1);
            }
        }
    });

    println!(
        "{} {} as site {} (session {}, up to {} workers)",
        if baseline { "Baselining" } else { "Monitoring" },
        root_url,
        site_id,
        session,
        config.max_workers
    );

    let summary = crawler.run(&root_url).await?;
    println!("{}", summary);

    if baseline {
        if summary.stopped_early {
            println!("Crawl interrupted; resume with --session {} before saving a baseline", session);
            return Ok(());
        }
        if builder.is_empty() {
            return Err(MainError::EmptyBaseline(site_id));
        }

        let profile = builder.build();
        baselines.save(&profile)?;
        println!("Saved baseline {} ({} pages)", profile.id, profile.pages.len());

        if promote {
            baselines.promote(site_id, &profile.id)?;
            println!("Baseline {} is now active for site {}", profile.id, site_id);
        }
    }

    Ok(())
}

fn run_promote_command(site_id: u64, baseline_id: &str, data_dir: &str) -> Result<(), MainError> {
    let store = Arc::new(RedbStore::new(data_dir)?);
    let baselines = BaselineManager::new(store);
    baselines.promote(site_id, baseline_id)?;
    println!("Baseline {} is now active for site {}", baseline_id, site_id);
    Ok(())
}

fn run_verdicts_command(site_id: u64, url: Option<String>, data_dir: &str) -> Result<(), MainError> {
    let store = RedbStore::new(data_dir)?;

    let verdicts = match url {
        Some(url) => {
            let normalized = normalize_url(&url).ok_or(MainError::InvalidUrl(url))?;
            store.latest_verdict(site_id, &normalized)?.into_iter().collect()
        }
        None => store.verdicts_for_site(site_id)?,
    };

    for verdict in &verdicts {
        println!("{}", serde_json::to_string(verdict)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), MainError> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Baseline { crawl, promote } => run_crawl_command(crawl, true, promote).await?,
        Commands::Monitor { crawl } => run_crawl_command(crawl, false, false).await?,
        Commands::Promote {
            site_id,
            baseline_id,
            data_dir,
        } => run_promote_command(site_id, &baseline_id, &data_dir)?,
        Commands::Verdicts { site_id, url, data_dir } => run_verdicts_command(site_id, url, &data_dir)?,
    }

    Ok(())
}
