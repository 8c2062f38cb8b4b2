//! Elastic worker pool driving fetch -> fingerprint -> detect -> report.
//!
//! Workers pull leases from the [`Frontier`]; nothing else hands out work. The
//! run loop doubles as pool governor and crash-recovery timer.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::baseline::{BaselineBuilder, BaselineManager};
use crate::config::{Config, MonitorConfig};
use crate::detection::DetectionEngine;
use crate::fingerprint::{FingerprintOutcome, Fingerprinter};
use crate::frontier::{Frontier, FrontierError};
use crate::metrics::{MetricsSnapshot, MonitorMetrics};
use crate::models::{ContractViolation, FrontierTask, PageVersion, TaskCounts, VerdictStatus};
use crate::network::{FetchBackend, FetchOptions, FetchResponse};
use crate::parser::resolve_links;
use crate::render::{needs_render, BoundedRenderer, RenderError};
use crate::store::{FingerprintStore, StoreError, VerdictStore};
use crate::traffic::TrafficController;
use crate::url_utils::{self, PolicyStats};

pub const PROGRESS_TIME_SECS: u64 = 60;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("Frontier error: {0}")]
    Frontier(#[from] FrontierError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

/// What a crawl does with each fingerprinted page.
#[derive(Clone)]
pub enum CrawlMode {
    /// Collect pages into a new baseline profile.
    Baseline(Arc<BaselineBuilder>),
    /// Compare pages with the site's active baseline and log verdicts.
    Monitor,
}

/// Collaborators shared by every worker.
pub struct CrawlerDeps {
    pub frontier: Arc<Frontier>,
    pub fetcher: Arc<dyn FetchBackend>,
    pub renderer: Option<Arc<BoundedRenderer>>,
    pub traffic: Arc<TrafficController>,
    pub fingerprinter: Fingerprinter,
    pub engine: DetectionEngine,
    pub baselines: Arc<BaselineManager>,
    pub verdicts: Arc<dyn VerdictStore>,
    pub fingerprints: Arc<dyn FingerprintStore>,
    pub metrics: Arc<MonitorMetrics>,
}

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub site_id: u64,
    pub min_workers: usize,
    pub max_workers: usize,
    pub poll_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub crash_threshold: Duration,
    pub governor_interval: Duration,
}

impl CrawlSettings {
    pub fn from_config(config: &MonitorConfig, site_id: u64) -> Self {
        Self {
            site_id,
            min_workers: config.min_workers.max(1),
            max_workers: config.max_workers.max(config.min_workers).max(1),
            poll_timeout: Duration::from_millis(config.poll_timeout_ms),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            crash_threshold: Duration::from_secs(config.crash_threshold_secs),
            governor_interval: Duration::from_millis(Config::GOVERNOR_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CrawlSummary {
    pub session: String,
    pub site_id: u64,
    pub frontier: TaskCounts,
    pub metrics: MetricsSnapshot,
    pub policy: PolicyStats,
    pub elapsed: Duration,
    pub stopped_early: bool,
}

impl std::fmt::Display for CrawlSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Session {} (site {}): {} | {} processed, {} retried, {} skipped, {} failed | verdicts: {} clean, {} potential, {} defaced, {} failed | {:.1}s",
            self.session,
            self.site_id,
            self.frontier,
            self.metrics.tasks_processed,
            self.metrics.tasks_retried,
            self.metrics.tasks_skipped,
            self.metrics.tasks_failed,
            self.metrics.verdicts_clean,
            self.metrics.verdicts_potential,
            self.metrics.verdicts_defaced,
            self.metrics.verdicts_failed,
            self.elapsed.as_secs_f64()
        )
    }
}

/// How one lease ended.
#[derive(Debug)]
enum TaskOutcome {
    Done,
    Retry(String),
    /// A failure another attempt cannot fix.
    Abandon(String),
}

enum WorkerExit {
    Stopped,
    Retired,
}

/// Decrements the live-worker count when a worker ends for any reason.
struct LiveWorker {
    live: Arc<AtomicUsize>,
    armed: bool,
}

impl Drop for LiveWorker {
    fn drop(&mut self) {
        if self.armed {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct Shared {
    deps: CrawlerDeps,
    settings: CrawlSettings,
    mode: CrawlMode,
    stop: AtomicBool,
    live_workers: Arc<AtomicUsize>,
    busy_workers: AtomicUsize,
    target_workers: AtomicUsize,
    fatal: Mutex<Option<ContractViolation>>,
}

#[derive(Clone)]
pub struct MonitorCrawler {
    shared: Arc<Shared>,
}

impl MonitorCrawler {
    pub fn new(deps: CrawlerDeps, settings: CrawlSettings, mode: CrawlMode) -> Self {
        let initial = settings.min_workers;
        Self {
            shared: Arc::new(Shared {
                deps,
                settings,
                mode,
                stop: AtomicBool::new(false),
                live_workers: Arc::new(AtomicUsize::new(0)),
                busy_workers: AtomicUsize::new(0),
                target_workers: AtomicUsize::new(initial),
                fatal: Mutex::new(None),
            }),
        }
    }

    /// Ask every worker to finish its current task and exit.
    pub fn stop(&self) {
        if !self.shared.stop.swap(true, Ordering::SeqCst) {
            info!("crawler stop requested");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.load(Ordering::SeqCst)
    }

    pub fn live_workers(&self) -> usize {
        self.shared.live_workers.load(Ordering::SeqCst)
    }

    pub fn target_workers(&self) -> usize {
        self.shared.target_workers.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> &MonitorMetrics {
        &self.shared.deps.metrics
    }

    fn frontier(&self) -> &Frontier {
        &self.shared.deps.frontier
    }

    fn site_key(&self) -> &str {
        self.frontier().policy().site_host()
    }

    /// Seed `root_url` and crawl until the frontier has no open work or `stop` is called.
    ///
    /// Re-running a session resumes it: known URLs keep their state and only
    /// open tasks are worked.
    pub async fn run(&self, root_url: &str) -> Result<CrawlSummary, CrawlError> {
        let started = Instant::now();
        let settings = self.shared.settings.clone();

        let seeded = self.frontier().discover(&[root_url], 0)?;
        if let CrawlMode::Baseline(builder) = &self.shared.mode {
            let restored = self.restore_baseline_pages(builder)?;
            if restored > 0 {
                info!(restored, "resumed baseline session: restored pages fingerprinted earlier");
            }
        }
        info!(
            session = self.frontier().session(),
            site_id = settings.site_id,
            root_url,
            seeded,
            "crawl starting"
        );

        let mut workers: JoinSet<WorkerExit> = JoinSet::new();
        let mut ticker = tokio::time::interval(settings.governor_interval);
        let recovery_every = (settings.crash_threshold / 2).max(settings.governor_interval);
        let mut last_recovery = Instant::now();
        let mut last_progress = Instant::now();

        self.spawn_up_to_target(&mut workers);

        loop {
            tokio::select! {
                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    match joined {
                        Ok(WorkerExit::Retired) => debug!("worker retired"),
                        Ok(WorkerExit::Stopped) => {}
                        Err(e) => error!(error = %e, "worker task failed"),
                    }
                }
                _ = ticker.tick() => {
                    if self.is_stopped() {
                        break;
                    }

                    if last_recovery.elapsed() >= recovery_every {
                        last_recovery = Instant::now();
                        self.recover_orphans(settings.crash_threshold);
                        self.purge_render_cache();
                    }

                    let counts = match self.frontier().stats() {
                        Ok(counts) => counts,
                        Err(e) => {
                            error!(error = %e, "failed to read frontier counts");
                            continue;
                        }
                    };

                    if !counts.has_open_work() && self.shared.busy_workers.load(Ordering::SeqCst) == 0 {
                        info!("{}", counts);
                        info!("crawl complete: no pending or assigned tasks");
                        break;
                    }

                    self.govern(&counts);
                    self.spawn_up_to_target(&mut workers);

                    if last_progress.elapsed().as_secs() >= PROGRESS_TIME_SECS {
                        last_progress = Instant::now();
                        let m = self.metrics().snapshot();
                        info!(
                            workers = self.live_workers(),
                            processed = m.tasks_processed,
                            failed = m.tasks_failed,
                            fetch_ewma_ms = m.fetch_ewma_ms,
                            "Progress: {}",
                            counts
                        );
                    }
                }
            }
        }

        let stopped_early = self.is_stopped();
        self.stop();
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker task failed during drain");
            }
        }

        if let Some(violation) = self.shared.fatal.lock().take() {
            error!(error = %violation, "crawl aborted on contract violation");
            return Err(CrawlError::Contract(violation));
        }

        let summary = CrawlSummary {
            session: self.frontier().session().to_string(),
            site_id: settings.site_id,
            frontier: self.frontier().stats()?,
            metrics: self.metrics().snapshot(),
            policy: self.frontier().policy().stats(),
            elapsed: started.elapsed(),
            stopped_early,
        };
        info!("{}", summary);
        Ok(summary)
    }

    /// Grow toward queue pressure; halve on a consumed scale-down request.
    fn govern(&self, counts: &TaskCounts) {
        let settings = &self.shared.settings;
        let target = self.target_workers();

        if self.shared.deps.traffic.reset_scale_down(self.site_key()) {
            let reduced = (target / 2).max(settings.min_workers);
            self.shared.target_workers.store(reduced, Ordering::SeqCst);
            info!(from = target, to = reduced, "scaling down after throttle");
            return;
        }

        if counts.pending > self.live_workers() && target < settings.max_workers {
            self.shared.target_workers.store(target + 1, Ordering::SeqCst);
            debug!(target = target + 1, pending = counts.pending, "scaling up");
        }
    }

    fn spawn_up_to_target(&self, workers: &mut JoinSet<WorkerExit>) {
        if self.is_stopped() {
            return;
        }
        while self.live_workers() < self.target_workers() {
            self.shared.live_workers.fetch_add(1, Ordering::SeqCst);
            let guard = LiveWorker {
                live: self.shared.live_workers.clone(),
                armed: true,
            };
            let crawler = self.clone();
            workers.spawn(async move { crawler.worker_loop(guard).await });
        }
    }

    /// Feed the pages of tasks this session already completed back into
    /// `builder`; a resumed crawl does not fetch them again.
    fn restore_baseline_pages(&self, builder: &BaselineBuilder) -> Result<usize, CrawlError> {
        let completed: HashSet<String> = self
            .frontier()
            .completed()?
            .into_iter()
            .map(|task| task.url)
            .collect();
        if completed.is_empty() {
            return Ok(0);
        }

        let mut restored = 0;
        let pages = self
            .shared
            .deps
            .fingerprints
            .session_fingerprints(self.frontier().session())?;
        for page in pages {
            if !completed.contains(&page.normalized_url) {
                continue;
            }
            if page.extraction_version != builder.extraction_version() {
                warn!(
                    url = %page.normalized_url,
                    page_version = %page.extraction_version,
                    "earlier page was fingerprinted with another extraction version; left out"
                );
                continue;
            }
            if builder.add(page) {
                restored += 1;
            }
        }
        Ok(restored)
    }

    fn purge_render_cache(&self) {
        if let Some(renderer) = &self.shared.deps.renderer {
            let purged = renderer.cache().purge_expired();
            if purged > 0 {
                debug!(purged, "expired render results dropped");
            }
        }
    }

    fn recover_orphans(&self, threshold: Duration) {
        match self.frontier().recover_crashes(threshold) {
            Ok(recovered) => {
                if !recovered.is_empty() {
                    self.metrics().recovered.add(recovered.len() as u64);
                }
            }
            Err(FrontierError::Contract(v)) => self.fail(v),
            Err(e) => error!(error = %e, "crash recovery failed"),
        }
    }

    fn fail(&self, violation: ContractViolation) {
        error!(error = %violation, "contract violation");
        let mut fatal = self.shared.fatal.lock();
        if fatal.is_none() {
            *fatal = Some(violation);
        }
        drop(fatal);
        self.stop();
    }

    /// Give up this worker's slot if the pool is above target.
    fn try_retire(&self, guard: &mut LiveWorker) -> bool {
        let live = &self.shared.live_workers;
        loop {
            let current = live.load(Ordering::SeqCst);
            if current <= self.target_workers() {
                return false;
            }
            if live
                .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                guard.armed = false;
                return true;
            }
        }
    }

    async fn worker_loop(self, mut guard: LiveWorker) -> WorkerExit {
        let poll_timeout = self.shared.settings.poll_timeout;

        loop {
            if self.is_stopped() {
                return WorkerExit::Stopped;
            }
            if self.try_retire(&mut guard) {
                return WorkerExit::Retired;
            }

            let task = match self.frontier().assign_next() {
                Ok(Some(task)) => task,
                Ok(None) => {
                    sleep(poll_timeout).await;
                    continue;
                }
                Err(FrontierError::Contract(v)) => {
                    self.fail(v);
                    return WorkerExit::Stopped;
                }
                Err(e) => {
                    error!(error = %e, "failed to claim task");
                    sleep(poll_timeout).await;
                    continue;
                }
            };

            self.shared.busy_workers.fetch_add(1, Ordering::SeqCst);
            let url = task.url.clone();
            let outcome = self.with_heartbeat(&url, self.process(&task)).await;
            let reported = match outcome {
                Ok(outcome) => self.report(&task, outcome),
                Err(violation) => Err(violation),
            };
            self.shared.busy_workers.fetch_sub(1, Ordering::SeqCst);

            if let Err(violation) = reported {
                self.fail(violation);
                return WorkerExit::Stopped;
            }
        }
    }

    /// Drive `work` while refreshing the task's lease on every heartbeat tick.
    async fn with_heartbeat<F: Future>(&self, url: &str, work: F) -> F::Output {
        tokio::pin!(work);
        let mut ticker = tokio::time::interval(self.shared.settings.heartbeat_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                out = &mut work => return out,
                _ = ticker.tick() => {
                    match self.frontier().update_heartbeat(url) {
                        Ok(true) => {}
                        Ok(false) => debug!(url, "lease lost while processing"),
                        Err(e) => warn!(url, error = %e, "heartbeat failed"),
                    }
                }
            }
        }
    }

    fn report(&self, task: &FrontierTask, outcome: TaskOutcome) -> Result<(), ContractViolation> {
        let frontier = self.frontier();
        let metrics = self.metrics();

        let result = match &outcome {
            TaskOutcome::Done => frontier.report_success(&task.url),
            TaskOutcome::Retry(reason) => {
                debug!(url = %task.url, attempt = task.attempt_count, %reason, "task attempt failed");
                frontier.report_failure(&task.url)
            }
            TaskOutcome::Abandon(reason) => {
                warn!(url = %task.url, %reason, "task abandoned without retry");
                frontier.report_abandoned(&task.url)
            }
        };

        match result {
            Ok(true) => {
                let terminal = match outcome {
                    TaskOutcome::Done => true,
                    TaskOutcome::Abandon(_) => {
                        metrics.tasks_failed.inc();
                        true
                    }
                    TaskOutcome::Retry(_) if task.attempt_count >= frontier.max_retries() => {
                        metrics.tasks_failed.inc();
                        true
                    }
                    TaskOutcome::Retry(_) => {
                        metrics.tasks_retried.inc();
                        false
                    }
                };
                if terminal {
                    metrics.tasks_processed.inc();
                }
                Ok(())
            }
            Ok(false) => {
                debug!(url = %task.url, "report dropped: lease no longer held");
                Ok(())
            }
            Err(FrontierError::Contract(v)) => Err(v),
            Err(e) => {
                // The lease stays ASSIGNED and crash recovery will requeue it.
                error!(url = %task.url, error = %e, "failed to report task outcome");
                Ok(())
            }
        }
    }

    async fn process(&self, task: &FrontierTask) -> Result<TaskOutcome, ContractViolation> {
        let deps = &self.shared.deps;
        let site = self.site_key().to_string();

        deps.traffic.wait_for_clearance(&site).await;

        let response = match deps.fetcher.fetch(&task.url, &FetchOptions::default()).await {
            Ok(response) => response,
            Err(e) => {
                deps.metrics.fetch_errors.inc();
                warn!(url = %task.url, error = %e, transient = e.is_transient(), "fetch failed");
                return Ok(if e.is_transient() {
                    TaskOutcome::Retry(e.to_string())
                } else {
                    TaskOutcome::Abandon(e.to_string())
                });
            }
        };

        if response.is_throttled() {
            deps.metrics.throttled.inc();
            deps.traffic.record_throttle(&site, response.retry_after());
            return Ok(TaskOutcome::Retry(format!("throttled with HTTP {}", response.status)));
        }
        deps.traffic.record_ok(&site);
        deps.metrics.record_fetch(Duration::from_millis(response.elapsed_ms));

        let is_html = response
            .content_type()
            .map_or(true, url_utils::is_html_content_type);
        if response.is_success() && !is_html {
            debug!(url = %task.url, content_type = ?response.content_type(), "skipping non-HTML response");
            deps.metrics.tasks_skipped.inc();
            return Ok(TaskOutcome::Done);
        }

        let body = match self.rendered_body(task, &response).await {
            Ok(body) => body,
            Err(RenderError::Timeout(limit)) => {
                deps.metrics.render_timeouts.inc();
                return Ok(TaskOutcome::Retry(format!("render timed out after {limit:?}")));
            }
            Err(e) => {
                warn!(url = %task.url, error = %e, "render failed, using raw body");
                response.body.clone()
            }
        };

        if response.is_success() {
            let text = String::from_utf8_lossy(&body);
            let links = resolve_links(&text, &response.final_url);
            if let Err(e) = deps.frontier.discover(&links, task.depth + 1) {
                return match e {
                    FrontierError::Contract(v) => Err(v),
                    other => Ok(TaskOutcome::Retry(other.to_string())),
                };
            }
        }

        match deps.fingerprinter.fingerprint(&task.url, response.status, &body) {
            FingerprintOutcome::Ready(page) => self.handle_page(page).await,
            outcome => {
                deps.metrics.tasks_skipped.inc();
                match &outcome {
                    FingerprintOutcome::ProcessFailed(reason) => {
                        warn!(url = %task.url, %reason, "fingerprint extraction failed")
                    }
                    _ => debug!(url = %task.url, outcome = outcome.label(), status = response.status, "page not fingerprinted"),
                }
                Ok(TaskOutcome::Done)
            }
        }
    }

    async fn rendered_body(&self, task: &FrontierTask, response: &FetchResponse) -> Result<Vec<u8>, RenderError> {
        let Some(renderer) = &self.shared.deps.renderer else {
            return Ok(response.body.clone());
        };
        if !response.is_success() {
            return Ok(response.body.clone());
        }

        let raw = String::from_utf8_lossy(&response.body);
        if !needs_render(&raw) {
            return Ok(response.body.clone());
        }

        debug!(url = %task.url, "rendering client-side page");
        let rendered = renderer.render(&raw, &task.url).await?;
        Ok(rendered.as_bytes().to_vec())
    }

    async fn handle_page(&self, page: PageVersion) -> Result<TaskOutcome, ContractViolation> {
        let deps = &self.shared.deps;
        let site_id = self.shared.settings.site_id;

        if let Err(e) = deps.fingerprints.save_fingerprint(self.frontier().session(), &page) {
            return Ok(TaskOutcome::Retry(format!("saving fingerprint: {e}")));
        }
        deps.metrics.pages_fingerprinted.inc();

        match &self.shared.mode {
            CrawlMode::Baseline(builder) => {
                builder.add(page);
                Ok(TaskOutcome::Done)
            }
            CrawlMode::Monitor => {
                let entry = match deps.baselines.lookup(site_id, &page.normalized_url) {
                    Ok(Some(entry)) => entry,
                    Ok(None) => {
                        debug!(url = %page.normalized_url, "no baseline page to compare against");
                        return Ok(TaskOutcome::Done);
                    }
                    Err(e) => return Ok(TaskOutcome::Retry(format!("baseline lookup: {e}"))),
                };

                let verdict = deps
                    .engine
                    .analyze(self.frontier().session(), site_id, &page, &entry)?;

                if let Err(e) = deps.verdicts.save_verdict(&verdict) {
                    return Ok(TaskOutcome::Retry(format!("saving verdict: {e}")));
                }
                deps.metrics.record_verdict(verdict.status);

                if verdict.status == VerdictStatus::Clean {
                    debug!(url = %verdict.normalized_url, "page clean");
                } else {
                    warn!(
                        url = %verdict.normalized_url,
                        status = %verdict.status,
                        severity = %verdict.severity,
                        structural_drift = verdict.structural_drift,
                        content_drift = verdict.content_drift,
                        indicators = ?verdict.indicators,
                        "page drifted from baseline"
                    );
                }
                Ok(TaskOutcome::Done)
            }
        }
    }
}
