use async_trait::async_trait;
use parking_lot::Mutex;
use site_sentinel::backoff::ThrottleBackoff;
use site_sentinel::metrics::MonitorMetrics;
use site_sentinel::store::{TaskStore, VerdictStore};
use site_sentinel::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const ROOT: &str = "https://site.test/";
const ABOUT: &str = "https://site.test/about";
const CONTACT: &str = "https://site.test/contact";
const MISSING: &str = "https://site.test/missing";

/// Serves canned pages; unknown URLs are 404s.
#[derive(Default)]
struct FakeSite {
    pages: Mutex<HashMap<String, String>>,
    throttle_once: Mutex<HashSet<String>>,
    oversized: Mutex<HashSet<String>>,
    unreachable: Mutex<HashSet<String>>,
    calls: AtomicUsize,
}

impl FakeSite {
    fn serve(&self, url: &str, html: &str) {
        self.pages.lock().insert(url.to_string(), html.to_string());
    }

    fn throttle_next(&self, url: &str) {
        self.throttle_once.lock().insert(url.to_string());
    }

    fn serve_oversized(&self, url: &str) {
        self.oversized.lock().insert(url.to_string());
    }

    fn time_out(&self, url: &str) {
        self.unreachable.lock().insert(url.to_string());
    }
}

#[async_trait]
impl FetchBackend for FakeSite {
    async fn fetch(&self, url: &str, _options: &FetchOptions) -> Result<FetchResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.oversized.lock().contains(url) {
            return Err(FetchError::ContentTooLarge(20 * 1024 * 1024, 10 * 1024 * 1024));
        }
        if self.unreachable.lock().contains(url) {
            return Err(FetchError::Timeout);
        }

        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "text/html; charset=utf-8".to_string());

        let (status, body) = if self.throttle_once.lock().remove(url) {
            (429, String::new())
        } else {
            match self.pages.lock().get(url) {
                Some(html) => (200, html.clone()),
                None => (404, "<html><body>not found</body></html>".to_string()),
            }
        };

        Ok(FetchResponse {
            status,
            headers,
            body: body.into_bytes(),
            final_url: url.to_string(),
            elapsed_ms: 1,
        })
    }
}

fn site() -> Arc<FakeSite> {
    let site = Arc::new(FakeSite::default());
    site.serve(
        ROOT,
        "<html><head><title>Home</title></head><body><a href=\"/about\">About</a><a href=\"/contact\">Contact</a><a href=\"mailto:x@site.test\">Mail</a></body></html>",
    );
    site.serve(
        ABOUT,
        "<html><head><title>About</title></head><body><p>We make things.</p><a href=\"/missing\">Old</a><a href=\"https://elsewhere.test/\">Partner</a></body></html>",
    );
    site.serve(
        CONTACT,
        "<html><head><title>Contact</title></head><body><div><p>a</p><p>b</p><p>c</p></div></body></html>",
    );
    site
}

fn settings() -> CrawlSettings {
    CrawlSettings {
        site_id: 42,
        min_workers: 1,
        max_workers: 4,
        poll_timeout: Duration::from_millis(10),
        heartbeat_interval: Duration::from_secs(1),
        crash_threshold: Duration::from_secs(30),
        governor_interval: Duration::from_millis(10),
    }
}

fn crawler(store: Arc<MemoryStore>, fetcher: Arc<FakeSite>, session: &str, mode: CrawlMode) -> MonitorCrawler {
    let policy = Arc::new(UrlPolicy::new("site.test", Vec::new(), 5));
    let deps = CrawlerDeps {
        frontier: Arc::new(Frontier::new(store.clone(), policy, session, 3)),
        fetcher,
        renderer: None,
        traffic: Arc::new(TrafficController::with_backoff(
            Duration::ZERO,
            ThrottleBackoff::new(10, 50).with_jitter(0),
        )),
        fingerprinter: Fingerprinter::new("v1"),
        engine: DetectionEngine::new("v1", DetectionThresholds::default()),
        baselines: Arc::new(BaselineManager::new(store.clone())),
        verdicts: store.clone(),
        fingerprints: store,
        metrics: Arc::new(MonitorMetrics::new()),
    };
    MonitorCrawler::new(deps, settings(), mode)
}

async fn establish_baseline(store: Arc<MemoryStore>, fetcher: Arc<FakeSite>) -> BaselineProfile {
    let builder = Arc::new(BaselineBuilder::new(42, ROOT, "v1"));
    let summary = crawler(store.clone(), fetcher, "baseline-1", CrawlMode::Baseline(builder.clone()))
        .run(ROOT)
        .await
        .unwrap();

    assert!(!summary.stopped_early);
    assert_eq!(summary.frontier.completed, 4);
    assert_eq!(summary.frontier.failed, 0);

    let profile = builder.build();
    let manager = BaselineManager::new(store);
    manager.save(&profile).unwrap();
    manager.promote(42, &profile.id).unwrap();
    profile
}

#[tokio::test]
async fn test_baseline_crawl_collects_fetchable_pages() {
    let store = Arc::new(MemoryStore::new());
    let profile = establish_baseline(store.clone(), site()).await;

    let urls: Vec<&str> = profile.pages.keys().map(String::as_str).collect();
    assert_eq!(urls, vec![ROOT, ABOUT, CONTACT]);
    assert!(profile.page(MISSING).is_none());

    let task = store.get_task("baseline-1", MISSING).unwrap().unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert!(store.get_task("baseline-1", "https://elsewhere.test/").unwrap().is_none());
}

#[tokio::test]
async fn test_monitor_crawl_flags_defaced_page() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = site();
    let profile = establish_baseline(store.clone(), fetcher.clone()).await;

    fetcher.serve(
        CONTACT,
        "<html><body><h1>HACKED</h1><img src=\"x.png\"><img src=\"y.png\"><marquee>lol</marquee></body></html>",
    );

    let monitor = crawler(store.clone(), fetcher, "monitor-1", CrawlMode::Monitor);
    let summary = monitor.run(ROOT).await.unwrap();
    assert_eq!(summary.metrics.verdicts_clean, 2);
    assert_eq!(summary.metrics.verdicts_defaced, 1);

    let log = store.verdicts_for_site(42).unwrap();
    assert_eq!(log.len(), 3);
    assert!(log.iter().all(|v| v.baseline_id == profile.id));

    let contact = store.latest_verdict(42, CONTACT).unwrap().unwrap();
    assert_eq!(contact.status, VerdictStatus::Defaced);
    assert!(contact.has_indicator(Indicator::TitleDeviation));
    assert!(contact.has_indicator(Indicator::MajorStructuralCollapse));

    let home = store.latest_verdict(42, ROOT).unwrap().unwrap();
    assert_eq!(home.status, VerdictStatus::Clean);
}

#[tokio::test]
async fn test_throttled_page_is_retried_and_pauses_site() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = site();
    establish_baseline(store.clone(), fetcher.clone()).await;

    fetcher.throttle_next(ABOUT);
    let monitor = crawler(store.clone(), fetcher, "monitor-2", CrawlMode::Monitor);
    let summary = monitor.run(ROOT).await.unwrap();

    assert_eq!(summary.metrics.throttled, 1);
    assert_eq!(summary.metrics.tasks_retried, 1);
    assert_eq!(summary.metrics.tasks_processed, 4);
    assert_eq!(summary.frontier.failed, 0);
    let about = store.get_task("monitor-2", ABOUT).unwrap().unwrap();
    assert_eq!(about.state, TaskState::Completed);
    assert_eq!(about.attempt_count, 2);
    assert_eq!(summary.metrics.verdicts_clean, 3);
}

#[tokio::test]
async fn test_rerunning_finished_session_does_no_work() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = site();
    establish_baseline(store.clone(), fetcher.clone()).await;

    crawler(store.clone(), fetcher.clone(), "monitor-3", CrawlMode::Monitor)
        .run(ROOT)
        .await
        .unwrap();
    let calls = fetcher.calls.load(Ordering::SeqCst);

    let summary = crawler(store.clone(), fetcher.clone(), "monitor-3", CrawlMode::Monitor)
        .run(ROOT)
        .await
        .unwrap();
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), calls);
    assert_eq!(summary.metrics.tasks_processed, 0);
    assert_eq!(store.verdicts_for_site(42).unwrap().len(), 3);
}

#[tokio::test]
async fn test_stop_before_run_exits_without_fetching() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = site();
    let monitor = crawler(store.clone(), fetcher.clone(), "monitor-4", CrawlMode::Monitor);
    monitor.stop();

    let summary = monitor.run(ROOT).await.unwrap();
    assert!(summary.stopped_early);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
    assert_eq!(summary.frontier.pending, 1);
}

#[tokio::test]
async fn test_resumed_baseline_keeps_pages_from_earlier_run() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = site();
    let first = Arc::new(BaselineBuilder::new(42, ROOT, "v1"));
    crawler(store.clone(), fetcher.clone(), "baseline-r", CrawlMode::Baseline(first.clone()))
        .run(ROOT)
        .await
        .unwrap();
    assert_eq!(first.len(), 3);

    // Leave the contact page open, as an interrupted run would.
    let mut contact = store.get_task("baseline-r", CONTACT).unwrap().unwrap();
    contact.state = TaskState::Pending;
    assert!(store.transition(TaskState::Completed, &contact).unwrap());
    let calls = fetcher.calls.load(Ordering::SeqCst);

    let resumed = Arc::new(BaselineBuilder::new(42, ROOT, "v1"));
    let summary = crawler(store.clone(), fetcher.clone(), "baseline-r", CrawlMode::Baseline(resumed.clone()))
        .run(ROOT)
        .await
        .unwrap();

    assert_eq!(fetcher.calls.load(Ordering::SeqCst), calls + 1);
    assert_eq!(summary.metrics.tasks_processed, 1);
    let profile = resumed.build();
    let urls: Vec<&str> = profile.pages.keys().map(String::as_str).collect();
    assert_eq!(urls, vec![ROOT, ABOUT, CONTACT]);
    assert_eq!(profile.pages, first.build().pages);
}

#[tokio::test]
async fn test_resumed_baseline_ignores_other_sessions() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = site();
    establish_baseline(store.clone(), fetcher.clone()).await;

    let fresh = Arc::new(BaselineBuilder::new(42, ROOT, "v1"));
    let fetcher_calls = fetcher.calls.load(Ordering::SeqCst);
    crawler(store.clone(), fetcher.clone(), "baseline-2", CrawlMode::Baseline(fresh.clone()))
        .run(ROOT)
        .await
        .unwrap();

    // A new session fetches everything itself.
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), fetcher_calls + 4);
    assert_eq!(fresh.len(), 3);
}

#[tokio::test]
async fn test_oversized_page_fails_without_retry() {
    let store = Arc::new(MemoryStore::new());
    let fetcher = site();
    fetcher.serve_oversized(ABOUT);
    fetcher.time_out(CONTACT);

    let builder = Arc::new(BaselineBuilder::new(42, ROOT, "v1"));
    let summary = crawler(store.clone(), fetcher.clone(), "baseline-big", CrawlMode::Baseline(builder.clone()))
        .run(ROOT)
        .await
        .unwrap();

    let about = store.get_task("baseline-big", ABOUT).unwrap().unwrap();
    assert_eq!(about.state, TaskState::Failed);
    assert_eq!(about.attempt_count, 1);

    let contact = store.get_task("baseline-big", CONTACT).unwrap().unwrap();
    assert_eq!(contact.state, TaskState::Failed);
    assert_eq!(contact.attempt_count, 3);

    assert_eq!(summary.frontier.failed, 2);
    assert_eq!(summary.metrics.tasks_failed, 2);
    assert_eq!(summary.metrics.tasks_retried, 2);
    assert_eq!(summary.metrics.tasks_processed, 3);
    assert_eq!(summary.metrics.fetch_errors, 4);
    assert_eq!(builder.len(), 1);
}
