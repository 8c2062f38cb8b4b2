pub mod backoff;
pub mod baseline;
pub mod cli;
pub mod config;
pub mod crawler;
pub mod detection;
pub mod fingerprint;
pub mod frontier;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod network;
pub mod parser;
pub mod render;
pub mod store;
pub mod traffic;
pub mod url_utils;

// Re-export main types for library usage
pub use baseline::{BaselineBuilder, BaselineError, BaselineManager};
pub use config::{Config, MonitorConfig};
pub use crawler::{CrawlError, CrawlMode, CrawlSettings, CrawlSummary, CrawlerDeps, MonitorCrawler};
pub use detection::{classify, content_drift, structural_drift, DetectionEngine, DetectionThresholds};
pub use fingerprint::{FingerprintOutcome, Fingerprinter};
pub use frontier::{Frontier, FrontierError};
pub use models::{
    BaselineEntry, BaselineProfile, ContractViolation, DetectionVerdict, FrontierTask, Indicator,
    PageVersion, Severity, TaskState, VerdictStatus,
};
pub use network::{FetchBackend, FetchError, FetchOptions, FetchResponse, HttpClient};
pub use parser::extract_links;
pub use render::{BoundedRenderer, RenderBackend, RenderError};
pub use store::{MemoryStore, RedbStore, StoreError};
pub use traffic::TrafficController;
pub use url_utils::UrlPolicy;
