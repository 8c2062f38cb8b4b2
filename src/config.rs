// Global configuration constants - single source of truth

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::detection::DetectionThresholds;

pub struct Config;

impl Config {
    // Fingerprinting
    pub const EXTRACTION_VERSION: &'static str = "v1";

    // Frontier and leases
    pub const MAX_RETRIES: u32 = 3;
    pub const CRASH_THRESHOLD_SECS: u64 = 300;
    pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
    pub const POLL_TIMEOUT_MS: u64 = 500;
    pub const MAX_DEPTH: u32 = 10;

    // Worker pool
    pub const MIN_WORKERS: usize = 2;
    pub const MAX_WORKERS: usize = 16;
    pub const GOVERNOR_INTERVAL_MS: u64 = 250;

    // HTTP/Network config
    pub const USER_AGENT: &'static str = "SiteSentinel/0.1";
    pub const TIMEOUT_SECS: u64 = 30;
    pub const REQUEST_DELAY_MS: u64 = 250;
    pub const MAX_CONTENT_SIZE: usize = 10 * 1024 * 1024; // 10MB

    // Rendering
    pub const RENDER_TIMEOUT_SECS: u64 = 20;
    pub const RENDER_CACHE_TTL_SECS: u64 = 600;
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Runtime settings. Every field falls back to the matching `Config` constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub extraction_version: String,
    pub thresholds: DetectionThresholds,
    pub max_retries: u32,
    pub crash_threshold_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub poll_timeout_ms: u64,
    pub min_workers: usize,
    pub max_workers: usize,
    pub request_delay_ms: u64,
    pub render_timeout_secs: u64,
    pub render_cache_ttl_secs: u64,
    pub user_agent: String,
    pub timeout_secs: u64,
    pub max_content_size: usize,
    pub max_depth: u32,
    pub blocked_paths: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            extraction_version: Config::EXTRACTION_VERSION.to_string(),
            thresholds: DetectionThresholds::default(),
            max_retries: Config::MAX_RETRIES,
            crash_threshold_secs: Config::CRASH_THRESHOLD_SECS,
            heartbeat_interval_secs: Config::HEARTBEAT_INTERVAL_SECS,
            poll_timeout_ms: Config::POLL_TIMEOUT_MS,
            min_workers: Config::MIN_WORKERS,
            max_workers: Config::MAX_WORKERS,
            request_delay_ms: Config::REQUEST_DELAY_MS,
            render_timeout_secs: Config::RENDER_TIMEOUT_SECS,
            render_cache_ttl_secs: Config::RENDER_CACHE_TTL_SECS,
            user_agent: Config::USER_AGENT.to_string(),
            timeout_secs: Config::TIMEOUT_SECS,
            max_content_size: Config::MAX_CONTENT_SIZE,
            max_depth: Config::MAX_DEPTH,
            blocked_paths: Vec::new(),
        }
    }
}

impl MonitorConfig {
    /// Read a TOML file. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.extraction_version.trim().is_empty() {
            return Err(ConfigError::Invalid("extraction_version must not be empty".into()));
        }
        if self.min_workers == 0 {
            return Err(ConfigError::Invalid("min_workers must be at least 1".into()));
        }
        if self.min_workers > self.max_workers {
            return Err(ConfigError::Invalid(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        for (name, value) in [
            ("thresholds.structural", self.thresholds.structural),
            ("thresholds.content", self.thresholds.content),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!("{name} must be within [0, 1], got {value}")));
            }
        }
        // max_retries counts attempts, so 0 would fail tasks before they run.
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("max_retries must be at least 1".into()));
        }
        if self.max_content_size == 0 {
            return Err(ConfigError::Invalid("max_content_size must be positive".into()));
        }
        if self.render_timeout_secs == 0 {
            return Err(ConfigError::Invalid("render_timeout_secs must be positive".into()));
        }
        if self.heartbeat_interval_secs == 0 || self.heartbeat_interval_secs >= self.crash_threshold_secs {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_secs must be positive and below crash_threshold_secs".into(),
            ));
        }
        Ok(())
    }
}
