use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::models::VerdictStatus;

#[derive(Debug, Clone)]
pub struct Histogram {
    buckets: Vec<(u64, u64)>,
    sum_ms: u64,
    count: u64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            buckets: vec![
                (10, 0),
                (50, 0),
                (100, 0),
                (500, 0),
                (1000, 0),
                (5000, 0),
                (u64::MAX, 0),
            ],
            sum_ms: 0,
            count: 0,
        }
    }

    pub fn observe(&mut self, value_ms: u64) {
        self.sum_ms = self.sum_ms.saturating_add(value_ms);
        self.count += 1;

        for (threshold, count) in &mut self.buckets {
            if value_ms <= *threshold {
                *count += 1;
                break;
            }
        }
    }

    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum_ms as f64 / self.count as f64
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self { value: AtomicU64::new(0) }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// EWMA with configurable alpha (0=smooth, 1=responsive).
#[derive(Debug, Clone)]
pub struct Ewma {
    value: f64,
    alpha: f64,
}

impl Ewma {
    pub fn new(alpha: f64) -> Self {
        Self {
            value: 0.0,
            alpha: alpha.clamp(0.0, 1.0),
        }
    }

    pub fn update(&mut self, new_value: f64) {
        if self.value == 0.0 {
            self.value = new_value;
        } else {
            self.value = self.alpha * new_value + (1.0 - self.alpha) * self.value;
        }
    }

    pub fn get(&self) -> f64 {
        self.value
    }
}

/// Point-in-time copy of the counters, for logs and summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_processed: u64,
    pub tasks_retried: u64,
    pub tasks_failed: u64,
    pub tasks_skipped: u64,
    pub fetch_errors: u64,
    pub throttled: u64,
    pub render_timeouts: u64,
    pub recovered: u64,
    pub pages_fingerprinted: u64,
    pub verdicts_clean: u64,
    pub verdicts_potential: u64,
    pub verdicts_defaced: u64,
    pub verdicts_failed: u64,
    pub fetch_ewma_ms: f64,
}

/// Crawl and detection counters shared by all workers.
pub struct MonitorMetrics {
    pub fetch_latency: Mutex<Histogram>,
    pub fetch_ewma: Mutex<Ewma>,

    /// Tasks that reached COMPLETED or FAILED.
    pub tasks_processed: Counter,
    /// Failed attempts sent back to PENDING.
    pub tasks_retried: Counter,
    pub tasks_failed: Counter,
    /// Routine data-level outcomes: empty body, ineligible status, extraction failure.
    pub tasks_skipped: Counter,
    pub fetch_errors: Counter,
    pub throttled: Counter,
    pub render_timeouts: Counter,
    pub recovered: Counter,
    pub pages_fingerprinted: Counter,
    pub verdicts_clean: Counter,
    pub verdicts_potential: Counter,
    pub verdicts_defaced: Counter,
    pub verdicts_failed: Counter,
}

impl MonitorMetrics {
    pub fn new() -> Self {
        Self {
            fetch_latency: Mutex::new(Histogram::new()),
            fetch_ewma: Mutex::new(Ewma::new(0.3)),
            tasks_processed: Counter::new(),
            tasks_retried: Counter::new(),
            tasks_failed: Counter::new(),
            tasks_skipped: Counter::new(),
            fetch_errors: Counter::new(),
            throttled: Counter::new(),
            render_timeouts: Counter::new(),
            recovered: Counter::new(),
            pages_fingerprinted: Counter::new(),
            verdicts_clean: Counter::new(),
            verdicts_potential: Counter::new(),
            verdicts_defaced: Counter::new(),
            verdicts_failed: Counter::new(),
        }
    }

    pub fn record_fetch(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.fetch_latency.lock().observe(ms);
        self.fetch_ewma.lock().update(ms as f64);
    }

    pub fn record_verdict(&self, status: VerdictStatus) {
        match status {
            VerdictStatus::Clean => self.verdicts_clean.inc(),
            VerdictStatus::PotentialDefacement => self.verdicts_potential.inc(),
            VerdictStatus::Defaced => self.verdicts_defaced.inc(),
            VerdictStatus::Failed => self.verdicts_failed.inc(),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_processed: self.tasks_processed.get(),
            tasks_retried: self.tasks_retried.get(),
            tasks_failed: self.tasks_failed.get(),
            tasks_skipped: self.tasks_skipped.get(),
            fetch_errors: self.fetch_errors.get(),
            throttled: self.throttled.get(),
            render_timeouts: self.render_timeouts.get(),
            recovered: self.recovered.get(),
            pages_fingerprinted: self.pages_fingerprinted.get(),
            verdicts_clean: self.verdicts_clean.get(),
            verdicts_potential: self.verdicts_potential.get(),
            verdicts_defaced: self.verdicts_defaced.get(),
            verdicts_failed: self.verdicts_failed.get(),
            fetch_ewma_ms: self.fetch_ewma.lock().get(),
        }
    }
}

impl Default for MonitorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMetrics = Arc<MonitorMetrics>;
