use rand::Rng;
use std::time::Duration;

/// Pause length after consecutive throttle responses from one site.
pub struct ThrottleBackoff {
    base_ms: u64,
    max_ms: u64,
    jitter_percent: u64,
}

impl ThrottleBackoff {
    pub const fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter_percent: 10,
        }
    }

    pub fn with_jitter(mut self, jitter_percent: u64) -> Self {
        self.jitter_percent = jitter_percent;
        self
    }

    /// Delay after the `strikes`-th throttle in a row (1-based).
    pub fn delay(&self, strikes: u32) -> Duration {
        let exponent = strikes.saturating_sub(1).min(20);
        let exponential_delay = self.base_ms.saturating_mul(2u64.saturating_pow(exponent));
        let capped_delay = exponential_delay.min(self.max_ms);
        let jitter = if self.jitter_percent > 0 {
            rand::thread_rng().gen_range(0..capped_delay * self.jitter_percent / 100 + 1)
        } else {
            0
        };
        Duration::from_millis(capped_delay + jitter)
    }

    /// `delay` honoring a server-provided Retry-After as a floor.
    pub fn pause_for(&self, strikes: u32, retry_after: Option<Duration>) -> Duration {
        let computed = self.delay(strikes);
        match retry_after {
            Some(hint) => computed.max(hint.min(Duration::from_millis(self.max_ms))),
            None => computed,
        }
    }
}

impl Default for ThrottleBackoff {
    fn default() -> Self {
        Self::new(2_000, 300_000)
    }
}
