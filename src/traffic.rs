//! Per-site pauses and pacing shared by every worker.
//!
//! One `TrafficController` is built per crawl and handed to workers and the
//! pool governor by `Arc`; nothing here is process-global.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::backoff::ThrottleBackoff;

#[derive(Debug, Default)]
struct SiteTraffic {
    pause_until: Option<Instant>,
    scale_down_requested: bool,
    /// Earliest instant the next request to this site may start.
    next_slot: Option<Instant>,
    throttle_strikes: u32,
}

pub struct TrafficController {
    sites: Mutex<HashMap<String, SiteTraffic>>,
    request_delay: Duration,
    backoff: ThrottleBackoff,
}

impl TrafficController {
    pub fn new(request_delay: Duration) -> Self {
        Self::with_backoff(request_delay, ThrottleBackoff::default())
    }

    pub fn with_backoff(request_delay: Duration, backoff: ThrottleBackoff) -> Self {
        Self {
            sites: Mutex::new(HashMap::new()),
            request_delay,
            backoff,
        }
    }

    /// Pause `site` for `secs` from now. Never shortens an existing pause.
    pub fn set_pause(&self, site: &str, secs: u64) {
        self.set_pause_for(site, Duration::from_secs(secs));
    }

    pub fn set_pause_for(&self, site: &str, pause: Duration) {
        let mut sites = self.sites.lock();
        let entry = sites.entry(site.to_string()).or_default();

        let deadline = Instant::now() + pause;
        if entry.pause_until.map_or(true, |current| deadline > current) {
            entry.pause_until = Some(deadline);
        }
        if !pause.is_zero() {
            entry.scale_down_requested = true;
        }
        debug!(site, pause_ms = pause.as_millis() as u64, "site paused");
    }

    /// Time left on the site's pause; zero when it is not paused.
    pub fn get_remaining_pause(&self, site: &str) -> Duration {
        let sites = self.sites.lock();
        sites
            .get(site)
            .and_then(|s| s.pause_until)
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Consume the scale-down request. Returns whether one was pending.
    pub fn reset_scale_down(&self, site: &str) -> bool {
        let mut sites = self.sites.lock();
        match sites.get_mut(site) {
            Some(entry) => std::mem::take(&mut entry.scale_down_requested),
            None => false,
        }
    }

    pub fn is_scale_down_requested(&self, site: &str) -> bool {
        self.sites
            .lock()
            .get(site)
            .is_some_and(|s| s.scale_down_requested)
    }

    /// Reserve the next request slot for `site` and return how long to wait for it.
    fn reserve_slot(&self, site: &str) -> Duration {
        let now = Instant::now();
        let mut sites = self.sites.lock();
        let entry = sites.entry(site.to_string()).or_default();

        let start = match entry.next_slot {
            Some(slot) if slot > now => slot,
            _ => now,
        };
        entry.next_slot = Some(start + self.request_delay);
        start - now
    }

    /// Sleep through any pause and the per-site request spacing.
    ///
    /// Returns only once the site is unpaused after the slot wait, so a
    /// throttle recorded while this caller waited for its slot still holds it.
    pub async fn wait_for_clearance(&self, site: &str) {
        loop {
            let pause = self.get_remaining_pause(site);
            if !pause.is_zero() {
                debug!(site, wait_ms = pause.as_millis() as u64, "waiting out site pause");
                tokio::time::sleep(pause).await;
                continue;
            }

            let wait = self.reserve_slot(site);
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
            if self.get_remaining_pause(site).is_zero() {
                return;
            }
        }
    }

    /// Register a throttle response and pause the site. Returns the pause applied.
    pub fn record_throttle(&self, site: &str, retry_after: Option<Duration>) -> Duration {
        let strikes = {
            let mut sites = self.sites.lock();
            let entry = sites.entry(site.to_string()).or_default();
            entry.throttle_strikes = entry.throttle_strikes.saturating_add(1);
            entry.throttle_strikes
        };

        let pause = self.backoff.pause_for(strikes, retry_after);
        self.set_pause_for(site, pause);
        info!(site, strikes, pause_ms = pause.as_millis() as u64, "site throttled us");
        pause
    }

    /// A successful response clears the throttle streak.
    pub fn record_ok(&self, site: &str) {
        if let Some(entry) = self.sites.lock().get_mut(site) {
            entry.throttle_strikes = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_pause_only_extends() {
        let traffic = TrafficController::new(Duration::ZERO);
        traffic.set_pause("a.test", 60);
        traffic.set_pause("a.test", 1);
        assert!(traffic.get_remaining_pause("a.test") > Duration::from_secs(50));
        assert_eq!(traffic.get_remaining_pause("b.test"), Duration::ZERO);
    }

    #[test]
    fn test_scale_down_is_one_shot() {
        let traffic = TrafficController::new(Duration::ZERO);
        assert!(!traffic.reset_scale_down("a.test"));

        traffic.set_pause("a.test", 5);
        assert!(traffic.is_scale_down_requested("a.test"));
        assert!(traffic.reset_scale_down("a.test"));
        assert!(!traffic.reset_scale_down("a.test"));
        // the pause outlives the consumed flag
        assert!(traffic.get_remaining_pause("a.test") > Duration::ZERO);
    }

    #[test]
    fn test_zero_pause_does_not_request_scale_down() {
        let traffic = TrafficController::new(Duration::ZERO);
        traffic.set_pause("a.test", 0);
        assert!(!traffic.is_scale_down_requested("a.test"));
    }

    #[test]
    fn test_throttle_streak_grows_and_resets() {
        let traffic =
            TrafficController::with_backoff(Duration::ZERO, ThrottleBackoff::new(100, 10_000).with_jitter(0));
        assert_eq!(traffic.record_throttle("a.test", None), Duration::from_millis(100));
        assert_eq!(traffic.record_throttle("a.test", None), Duration::from_millis(200));
        traffic.record_ok("a.test");
        assert_eq!(traffic.record_throttle("a.test", None), Duration::from_millis(100));
        assert!(traffic.is_scale_down_requested("a.test"));
    }

    #[test]
    fn test_request_slots_are_spaced() {
        let traffic = TrafficController::new(Duration::from_millis(500));
        assert_eq!(traffic.reserve_slot("a.test"), Duration::ZERO);
        let second = traffic.reserve_slot("a.test");
        assert!(second > Duration::from_millis(400));
        assert_eq!(traffic.reserve_slot("b.test"), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_wait_for_clearance_sleeps_through_pause() {
        let traffic = TrafficController::new(Duration::ZERO);
        traffic.set_pause_for("a.test", Duration::from_millis(50));
        let started = Instant::now();
        traffic.wait_for_clearance("a.test").await;
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(traffic.get_remaining_pause("a.test"), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_pause_raised_during_slot_wait_holds_waiter() {
        let traffic = Arc::new(TrafficController::new(Duration::from_millis(300)));
        traffic.wait_for_clearance("a.test").await;

        let started = Instant::now();
        let waiter = tokio::spawn({
            let traffic = traffic.clone();
            async move {
                traffic.wait_for_clearance("a.test").await;
                traffic.get_remaining_pause("a.test")
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        traffic.set_pause_for("a.test", Duration::from_millis(600));

        let remaining_at_release = waiter.await.unwrap();
        assert_eq!(remaining_at_release, Duration::ZERO);
        assert!(started.elapsed() >= Duration::from_millis(600));
    }
}
