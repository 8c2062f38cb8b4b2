use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{now_millis, ContractViolation, FrontierTask, TaskCounts, TaskState};
use crate::store::{StoreError, TaskStore};
use crate::url_utils::UrlPolicy;

#[derive(Error, Debug)]
pub enum FrontierError {
    #[error("Task store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

/// Scheduling priority: shallower pages first.
fn priority_for_depth(depth: u32) -> i64 {
    -i64::from(depth)
}

/// Task lifecycle, leases and crash recovery for one crawl session.
///
/// Every state change goes through [`TaskStore::transition`], so two racing
/// callers on the same task can never both succeed; the loser gets a no-op.
pub struct Frontier {
    store: Arc<dyn TaskStore>,
    policy: Arc<UrlPolicy>,
    session: String,
    max_retries: u32,
}

impl Frontier {
    pub fn new(
        store: Arc<dyn TaskStore>,
        policy: Arc<UrlPolicy>,
        session: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            policy,
            session: session.into(),
            max_retries: max_retries.max(1),
        }
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn policy(&self) -> &UrlPolicy {
        &self.policy
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Add newly discovered URLs. Returns how many tasks were created.
    ///
    /// `create_if_absent` is the only deduplication gate: a URL already known
    /// to this session is left exactly as it is, whatever its state.
    pub fn discover<S: AsRef<str>>(&self, urls: &[S], depth: u32) -> Result<usize, FrontierError> {
        let mut created = 0;

        for raw in urls {
            let normalized = match self.policy.admit(raw.as_ref(), depth) {
                Ok(url) => url,
                Err(reason) => {
                    debug!(url = raw.as_ref(), ?reason, "url rejected by policy");
                    continue;
                }
            };

            let task = FrontierTask::new(&self.session, normalized, depth, priority_for_depth(depth));
            if self.store.create_if_absent(&task)? {
                debug!(url = %task.url, depth, "task discovered");
                created += 1;
            }
        }

        Ok(created)
    }

    /// Lease the best PENDING task, or None when nothing is pending.
    pub fn assign_next(&self) -> Result<Option<FrontierTask>, FrontierError> {
        let claimed = self.store.claim_next(&self.session, now_millis())?;
        if let Some(task) = &claimed {
            debug!(url = %task.url, attempt = task.attempt_count, "task assigned");
        }
        Ok(claimed)
    }

    /// ASSIGNED -> COMPLETED. Returns false when the lease was already lost.
    pub fn report_success(&self, url: &str) -> Result<bool, FrontierError> {
        let Some(current) = self.load_assigned(url)? else {
            debug!(url, "stale success report ignored");
            return Ok(false);
        };

        let mut next = current;
        next.state = TaskState::Completed;
        next.last_heartbeat = now_millis();
        self.apply(TaskState::Assigned, next)
    }

    /// ASSIGNED -> PENDING below the retry limit, ASSIGNED -> FAILED at it.
    pub fn report_failure(&self, url: &str) -> Result<bool, FrontierError> {
        self.fail_task(url, false)
    }

    /// ASSIGNED -> FAILED whatever the attempt count, for failures a retry cannot fix.
    pub fn report_abandoned(&self, url: &str) -> Result<bool, FrontierError> {
        self.fail_task(url, true)
    }

    fn fail_task(&self, url: &str, terminal: bool) -> Result<bool, FrontierError> {
        let Some(current) = self.load_assigned(url)? else {
            debug!(url, "stale failure report ignored");
            return Ok(false);
        };

        let exhausted = terminal || current.attempt_count >= self.max_retries;
        let mut next = current;
        next.state = if exhausted {
            TaskState::Failed
        } else {
            TaskState::Pending
        };
        next.last_heartbeat = now_millis();

        let attempt = next.attempt_count;
        let applied = self.apply(TaskState::Assigned, next)?;
        if applied && exhausted {
            warn!(url, attempt, "task failed permanently");
        }
        Ok(applied)
    }

    /// Return ASSIGNED tasks whose heartbeat is older than `threshold` to PENDING.
    ///
    /// The CAS only checks that the task is still ASSIGNED, not that its
    /// heartbeat is unchanged: a worker refreshing its lease between the scan
    /// and the swap can lose that lease. Known race, left as is.
    pub fn recover_crashes(&self, threshold: Duration) -> Result<Vec<String>, FrontierError> {
        let now = now_millis();
        let threshold_ms = threshold.as_millis() as u64;
        let mut recovered = Vec::new();

        for task in self.store.tasks_in_state(&self.session, TaskState::Assigned)? {
            if task.heartbeat_age_ms(now) <= threshold_ms {
                continue;
            }

            let url = task.url.clone();
            let mut next = task;
            next.state = TaskState::Pending;
            next.last_heartbeat = now;
            if self.apply(TaskState::Assigned, next)? {
                recovered.push(url);
            }
        }

        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered orphaned tasks");
        }
        Ok(recovered)
    }

    /// Keep a lease alive. No-op unless the task is still ASSIGNED.
    pub fn update_heartbeat(&self, url: &str) -> Result<bool, FrontierError> {
        let Some(current) = self.load_assigned(url)? else {
            return Ok(false);
        };

        let mut next = current;
        next.last_heartbeat = now_millis();
        Ok(self.store.transition(TaskState::Assigned, &next)?)
    }

    pub fn get(&self, url: &str) -> Result<Option<FrontierTask>, FrontierError> {
        Ok(self.store.get_task(&self.session, url)?)
    }

    /// Tasks of this session that finished successfully.
    pub fn completed(&self) -> Result<Vec<FrontierTask>, FrontierError> {
        Ok(self.store.tasks_in_state(&self.session, TaskState::Completed)?)
    }

    pub fn stats(&self) -> Result<TaskCounts, FrontierError> {
        Ok(self.store.count_tasks(&self.session)?)
    }

    fn load_assigned(&self, url: &str) -> Result<Option<FrontierTask>, FrontierError> {
        Ok(self
            .store
            .get_task(&self.session, url)?
            .filter(|t| t.state == TaskState::Assigned))
    }

    fn apply(&self, expected: TaskState, next: FrontierTask) -> Result<bool, FrontierError> {
        if !expected.can_transition_to(next.state) {
            return Err(ContractViolation::InvalidTransition {
                url: next.url,
                from: expected,
                to: next.state,
            }
            .into());
        }

        let swapped = self.store.transition(expected, &next)?;
        if swapped {
            debug!(url = %next.url, from = %expected, to = %next.state, "task transition");
        }
        Ok(swapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::Barrier;
    use std::thread;

    fn frontier(max_retries: u32) -> (Arc<MemoryStore>, Frontier) {
        let store = Arc::new(MemoryStore::new());
        let policy = Arc::new(UrlPolicy::new("test.local", Vec::new(), 5));
        let frontier = Frontier::new(store.clone(), policy, "s1", max_retries);
        (store, frontier)
    }

    #[test]
    fn test_discover_normalizes_and_dedups() {
        let (_store, frontier) = frontier(3);
        let created = frontier
            .discover(
                &[
                    "https://test.local/page#a",
                    "https://TEST.local/page",
                    "https://other.local/",
                    "https://test.local/img.png",
                ],
                1,
            )
            .unwrap();
        assert_eq!(created, 1);
        assert_eq!(frontier.stats().unwrap().pending, 1);
    }

    #[test]
    fn test_rediscovery_leaves_completed_task_alone() {
        let (_store, frontier) = frontier(3);
        frontier.discover(&["https://test.local/"], 0).unwrap();
        let task = frontier.assign_next().unwrap().unwrap();
        assert!(frontier.report_success(&task.url).unwrap());

        assert_eq!(frontier.discover(&["https://test.local/"], 0).unwrap(), 0);
        let stored = frontier.get("https://test.local/").unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Completed);
    }

    #[test]
    fn test_shallow_pages_assigned_first() {
        let (_store, frontier) = frontier(3);
        frontier.discover(&["https://test.local/deep"], 3).unwrap();
        frontier.discover(&["https://test.local/"], 0).unwrap();
        assert_eq!(frontier.assign_next().unwrap().unwrap().url, "https://test.local/");
    }

    #[test]
    fn test_failure_retries_then_fails() {
        let (_store, frontier) = frontier(2);
        frontier.discover(&["https://test.local/"], 0).unwrap();

        let first = frontier.assign_next().unwrap().unwrap();
        assert!(frontier.report_failure(&first.url).unwrap());
        assert_eq!(frontier.get(&first.url).unwrap().unwrap().state, TaskState::Pending);

        let second = frontier.assign_next().unwrap().unwrap();
        assert_eq!(second.attempt_count, 2);
        assert!(frontier.report_failure(&second.url).unwrap());
        assert_eq!(frontier.get(&first.url).unwrap().unwrap().state, TaskState::Failed);
        assert!(frontier.assign_next().unwrap().is_none());
    }

    #[test]
    fn test_stale_reports_are_noops() {
        let (_store, frontier) = frontier(3);
        frontier.discover(&["https://test.local/"], 0).unwrap();
        assert!(!frontier.report_success("https://test.local/").unwrap());

        let task = frontier.assign_next().unwrap().unwrap();
        assert!(frontier.report_success(&task.url).unwrap());
        assert!(!frontier.report_success(&task.url).unwrap());
        assert!(!frontier.report_failure(&task.url).unwrap());
        assert!(!frontier.update_heartbeat(&task.url).unwrap());
        assert!(!frontier.report_success("https://test.local/unknown").unwrap());
    }

    #[test]
    fn test_recover_only_touches_expired_leases() {
        let (store, frontier) = frontier(3);
        let now = now_millis();

        let mut stale = FrontierTask::new("s1", "https://test.local/stale".to_string(), 0, 0);
        stale.state = TaskState::Assigned;
        stale.attempt_count = 1;
        stale.last_heartbeat = now - 600_000;
        store.create_if_absent(&stale).unwrap();

        let mut fresh = FrontierTask::new("s1", "https://test.local/fresh".to_string(), 0, 0);
        fresh.state = TaskState::Assigned;
        fresh.attempt_count = 1;
        fresh.last_heartbeat = now;
        store.create_if_absent(&fresh).unwrap();

        let recovered = frontier.recover_crashes(Duration::from_secs(300)).unwrap();
        assert_eq!(recovered, vec!["https://test.local/stale".to_string()]);
        assert_eq!(frontier.get("https://test.local/fresh").unwrap().unwrap().state, TaskState::Assigned);

        let reassigned = frontier.assign_next().unwrap().unwrap();
        assert_eq!(reassigned.url, "https://test.local/stale");
        assert_eq!(reassigned.attempt_count, 2);
    }

    #[test]
    fn test_heartbeat_refreshes_lease() {
        let (store, frontier) = frontier(3);
        let mut task = FrontierTask::new("s1", "https://test.local/".to_string(), 0, 0);
        task.state = TaskState::Assigned;
        task.last_heartbeat = now_millis() - 600_000;
        store.create_if_absent(&task).unwrap();

        assert!(frontier.update_heartbeat("https://test.local/").unwrap());
        assert!(frontier.recover_crashes(Duration::from_secs(300)).unwrap().is_empty());
    }

    #[test]
    fn test_abandoned_task_fails_on_first_attempt() {
        let (_store, frontier) = frontier(3);
        frontier.discover(&["https://test.local/"], 0).unwrap();
        let task = frontier.assign_next().unwrap().unwrap();
        assert_eq!(task.attempt_count, 1);

        assert!(frontier.report_abandoned(&task.url).unwrap());
        assert_eq!(frontier.get(&task.url).unwrap().unwrap().state, TaskState::Failed);
        assert!(!frontier.report_abandoned(&task.url).unwrap());
        assert!(frontier.completed().unwrap().is_empty());
    }

    #[test]
    fn test_racing_reports_on_one_lease_have_one_winner() {
        for round in 0..50 {
            let (store, frontier) = frontier(3);
            let frontier = Arc::new(frontier);
            let url = format!("https://test.local/{round}");
            let mut task = FrontierTask::new("s1", url.clone(), 0, 0);
            task.state = TaskState::Assigned;
            task.attempt_count = 1;
            task.last_heartbeat = now_millis() - 600_000;
            store.create_if_absent(&task).unwrap();

            let barrier = Arc::new(Barrier::new(3));
            let contenders: Vec<Box<dyn Fn(&Frontier) -> bool + Send>> = vec![
                Box::new({
                    let url = url.clone();
                    move |f: &Frontier| f.report_success(&url).unwrap()
                }),
                Box::new({
                    let url = url.clone();
                    move |f: &Frontier| f.report_failure(&url).unwrap()
                }),
                Box::new(|f: &Frontier| !f.recover_crashes(Duration::from_secs(300)).unwrap().is_empty()),
            ];
            let handles: Vec<_> = contenders
                .into_iter()
                .map(|contender| {
                    let frontier = frontier.clone();
                    let barrier = barrier.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        contender(&frontier)
                    })
                })
                .collect();

            let winners = handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|won| *won)
                .count();
            assert_eq!(winners, 1, "round {round}");
            assert_ne!(frontier.get(&url).unwrap().unwrap().state, TaskState::Assigned);
        }
    }

    #[test]
    fn test_store_errors_propagate() {
        let (store, frontier) = frontier(3);
        store.set_unavailable(true);
        assert!(matches!(frontier.assign_next(), Err(FrontierError::Store(_))));
    }
}
