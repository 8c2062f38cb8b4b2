//! In-memory store: every table is a map behind a `parking_lot::Mutex`, so each
//! operation is one critical section and therefore atomic.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use super::{
    claim_order, mark_claimed, BaselineStore, FingerprintStore, StoreError, TaskStore, VerdictStore,
};
use crate::models::{
    BaselineProfile, BaselineStatus, DetectionVerdict, FrontierTask, PageVersion, TaskCounts,
    TaskState,
};

type TaskKey = (String, String);

#[derive(Default)]
struct VerdictLog {
    ids: HashSet<String>,
    entries: Vec<DetectionVerdict>,
}

#[derive(Default)]
struct FingerprintTables {
    by_identity: HashMap<String, PageVersion>,
    latest_by_url: HashMap<String, String>,
    by_session: BTreeMap<TaskKey, PageVersion>,
}

#[derive(Default)]
pub struct MemoryStore {
    tasks: Mutex<BTreeMap<TaskKey, FrontierTask>>,
    baselines: Mutex<BTreeMap<String, BaselineProfile>>,
    verdicts: Mutex<VerdictLog>,
    fingerprints: Mutex<FingerprintTables>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".to_string()));
        }
        Ok(())
    }

    fn key(session: &str, url: &str) -> TaskKey {
        (session.to_string(), url.to_string())
    }
}

impl TaskStore for MemoryStore {
    fn create_if_absent(&self, task: &FrontierTask) -> Result<bool, StoreError> {
        self.check()?;
        let mut tasks = self.tasks.lock();
        let key = Self::key(&task.session, &task.url);
        if tasks.contains_key(&key) {
            return Ok(false);
        }
        tasks.insert(key, task.clone());
        Ok(true)
    }

    fn get_task(&self, session: &str, url: &str) -> Result<Option<FrontierTask>, StoreError> {
        self.check()?;
        Ok(self.tasks.lock().get(&Self::key(session, url)).cloned())
    }

    fn transition(&self, expected: TaskState, next: &FrontierTask) -> Result<bool, StoreError> {
        self.check()?;
        let mut tasks = self.tasks.lock();
        match tasks.get_mut(&Self::key(&next.session, &next.url)) {
            Some(current) if current.state == expected => {
                *current = next.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn claim_next(&self, session: &str, now: u64) -> Result<Option<FrontierTask>, StoreError> {
        self.check()?;
        let mut tasks = self.tasks.lock();
        let best_key = tasks
            .iter()
            .filter(|((s, _), t)| s == session && t.state == TaskState::Pending)
            .min_by(|(_, a), (_, b)| claim_order(a, b))
            .map(|(key, _)| key.clone());

        Ok(best_key.and_then(|key| {
            tasks.get_mut(&key).map(|task| {
                mark_claimed(task, now);
                task.clone()
            })
        }))
    }

    fn tasks_in_state(&self, session: &str, state: TaskState) -> Result<Vec<FrontierTask>, StoreError> {
        self.check()?;
        Ok(self
            .tasks
            .lock()
            .iter()
            .filter(|((s, _), t)| s == session && t.state == state)
            .map(|(_, t)| t.clone())
            .collect())
    }

    fn count_tasks(&self, session: &str) -> Result<TaskCounts, StoreError> {
        self.check()?;
        let mut counts = TaskCounts::default();
        for ((s, _), task) in self.tasks.lock().iter() {
            if s == session {
                counts.record(task.state);
            }
        }
        Ok(counts)
    }
}

impl BaselineStore for MemoryStore {
    fn save_baseline(&self, profile: &BaselineProfile) -> Result<(), StoreError> {
        self.check()?;
        let mut baselines = self.baselines.lock();
        if !baselines.contains_key(&profile.id) {
            let mut stored = profile.clone();
            stored.status = BaselineStatus::Inactive;
            baselines.insert(stored.id.clone(), stored);
        }
        Ok(())
    }

    fn get_baseline(&self, id: &str) -> Result<Option<BaselineProfile>, StoreError> {
        self.check()?;
        Ok(self.baselines.lock().get(id).cloned())
    }

    fn baselines_for_site(&self, site_id: u64) -> Result<Vec<BaselineProfile>, StoreError> {
        self.check()?;
        let mut profiles: Vec<BaselineProfile> = self
            .baselines
            .lock()
            .values()
            .filter(|p| p.site_id == site_id)
            .cloned()
            .collect();
        profiles.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(profiles)
    }

    fn active_baseline(&self, site_id: u64) -> Result<Option<BaselineProfile>, StoreError> {
        self.check()?;
        Ok(self
            .baselines
            .lock()
            .values()
            .find(|p| p.site_id == site_id && p.is_active())
            .cloned())
    }

    fn promote(&self, site_id: u64, baseline_id: &str) -> Result<bool, StoreError> {
        self.check()?;
        // Holding the table lock for the whole protocol serializes promotions.
        let mut baselines = self.baselines.lock();
        let target_exists = baselines
            .get(baseline_id)
            .is_some_and(|p| p.site_id == site_id);
        if !target_exists {
            return Ok(false);
        }

        for profile in baselines.values_mut().filter(|p| p.site_id == site_id) {
            profile.status = BaselineStatus::Inactive;
        }
        if let Some(target) = baselines.get_mut(baseline_id) {
            target.status = BaselineStatus::Active;
        }
        Ok(true)
    }
}

impl VerdictStore for MemoryStore {
    fn save_verdict(&self, verdict: &DetectionVerdict) -> Result<(), StoreError> {
        self.check()?;
        let mut log = self.verdicts.lock();
        if log.ids.insert(verdict.id.clone()) {
            log.entries.push(verdict.clone());
        }
        Ok(())
    }

    fn verdicts_for_site(&self, site_id: u64) -> Result<Vec<DetectionVerdict>, StoreError> {
        self.check()?;
        Ok(self
            .verdicts
            .lock()
            .entries
            .iter()
            .filter(|v| v.site_id == site_id)
            .cloned()
            .collect())
    }

    fn latest_verdict(&self, site_id: u64, normalized_url: &str) -> Result<Option<DetectionVerdict>, StoreError> {
        self.check()?;
        Ok(self
            .verdicts
            .lock()
            .entries
            .iter()
            .rev()
            .find(|v| v.site_id == site_id && v.normalized_url == normalized_url)
            .cloned())
    }
}

impl FingerprintStore for MemoryStore {
    fn save_fingerprint(&self, session: &str, page: &PageVersion) -> Result<(), StoreError> {
        self.check()?;
        let mut tables = self.fingerprints.lock();
        tables
            .by_identity
            .entry(page.identity.clone())
            .or_insert_with(|| page.clone());
        tables
            .latest_by_url
            .insert(page.normalized_url.clone(), page.identity.clone());
        tables
            .by_session
            .insert(Self::key(session, &page.normalized_url), page.clone());
        Ok(())
    }

    fn get_fingerprint(&self, identity: &str) -> Result<Option<PageVersion>, StoreError> {
        self.check()?;
        Ok(self.fingerprints.lock().by_identity.get(identity).cloned())
    }

    fn latest_fingerprint(&self, normalized_url: &str) -> Result<Option<PageVersion>, StoreError> {
        self.check()?;
        let tables = self.fingerprints.lock();
        Ok(tables
            .latest_by_url
            .get(normalized_url)
            .and_then(|identity| tables.by_identity.get(identity))
            .cloned())
    }

    fn session_fingerprints(&self, session: &str) -> Result<Vec<PageVersion>, StoreError> {
        self.check()?;
        let tables = self.fingerprints.lock();
        Ok(tables
            .by_session
            .iter()
            .filter(|((s, _), _)| s == session)
            .map(|(_, page)| page.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(url: &str, priority: i64, heartbeat: u64) -> FrontierTask {
        let mut t = FrontierTask::new("s1", url.to_string(), 0, priority);
        t.last_heartbeat = heartbeat;
        t
    }

    #[test]
    fn test_create_if_absent_keeps_existing_state() {
        let store = MemoryStore::new();
        let mut first = task("https://a.test/", 0, 10);
        assert!(store.create_if_absent(&first).unwrap());

        first.state = TaskState::Completed;
        assert!(!store.create_if_absent(&first).unwrap());
        let stored = store.get_task("s1", "https://a.test/").unwrap().unwrap();
        assert_eq!(stored.state, TaskState::Pending);
    }

    #[test]
    fn test_claim_order_priority_then_heartbeat() {
        let store = MemoryStore::new();
        store.create_if_absent(&task("https://a.test/low", -2, 1)).unwrap();
        store.create_if_absent(&task("https://a.test/new", 0, 50)).unwrap();
        store.create_if_absent(&task("https://a.test/old", 0, 5)).unwrap();

        let urls: Vec<String> = (0..3)
            .map(|_| store.claim_next("s1", 100).unwrap().unwrap().url)
            .collect();
        assert_eq!(
            urls,
            vec!["https://a.test/old", "https://a.test/new", "https://a.test/low"]
        );
        assert!(store.claim_next("s1", 100).unwrap().is_none());
    }

    #[test]
    fn test_claim_is_session_scoped() {
        let store = MemoryStore::new();
        store.create_if_absent(&task("https://a.test/", 0, 1)).unwrap();
        assert!(store.claim_next("other", 5).unwrap().is_none());
        let claimed = store.claim_next("s1", 5).unwrap().unwrap();
        assert_eq!(claimed.state, TaskState::Assigned);
        assert_eq!(claimed.attempt_count, 1);
        assert_eq!(claimed.last_heartbeat, 5);
    }

    #[test]
    fn test_transition_is_compare_and_swap() {
        let store = MemoryStore::new();
        store.create_if_absent(&task("https://a.test/", 0, 1)).unwrap();
        let mut next = store.claim_next("s1", 2).unwrap().unwrap();
        next.state = TaskState::Completed;

        assert!(!store.transition(TaskState::Pending, &next).unwrap());
        assert!(store.transition(TaskState::Assigned, &next).unwrap());
        assert!(!store.transition(TaskState::Assigned, &next).unwrap());
    }

    #[test]
    fn test_unavailable_store_errors() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.count_tasks("s1"),
            Err(StoreError::Unavailable(_))
        ));
    }
}
