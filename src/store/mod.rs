//! Persistence boundary.
//!
//! Each trait is the contract a backing store must honor; every mutation is
//! atomic at this boundary. Saves of immutable records are idempotent:
//! re-saving an identical record is a no-op, not an error.

pub mod memory;
pub mod redb_store;

pub use memory::MemoryStore;
pub use redb_store::RedbStore;

use thiserror::Error;

use crate::models::{
    BaselineProfile, DetectionVerdict, FrontierTask, PageVersion, TaskCounts, TaskState,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("Database creation error: {0}")]
    RedbCreate(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub trait TaskStore: Send + Sync {
    /// Insert `task` unless a task already exists for its (session, url),
    /// whatever that task's state. Returns whether it was inserted.
    fn create_if_absent(&self, task: &FrontierTask) -> Result<bool, StoreError>;

    fn get_task(&self, session: &str, url: &str) -> Result<Option<FrontierTask>, StoreError>;

    /// Compare-and-swap: replace the stored task keyed by `next`'s (session, url)
    /// only if its current state equals `expected`. Returns whether it swapped.
    fn transition(&self, expected: TaskState, next: &FrontierTask) -> Result<bool, StoreError>;

    /// Atomically pick the PENDING task with the highest priority (oldest
    /// heartbeat first on ties), mark it ASSIGNED, bump its attempt count and
    /// stamp its heartbeat with `now`. Concurrent callers never receive the
    /// same task and never wait on one another's selection.
    fn claim_next(&self, session: &str, now: u64) -> Result<Option<FrontierTask>, StoreError>;

    fn tasks_in_state(&self, session: &str, state: TaskState) -> Result<Vec<FrontierTask>, StoreError>;

    fn count_tasks(&self, session: &str) -> Result<TaskCounts, StoreError>;
}

pub trait BaselineStore: Send + Sync {
    /// Stores the profile as INACTIVE; only `promote` activates.
    fn save_baseline(&self, profile: &BaselineProfile) -> Result<(), StoreError>;

    fn get_baseline(&self, id: &str) -> Result<Option<BaselineProfile>, StoreError>;

    /// All profiles for a site, oldest first.
    fn baselines_for_site(&self, site_id: u64) -> Result<Vec<BaselineProfile>, StoreError>;

    fn active_baseline(&self, site_id: u64) -> Result<Option<BaselineProfile>, StoreError>;

    /// In one exclusive transaction: deactivate whatever is active for the
    /// site, then activate `baseline_id` if it exists and belongs to the site.
    /// Returns false (with everything rolled back) when no such baseline exists.
    fn promote(&self, site_id: u64, baseline_id: &str) -> Result<bool, StoreError>;
}

pub trait VerdictStore: Send + Sync {
    fn save_verdict(&self, verdict: &DetectionVerdict) -> Result<(), StoreError>;

    /// Verdict log for a site, oldest first.
    fn verdicts_for_site(&self, site_id: u64) -> Result<Vec<DetectionVerdict>, StoreError>;

    fn latest_verdict(&self, site_id: u64, normalized_url: &str) -> Result<Option<DetectionVerdict>, StoreError>;
}

pub trait FingerprintStore: Send + Sync {
    /// Store `page` (a no-op when its identity is already known) and record it
    /// as the latest page for its URL, both globally and within `session`.
    fn save_fingerprint(&self, session: &str, page: &PageVersion) -> Result<(), StoreError>;

    fn get_fingerprint(&self, identity: &str) -> Result<Option<PageVersion>, StoreError>;

    /// Most recently saved fingerprint for a URL.
    fn latest_fingerprint(&self, normalized_url: &str) -> Result<Option<PageVersion>, StoreError>;

    /// Latest page per URL as fingerprinted by `session`, ordered by URL.
    fn session_fingerprints(&self, session: &str) -> Result<Vec<PageVersion>, StoreError>;
}

/// Ordering used by `claim_next`: priority desc, heartbeat asc, url asc.
pub(crate) fn claim_order(a: &FrontierTask, b: &FrontierTask) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.last_heartbeat.cmp(&b.last_heartbeat))
        .then_with(|| a.url.cmp(&b.url))
}

/// Shared claim mutation so every store applies the same lease rules.
pub(crate) fn mark_claimed(task: &mut FrontierTask, now: u64) {
    task.state = TaskState::Assigned;
    task.attempt_count = task.attempt_count.saturating_add(1);
    task.last_heartbeat = now;
}
