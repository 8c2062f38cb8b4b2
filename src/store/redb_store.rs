//! Durable store on a single redb file.
//!
//! redb admits one write transaction at a time, so every CAS, claim and
//! promotion below runs inside an exclusive write transaction; readers never
//! block writers. Records are JSON-encoded.

use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use super::{
    claim_order, mark_claimed, BaselineStore, FingerprintStore, StoreError, TaskStore, VerdictStore,
};
use crate::models::{
    BaselineProfile, BaselineStatus, DetectionVerdict, FrontierTask, PageVersion, TaskCounts,
    TaskState,
};

const TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");
const BASELINES: TableDefinition<&str, &[u8]> = TableDefinition::new("baselines");
const ACTIVE_BASELINES: TableDefinition<u64, &str> = TableDefinition::new("active_baselines");
const VERDICTS: TableDefinition<&str, &[u8]> = TableDefinition::new("verdicts");
/// Append order of the verdict log: sequence number -> verdict id.
const VERDICT_LOG: TableDefinition<u64, &str> = TableDefinition::new("verdict_log");
const FINGERPRINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("fingerprints");
const LATEST_FINGERPRINT: TableDefinition<&str, &str> = TableDefinition::new("latest_fingerprint");
/// (session, url) -> the page as that session saw it. Kept whole because
/// text-only edits share a structural identity.
const SESSION_FINGERPRINTS: TableDefinition<&str, &[u8]> = TableDefinition::new("session_fingerprints");

/// Key separator between session and url; cannot appear in a normalized URL.
const KEY_SEPARATOR: char = '\u{1f}';

fn task_key(session: &str, url: &str) -> String {
    format!("{}{}{}", session, KEY_SEPARATOR, url)
}

fn session_prefix(session: &str) -> String {
    format!("{}{}", session, KEY_SEPARATOR)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(serde_json::to_vec(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// All tables live in `sentinel_state.redb` under the data directory.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Result<Self, StoreError> {
        let data_path = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_path)?;

        let db = Database::create(data_path.join("sentinel_state.redb"))?;

        // Create every table up front so read transactions never hit a missing table.
        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(TASKS)?;
            write_txn.open_table(BASELINES)?;
            write_txn.open_table(ACTIVE_BASELINES)?;
            write_txn.open_table(VERDICTS)?;
            write_txn.open_table(VERDICT_LOG)?;
            write_txn.open_table(FINGERPRINTS)?;
            write_txn.open_table(LATEST_FINGERPRINT)?;
            write_txn.open_table(SESSION_FINGERPRINTS)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    fn read_session_tasks(&self, session: &str) -> Result<Vec<FrontierTask>, StoreError> {
        let prefix = session_prefix(session);
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TASKS)?;

        let mut tasks = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            if key.value().starts_with(&prefix) {
                tasks.push(decode(value.value())?);
            }
        }
        Ok(tasks)
    }

    fn load_baseline_in_txn(
        txn: &WriteTransaction,
        id: &str,
    ) -> Result<Option<BaselineProfile>, StoreError> {
        let table = txn.open_table(BASELINES)?;
        let bytes = table.get(id)?.map(|guard| guard.value().to_vec());
        bytes.map(|b| decode(&b)).transpose()
    }

    fn write_baseline_in_txn(txn: &WriteTransaction, profile: &BaselineProfile) -> Result<(), StoreError> {
        let mut table = txn.open_table(BASELINES)?;
        let bytes = encode(profile)?;
        table.insert(profile.id.as_str(), bytes.as_slice())?;
        Ok(())
    }
}

impl TaskStore for RedbStore {
    fn create_if_absent(&self, task: &FrontierTask) -> Result<bool, StoreError> {
        let key = task_key(&task.session, &task.url);
        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut table = write_txn.open_table(TASKS)?;
            if table.get(key.as_str())?.is_some() {
                false
            } else {
                let bytes = encode(task)?;
                table.insert(key.as_str(), bytes.as_slice())?;
                true
            }
        };

        if inserted {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(inserted)
    }

    fn get_task(&self, session: &str, url: &str) -> Result<Option<FrontierTask>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TASKS)?;
        let bytes = table
            .get(task_key(session, url).as_str())?
            .map(|guard| guard.value().to_vec());
        bytes.map(|b| decode(&b)).transpose()
    }

    fn transition(&self, expected: TaskState, next: &FrontierTask) -> Result<bool, StoreError> {
        let key = task_key(&next.session, &next.url);
        let write_txn = self.db.begin_write()?;
        let swapped = {
            let mut table = write_txn.open_table(TASKS)?;
            let current = table.get(key.as_str())?.map(|guard| guard.value().to_vec());
            match current {
                Some(bytes) => {
                    let current: FrontierTask = decode(&bytes)?;
                    if current.state == expected {
                        let bytes = encode(next)?;
                        table.insert(key.as_str(), bytes.as_slice())?;
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if swapped {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(swapped)
    }

    fn claim_next(&self, session: &str, now: u64) -> Result<Option<FrontierTask>, StoreError> {
        let prefix = session_prefix(session);
        let write_txn = self.db.begin_write()?;
        let claimed = {
            let mut table = write_txn.open_table(TASKS)?;

            let mut best: Option<FrontierTask> = None;
            for entry in table.iter()? {
                let (key, value) = entry?;
                if !key.value().starts_with(&prefix) {
                    continue;
                }
                let task: FrontierTask = decode(value.value())?;
                if task.state != TaskState::Pending {
                    continue;
                }
                let better = best
                    .as_ref()
                    .map_or(true, |current| claim_order(&task, current).is_lt());
                if better {
                    best = Some(task);
                }
            }

            match best {
                Some(mut task) => {
                    mark_claimed(&mut task, now);
                    let bytes = encode(&task)?;
                    table.insert(task_key(&task.session, &task.url).as_str(), bytes.as_slice())?;
                    Some(task)
                }
                None => None,
            }
        };

        if claimed.is_some() {
            write_txn.commit()?;
        } else {
            write_txn.abort()?;
        }
        Ok(claimed)
    }

    fn tasks_in_state(&self, session: &str, state: TaskState) -> Result<Vec<FrontierTask>, StoreError> {
        Ok(self
            .read_session_tasks(session)?
            .into_iter()
            .filter(|t| t.state == state)
            .collect())
    }

    fn count_tasks(&self, session: &str) -> Result<TaskCounts, StoreError> {
        let mut counts = TaskCounts::default();
        for task in self.read_session_tasks(session)? {
            counts.record(task.state);
        }
        Ok(counts)
    }
}

impl BaselineStore for RedbStore {
    fn save_baseline(&self, profile: &BaselineProfile) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        if Self::load_baseline_in_txn(&write_txn, &profile.id)?.is_some() {
            write_txn.abort()?;
            return Ok(());
        }

        let mut stored = profile.clone();
        stored.status = BaselineStatus::Inactive;
        Self::write_baseline_in_txn(&write_txn, &stored)?;
        write_txn.commit()?;
        Ok(())
    }

    fn get_baseline(&self, id: &str) -> Result<Option<BaselineProfile>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BASELINES)?;
        let bytes = table.get(id)?.map(|guard| guard.value().to_vec());
        bytes.map(|b| decode(&b)).transpose()
    }

    fn baselines_for_site(&self, site_id: u64) -> Result<Vec<BaselineProfile>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BASELINES)?;

        let mut profiles = Vec::new();
        for entry in table.iter()? {
            let (_key, value) = entry?;
            let profile: BaselineProfile = decode(value.value())?;
            if profile.site_id == site_id {
                profiles.push(profile);
            }
        }
        profiles.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(profiles)
    }

    fn active_baseline(&self, site_id: u64) -> Result<Option<BaselineProfile>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let active = read_txn.open_table(ACTIVE_BASELINES)?;
        let active_id = active.get(site_id)?.map(|guard| guard.value().to_string());

        let Some(id) = active_id else {
            return Ok(None);
        };

        let table = read_txn.open_table(BASELINES)?;
        let bytes = table.get(id.as_str())?.map(|guard| guard.value().to_vec());
        bytes.map(|b| decode(&b)).transpose()
    }

    fn promote(&self, site_id: u64, baseline_id: &str) -> Result<bool, StoreError> {
        // The write transaction is exclusive: concurrent promotions queue here.
        let write_txn = self.db.begin_write()?;

        let target = match Self::load_baseline_in_txn(&write_txn, baseline_id)? {
            Some(profile) if profile.site_id == site_id => profile,
            _ => {
                write_txn.abort()?;
                return Ok(false);
            }
        };

        let previous_id = {
            let active = write_txn.open_table(ACTIVE_BASELINES)?;
            let id = active.get(site_id)?.map(|guard| guard.value().to_string());
            id
        };

        if let Some(previous_id) = previous_id.filter(|id| id != baseline_id) {
            if let Some(mut previous) = Self::load_baseline_in_txn(&write_txn, &previous_id)? {
                previous.status = BaselineStatus::Inactive;
                Self::write_baseline_in_txn(&write_txn, &previous)?;
            }
        }

        let mut target = target;
        target.status = BaselineStatus::Active;
        Self::write_baseline_in_txn(&write_txn, &target)?;
        {
            let mut active = write_txn.open_table(ACTIVE_BASELINES)?;
            active.insert(site_id, baseline_id)?;
        }

        write_txn.commit()?;
        Ok(true)
    }
}

impl VerdictStore for RedbStore {
    fn save_verdict(&self, verdict: &DetectionVerdict) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        let inserted = {
            let mut table = write_txn.open_table(VERDICTS)?;
            if table.get(verdict.id.as_str())?.is_some() {
                false
            } else {
                let bytes = encode(verdict)?;
                table.insert(verdict.id.as_str(), bytes.as_slice())?;
                true
            }
        };

        if !inserted {
            write_txn.abort()?;
            return Ok(());
        }

        {
            let mut log = write_txn.open_table(VERDICT_LOG)?;
            let next = log.last()?.map(|(seq, _)| seq.value() + 1).unwrap_or(0);
            log.insert(next, verdict.id.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn verdicts_for_site(&self, site_id: u64) -> Result<Vec<DetectionVerdict>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let log = read_txn.open_table(VERDICT_LOG)?;
        let table = read_txn.open_table(VERDICTS)?;

        let mut verdicts = Vec::new();
        for entry in log.iter()? {
            let (_seq, id) = entry?;
            let bytes = table.get(id.value())?.map(|guard| guard.value().to_vec());
            if let Some(bytes) = bytes {
                let verdict: DetectionVerdict = decode(&bytes)?;
                if verdict.site_id == site_id {
                    verdicts.push(verdict);
                }
            }
        }
        Ok(verdicts)
    }

    fn latest_verdict(&self, site_id: u64, normalized_url: &str) -> Result<Option<DetectionVerdict>, StoreError> {
        Ok(self
            .verdicts_for_site(site_id)?
            .into_iter()
            .filter(|v| v.normalized_url == normalized_url)
            .last())
    }
}

impl FingerprintStore for RedbStore {
    fn save_fingerprint(&self, session: &str, page: &PageVersion) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(FINGERPRINTS)?;
            let exists = table.get(page.identity.as_str())?.is_some();
            if !exists {
                let bytes = encode(page)?;
                table.insert(page.identity.as_str(), bytes.as_slice())?;
            }
        }
        {
            let mut latest = write_txn.open_table(LATEST_FINGERPRINT)?;
            latest.insert(page.normalized_url.as_str(), page.identity.as_str())?;
        }
        {
            let mut by_session = write_txn.open_table(SESSION_FINGERPRINTS)?;
            let key = task_key(session, &page.normalized_url);
            let bytes = encode(page)?;
            by_session.insert(key.as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get_fingerprint(&self, identity: &str) -> Result<Option<PageVersion>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FINGERPRINTS)?;
        let bytes = table.get(identity)?.map(|guard| guard.value().to_vec());
        bytes.map(|b| decode(&b)).transpose()
    }

    fn latest_fingerprint(&self, normalized_url: &str) -> Result<Option<PageVersion>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let latest = read_txn.open_table(LATEST_FINGERPRINT)?;
        let identity = latest
            .get(normalized_url)?
            .map(|guard| guard.value().to_string());

        let Some(identity) = identity else {
            return Ok(None);
        };

        let table = read_txn.open_table(FINGERPRINTS)?;
        let bytes = table.get(identity.as_str())?.map(|guard| guard.value().to_vec());
        bytes.map(|b| decode(&b)).transpose()
    }

    fn session_fingerprints(&self, session: &str) -> Result<Vec<PageVersion>, StoreError> {
        let prefix = session_prefix(session);
        let read_txn = self.db.begin_read()?;
        let by_session = read_txn.open_table(SESSION_FINGERPRINTS)?;

        let mut pages = Vec::new();
        for entry in by_session.range(prefix.as_str()..)? {
            let (key, value) = entry?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            pages.push(decode(value.value())?);
        }
        Ok(pages)
    }
}
