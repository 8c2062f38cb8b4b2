use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Milliseconds since the UNIX epoch; every persisted timestamp uses this unit.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Caller bugs. These are not recoverable and are never turned into outcomes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContractViolation {
    #[error("invalid task transition {from} -> {to} for {url}")]
    InvalidTransition {
        url: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("fingerprint url {current} does not match baseline url {baseline}")]
    IdentityMismatch { current: String, baseline: String },
}

// ============================================================================
// FRONTIER TASKS
// ============================================================================

/// Lifecycle of a crawl task inside one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Never produced: discover() creates tasks directly as Pending.
    Discovered,
    Pending,
    Assigned,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    /// Edges of the task state machine. Anything else is a caller bug.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Assigned)
                | (TaskState::Assigned, TaskState::Completed)
                | (TaskState::Assigned, TaskState::Pending)
                | (TaskState::Assigned, TaskState::Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskState::Discovered => "DISCOVERED",
            TaskState::Pending => "PENDING",
            TaskState::Assigned => "ASSIGNED",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

/// One URL to crawl within a session. Unique per (session, url) and never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrontierTask {
    pub session: String,
    pub url: String,
    pub state: TaskState,
    pub attempt_count: u32,
    /// Epoch millis of the last lease refresh (or of creation / requeue).
    pub last_heartbeat: u64,
    pub priority: i64,
    pub depth: u32,
}

impl FrontierTask {
    pub fn new(session: &str, url: String, depth: u32, priority: i64) -> Self {
        Self {
            session: session.to_string(),
            url,
            state: TaskState::Pending,
            attempt_count: 0,
            last_heartbeat: now_millis(),
            priority,
            depth,
        }
    }

    pub fn heartbeat_age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_heartbeat)
    }
}

/// Per-state task counts for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub assigned: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    pub fn record(&mut self, state: TaskState) {
        match state {
            TaskState::Pending => self.pending += 1,
            TaskState::Assigned => self.assigned += 1,
            TaskState::Completed => self.completed += 1,
            TaskState::Failed => self.failed += 1,
            TaskState::Discovered => {}
        }
    }

    /// True while any task can still make progress.
    pub fn has_open_work(&self) -> bool {
        self.pending > 0 || self.assigned > 0
    }

    pub fn total(&self) -> usize {
        self.pending + self.assigned + self.completed + self.failed
    }
}

impl fmt::Display for TaskCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frontier: {} pending, {} assigned, {} completed, {} failed",
            self.pending, self.assigned, self.completed, self.failed
        )
    }
}

// ============================================================================
// FINGERPRINTS
// ============================================================================

/// Weighting signals pulled from a page. Never part of identity.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContentFeatures {
    pub title: Option<String>,
    pub meta_description: Option<String>,
    /// Character count rounded down to a coarse bucket.
    pub approx_size: usize,
}

impl ContentFeatures {
    pub const TITLE: &'static str = "title";
    pub const META_DESCRIPTION: &'static str = "meta_description";
    pub const APPROX_SIZE: &'static str = "approx_size";

    /// Flattened key/value view; absent features are absent keys.
    pub fn as_map(&self) -> BTreeMap<&'static str, String> {
        let mut map = BTreeMap::new();
        if let Some(title) = &self.title {
            map.insert(Self::TITLE, title.clone());
        }
        if let Some(description) = &self.meta_description {
            map.insert(Self::META_DESCRIPTION, description.clone());
        }
        map.insert(Self::APPROX_SIZE, self.approx_size.to_string());
        map
    }
}

/// Immutable fingerprint of one crawl of one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageVersion {
    /// hash(url | structural_digest | extraction_version)
    pub identity: String,
    pub normalized_url: String,
    /// Hash of the ordered opening-tag skeleton.
    pub structural_digest: String,
    /// Hash of the indented element/attribute/text line stream.
    pub semantic_hash: String,
    pub structural_features: BTreeMap<String, u32>,
    pub content_features: ContentFeatures,
    pub extraction_version: String,
}

// ============================================================================
// BASELINES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BaselineStatus {
    Inactive,
    Active,
}

/// Trusted snapshot of a site's pages. Only the promotion protocol touches `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineProfile {
    pub id: String,
    pub site_id: u64,
    pub root_url: String,
    pub extraction_version: String,
    pub created_at: u64,
    pub status: BaselineStatus,
    /// Page fingerprints keyed by normalized URL.
    pub pages: BTreeMap<String, PageVersion>,
}

impl BaselineProfile {
    pub fn is_active(&self) -> bool {
        self.status == BaselineStatus::Active
    }

    pub fn page(&self, normalized_url: &str) -> Option<&PageVersion> {
        self.pages.get(normalized_url)
    }
}

/// The baseline page a detection run compares against.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineEntry {
    pub baseline_id: String,
    pub site_id: u64,
    pub page: PageVersion,
}

// ============================================================================
// VERDICTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictStatus {
    Clean,
    PotentialDefacement,
    Defaced,
    Failed,
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            VerdictStatus::Clean => "CLEAN",
            VerdictStatus::PotentialDefacement => "POTENTIAL_DEFACEMENT",
            VerdictStatus::Defaced => "DEFACED",
            VerdictStatus::Failed => "FAILED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::None => "NONE",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

/// Non-exclusive tags attached to a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Indicator {
    StructuralMutation,
    MajorStructuralCollapse,
    TitleDeviation,
    IncompatibleVersion,
    ErrorProcessFailed,
}

impl fmt::Display for Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Indicator::StructuralMutation => "STRUCTURAL_MUTATION",
            Indicator::MajorStructuralCollapse => "MAJOR_STRUCTURAL_COLLAPSE",
            Indicator::TitleDeviation => "TITLE_DEVIATION",
            Indicator::IncompatibleVersion => "INCOMPATIBLE_VERSION",
            Indicator::ErrorProcessFailed => "ERROR_PROCESS_FAILED",
        };
        f.write_str(label)
    }
}

/// Append-only detection record; the verdict log is the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionVerdict {
    /// hash(session | fingerprint identity | baseline id)
    pub id: String,
    pub session: String,
    pub site_id: u64,
    pub normalized_url: String,
    pub status: VerdictStatus,
    pub severity: Severity,
    pub confidence: f64,
    pub structural_drift: f64,
    pub content_drift: f64,
    /// Whether the semantic hashes differ.
    pub content_changed: bool,
    pub indicators: Vec<Indicator>,
    pub baseline_id: String,
    pub fingerprint_id: String,
    pub created_at: u64,
}

impl DetectionVerdict {
    pub fn has_indicator(&self, indicator: Indicator) -> bool {
        self.indicators.contains(&indicator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_state_edges() {
        assert!(TaskState::Pending.can_transition_to(TaskState::Assigned));
        assert!(TaskState::Assigned.can_transition_to(TaskState::Pending));
        assert!(TaskState::Assigned.can_transition_to(TaskState::Failed));
        assert!(!TaskState::Completed.can_transition_to(TaskState::Pending));
        assert!(!TaskState::Failed.can_transition_to(TaskState::Assigned));
        assert!(!TaskState::Pending.can_transition_to(TaskState::Completed));
        assert!(!TaskState::Discovered.can_transition_to(TaskState::Assigned));
    }

    #[test]
    fn test_content_feature_map_skips_absent_keys() {
        let features = ContentFeatures {
            title: Some("Home".to_string()),
            meta_description: None,
            approx_size: 256,
        };
        let map = features.as_map();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(ContentFeatures::TITLE).map(String::as_str), Some("Home"));
        assert!(!map.contains_key(ContentFeatures::META_DESCRIPTION));
    }

    #[test]
    fn test_verdict_enums_serialize_as_tags() {
        let json = serde_json::to_string(&Indicator::MajorStructuralCollapse).unwrap();
        assert_eq!(json, "\"MAJOR_STRUCTURAL_COLLAPSE\"");
        let json = serde_json::to_string(&VerdictStatus::PotentialDefacement).unwrap();
        assert_eq!(json, "\"POTENTIAL_DEFACEMENT\"");
        assert!(Severity::Critical > Severity::High);
    }
}
