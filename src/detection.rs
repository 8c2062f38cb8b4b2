//! Drift scoring and classification.
//!
//! Scoring and classification are pure functions; `DetectionEngine` wraps them
//! with the preconditions and builds the verdict record.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, error, warn};

use crate::fingerprint::digest_hex;
use crate::models::{
    now_millis, BaselineEntry, ContentFeatures, ContractViolation, DetectionVerdict, Indicator,
    PageVersion, Severity, VerdictStatus,
};

/// Classification thresholds. Drift strictly below both means CLEAN.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionThresholds {
    pub structural: f64,
    pub content: f64,
}

impl Default for DetectionThresholds {
    fn default() -> Self {
        Self {
            structural: 0.05,
            content: 0.1,
        }
    }
}

/// Count-weighted Jaccard distance between two tag bags, in [0, 1].
pub fn structural_drift(current: &BTreeMap<String, u32>, baseline: &BTreeMap<String, u32>) -> f64 {
    let tags: BTreeSet<&String> = current.keys().chain(baseline.keys()).collect();

    let mut shared: u64 = 0;
    let mut total: u64 = 0;
    for tag in tags {
        let a = current.get(tag).copied().unwrap_or(0);
        let b = baseline.get(tag).copied().unwrap_or(0);
        shared += u64::from(a.min(b));
        total += u64::from(a.max(b));
    }

    if total == 0 {
        return 0.0;
    }
    1.0 - shared as f64 / total as f64
}

/// Share of keys whose values differ; a key on one side only counts as differing.
pub fn content_drift(current: &BTreeMap<&str, String>, baseline: &BTreeMap<&str, String>) -> f64 {
    let keys: BTreeSet<&str> = current.keys().chain(baseline.keys()).copied().collect();
    if keys.is_empty() {
        return 0.0;
    }

    let mismatched = keys
        .iter()
        .filter(|key| current.get(*key) != baseline.get(*key))
        .count();
    mismatched as f64 / keys.len() as f64
}

/// Status, severity and confidence for a pair of drift scores.
///
/// Rules are checked top to bottom and the first match wins; the ranges overlap.
pub fn classify(
    structural: f64,
    content: f64,
    thresholds: &DetectionThresholds,
) -> (VerdictStatus, Severity, f64) {
    if structural < thresholds.structural && content < thresholds.content {
        return (VerdictStatus::Clean, Severity::None, 1.0 - structural.max(content));
    }
    if structural > 0.8 {
        return (VerdictStatus::Defaced, Severity::Critical, 1.0);
    }
    if structural > 0.3 {
        return (VerdictStatus::Defaced, Severity::High, 0.9);
    }
    if content > 0.6 || structural > 0.1 {
        return (VerdictStatus::PotentialDefacement, Severity::Medium, 0.7);
    }
    (VerdictStatus::PotentialDefacement, Severity::Low, 0.5)
}

pub fn indicators_for(structural: f64, current: &ContentFeatures, baseline: &ContentFeatures) -> Vec<Indicator> {
    let mut indicators = Vec::new();
    if structural > 0.0 {
        indicators.push(Indicator::StructuralMutation);
    }
    if structural > 0.5 {
        indicators.push(Indicator::MajorStructuralCollapse);
    }
    if current.title != baseline.title {
        indicators.push(Indicator::TitleDeviation);
    }
    indicators
}

struct Scores {
    structural: f64,
    content: f64,
}

fn score(current: &PageVersion, baseline: &PageVersion) -> Result<Scores, String> {
    let structural = structural_drift(&current.structural_features, &baseline.structural_features);
    let content = content_drift(
        &current.content_features.as_map(),
        &baseline.content_features.as_map(),
    );
    checked_scores(structural, content)
}

fn checked_scores(structural: f64, content: f64) -> Result<Scores, String> {
    for (name, value) in [("structural", structural), ("content", content)] {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(format!("{name} drift out of range: {value}"));
        }
    }
    Ok(Scores { structural, content })
}

/// Compares fingerprints against baselines built with the same extraction version.
#[derive(Debug, Clone)]
pub struct DetectionEngine {
    extraction_version: String,
    thresholds: DetectionThresholds,
}

impl DetectionEngine {
    pub fn new(extraction_version: impl Into<String>, thresholds: DetectionThresholds) -> Self {
        Self {
            extraction_version: extraction_version.into(),
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &DetectionThresholds {
        &self.thresholds
    }

    /// Score `current` against `baseline` and build the verdict.
    ///
    /// A URL mismatch is a caller bug and comes back as an error. Everything
    /// else, including version mismatches and scoring failures, ends in a
    /// verdict.
    pub fn analyze(
        &self,
        session: &str,
        site_id: u64,
        current: &PageVersion,
        baseline: &BaselineEntry,
    ) -> Result<DetectionVerdict, ContractViolation> {
        self.analyze_with(session, site_id, current, baseline, score)
    }

    fn analyze_with<F>(
        &self,
        session: &str,
        site_id: u64,
        current: &PageVersion,
        baseline: &BaselineEntry,
        scorer: F,
    ) -> Result<DetectionVerdict, ContractViolation>
    where
        F: FnOnce(&PageVersion, &PageVersion) -> Result<Scores, String>,
    {
        if current.normalized_url != baseline.page.normalized_url {
            return Err(ContractViolation::IdentityMismatch {
                current: current.normalized_url.clone(),
                baseline: baseline.page.normalized_url.clone(),
            });
        }

        let mut verdict = DetectionVerdict {
            id: digest_hex(&[session, &current.identity, &baseline.baseline_id]),
            session: session.to_string(),
            site_id,
            normalized_url: current.normalized_url.clone(),
            status: VerdictStatus::Clean,
            severity: Severity::None,
            confidence: 1.0,
            structural_drift: 0.0,
            content_drift: 0.0,
            content_changed: current.semantic_hash != baseline.page.semantic_hash,
            indicators: Vec::new(),
            baseline_id: baseline.baseline_id.clone(),
            fingerprint_id: current.identity.clone(),
            created_at: now_millis(),
        };

        if baseline.page.extraction_version != self.extraction_version
            || current.extraction_version != self.extraction_version
        {
            warn!(
                url = %current.normalized_url,
                baseline_version = %baseline.page.extraction_version,
                engine_version = %self.extraction_version,
                "extraction version mismatch"
            );
            verdict.status = VerdictStatus::Failed;
            verdict.confidence = 0.0;
            verdict.indicators.push(Indicator::IncompatibleVersion);
            return Ok(verdict);
        }

        if !verdict.content_changed {
            debug!(url = %current.normalized_url, "semantic hash unchanged");
            return Ok(verdict);
        }

        let scored = catch_unwind(AssertUnwindSafe(|| scorer(current, &baseline.page)))
            .unwrap_or_else(|_| Err("drift scoring panicked".to_string()));

        match scored {
            Ok(scores) => {
                let (status, severity, confidence) =
                    classify(scores.structural, scores.content, &self.thresholds);
                verdict.status = status;
                verdict.severity = severity;
                verdict.confidence = confidence;
                verdict.structural_drift = scores.structural;
                verdict.content_drift = scores.content;
                verdict.indicators = indicators_for(
                    scores.structural,
                    &current.content_features,
                    &baseline.page.content_features,
                );
            }
            Err(reason) => {
                error!(url = %current.normalized_url, %reason, "drift scoring failed");
                verdict.status = VerdictStatus::Failed;
                verdict.severity = Severity::High;
                verdict.confidence = 0.0;
                verdict.structural_drift = 1.0;
                verdict.content_drift = 1.0;
                verdict.indicators = vec![Indicator::ErrorProcessFailed];
            }
        }

        Ok(verdict)
    }
}
