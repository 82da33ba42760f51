//! Structured results of a run.
//!
//! Every stage returns one of these values; the orchestrator assembles them
//! into a [`RunReport`] once, at the end. Nothing here is derived from log
//! text.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backup::BackupOutcome;
use crate::catalog::Shape;

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Per-collection tally produced by a reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationResult {
    pub collection: String,
    pub shape: Shape,
    /// Records written as new documents.
    pub inserted: usize,
    /// Records that updated an existing document, including conflict retries.
    pub updated: usize,
    /// Records that were never written.
    pub skipped: usize,
    /// Inserts that hit a duplicate identity and converged as updates.
    pub conflicts_retried: usize,
    /// Bulk batches submitted.
    pub batches: usize,
    /// Bulk batches that failed and were replayed one operation at a time.
    pub batch_fallbacks: usize,
    /// Why the whole collection was skipped, if it was.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
}

impl ReconciliationResult {
    #[must_use]
    pub fn new(collection: &str, shape: Shape) -> Self {
        Self {
            collection: collection.to_string(),
            shape,
            inserted: 0,
            updated: 0,
            skipped: 0,
            conflicts_retried: 0,
            batches: 0,
            batch_fallbacks: 0,
            skipped_reason: None,
        }
    }

    /// A zero result for a collection that was not reconciled at all.
    #[must_use]
    pub fn skipped_collection(collection: &str, shape: Shape, reason: impl Into<String>) -> Self {
        Self {
            skipped_reason: Some(reason.into()),
            ..Self::new(collection, shape)
        }
    }

    /// Records that reached the target (inserted or updated).
    #[must_use]
    pub const fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

// ---------------------------------------------------------------------------
// Indexes
// ---------------------------------------------------------------------------

/// One index operation that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexFailure {
    pub collection: String,
    pub index: String,
    pub unique: bool,
    pub reason: String,
}

/// Outcome of index provisioning across all collections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexProvisionSummary {
    pub created: usize,
    pub recreated: usize,
    pub dropped_stale: usize,
    pub unchanged: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<IndexFailure>,
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

/// Outcome of comparing one collection's counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CountStatus {
    /// Target count equals source count.
    Match,
    /// Target holds more documents than the source.
    Superset,
    /// Target holds fewer documents than the source.
    Missing,
    /// Source value had an invalid shape; nothing to compare.
    SkippedShape,
    /// Target count could not be read.
    Unavailable,
}

impl CountStatus {
    #[must_use]
    pub const fn passed(self) -> bool {
        matches!(self, Self::Match | Self::Superset | Self::SkippedShape)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Match => "match",
            Self::Superset => "superset",
            Self::Missing => "missing",
            Self::SkippedShape => "skipped_shape",
            Self::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountEntry {
    pub collection: String,
    pub source: u64,
    pub target: u64,
    pub status: CountStatus,
}

/// Count pass over every collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CountReport {
    pub passed: bool,
    pub collections: Vec<CountEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExistenceEntry {
    pub collection: String,
    pub found: u64,
    pub total: u64,
    /// Source records without a usable key; not part of `total`.
    pub unkeyed: u64,
    /// Up to ten keys that were not found.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_sample: Vec<String>,
    pub verified: bool,
}

/// Per-record existence pass over every collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExistenceReport {
    pub passed: bool,
    pub collections: Vec<ExistenceEntry>,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Overall verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Warning,
}

impl RunStatus {
    #[must_use]
    pub const fn from_checks(count: &CountReport, existence: &ExistenceReport) -> Self {
        if count.passed && existence.passed {
            Self::Success
        } else {
            Self::Warning
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Warning => "warning",
        }
    }
}

/// The snapshot a run read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub path: PathBuf,
    pub hash: String,
    pub bytes: u64,
}

/// The store a run wrote to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetInfo {
    pub uri: String,
    pub backend: String,
    pub database: String,
}

/// Wall-clock time spent in one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageTiming {
    pub name: String,
    pub elapsed_ms: u64,
}

/// Records stage timings in execution order.
#[derive(Debug, Default)]
pub struct StageClock {
    stages: Vec<StageTiming>,
}

impl StageClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` and record how long it took under `name`.
    pub fn time<R>(&mut self, name: &str, f: impl FnOnce() -> R) -> R {
        let started = Instant::now();
        let result = f();
        self.record(name, started.elapsed());
        result
    }

    pub fn record(&mut self, name: &str, elapsed: Duration) {
        self.stages.push(StageTiming {
            name: name.to_string(),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        });
    }

    #[must_use]
    pub fn finish(self) -> Vec<StageTiming> {
        self.stages
    }
}

/// Immutable summary of one migration run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub source: SourceInfo,
    pub target: TargetInfo,
    pub backup: BackupOutcome,
    pub indexes: IndexProvisionSummary,
    pub collections: Vec<ReconciliationResult>,
    pub metadata_written: bool,
    pub count_check: CountReport,
    pub existence_check: ExistenceReport,
    pub stages: Vec<StageTiming>,
    pub status: RunStatus,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl RunReport {
    /// Total records inserted across all collections.
    #[must_use]
    pub fn total_inserted(&self) -> usize {
        self.collections.iter().map(|c| c.inserted).sum()
    }

    #[must_use]
    pub fn total_updated(&self) -> usize {
        self.collections.iter().map(|c| c.updated).sum()
    }

    #[must_use]
    pub fn total_skipped(&self) -> usize {
        self.collections.iter().map(|c| c.skipped).sum()
    }

    /// Tally for one collection.
    #[must_use]
    pub fn collection(&self, name: &str) -> Option<&ReconciliationResult> {
        self.collections.iter().find(|c| c.collection == name)
    }
}

/// Result of a verify-only run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerifyReport {
    pub checked_at: DateTime<Utc>,
    pub source: SourceInfo,
    pub target: TargetInfo,
    pub count_check: CountReport,
    pub existence_check: ExistenceReport,
    pub status: RunStatus,
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_status_pass_rules() {
        assert!(CountStatus::Match.passed());
        assert!(CountStatus::Superset.passed());
        assert!(CountStatus::SkippedShape.passed());
        assert!(!CountStatus::Missing.passed());
        assert!(!CountStatus::Unavailable.passed());
    }

    #[test]
    fn count_status_names_match_serialized_form() {
        for status in [CountStatus::Superset, CountStatus::SkippedShape] {
            let json = serde_json::to_value(status).expect("serialize");
            assert_eq!(json, status.as_str());
        }
    }

    #[test]
    fn run_status_needs_both_checks() {
        let ok_count = CountReport {
            passed: true,
            collections: Vec::new(),
        };
        let bad_existence = ExistenceReport {
            passed: false,
            collections: Vec::new(),
        };
        let ok_existence = ExistenceReport {
            passed: true,
            collections: Vec::new(),
        };
        assert_eq!(RunStatus::from_checks(&ok_count, &ok_existence), RunStatus::Success);
        assert_eq!(RunStatus::from_checks(&ok_count, &bad_existence), RunStatus::Warning);
    }

    #[test]
    fn reconciliation_result_serializes_without_empty_reason() {
        let mut result = ReconciliationResult::new("bins", Shape::Array);
        result.inserted = 2;
        let json = serde_json::to_value(&result).expect("serialize");
        assert_eq!(json["shape"], "array");
        assert_eq!(json["inserted"], 2);
        assert!(json.get("skipped_reason").is_none());

        let skipped = ReconciliationResult::skipped_collection("alerts", Shape::Array, "not an array");
        let json = serde_json::to_value(&skipped).expect("serialize");
        assert_eq!(json["skipped_reason"], "not an array");
    }

    #[test]
    fn stage_clock_keeps_order() {
        let mut clock = StageClock::new();
        let value = clock.time("load", || 7);
        clock.record("verify", Duration::from_millis(12));
        let stages = clock.finish();

        assert_eq!(value, 7);
        assert_eq!(stages[0].name, "load");
        assert_eq!(stages[1].elapsed_ms, 12);
    }
}
