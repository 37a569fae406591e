//! Per-issue outcomes and the batch report.
//!
//! The report is written to `<output-dir>/processing_report.json` once per
//! batch run:
//!
//! ```json
//! {
//!   "total_issues": 3, "successful": 2, "failed": 1, "skipped": 0,
//!   "processing_time": "0h 1m 12s",
//!   "successful_issues": ["issue1", "issue3"], "failed_issues": ["issue2"], "skipped_issues": [],
//!   "timestamp": "2026-10-19T12:00:00Z",
//!   "workers": 1, "interrupted": false, "issue_stats": [ ... ]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use tokio::time::Instant;

use super::EngineError;
use crate::stages::Stage;

/// File name of the batch report inside the output directory.
pub const REPORT_FILE: &str = "processing_report.json";

/// Articles carried through each counting stage for one issue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArticleCounts {
    pub extracted: usize,
    pub classified: usize,
    pub written: usize,
}

/// Wall-clock time spent in each stage for one issue, retries included.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageTimings(BTreeMap<Stage, Duration>);

impl StageTimings {
    /// Adds `elapsed` to the time recorded for `stage`.
    pub fn record(&mut self, stage: Stage, elapsed: Duration) {
        *self.0.entry(stage).or_default() += elapsed;
    }

    #[must_use]
    pub fn get(&self, stage: Stage) -> Option<Duration> {
        self.0.get(&stage).copied()
    }

    #[must_use]
    pub fn total(&self) -> Duration {
        self.0.values().sum()
    }
}

impl Serialize for StageTimings {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (stage, elapsed) in &self.0 {
            map.serialize_entry(stage.as_str(), &elapsed.as_secs_f64())?;
        }
        map.end()
    }
}

fn serialize_secs<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(elapsed.as_secs_f64())
}

/// How one issue ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessingOutcome {
    Succeeded {
        counts: ArticleCounts,
        timings: StageTimings,
    },
    Failed {
        /// Stage that failed; `None` when the worker itself died or timed out.
        stage: Option<Stage>,
        error: String,
        attempt_count: u32,
    },
}

/// Outcome of one issue together with its identity and duration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IssueOutcome {
    pub issue_id: String,
    #[serde(flatten)]
    pub outcome: ProcessingOutcome,
    #[serde(rename = "processing_time", serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    #[serde(rename = "timestamp")]
    pub finished_at: DateTime<Utc>,
}

impl IssueOutcome {
    #[must_use]
    pub fn succeeded(
        issue_id: impl Into<String>,
        counts: ArticleCounts,
        timings: StageTimings,
        elapsed: Duration,
    ) -> Self {
        Self {
            issue_id: issue_id.into(),
            outcome: ProcessingOutcome::Succeeded { counts, timings },
            elapsed,
            finished_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn failed(
        issue_id: impl Into<String>,
        stage: Option<Stage>,
        error: impl Into<String>,
        attempt_count: u32,
        elapsed: Duration,
    ) -> Self {
        Self {
            issue_id: issue_id.into(),
            outcome: ProcessingOutcome::Failed {
                stage,
                error: error.into(),
                attempt_count,
            },
            elapsed,
            finished_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ProcessingOutcome::Succeeded { .. })
    }
}

/// Summary of one batch run.
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub total_issues: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Human-readable wall-clock duration, `"Xh Ym Zs"`.
    pub processing_time: String,
    pub processing_time_secs: f64,
    pub successful_issues: Vec<String>,
    pub failed_issues: Vec<String>,
    pub skipped_issues: Vec<String>,
    /// Issues never started because the batch was stopped early.
    pub not_dispatched_issues: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub workers: usize,
    pub interrupted: bool,
    /// Mean seconds per processed issue.
    pub avg_issue_time: f64,
    /// Processed issues per hour.
    pub throughput: f64,
    pub issue_stats: Vec<IssueOutcome>,
}

impl BatchReport {
    /// Writes the report as `processing_report.json` under `output_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Report`] if the file cannot be written.
    pub fn write_to(&self, output_dir: &Path) -> Result<PathBuf, EngineError> {
        let path = output_dir.join(REPORT_FILE);
        let json = serde_json::to_vec_pretty(self)?;
        let io_err = |source| EngineError::Report {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(output_dir).map_err(io_err)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(io_err)?;
        std::fs::rename(&tmp, &path).map_err(io_err)?;
        Ok(path)
    }
}

/// Accumulates outcomes while a batch runs.
#[derive(Debug)]
pub(crate) struct ReportBuilder {
    started: Instant,
    total: usize,
    skipped: Vec<String>,
    not_dispatched: Vec<String>,
    outcomes: Vec<IssueOutcome>,
}

impl ReportBuilder {
    pub(crate) fn new(total: usize, skipped: Vec<String>) -> Self {
        Self {
            started: Instant::now(),
            total,
            skipped,
            not_dispatched: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    pub(crate) fn skipped(&self) -> usize {
        self.skipped.len()
    }

    pub(crate) fn record(&mut self, outcome: IssueOutcome) {
        self.outcomes.push(outcome);
    }

    pub(crate) fn not_dispatched(&mut self, issue_id: String) {
        self.not_dispatched.push(issue_id);
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn finish(self, workers: usize, interrupted: bool) -> BatchReport {
        let elapsed = self.started.elapsed();
        let (successful_issues, failed_issues): (Vec<_>, Vec<_>) =
            self.outcomes.iter().partition(|o| o.is_success());
        let successful_issues: Vec<String> =
            successful_issues.into_iter().map(|o| o.issue_id.clone()).collect();
        let failed_issues: Vec<String> =
            failed_issues.into_iter().map(|o| o.issue_id.clone()).collect();

        let processed = self.outcomes.len();
        let avg_issue_time = if processed == 0 {
            0.0
        } else {
            self.outcomes.iter().map(|o| o.elapsed.as_secs_f64()).sum::<f64>() / processed as f64
        };
        let hours = elapsed.as_secs_f64() / 3600.0;
        let throughput = if hours > 0.0 {
            processed as f64 / hours
        } else {
            0.0
        };

        BatchReport {
            total_issues: self.total,
            successful: successful_issues.len(),
            failed: failed_issues.len(),
            skipped: self.skipped.len(),
            processing_time: format_duration(elapsed),
            processing_time_secs: elapsed.as_secs_f64(),
            successful_issues,
            failed_issues,
            skipped_issues: self.skipped,
            not_dispatched_issues: self.not_dispatched,
            timestamp: Utc::now(),
            workers,
            interrupted,
            avg_issue_time,
            throughput,
            issue_stats: self.outcomes,
        }
    }
}

/// Formats a duration as `"Xh Ym Zs"`.
///
/// ```
/// use std::time::Duration;
/// use storydredge_core::engine::format_duration;
///
/// assert_eq!(format_duration(Duration::from_secs(3723)), "1h 2m 3s");
/// ```
#[must_use]
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}
