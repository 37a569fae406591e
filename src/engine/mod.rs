//! Batch execution: drives issues through the stage pipeline with retries,
//! rate limiting and checkpointing.
//!
//! Two engines share the same contract:
//!
//! - [`SequentialEngine`] processes issues one at a time in input order and
//!   checkpoints after every issue.
//! - [`ParallelEngine`] keeps up to `max_workers` issues in flight and
//!   checkpoints every `checkpoint_interval` completions.
//!
//! In both, the engine's control flow is the only owner of the
//! [`CheckpointStore`]; workers report outcomes back and never write shared
//! state. Per-issue failures are recorded and the batch continues; only
//! resource failures and checkpoint write errors abort a batch.

mod error;
mod parallel;
pub mod rate_limiter;
mod report;
pub mod retry;
mod sequential;
mod worker;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

pub use error::EngineError;
pub use parallel::ParallelEngine;
pub use rate_limiter::{RateLimiter, parse_retry_after};
pub use report::{
    ArticleCounts, BatchReport, IssueOutcome, ProcessingOutcome, REPORT_FILE, StageTimings,
    format_duration,
};
pub use retry::{FailureType, RetryDecision, RetryError, RetryPolicy};
pub use sequential::SequentialEngine;
pub use worker::process_issue;

use crate::checkpoint::CheckpointStore;
use crate::issue::Issue;
use report::ReportBuilder;

/// Minimum allowed worker count.
pub const MIN_WORKERS: usize = 1;

/// Maximum allowed worker count.
pub const MAX_WORKERS: usize = 64;

/// Completions between checkpoint saves in the parallel engine.
pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 5;

/// Default worker count: one fewer than the available cores, at least one.
#[must_use]
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map_or(MIN_WORKERS, |n| n.get().saturating_sub(1))
        .clamp(MIN_WORKERS, MAX_WORKERS)
}

/// Settings shared by both engines.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root for per-issue artifacts and the batch report.
    pub output_dir: PathBuf,
    pub retry_policy: RetryPolicy,
    /// Ignored by [`SequentialEngine`].
    pub max_workers: usize,
    /// Ignored by [`SequentialEngine`], which saves after every issue.
    pub checkpoint_interval: usize,
    /// Wall-clock limit per issue; overruns are recorded as failures.
    pub issue_timeout: Option<Duration>,
    /// Stop dispatching new issues once this much time has passed.
    pub deadline: Option<Duration>,
    /// Write `processing_report.json` at the end of each batch.
    pub write_report: bool,
}

impl EngineConfig {
    #[must_use]
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            retry_policy: RetryPolicy::default(),
            max_workers: default_workers(),
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            issue_timeout: None,
            deadline: None,
            write_report: true,
        }
    }
}

/// Receives progress events from a running batch.
///
/// Every method has an empty default, so observers implement only what they
/// show.
pub trait ProgressObserver: Send + Sync {
    /// Called once before the first issue starts.
    fn batch_started(&self, _pending: usize, _skipped: usize) {}

    /// Called after each issue completes, in completion order.
    fn issue_finished(&self, _outcome: &IssueOutcome) {}

    /// Called once with the final report.
    fn batch_finished(&self, _report: &BatchReport) {}
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {}

/// Decides when a batch should stop dispatching new issues.
#[derive(Debug, Clone)]
pub(crate) struct StopSignal {
    interrupt: Option<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl StopSignal {
    pub(crate) fn new(interrupt: Option<Arc<AtomicBool>>, deadline: Option<Duration>) -> Self {
        Self {
            interrupt,
            deadline: deadline.map(|limit| Instant::now() + limit),
        }
    }

    /// Reason to stop, if any.
    pub(crate) fn check(&self) -> Option<&'static str> {
        if self
            .interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
        {
            return Some("interrupted");
        }
        if self.deadline.is_some_and(|at| Instant::now() >= at) {
            return Some("deadline reached");
        }
        None
    }
}

/// Issues left to run after resume filtering.
#[derive(Debug)]
pub(crate) struct BatchPlan {
    pub(crate) pending: Vec<Issue>,
    pub(crate) report: ReportBuilder,
}

/// Drops issues already processed and duplicate identifiers.
///
/// Both count as skipped, so `total_issues` always equals the input length.
pub(crate) fn plan_batch(issues: Vec<Issue>, checkpoint: &CheckpointStore) -> BatchPlan {
    let total = issues.len();
    let mut seen = HashSet::new();
    let mut pending = Vec::new();
    let mut skipped = Vec::new();

    for issue in issues {
        if !seen.insert(issue.id.clone()) {
            warn!(issue_id = %issue.id, "duplicate issue in input, skipping");
            skipped.push(issue.id);
        } else if checkpoint.contains(&issue.id) {
            debug!(issue_id = %issue.id, "already processed, skipping");
            skipped.push(issue.id);
        } else {
            pending.push(issue);
        }
    }

    info!(
        total,
        pending = pending.len(),
        skipped = skipped.len(),
        "batch planned"
    );
    BatchPlan {
        pending,
        report: ReportBuilder::new(total, skipped),
    }
}

/// Records one outcome in the checkpoint state and report.
pub(crate) fn settle(
    outcome: IssueOutcome,
    checkpoint: &mut CheckpointStore,
    report: &mut ReportBuilder,
    observer: &dyn ProgressObserver,
) {
    if outcome.is_success() {
        checkpoint.mark_succeeded(&outcome.issue_id);
    } else {
        checkpoint.mark_failed(&outcome.issue_id);
    }
    observer.issue_finished(&outcome);
    report.record(outcome);
}

/// Finishes a batch: final checkpoint save, report file, observer.
pub(crate) fn finish_batch(
    report: ReportBuilder,
    checkpoint: &mut CheckpointStore,
    config: &EngineConfig,
    workers: usize,
    interrupted: bool,
    observer: &dyn ProgressObserver,
) -> Result<BatchReport, EngineError> {
    checkpoint.save()?;
    let report = report.finish(workers, interrupted);

    info!(
        total = report.total_issues,
        successful = report.successful,
        failed = report.failed,
        skipped = report.skipped,
        not_dispatched = report.not_dispatched_issues.len(),
        interrupted,
        elapsed = %report.processing_time,
        "batch complete"
    );

    if config.write_report {
        let path = report.write_to(&config.output_dir)?;
        info!(path = %path.display(), "report written");
    }
    observer.batch_finished(&report);
    Ok(report)
}
