//! Bounded-concurrency engine.
//!
//! The control loop dispatches issues onto a [`JoinSet`] until `max_workers`
//! are in flight, then waits for the next completion. Workers send back their
//! outcome as the task result; only the control loop updates the checkpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use tokio::task::{Id, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use super::worker::run_isolated;
use super::{
    BatchReport, EngineConfig, EngineError, IssueOutcome, MAX_WORKERS, MIN_WORKERS, NoopObserver,
    ProgressObserver, StopSignal, finish_batch, plan_batch, settle,
};
use crate::checkpoint::CheckpointStore;
use crate::issue::Issue;
use crate::stages::{StageError, StagePipeline};

type WorkerResult = (String, Result<IssueOutcome, StageError>);

fn lost_worker(issue_id: String) -> IssueOutcome {
    IssueOutcome::failed(issue_id, None, "worker exited without reporting", 1, Duration::ZERO)
}

/// Processes up to `max_workers` issues concurrently, checkpointing every
/// `checkpoint_interval` completions and once more at the end.
///
/// Completion order is not input order. A worker that panics, overruns its
/// timeout or vanishes without reporting is recorded as a failure of its
/// issue; the batch continues.
pub struct ParallelEngine {
    pipeline: Arc<dyn StagePipeline>,
    checkpoint: CheckpointStore,
    config: EngineConfig,
    interrupt: Option<Arc<AtomicBool>>,
    observer: Arc<dyn ProgressObserver>,
}

impl std::fmt::Debug for ParallelEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelEngine")
            .field("checkpoint", &self.checkpoint)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ParallelEngine {
    /// Creates a parallel engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidWorkers`] if `config.max_workers` is
    /// outside `1..=64` and [`EngineError::InvalidCheckpointInterval`] if
    /// `config.checkpoint_interval` is zero.
    pub fn new(
        pipeline: Arc<dyn StagePipeline>,
        checkpoint: CheckpointStore,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&config.max_workers) {
            return Err(EngineError::InvalidWorkers {
                value: config.max_workers,
            });
        }
        if config.checkpoint_interval == 0 {
            return Err(EngineError::InvalidCheckpointInterval { value: 0 });
        }
        debug!(
            workers = config.max_workers,
            checkpoint_interval = config.checkpoint_interval,
            max_attempts = config.retry_policy.max_attempts(),
            "creating parallel engine"
        );
        Ok(Self {
            pipeline,
            checkpoint,
            config,
            interrupt: None,
            observer: Arc::new(NoopObserver),
        })
    }

    /// Stops dispatching once `flag` is set; in-flight issues finish.
    #[must_use]
    pub fn with_interrupt_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = observer;
        self
    }

    #[must_use]
    pub fn workers(&self) -> usize {
        self.config.max_workers
    }

    #[must_use]
    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    fn spawn(&self, tasks: &mut JoinSet<WorkerResult>, issue: Issue) -> Id {
        let pipeline = Arc::clone(&self.pipeline);
        let output_dir = self.config.output_dir.clone();
        let retry = self.config.retry_policy.clone();
        let timeout = self.config.issue_timeout;
        tasks.spawn(async move {
            let issue_id = issue.id.clone();
            let result = run_isolated(pipeline, issue, &output_dir, retry, timeout).await;
            (issue_id, result)
        })
        .id()
    }

    /// Runs every issue not already in the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Resource`] on a local resource failure, after
    /// cancelling in-flight work and saving progress, and
    /// [`EngineError::Checkpoint`] if progress cannot be persisted.
    #[instrument(skip_all, fields(issues = issues.len(), workers = self.config.max_workers))]
    pub async fn run_batch(&mut self, issues: Vec<Issue>) -> Result<BatchReport, EngineError> {
        let plan = plan_batch(issues, &self.checkpoint);
        let mut report = plan.report;
        let stop = StopSignal::new(self.interrupt.clone(), self.config.deadline);
        self.observer.batch_started(plan.pending.len(), report.skipped());
        info!(pending = plan.pending.len(), "starting parallel batch");

        let mut pending = plan.pending.into_iter();
        let mut tasks = JoinSet::new();
        let mut in_flight: HashMap<Id, String> = HashMap::new();
        let mut since_save = 0;
        let mut interrupted = false;

        loop {
            while !interrupted && in_flight.len() < self.config.max_workers {
                if let Some(reason) = stop.check() {
                    warn!(reason, in_flight = in_flight.len(), "no new issues will be started");
                    interrupted = true;
                    break;
                }
                let Some(issue) = pending.next() else {
                    break;
                };
                debug!(issue_id = %issue.id, "dispatching");
                let issue_id = issue.id.clone();
                let task_id = self.spawn(&mut tasks, issue);
                in_flight.insert(task_id, issue_id);
            }

            let Some(joined) = tasks.join_next_with_id().await else {
                break;
            };

            let outcome = match joined {
                Ok((task_id, (_, Ok(outcome)))) => {
                    in_flight.remove(&task_id);
                    outcome
                }
                Ok((_, (issue_id, Err(source)))) => {
                    error!(issue_id = %issue_id, error = %source, "resource failure, aborting batch");
                    tasks.shutdown().await;
                    self.checkpoint.save()?;
                    return Err(EngineError::Resource { issue_id, source });
                }
                Err(join_error) => {
                    let Some(issue_id) = in_flight.remove(&join_error.id()) else {
                        error!(error = %join_error, "unknown worker task lost");
                        continue;
                    };
                    error!(issue_id = %issue_id, error = %join_error, "worker task lost");
                    lost_worker(issue_id)
                }
            };

            settle(outcome, &mut self.checkpoint, &mut report, self.observer.as_ref());
            since_save += 1;
            if since_save >= self.config.checkpoint_interval {
                self.checkpoint.save()?;
                since_save = 0;
            }
        }

        let mut lost: Vec<String> = in_flight.into_values().collect();
        lost.sort();
        for issue_id in lost {
            warn!(issue_id = %issue_id, "worker exited without reporting");
            settle(
                lost_worker(issue_id),
                &mut self.checkpoint,
                &mut report,
                self.observer.as_ref(),
            );
        }

        pending.for_each(|issue| report.not_dispatched(issue.id));

        finish_batch(
            report,
            &mut self.checkpoint,
            &self.config,
            self.config.max_workers,
            interrupted,
            self.observer.as_ref(),
        )
    }
}
