//! One-issue-at-a-time engine.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tracing::{info, instrument, warn};

use super::worker::run_isolated;
use super::{
    BatchReport, EngineConfig, EngineError, NoopObserver, ProgressObserver, StopSignal,
    finish_batch, plan_batch, settle,
};
use crate::checkpoint::CheckpointStore;
use crate::issue::Issue;
use crate::stages::StagePipeline;

/// Processes issues strictly in input order, saving the checkpoint after
/// every issue.
pub struct SequentialEngine {
    pipeline: Arc<dyn StagePipeline>,
    checkpoint: CheckpointStore,
    config: EngineConfig,
    interrupt: Option<Arc<AtomicBool>>,
    observer: Arc<dyn ProgressObserver>,
}

impl std::fmt::Debug for SequentialEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialEngine")
            .field("checkpoint", &self.checkpoint)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SequentialEngine {
    #[must_use]
    pub fn new(
        pipeline: Arc<dyn StagePipeline>,
        checkpoint: CheckpointStore,
        config: EngineConfig,
    ) -> Self {
        Self {
            pipeline,
            checkpoint,
            config,
            interrupt: None,
            observer: Arc::new(NoopObserver),
        }
    }

    /// Stops dispatching once `flag` is set; the issue in progress finishes.
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
    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    /// Runs every issue not already in the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Resource`] on a local resource failure and
    /// [`EngineError::Checkpoint`] if progress cannot be persisted. Progress
    /// made before the error is saved first.
    #[instrument(skip_all, fields(issues = issues.len()))]
    pub async fn run_batch(&mut self, issues: Vec<Issue>) -> Result<BatchReport, EngineError> {
        let plan = plan_batch(issues, &self.checkpoint);
        let mut report = plan.report;
        let stop = StopSignal::new(self.interrupt.clone(), self.config.deadline);
        self.observer.batch_started(plan.pending.len(), report.skipped());
        info!(pending = plan.pending.len(), "starting sequential batch");

        let mut interrupted = false;
        let mut pending = plan.pending.into_iter();
        while let Some(issue) = pending.next() {
            if let Some(reason) = stop.check() {
                warn!(reason, "stopping before next issue");
                interrupted = true;
                report.not_dispatched(issue.id);
                pending.by_ref().for_each(|rest| report.not_dispatched(rest.id));
                break;
            }

            let issue_id = issue.id.clone();
            let result = run_isolated(
                Arc::clone(&self.pipeline),
                issue,
                &self.config.output_dir,
                self.config.retry_policy.clone(),
                self.config.issue_timeout,
            )
            .await;

            match result {
                Ok(outcome) => {
                    settle(outcome, &mut self.checkpoint, &mut report, self.observer.as_ref());
                    self.checkpoint.save()?;
                }
                Err(source) => {
                    self.checkpoint.save()?;
                    return Err(EngineError::Resource { issue_id, source });
                }
            }
        }

        finish_batch(
            report,
            &mut self.checkpoint,
            &self.config,
            1,
            interrupted,
            self.observer.as_ref(),
        )
    }
}
