//! Runs one issue through every stage.
//!
//! Fetch and per-article classification go through the [`RetryPolicy`];
//! clean, split and format run once. Any per-article failure fails the whole
//! issue. Only resource failures escape as `Err`; everything else becomes a
//! [`ProcessingOutcome::Failed`](super::ProcessingOutcome::Failed).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use super::report::{ArticleCounts, IssueOutcome, StageTimings};
use super::retry::{RetryError, RetryPolicy};
use crate::issue::Issue;
use crate::stages::{IssueContext, Stage, StageError, StagePipeline};

/// Attempt count reported for stages that are never retried.
const SINGLE_ATTEMPT: u32 = 1;

/// What a failed stage turns into.
enum StageFailure {
    /// Recorded against the issue; the batch continues.
    Issue(IssueOutcome),
    /// Batch-fatal.
    Resource(StageError),
}

struct IssueRun<'a> {
    ctx: &'a IssueContext,
    started: Instant,
}

impl IssueRun<'_> {
    fn fail(&self, stage: Stage, error: StageError, message: String, attempts: u32) -> StageFailure {
        if error.is_resource() {
            return StageFailure::Resource(error);
        }
        warn!(
            issue_id = %self.ctx.issue_id(),
            stage = %stage,
            attempts,
            error = %message,
            "issue failed"
        );
        StageFailure::Issue(IssueOutcome::failed(
            self.ctx.issue_id(),
            Some(stage),
            message,
            attempts,
            self.started.elapsed(),
        ))
    }

    fn once(&self, stage: Stage, error: StageError) -> StageFailure {
        let message = error.to_string();
        self.fail(stage, error, message, SINGLE_ATTEMPT)
    }

    fn retried(&self, stage: Stage, error: RetryError<StageError>) -> StageFailure {
        let message = error.to_string();
        let attempts = error.attempts();
        self.fail(stage, error.into_last_error(), message, attempts)
    }
}

/// Processes one issue to completion.
///
/// # Errors
///
/// Returns the [`StageError`] of a resource failure. Every other failure is
/// reported through the returned outcome.
#[instrument(skip_all, fields(issue_id = %ctx.issue_id()))]
pub async fn process_issue(
    pipeline: &dyn StagePipeline,
    ctx: &IssueContext,
    retry: &RetryPolicy,
) -> Result<IssueOutcome, StageError> {
    match run_stages(pipeline, ctx, retry).await {
        Ok(outcome) => Ok(outcome),
        Err(StageFailure::Issue(outcome)) => Ok(outcome),
        Err(StageFailure::Resource(error)) => Err(error),
    }
}

async fn run_stages(
    pipeline: &dyn StagePipeline,
    ctx: &IssueContext,
    retry: &RetryPolicy,
) -> Result<IssueOutcome, StageFailure> {
    let run = IssueRun {
        ctx,
        started: Instant::now(),
    };
    let mut timings = StageTimings::default();
    let mut counts = ArticleCounts::default();

    let clock = Instant::now();
    let raw = retry
        .run("fetch", || pipeline.fetch(ctx), StageError::failure_type)
        .await
        .map_err(|e| run.retried(Stage::Fetch, e))?;
    timings.record(Stage::Fetch, clock.elapsed());

    let clock = Instant::now();
    let cleaned = pipeline
        .clean(ctx, &raw)
        .await
        .map_err(|e| run.once(Stage::Clean, e))?;
    timings.record(Stage::Clean, clock.elapsed());

    let clock = Instant::now();
    let articles = pipeline
        .split(ctx, &cleaned)
        .await
        .map_err(|e| run.once(Stage::Split, e))?;
    timings.record(Stage::Split, clock.elapsed());
    counts.extracted = articles.len();

    // Every article is classified before any record is written, so a failed
    // issue leaves nothing in the record tree.
    let mut classified = Vec::with_capacity(articles.len());
    for article in &articles {
        let clock = Instant::now();
        let label = format!("classify article {}", article.index);
        let result = retry
            .run(&label, || pipeline.classify(ctx, article), StageError::failure_type)
            .await
            .map_err(|e| run.retried(Stage::Classify, e))?;
        timings.record(Stage::Classify, clock.elapsed());
        counts.classified += 1;
        classified.push(result);
    }

    for article in &classified {
        let clock = Instant::now();
        pipeline
            .format_and_write(ctx, article)
            .await
            .map_err(|e| run.once(Stage::Format, e))?;
        timings.record(Stage::Format, clock.elapsed());
        counts.written += 1;
    }

    let elapsed = run.started.elapsed();
    info!(
        articles = counts.written,
        elapsed_ms = elapsed.as_millis(),
        "issue processed"
    );
    Ok(IssueOutcome::succeeded(ctx.issue_id(), counts, timings, elapsed))
}

/// Aborts the spawned issue task when dropped. A bare `JoinHandle` detaches
/// on drop, which would let a cancelled issue keep writing output.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs [`process_issue`] on its own task, so a panic or an overrun fails
/// only this issue.
///
/// # Errors
///
/// Propagates resource failures from [`process_issue`].
pub(crate) async fn run_isolated(
    pipeline: Arc<dyn StagePipeline>,
    issue: Issue,
    output_dir: &Path,
    retry: RetryPolicy,
    timeout: Option<Duration>,
) -> Result<IssueOutcome, StageError> {
    let issue_id = issue.id.clone();
    let ctx = IssueContext::new(issue, output_dir);
    let started = Instant::now();

    let mut task = AbortOnDrop(tokio::spawn(async move {
        process_issue(pipeline.as_ref(), &ctx, &retry).await
    }));

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut task.0).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(issue_id = %issue_id, limit_secs = limit.as_secs(), "issue timed out");
                return Ok(IssueOutcome::failed(
                    issue_id,
                    None,
                    format!("timed out after {}s", limit.as_secs()),
                    SINGLE_ATTEMPT,
                    started.elapsed(),
                ));
            }
        },
        None => (&mut task.0).await,
    };

    match joined {
        Ok(result) => result,
        Err(join_error) => {
            error!(issue_id = %issue_id, error = %join_error, "worker crashed");
            Ok(IssueOutcome::failed(
                issue_id,
                None,
                format!("worker crashed: {join_error}"),
                SINGLE_ATTEMPT,
                started.elapsed(),
            ))
        }
    }
}
