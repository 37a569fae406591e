//! One batch run from parsed arguments to exit outcome.

use std::io::{self, IsTerminal};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use storydredge_core::engine::NoopObserver;
use storydredge_core::engine::rate_limiter::DEFAULT_PERIOD;
use storydredge_core::engine::retry::DEFAULT_JITTER;
use storydredge_core::stages::ArticleSplitter;
use storydredge_core::{
    BatchReport, CheckpointStore, ContentCache, EngineConfig, Issue, NewspaperPipeline,
    ParallelEngine, PipelineConfig, ProgressObserver, RateLimiter, RetryPolicy, SequentialEngine,
    StagePipeline, load_issue_list,
};
use tracing::{debug, info, warn};

use super::config::{self, Settings};
use super::exit_handler::determine_exit_outcome;
use super::progress::BarObserver;
use super::terminal;
use crate::ProcessExit;
use crate::cli::Args;

pub(crate) async fn run(args: Args) -> Result<ProcessExit> {
    let file_config = config::load_file_config(args.config.as_deref())?;
    let settings = Settings::resolve(&args, &file_config)?;
    debug!(?settings, "settings resolved");

    let issues = collect_issues(&args)?;
    if issues.is_empty() && !args.clean_cache {
        info!("No issues given. Pass identifiers as arguments or use --issues-file.");
        return Ok(ProcessExit::Success);
    }

    let cache = Arc::new(match &settings.cache_dir {
        Some(dir) => ContentCache::open(dir, settings.cache_ttl)
            .with_context(|| format!("Failed to open cache directory '{}'", dir.display()))?,
        None => ContentCache::disabled(),
    });
    if args.clean_cache {
        let removed = cache.clean_expired().await?;
        info!(removed, "expired cache entries removed");
        if issues.is_empty() {
            return Ok(ProcessExit::Success);
        }
    }

    let limiter = Arc::new(if settings.rate_limit == 0 {
        debug!("rate limiting disabled");
        RateLimiter::disabled()
    } else {
        RateLimiter::new(settings.rate_limit, DEFAULT_PERIOD)
    });

    let pipeline: Arc<dyn StagePipeline> = Arc::new(NewspaperPipeline::new(
        pipeline_config(&settings),
        Arc::clone(&limiter),
        Arc::clone(&cache),
    )?);

    let checkpoint = match &settings.checkpoint_file {
        Some(path) => CheckpointStore::open(path),
        None => {
            debug!("checkpointing disabled");
            CheckpointStore::in_memory()
        }
    };

    let engine_config = EngineConfig {
        output_dir: settings.output_dir.clone(),
        retry_policy: retry_policy(&settings),
        max_workers: settings.workers,
        checkpoint_interval: settings.checkpoint_interval,
        issue_timeout: settings.issue_timeout,
        deadline: settings.deadline,
        write_report: true,
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_signal = Arc::clone(&interrupted);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight issues");
            interrupted_signal.store(true, Ordering::SeqCst);
        }
    });

    let observer: Arc<dyn ProgressObserver> = if terminal::should_use_progress_bar(
        io::stderr().is_terminal(),
        args.quiet,
        terminal::is_dumb_terminal(),
    ) {
        Arc::new(BarObserver::new())
    } else {
        Arc::new(NoopObserver)
    };

    let report = if settings.workers > 1 {
        ParallelEngine::new(pipeline, checkpoint, engine_config)?
            .with_interrupt_flag(interrupted)
            .with_observer(observer)
            .run_batch(issues)
            .await?
    } else {
        SequentialEngine::new(pipeline, checkpoint, engine_config)
            .with_interrupt_flag(interrupted)
            .with_observer(observer)
            .run_batch(issues)
            .await?
    };

    let stats = cache.stats();
    info!(
        hits = stats.hits,
        misses = stats.misses,
        hit_rate_percent = stats.hit_rate_percent(),
        rate_limit_wait_ms = limiter.cumulative_delay().as_millis(),
        "cache and rate limiter totals"
    );

    if !args.quiet {
        print_summary(&report);
    }
    Ok(determine_exit_outcome(&report))
}

/// Backoff is jittered when several workers share the archive.
fn retry_policy(settings: &Settings) -> RetryPolicy {
    let policy = RetryPolicy::with_max_retries(settings.max_retries);
    if settings.workers > 1 {
        policy.with_jitter(DEFAULT_JITTER)
    } else {
        policy
    }
}

fn pipeline_config(settings: &Settings) -> PipelineConfig {
    PipelineConfig {
        output_dir: settings.output_dir.clone(),
        archive_url: settings.archive_url.clone(),
        model_url: settings.model_url.clone(),
        model: settings.model.clone(),
        fetch_timeout: settings.fetch_timeout,
        classify_timeout: settings.classify_timeout,
        raw_text_dir: settings.raw_text_dir(),
        default_publication: settings.publication.clone(),
        splitter: ArticleSplitter {
            min_article_length: settings.min_article_length,
            drop_advertisements: settings.drop_advertisements,
        },
        write_artifacts: settings.write_artifacts,
    }
}

/// Positional identifiers first, then the issues file.
fn collect_issues(args: &Args) -> Result<Vec<Issue>> {
    let mut issues: Vec<Issue> = args.issues.iter().map(Issue::new).collect();
    if let Some(path) = &args.issues_file {
        let listed = load_issue_list(path)
            .with_context(|| format!("Failed to load issues file '{}'", path.display()))?;
        info!(count = listed.len(), path = %path.display(), "issues file loaded");
        issues.extend(listed);
    }
    Ok(issues)
}

#[allow(clippy::print_stdout)]
fn print_summary(report: &BatchReport) {
    println!(
        "Processed {} issue(s) in {}: {} succeeded, {} failed, {} skipped",
        report.total_issues,
        report.processing_time,
        report.successful,
        report.failed,
        report.skipped
    );
    for issue_id in &report.failed_issues {
        println!("  failed: {issue_id}");
    }
    if report.interrupted {
        println!(
            "Stopped early; {} issue(s) not started. Re-run to resume.",
            report.not_dispatched_issues.len()
        );
    }
}
