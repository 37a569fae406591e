//! StoryDredge Core Library
//!
//! Turns digitized newspaper issues (OCR text from an online archive) into
//! classified, validated article records, one issue at a time or with a
//! bounded pool of workers, resuming safely after interruption.
//!
//! # Architecture
//!
//! - [`stages`] - the five-stage contract (fetch, clean, split, classify,
//!   format) and its archive/Ollama-backed implementation
//! - [`engine`] - sequential and parallel batch engines, retry policy, rate
//!   limiter and the batch report
//! - [`checkpoint`] - durable record of processed and failed issues
//! - [`cache`] - classification cache keyed by content fingerprint
//! - [`issue`] - issue identifiers and issue-list parsing

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod checkpoint;
pub mod engine;
pub mod issue;
pub mod stages;

// Re-export commonly used types
pub use cache::{CacheError, CacheStats, ContentCache, DEFAULT_CACHE_TTL, fingerprint};
pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore};
pub use engine::{
    BatchReport, DEFAULT_CHECKPOINT_INTERVAL, EngineConfig, EngineError, FailureType,
    IssueOutcome, ParallelEngine, ProcessingOutcome, ProgressObserver, RateLimiter, RetryDecision,
    RetryError, RetryPolicy, SequentialEngine, default_workers,
};
pub use issue::{Issue, IssueListError, load_issue_list, parse_issue_list};
pub use stages::{
    Article, ClassifiedArticle, IssueContext, NewspaperPipeline, PipelineConfig, Stage,
    StageError, StagePipeline,
};
