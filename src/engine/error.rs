//! Batch-fatal engine errors.
//!
//! Per-issue failures never surface here; they are recorded as
//! [`ProcessingOutcome::Failed`](super::ProcessingOutcome::Failed) and the
//! batch moves on.

use std::path::PathBuf;

use thiserror::Error;

use super::{MAX_WORKERS, MIN_WORKERS};
use crate::checkpoint::CheckpointError;
use crate::stages::StageError;

/// Error type for batch runs.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Worker count outside the supported range.
    #[error("invalid worker count {value}: must be between {MIN_WORKERS} and {MAX_WORKERS}")]
    InvalidWorkers { value: usize },

    /// Checkpoint interval of zero.
    #[error("invalid checkpoint interval {value}: must be at least 1")]
    InvalidCheckpointInterval { value: usize },

    /// Checkpoint could not be persisted.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// An issue hit a local resource failure (disk, permissions).
    #[error("resource failure while processing {issue_id}: {source}")]
    Resource {
        issue_id: String,
        #[source]
        source: StageError,
    },

    /// Report file could not be written.
    #[error("cannot write report {path}: {source}")]
    Report {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Report could not be encoded.
    #[error("cannot encode report: {0}")]
    ReportEncode(#[from] serde_json::Error),
}
