//! Durable record of finished issues, enabling resumable batches.
//!
//! # File Format
//!
//! ```json
//! {"processed_issues": ["sn123_1901-01-01_ed-1"], "failed_issues": [], "timestamp": "2026-01-01T00:00:00Z"}
//! ```
//!
//! # Atomic Writes
//!
//! [`CheckpointStore::save`] writes the whole state with a
//! write-to-temp-then-rename sequence:
//! 1. Write to `<path>.tmp`
//! 2. fsync the file
//! 3. Rename to `<path>`
//! 4. fsync the directory
//!
//! A crash at any point leaves either the previous or the new checkpoint.

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors raised while persisting a checkpoint. These abort the batch.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to encode checkpoint: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CheckpointError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Snapshot of batch progress.
///
/// An issue ID is never in both sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Issues that completed every stage.
    #[serde(rename = "processed_issues", default)]
    pub processed: BTreeSet<String>,

    /// Issues whose last run failed. Informational; they are retried.
    #[serde(rename = "failed_issues", default)]
    pub failed: BTreeSet<String>,

    /// Last save time. Files without an offset are read as UTC; a missing or
    /// unreadable value becomes the load time.
    #[serde(rename = "timestamp", default = "Utc::now", deserialize_with = "lenient_timestamp")]
    pub updated_at: DateTime<Utc>,
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    let parsed = raw.as_deref().and_then(|text| {
        DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                text.parse::<NaiveDateTime>()
                    .ok()
                    .map(|naive| naive.and_utc())
            })
    });
    Ok(parsed.unwrap_or_else(|| {
        debug!(timestamp = ?raw, "unreadable checkpoint timestamp, using now");
        Utc::now()
    }))
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            processed: BTreeSet::new(),
            failed: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }
}

impl Checkpoint {
    /// Restores disjointness of a hand-edited file; success wins.
    fn normalize(mut self) -> Self {
        let overlap: Vec<String> = self.processed.intersection(&self.failed).cloned().collect();
        if !overlap.is_empty() {
            warn!(count = overlap.len(), "issues listed as both processed and failed, keeping processed");
            for id in &overlap {
                self.failed.remove(id);
            }
        }
        self
    }
}

/// Owner of the checkpoint file.
///
/// Only the engine's control flow holds a `CheckpointStore`; workers report
/// outcomes and never touch it.
#[derive(Debug)]
pub struct CheckpointStore {
    /// `None` when checkpointing is disabled.
    path: Option<PathBuf>,
    state: Checkpoint,
    saves: u64,
}

impl CheckpointStore {
    /// Opens the checkpoint at `path`, loading prior progress if any.
    ///
    /// A missing or unparseable file yields an empty checkpoint; corruption
    /// costs the resume, never the run.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = Self::load(&path);
        info!(
            processed = state.processed.len(),
            failed = state.failed.len(),
            "checkpoint loaded"
        );
        Self {
            path: Some(path),
            state,
            saves: 0,
        }
    }

    /// A store that starts empty and never writes.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Checkpoint::default(),
            saves: 0,
        }
    }

    /// Reads the checkpoint file at `path`.
    #[must_use]
    pub fn load(path: &Path) -> Checkpoint {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no checkpoint file, starting fresh");
                return Checkpoint::default();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable checkpoint, starting fresh");
                return Checkpoint::default();
            }
        };

        match serde_json::from_slice::<Checkpoint>(&bytes) {
            Ok(checkpoint) => checkpoint.normalize(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt checkpoint, starting fresh");
                Checkpoint::default()
            }
        }
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub fn checkpoint(&self) -> &Checkpoint {
        &self.state
    }

    /// Whether `issue_id` already completed successfully.
    #[must_use]
    pub fn contains(&self, issue_id: &str) -> bool {
        self.state.processed.contains(issue_id)
    }

    /// Whether the last recorded run of `issue_id` failed.
    #[must_use]
    pub fn has_failed(&self, issue_id: &str) -> bool {
        self.state.failed.contains(issue_id)
    }

    pub fn mark_succeeded(&mut self, issue_id: &str) {
        self.state.failed.remove(issue_id);
        self.state.processed.insert(issue_id.to_string());
    }

    pub fn mark_failed(&mut self, issue_id: &str) {
        self.state.processed.remove(issue_id);
        self.state.failed.insert(issue_id.to_string());
    }

    /// Number of successful [`save`](Self::save) calls that hit the disk.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.saves
    }

    /// Persists the full state atomically. No-op for in-memory stores.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if the file cannot be written.
    #[instrument(skip(self), fields(processed = self.state.processed.len(), failed = self.state.failed.len()))]
    pub fn save(&mut self) -> Result<(), CheckpointError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        self.state.updated_at = Utc::now();
        save_atomic(path, &self.state)?;
        self.saves += 1;
        debug!(path = %path.display(), "checkpoint saved");
        Ok(())
    }
}

fn save_atomic(path: &Path, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| CheckpointError::io(parent, e))?;

    let json = serde_json::to_vec_pretty(checkpoint)?;
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| CheckpointError::io(&tmp_path, e))?;
        file.write_all(&json)
            .and_then(|()| file.sync_all())
            .map_err(|e| CheckpointError::io(&tmp_path, e))?;
    }

    std::fs::rename(&tmp_path, path).map_err(|e| CheckpointError::io(path, e))?;
    fsync_dir(parent).map_err(|e| CheckpointError::io(parent, e))?;
    Ok(())
}

/// Makes a rename in `dir` durable.
fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}
