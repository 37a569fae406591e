//! Error type shared by every pipeline stage.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::Stage;
use crate::engine::FailureType;

/// Errors raised by a stage while processing one issue.
#[derive(Debug, Error)]
pub enum StageError {
    /// Network-level error (DNS resolution, connection refused, body read).
    #[error("network error calling {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout calling {url}")]
    Timeout { url: String },

    /// Non-success HTTP response.
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        url: String,
        status: u16,
        /// Parsed Retry-After header, if the server sent one.
        retry_after: Option<Duration>,
    },

    /// The issue identifier is not a valid archive identifier.
    #[error("invalid archive identifier {id:?}")]
    InvalidIdentifier { id: String },

    /// Stage input or output failed validation; retrying will not help.
    #[error("{stage} validation failed: {reason}")]
    Validation { stage: Stage, reason: String },

    /// The model answered with something that is not the expected JSON.
    #[error("unparseable model response: {reason}")]
    Unparseable { reason: String },

    /// Local file system error writing output or artifacts.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StageError {
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let url = url.into();
        if source.is_timeout() {
            Self::Timeout { url }
        } else {
            Self::Network { url, source }
        }
    }

    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    pub fn validation(stage: Stage, reason: impl Into<String>) -> Self {
        Self::Validation {
            stage,
            reason: reason.into(),
        }
    }

    pub fn unparseable(reason: impl Into<String>) -> Self {
        Self::Unparseable {
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classifies this error for retry decisions.
    ///
    /// # HTTP Status Code Classification
    ///
    /// | Status | Type |
    /// |--------|------|
    /// | 408 | Transient |
    /// | 429 | RateLimited |
    /// | 5xx | Transient |
    /// | other | Permanent |
    ///
    /// Model output that fails to parse is transient: the model is
    /// nondeterministic and a second call may answer well-formed.
    #[must_use]
    pub fn failure_type(&self) -> FailureType {
        match self {
            Self::Network { source, .. } => {
                if source.is_builder() {
                    FailureType::Permanent
                } else {
                    FailureType::Transient
                }
            }
            Self::Timeout { .. } | Self::Unparseable { .. } => FailureType::Transient,
            Self::HttpStatus { status, .. } => match status {
                429 => FailureType::RateLimited,
                408 | 500..=599 => FailureType::Transient,
                _ => FailureType::Permanent,
            },
            Self::InvalidIdentifier { .. } | Self::Validation { .. } | Self::Io { .. } => {
                FailureType::Permanent
            }
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.failure_type().is_retryable()
    }

    /// Local resource failures (disk full, permission denied) that would hit
    /// every issue alike; these abort the batch instead of failing one issue.
    #[must_use]
    pub fn is_resource(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}
