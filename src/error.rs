//! Error types for the write pipeline.
//!
//! Two failure classes are kept strictly apart:
//! - [`TransportError`]: the whole bulk call failed (connection, timeout,
//!   payload construction). The affected batch is requeued unchanged.
//! - [`BackendFailure`]: the backend accepted the call but rejected one
//!   specific item. That item enters the backoff/retry path.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

/// Failure of an entire bulk round-trip.
///
/// A transport error never carries per-item detail: the backend was not
/// reached, or its answer never arrived, so nothing is known about any
/// individual item in the batch.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// The bulk call exceeded the configured per-call timeout.
    #[error("bulk call timed out after {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },
    /// The backend could not be reached.
    #[error("connection to backend failed: {reason}")]
    Connection { reason: String },
    /// The bulk payload could not be constructed.
    #[error("failed to build bulk payload: {reason}")]
    Payload { reason: String },
    /// The executor gave up on the call before a result was produced.
    #[error("executor failed: {reason}")]
    Executor { reason: String },
}

/// Broad classification of a backend-reported per-item failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The item lost a version race against a concurrent writer.
    VersionConflict,
    /// The backend rejected the item outright (mapping, validation).
    Rejected,
    /// The backend shed load and asked for the item to be resent later.
    Throttled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::VersionConflict => write!(f, "version conflict"),
            FailureKind::Rejected => write!(f, "rejected"),
            FailureKind::Throttled => write!(f, "throttled"),
        }
    }
}

/// Backend-reported failure of a single item inside an otherwise
/// successful bulk response.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {reason}")]
pub struct BackendFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl BackendFailure {
    pub fn conflict(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::VersionConflict,
            reason: reason.into(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Rejected,
            reason: reason.into(),
        }
    }

    pub fn throttled(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Throttled,
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by the coordinator's public operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The executor's work queue is closed and no further batches can run.
    #[error("bulk executor is no longer accepting work")]
    ExecutorClosed,
    /// The pipeline was constructed with an invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
