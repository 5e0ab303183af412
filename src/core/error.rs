// src/core/error.rs

use std::time::Duration;

use thiserror::Error;

use crate::core::models::{JobId, JobState, Phase};

/// Why a single adapter run did not produce usable output.
///
/// These never escalate on their own: the executor records them in the
/// `PhaseResult` and the phase status decides what happens next.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    #[error("adapter timed out after {0:?}")]
    Timeout(Duration),

    #[error("phase deadline exceeded")]
    PhaseDeadlineExceeded,

    #[error("cancelled")]
    Cancelled,

    #[error("process exited with status {code:?}: {stderr}")]
    NonZeroExit { code: Option<i32>, stderr: String },

    #[error("malformed output: {0}")]
    MalformedOutput(String),

    #[error("failed to launch: {0}")]
    Launch(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("adapter task panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

impl AdapterError {
    /// Default retry classification when the adapter did not state one.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::Network(_) | AdapterError::Launch(_))
    }
}

/// Errors raised by a `JobStore`.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Io(_) | StorageError::Unavailable(_) => true,
            StorageError::Serialization(_) => false,
        }
    }
}

/// Errors surfaced by the orchestrator's command interface.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("invalid target domain {0:?}")]
    InvalidTarget(String),

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("job {0} is already running")]
    AlreadyRunning(JobId),

    #[error("job {id} is {state} and cannot be resumed")]
    NotResumable { id: JobId, state: JobState },

    #[error("illegal transition {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("phase {0} failed: no usable adapter output")]
    PhaseFailed(Phase),

    #[error("checkpoint failed after {attempts} attempts: {source}")]
    Checkpoint {
        attempts: u32,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("job task ended unexpectedly: {0}")]
    Join(String),
}

/// Configuration validation failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
