//! Error types for indexing-runner
//!
//! This module defines the error hierarchy that covers:
//! - Cancellation outcomes (caller abort, session disposal, host shutdown)
//! - Per-item processing failures
//! - Configuration and CLI errors
//! - Worker thread errors
//!
//! Cancellation is modelled as a value, not an unwinding signal. A worker
//! that observes a cancelled scope returns `Cancelled`, and the scheduler
//! decides whether that becomes a retry or a failure for its caller.

use std::fmt;
use thiserror::Error;

/// Top-level error type for the indexing runner
#[derive(Error, Debug)]
pub enum RunnerError {
    /// The run was cancelled before every item was processed
    #[error("Indexing cancelled: {0}")]
    Cancelled(CancelReason),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Worker/concurrency errors
    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Returns true if this error is a cancellation outcome
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunnerError::Cancelled(_))
    }
}

/// Why a run stopped before completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller's token was cancelled
    Caller,

    /// The owning session was disposed
    SessionDisposed,

    /// The host runtime was disposed
    HostDisposed,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Caller => write!(f, "cancelled by caller"),
            CancelReason::SessionDisposed => write!(f, "session disposed"),
            CancelReason::HostDisposed => write!(f, "host disposed"),
        }
    }
}

impl From<CancelReason> for RunnerError {
    fn from(reason: CancelReason) -> Self {
        RunnerError::Cancelled(reason)
    }
}

/// Marker returned by blocking operations that observed a cancelled token
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Error reported by a content processor for a single item
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// The processor noticed cancellation and gave up on the item
    #[error("processing cancelled")]
    Cancelled,

    /// The item cannot be processed
    #[error("{reason}")]
    Failed { reason: String },
}

impl ProcessError {
    /// Create a failure with the given reason
    pub fn failed(reason: impl Into<String>) -> Self {
        ProcessError::Failed {
            reason: reason.into(),
        }
    }
}

impl From<Cancelled> for ProcessError {
    fn from(_: Cancelled) -> Self {
        ProcessError::Cancelled
    }
}

impl From<std::io::Error> for ProcessError {
    fn from(e: std::io::Error) -> Self {
        ProcessError::failed(e.to_string())
    }
}

/// Configuration and CLI errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid thread count override
    #[error("Invalid thread count {count}: must be at most {max} (0 or negative means auto)")]
    InvalidThreadCount { count: i64, max: usize },

    /// Invalid queue size
    #[error("Invalid queue size {size}: must be between {min} and {max}")]
    InvalidQueueSize { size: usize, min: usize, max: usize },

    /// Invalid exclude pattern
    #[error("Invalid exclude pattern '{pattern}': {reason}")]
    InvalidExcludePattern { pattern: String, reason: String },

    /// Root directory missing or unreadable
    #[error("Invalid root directory '{path}': {reason}")]
    InvalidRoot { path: String, reason: String },
}

/// Worker thread errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Worker panicked
    #[error("Worker {id} panicked: {message}")]
    Panicked { id: usize, message: String },

    /// Worker thread could not be spawned
    #[error("Failed to spawn worker {id}: {reason}")]
    SpawnFailed { id: usize, reason: String },
}

/// Result type alias for RunnerError
pub type Result<T> = std::result::Result<T, RunnerError>;
