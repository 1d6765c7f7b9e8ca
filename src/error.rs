//! Error types for imagegen-batch
//!
//! Domain-specific error enums (Task, Download) hang off a single top-level
//! [`Error`] so callers can match broadly or precisely. Per-item generation
//! failures are recorded on the item and never thrown out of the scheduling
//! loop; the variants here cover the synchronous API surface.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for imagegen-batch operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for imagegen-batch
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "concurrent_limit")
        key: Option<String>,
    },

    /// Task lifecycle error
    #[error("task error: {0}")]
    Task(#[from] TaskError),

    /// Download queue error
    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    /// Generation backend failure
    #[error("generation failed: {message}")]
    Generation {
        /// Human-readable error message from the backend
        message: String,
        /// Optional low-level code (HTTP status, provider error code)
        code: Option<String>,
    },

    /// Task store operation failed
    #[error("store error: {0}")]
    Store(String),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Network error during artifact transfer
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new work")]
    ShuttingDown,
}

impl Error {
    /// Construct a configuration error for a specific key
    pub fn config(message: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Construct a generation error without a low-level code
    pub fn generation(message: impl Into<String>) -> Self {
        Self::Generation {
            message: message.into(),
            code: None,
        }
    }
}

/// Task lifecycle errors
#[derive(Debug, Error)]
pub enum TaskError {
    /// Task not found in the scheduler
    #[error("task {id} not found")]
    NotFound {
        /// The task ID that was not found
        id: i64,
    },

    /// Task item not found within a task
    #[error("item {item_id} not found in task {task_id}")]
    ItemNotFound {
        /// The parent task ID
        task_id: i64,
        /// The item ID that was not found
        item_id: i64,
    },

    /// Cannot perform operation in current state
    #[error("cannot {operation} task {id} in state {current_state}")]
    InvalidState {
        /// The task ID that is in an invalid state for the operation
        id: i64,
        /// The operation that was attempted (e.g., "start", "pause", "resume")
        operation: String,
        /// The current state that prevents the operation
        current_state: String,
    },

    /// A task must carry at least one item
    #[error("task must contain at least one item")]
    EmptyItems,

    /// No backend is registered for the requested model family
    #[error("no generation backend registered for model family {family}")]
    UnknownModelFamily {
        /// The requested model family
        family: String,
    },

    /// Work was in flight across a process restart
    #[error("interrupted by process restart")]
    Interrupted,
}

/// Download queue errors
///
/// `Display` and `Error` are implemented by hand rather than derived: two
/// variants carry a plain-`String` data field named `source` (the artifact
/// source reference, as specified), and `thiserror`'s derive unconditionally
/// treats any field named `source` as the error's `std::error::Error` cause,
/// which a `String` is not. The manual impls below reproduce the exact
/// message strings the derive would have produced.
#[derive(Debug)]
pub enum DownloadError {
    /// A job for the same source reference is already queued or in flight
    Duplicate {
        /// The duplicated source reference
        source: String,
    },

    /// Artifact fetch failed after all attempts
    FetchFailed {
        /// The artifact source reference
        source: String,
        /// The reason the fetch failed
        reason: String,
    },

    /// The source reference is neither an HTTP(S) URL nor a data URI
    UnsupportedReference(String),

    /// The storage-write primitive is unavailable in this environment
    StorageUnavailable(String),

    /// Writing the artifact to its destination failed
    WriteFailed {
        /// The destination path
        path: PathBuf,
        /// The reason the write failed
        reason: String,
    },
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadError::Duplicate { source } => {
                write!(f, "duplicate download for source {source}")
            }
            DownloadError::FetchFailed { source, reason } => {
                write!(f, "failed to fetch {source}: {reason}")
            }
            DownloadError::UnsupportedReference(reference) => {
                write!(f, "unsupported artifact reference: {reference}")
            }
            DownloadError::StorageUnavailable(message) => {
                write!(f, "storage unavailable: {message}")
            }
            DownloadError::WriteFailed { path, reason } => {
                write!(f, "failed to write artifact to {}: {reason}", path.display())
            }
        }
    }
}

impl std::error::Error for DownloadError {}
