//! Error types for the worker-runtime.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Top-level errors for the runtime
//! - [`WorkerError`]: Errors raised by a single worker
//! - [`PoolError`]: Protocol violations against the worker pool

use std::io;
use std::path::Path;

use thiserror::Error;

use crate::status::WorkerStatus;

/// Boxed error type returned by external collaborators
/// (entry points and bootstrap callbacks).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Top-level runtime errors.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Invalid configuration was provided. Fatal, never retried.
    #[error("Invalid configuration: {reason}")]
    Config {
        /// Description of the configuration error.
        reason: String,
    },

    /// Persisting or reading an artifact failed.
    #[error("IO error on '{path}': {source}")]
    Io {
        /// The path being read or written.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The bootstrap cache entry is missing or cannot be decoded.
    #[error("Bootstrap cache corrupt at '{path}': {reason}")]
    CacheCorrupt {
        /// Path of the cache entry.
        path: String,
        /// Why the entry could not be used.
        reason: String,
    },

    /// A registered preload path does not exist.
    #[error("Path not found: {path}")]
    PathNotFound {
        /// The missing path.
        path: String,
    },

    /// The application assembly callback failed.
    #[error("Bootstrap failed: {reason}")]
    Bootstrap {
        /// Description of the failure.
        reason: String,
    },

    /// The requested facility is disabled in this runtime.
    #[error("{facility} is not available")]
    FacilityUnavailable {
        /// Name of the disabled facility.
        facility: &'static str,
    },

    /// A worker operation failed.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// A pool operation was rejected.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Errors raised by a single worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The entry point's initialization failed; the worker is `Stopped`.
    #[error("Worker {slot} failed to start: {reason}")]
    Start {
        /// Slot index of the worker.
        slot: usize,
        /// Description of the failure.
        reason: String,
    },

    /// The worker is reloading and refuses new dispatches.
    #[error("Worker {slot} is busy reloading")]
    Busy {
        /// Slot index of the worker.
        slot: usize,
    },

    /// The operation requires a different worker state.
    #[error("Worker {slot} is {status}")]
    NotRunning {
        /// Slot index of the worker.
        slot: usize,
        /// The state the worker was in.
        status: WorkerStatus,
    },

    /// The entry point failed while dispatching; the worker is `Crashed`.
    #[error("Worker {slot} crashed: {reason}")]
    Crashed {
        /// Slot index of the worker.
        slot: usize,
        /// Description of the failure.
        reason: String,
    },

    /// The dispatch outlived the stop grace period and was abandoned.
    #[error("Worker {slot} aborted the request during shutdown")]
    Aborted {
        /// Slot index of the worker.
        slot: usize,
    },

    /// The worker thread is gone.
    #[error("Worker {slot} is unavailable")]
    Unavailable {
        /// Slot index of the worker.
        slot: usize,
    },

    /// The requested state change is not in the transition table.
    #[error("Worker {slot} cannot move from {from} to {to}")]
    IllegalTransition {
        /// Slot index of the worker.
        slot: usize,
        /// Current state.
        from: WorkerStatus,
        /// Requested state.
        to: WorkerStatus,
    },
}

/// Protocol violations against the worker pool.
#[derive(Error, Debug)]
pub enum PoolError {
    /// `start` was called on a pool that is not stopped.
    #[error("Worker pool is already running")]
    AlreadyRunning,

    /// The operation requires a running pool.
    #[error("Worker pool is not running")]
    NotRunning,

    /// Another lifecycle operation is in progress.
    #[error("Worker pool is busy with another lifecycle operation")]
    Busy,

    /// No slot currently accepts dispatches.
    #[error("No worker available")]
    NoAvailableWorker,

    /// The slot index is outside the pool.
    #[error("Invalid worker slot {slot} (pool size {size})")]
    InvalidSlot {
        /// The requested slot.
        slot: usize,
        /// Number of slots in the pool.
        size: usize,
    },
}

impl RuntimeError {
    /// Create a new `Config` error.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// Create a new `Io` error for the given path.
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Create a new `CacheCorrupt` error.
    pub fn cache_corrupt(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::CacheCorrupt {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }

    /// Create a new `PathNotFound` error.
    pub fn path_not_found(path: impl AsRef<Path>) -> Self {
        Self::PathNotFound {
            path: path.as_ref().display().to_string(),
        }
    }

    /// Create a new `Bootstrap` error.
    pub fn bootstrap(reason: impl Into<String>) -> Self {
        Self::Bootstrap {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error indicates caller misuse of the
    /// worker or pool protocol. These are never retried automatically.
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            Self::Worker(err) => err.is_protocol_violation(),
            Self::Pool(err) => matches!(
                err,
                PoolError::AlreadyRunning | PoolError::NotRunning | PoolError::Busy
            ),
            _ => false,
        }
    }

    /// Returns `true` if this error is a disabled facility.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::FacilityUnavailable { .. })
    }
}

impl WorkerError {
    /// Slot index of the worker that raised this error.
    pub fn slot(&self) -> usize {
        match self {
            Self::Start { slot, .. }
            | Self::Busy { slot }
            | Self::NotRunning { slot, .. }
            | Self::Crashed { slot, .. }
            | Self::Aborted { slot }
            | Self::Unavailable { slot }
            | Self::IllegalTransition { slot, .. } => *slot,
        }
    }

    /// Returns `true` if this error indicates caller misuse.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::Start { .. }
                | Self::Busy { .. }
                | Self::NotRunning { .. }
                | Self::IllegalTransition { .. }
        )
    }

    /// Returns `true` if the pool recovers from this error by replacing
    /// the worker.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Crashed { .. } | Self::Unavailable { .. })
    }
}
