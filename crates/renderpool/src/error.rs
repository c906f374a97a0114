//! Error types

use std::time::Duration;

use crate::worker::SlotId;

/// Errors produced by a worker
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The worker process could not be launched
    #[error("failed to launch worker process: {0}")]
    Spawn(#[source] std::io::Error),

    /// Reading from or writing to the worker failed
    #[error("worker i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON on the worker channel
    #[error("malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// The worker sent something the protocol does not allow
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The worker never completed its startup handshake
    #[error("worker did not become ready within {0:?}")]
    StartupTimeout(Duration),

    /// The worker process went away
    #[error("worker process exited")]
    Exited,

    /// The worker has not been started, or was killed
    #[error("worker is not running")]
    NotRunning,

    /// The worker rejected the task
    #[error("{0}")]
    Task(String),
}

/// Errors reported by the pool
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A worker failed to initialize during pool start
    #[error("worker {slot} failed to start: {source}")]
    Start {
        slot: SlotId,
        #[source]
        source: WorkerError,
    },

    /// The worker reported a failure for this task
    #[error("task failed: {0}")]
    Worker(#[from] WorkerError),

    /// No result arrived before the deadline; the worker has been recycled
    #[error("task timed out on worker {slot} after {timeout:?}")]
    Timeout { slot: SlotId, timeout: Duration },

    /// The pool configuration cannot produce a working pool
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// The pool is already started
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// The pool was killed
    #[error("worker pool has been shut down")]
    ShutDown,
}

impl WorkerError {
    /// Whether the worker process is gone and must be relaunched before reuse
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkerError::Exited | WorkerError::NotRunning | WorkerError::Io(_)
        )
    }
}

impl PoolError {
    /// Whether the failure came from the worker environment rather than the task
    ///
    /// Only timeouts are weak: the task may well succeed if submitted again.
    pub fn is_weak(&self) -> bool {
        matches!(self, PoolError::Timeout { .. })
    }
}
