//! Worker capability surface
//!
//! The pool drives its workers exclusively through [`Worker`]:
//!
//! - [`Worker::start`] - launch and wait for the worker to report ready
//! - [`Worker::execute`] - run one task (may never complete if the worker hangs)
//! - [`Worker::recycle`] - restart in place after a timeout
//! - [`Worker::kill`] - unconditional teardown
//!
//! Busy/free state is not the worker's concern; the pool tracks it per slot.
//!
//! [`ProcessWorker`] is the production implementation: one external process
//! speaking newline-delimited JSON over stdin/stdout.

mod process;
mod protocol;

use std::fmt;

use async_trait::async_trait;

use crate::error::WorkerError;

pub use process::{ProcessWorker, ProcessWorkerConfig};
pub use protocol::{TaskRequest, WorkerMessage};

/// Identity of a worker slot: its 0-based registration index in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub usize);

impl SlotId {
    /// Registration index
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A long-lived worker the pool can hand tasks to
///
/// Methods take `&self` so the pool can `kill` a worker while a dispatch is
/// still waiting on `execute`.
///
/// # Example
///
/// ```ignore
/// struct EchoWorker;
///
/// #[async_trait]
/// impl Worker for EchoWorker {
///     type Task = String;
///     type Output = String;
///
///     async fn start(&self) -> Result<(), WorkerError> { Ok(()) }
///     async fn execute(&self, task: String) -> Result<String, WorkerError> { Ok(task) }
///     async fn recycle(&self) -> Result<(), WorkerError> { Ok(()) }
///     fn kill(&self) {}
/// }
/// ```
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Task payload, passed through unexamined by the pool
    type Task: Send + 'static;

    /// Result of a successful task
    type Output: Send + 'static;

    /// Launch the worker; resolves once it is ready for tasks
    async fn start(&self) -> Result<(), WorkerError>;

    /// Run one task
    async fn execute(&self, task: Self::Task) -> Result<Self::Output, WorkerError>;

    /// Restart the worker in place; resolves once it is ready for reuse
    async fn recycle(&self) -> Result<(), WorkerError>;

    /// Tear the worker down immediately
    fn kill(&self);
}
