//! # renderpool
//!
//! Distributes rendering tasks across a fixed-size pool of long-lived worker
//! processes.
//!
//! ## Features
//!
//! - **Bounded concurrency**: one worker per CPU core by default, one task per
//!   worker at a time
//! - **Non-blocking submission**: tasks go to the first free worker or wait in
//!   an unbounded FIFO backlog
//! - **Deadlines**: a dispatch that outlives the pool timeout is failed with a
//!   weak (retryable) error and its worker is restarted in place
//! - **Process workers**: newline-delimited JSON over stdin/stdout
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │        (slots, FIFO backlog, start / execute / kill)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Dispatch                             │
//! │     (one task on one slot, raced against the deadline)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Worker (trait)                          │
//! │       ProcessWorker: external process, JSON lines            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use renderpool::prelude::*;
//!
//! let pool = WorkerPool::with_processes(
//!     PoolConfig::from_env(),
//!     ProcessWorkerConfig::new("phantomjs").arg("render.js"),
//! );
//! pool.start().await?;
//!
//! match pool.execute(json!({"url": "https://example.com"})).await {
//!     Ok(output) => println!("{output}"),
//!     Err(err) if err.is_weak() => { /* worker stalled, try again later */ }
//!     Err(err) => return Err(err.into()),
//! }
//!
//! pool.kill();
//! ```

pub mod config;
pub mod error;
pub mod pool;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::PoolConfig;
    pub use crate::error::{PoolError, WorkerError};
    pub use crate::pool::{PoolEvent, PoolSnapshot, PoolStatus, TaskHandle, WorkerPool};
    pub use crate::worker::{ProcessWorker, ProcessWorkerConfig, SlotId, Worker};
}

// Re-export key types at crate root
pub use config::PoolConfig;
pub use error::{PoolError, WorkerError};
pub use pool::{PoolEvent, PoolSnapshot, PoolStatus, TaskHandle, TaskResult, WorkerPool};
pub use worker::{ProcessWorker, ProcessWorkerConfig, SlotId, Worker};
