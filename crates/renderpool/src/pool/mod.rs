//! Worker pool scheduling
//!
//! This module provides:
//! - [`WorkerPool`] - owns the worker slots and the backlog, accepts tasks
//! - [`TaskHandle`] - future resolving to a submitted task's result
//! - [`PoolEvent`] - notifications for external monitoring
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │                                                              │
//! │   execute(task) ──► free slot? ──yes──► Dispatch             │
//! │                         │                  │                 │
//! │                         no                 ▼                 │
//! │                         │         worker.execute(task)       │
//! │                         ▼          raced against deadline    │
//! │                  ┌────────────┐            │                 │
//! │                  │ TaskQueue  │◄── drain ──┘                 │
//! │                  │   (FIFO)   │   after success, failure     │
//! │                  └────────────┘   or timeout (+ recycle)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod dispatch;
mod manager;
mod queue;

use serde::Serialize;

use crate::worker::SlotId;

pub use manager::WorkerPool;
pub use queue::{TaskHandle, TaskResult};

/// Pool lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Constructed, or a start attempt failed
    Stopped,
    /// Workers are being launched
    Starting,
    /// Accepting and dispatching tasks
    Running,
    /// Killed; terminal
    Killed,
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub status: PoolStatus,
    /// Worker slots owned by the pool
    pub workers: usize,
    /// Slots with an active dispatch
    pub busy: usize,
    /// Slots ready for a task
    pub free: usize,
    /// Tasks waiting for a free slot
    pub queued: usize,
}

/// Notification emitted by the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A dispatch hit its deadline; the worker is about to be recycled
    Timeout { slot: SlotId },
    /// A timed-out or crashed worker was restarted and is ready again
    WorkerRecycled { slot: SlotId },
    /// Restarting a worker failed; its next task fails fast and retries the restart
    RecycleFailed { slot: SlotId, error: String },
}

impl PoolEvent {
    /// Slot the event refers to
    pub fn slot(&self) -> SlotId {
        match self {
            Self::Timeout { slot }
            | Self::WorkerRecycled { slot }
            | Self::RecycleFailed { slot, .. } => *slot,
        }
    }
}
