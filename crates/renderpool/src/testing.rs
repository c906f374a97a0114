//! Test utilities: a scripted in-memory worker.
//!
//! Each [`MockTask`] says how the worker should behave (succeed, fail or
//! hang, optionally after a delay). Every worker created from the same
//! [`MockLog`] records what happened to it, so tests can assert on dispatch
//! order, recycles and kills.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::WorkerError;
use crate::worker::{SlotId, Worker};

/// Scripted behavior for one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockTask {
    /// Return `value` after `after`
    Succeed { value: String, after: Duration },
    /// Fail with `message` after `after`
    Fail { message: String, after: Duration },
    /// Never complete
    Hang,
    /// The worker dies mid-task and stays down until recycled
    Crash,
}

impl MockTask {
    pub fn succeed(value: impl Into<String>) -> Self {
        Self::succeed_after(value, Duration::ZERO)
    }

    pub fn succeed_after(value: impl Into<String>, after: Duration) -> Self {
        Self::Succeed {
            value: value.into(),
            after,
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::fail_after(message, Duration::ZERO)
    }

    pub fn fail_after(message: impl Into<String>, after: Duration) -> Self {
        Self::Fail {
            message: message.into(),
            after,
        }
    }

    pub fn hang() -> Self {
        Self::Hang
    }

    pub fn crash() -> Self {
        Self::Crash
    }

    /// Label recorded in the log when the task starts executing
    pub fn label(&self) -> &str {
        match self {
            Self::Succeed { value, .. } => value,
            Self::Fail { message, .. } => message,
            Self::Hang => "hang",
            Self::Crash => "crash",
        }
    }
}

/// Something that happened to a mock worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockEvent {
    Started(SlotId),
    Executed(SlotId, String),
    Recycled(SlotId),
    Killed(SlotId),
}

/// Shared record of mock worker activity
#[derive(Debug, Default)]
pub struct MockLog {
    events: Mutex<Vec<MockEvent>>,
}

impl MockLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, event: MockEvent) {
        self.events.lock().push(event);
    }

    /// Everything recorded so far, in order
    pub fn events(&self) -> Vec<MockEvent> {
        self.events.lock().clone()
    }

    pub fn starts(&self) -> Vec<SlotId> {
        self.filter(|e| match e {
            MockEvent::Started(slot) => Some(*slot),
            _ => None,
        })
    }

    /// `(slot, task label)` for every task that began executing
    pub fn executions(&self) -> Vec<(SlotId, String)> {
        self.filter(|e| match e {
            MockEvent::Executed(slot, label) => Some((*slot, label.clone())),
            _ => None,
        })
    }

    pub fn recycles(&self) -> Vec<SlotId> {
        self.filter(|e| match e {
            MockEvent::Recycled(slot) => Some(*slot),
            _ => None,
        })
    }

    pub fn kills(&self) -> Vec<SlotId> {
        self.filter(|e| match e {
            MockEvent::Killed(slot) => Some(*slot),
            _ => None,
        })
    }

    fn filter<T>(&self, f: impl Fn(&MockEvent) -> Option<T>) -> Vec<T> {
        self.events.lock().iter().filter_map(f).collect()
    }
}

/// In-memory [`Worker`] driven by [`MockTask`] scripts
pub struct MockWorker {
    slot: SlotId,
    log: Arc<MockLog>,
    start_delay: Duration,
    recycle_delay: Duration,
    fail_start: bool,
    killed: AtomicBool,
}

impl MockWorker {
    pub fn new(slot: SlotId, log: Arc<MockLog>) -> Self {
        Self {
            slot,
            log,
            start_delay: Duration::ZERO,
            recycle_delay: Duration::from_millis(5),
            fail_start: false,
            killed: AtomicBool::new(false),
        }
    }

    /// Make `start` fail
    pub fn with_start_failure(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Delay before `start` resolves
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Delay before `recycle` resolves
    pub fn with_recycle_delay(mut self, delay: Duration) -> Self {
        self.recycle_delay = delay;
        self
    }

    /// Whether the worker is down (killed or crashed)
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for MockWorker {
    type Task = MockTask;
    type Output = String;

    async fn start(&self) -> Result<(), WorkerError> {
        tokio::time::sleep(self.start_delay).await;
        if self.fail_start {
            return Err(WorkerError::Protocol(format!(
                "mock worker {} refused to start",
                self.slot
            )));
        }
        self.killed.store(false, Ordering::SeqCst);
        self.log.record(MockEvent::Started(self.slot));
        Ok(())
    }

    async fn execute(&self, task: MockTask) -> Result<String, WorkerError> {
        if self.is_killed() {
            return Err(WorkerError::NotRunning);
        }
        self.log
            .record(MockEvent::Executed(self.slot, task.label().to_string()));

        match task {
            MockTask::Succeed { value, after } => {
                tokio::time::sleep(after).await;
                Ok(value)
            }
            MockTask::Fail { message, after } => {
                tokio::time::sleep(after).await;
                Err(WorkerError::Task(message))
            }
            MockTask::Hang => futures::future::pending().await,
            MockTask::Crash => {
                self.killed.store(true, Ordering::SeqCst);
                Err(WorkerError::Exited)
            }
        }
    }

    async fn recycle(&self) -> Result<(), WorkerError> {
        tokio::time::sleep(self.recycle_delay).await;
        self.killed.store(false, Ordering::SeqCst);
        self.log.record(MockEvent::Recycled(self.slot));
        Ok(())
    }

    fn kill(&self) {
        self.killed.store(true, Ordering::SeqCst);
        self.log.record(MockEvent::Killed(self.slot));
    }
}
