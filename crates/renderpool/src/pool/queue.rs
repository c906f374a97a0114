//! FIFO backlog and task completion handles

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::trace;

use crate::error::PoolError;

/// Result delivered to a submitter
pub type TaskResult<O> = Result<O, PoolError>;

/// Sending half of a task's completion channel
///
/// Consumed by [`Reply::send`], so a task can be answered at most once.
pub(crate) struct Reply<O>(oneshot::Sender<TaskResult<O>>);

impl<O> Reply<O> {
    pub(crate) fn send(self, result: TaskResult<O>) {
        if self.0.send(result).is_err() {
            trace!("Submitter dropped its task handle");
        }
    }
}

/// Future resolving to the result of a submitted task
///
/// Dropping the handle does not cancel the task.
#[must_use = "a task handle does nothing unless awaited"]
#[derive(Debug)]
pub struct TaskHandle<O> {
    rx: oneshot::Receiver<TaskResult<O>>,
}

impl<O> Future for TaskHandle<O> {
    type Output = TaskResult<O>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(PoolError::ShutDown)))
    }
}

pub(crate) fn task_channel<O>() -> (Reply<O>, TaskHandle<O>) {
    let (tx, rx) = oneshot::channel();
    (Reply(tx), TaskHandle { rx })
}

/// A task waiting for a free worker
pub(crate) struct QueuedTask<T, O> {
    pub(crate) task: T,
    pub(crate) reply: Reply<O>,
    pub(crate) queued_at: Instant,
}

/// Unbounded FIFO of tasks awaiting a free worker
pub(crate) struct TaskQueue<T, O> {
    tasks: VecDeque<QueuedTask<T, O>>,
}

impl<T, O> TaskQueue<T, O> {
    pub(crate) fn new() -> Self {
        Self {
            tasks: VecDeque::new(),
        }
    }

    /// Append to the tail
    pub(crate) fn push(&mut self, task: T, reply: Reply<O>) {
        self.tasks.push_back(QueuedTask {
            task,
            reply,
            queued_at: Instant::now(),
        });
    }

    /// Take the oldest task
    pub(crate) fn pop(&mut self) -> Option<QueuedTask<T, O>> {
        self.tasks.pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Remove every pending task, oldest first
    pub(crate) fn drain(&mut self) -> Vec<QueuedTask<T, O>> {
        self.tasks.drain(..).collect()
    }
}
