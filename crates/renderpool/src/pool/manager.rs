//! Pool manager
//!
//! Owns the worker slots and the backlog. All pool state sits behind one
//! mutex that is only held for bookkeeping, never across an await.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, instrument, warn};

use super::dispatch::Dispatch;
use super::queue::{task_channel, QueuedTask, Reply, TaskHandle, TaskQueue, TaskResult};
use super::{PoolEvent, PoolSnapshot, PoolStatus};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::worker::{SlotId, Worker};

const EVENT_CAPACITY: usize = 64;

type WorkerFactory<W> = dyn Fn(SlotId) -> W + Send + Sync;

pub(super) struct PoolState<W: Worker> {
    status: PoolStatus,
    workers: Vec<Arc<W>>,
    /// Free slots, ordered by registration index
    free: BTreeSet<SlotId>,
    queue: TaskQueue<W::Task, W::Output>,
}

impl<W: Worker> PoolState<W> {
    fn new() -> Self {
        Self {
            status: PoolStatus::Stopped,
            workers: Vec::new(),
            free: BTreeSet::new(),
            queue: TaskQueue::new(),
        }
    }

    /// Take the first free slot in registration order
    fn acquire(&mut self) -> Option<(SlotId, Arc<W>)> {
        if self.status != PoolStatus::Running {
            return None;
        }
        let slot = self.free.pop_first()?;
        Some((slot, Arc::clone(&self.workers[slot.index()])))
    }

    /// Pair the head of the queue with a free slot, if both exist
    fn next_dispatch(&mut self) -> Option<(SlotId, Arc<W>, QueuedTask<W::Task, W::Output>)> {
        if self.queue.is_empty() {
            return None;
        }
        let (slot, worker) = self.acquire()?;
        let queued = self.queue.pop()?;
        Some((slot, worker, queued))
    }
}

pub(super) struct Shared<W: Worker> {
    pub(super) config: PoolConfig,
    factory: Box<WorkerFactory<W>>,
    state: Mutex<PoolState<W>>,
    events: broadcast::Sender<PoolEvent>,
    shutdown_tx: watch::Sender<bool>,
}

impl<W: Worker> Shared<W> {
    pub(super) fn emit(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(super) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Return a slot to the free set and drain the queue into it
    pub(super) fn release(self: &Arc<Self>, slot: SlotId) {
        {
            let mut state = self.state.lock();
            if state.status != PoolStatus::Running {
                return;
            }
            state.free.insert(slot);
        }
        self.try_flush_queue();
    }

    /// Dispatch the oldest queued task if a slot is free
    ///
    /// Returns whether a task was dispatched. Safe to call at any time.
    pub(super) fn try_flush_queue(self: &Arc<Self>) -> bool {
        let next = {
            let mut state = self.state.lock();
            state.next_dispatch()
        };

        match next {
            Some((slot, worker, queued)) => {
                debug!(
                    %slot,
                    waited_ms = queued.queued_at.elapsed().as_millis() as u64,
                    "Dispatching queued task"
                );
                self.spawn_dispatch(slot, worker, queued.task, queued.reply);
                true
            }
            None => false,
        }
    }

    fn spawn_dispatch(
        self: &Arc<Self>,
        slot: SlotId,
        worker: Arc<W>,
        task: W::Task,
        reply: Reply<W::Output>,
    ) {
        let dispatch = Dispatch::new(slot, worker, task, reply);
        tokio::spawn(dispatch.run(Arc::clone(self)));
    }
}

/// Rolls back a start attempt that ends without reaching `Running`
///
/// Covers start errors as well as a dropped `start` future: the pool returns
/// to `Stopped` and every worker created for the attempt is killed.
struct StartAttempt<'a, W: Worker> {
    shared: &'a Shared<W>,
}

impl<W: Worker> Drop for StartAttempt<'_, W> {
    fn drop(&mut self) {
        let workers = {
            let mut state = self.shared.state.lock();
            if state.status != PoolStatus::Starting {
                return;
            }
            state.status = PoolStatus::Stopped;
            std::mem::take(&mut state.workers)
        };

        debug!(workers = workers.len(), "Rolling back worker pool start");
        for worker in &workers {
            worker.kill();
        }
    }
}

/// Fixed-size pool of long-lived workers with a FIFO backlog
///
/// Cloning the pool yields another handle to the same workers. Submission
/// requires a running tokio runtime.
///
/// The owner is responsible for calling [`WorkerPool::kill`] before the
/// process exits; there is no implicit exit hook.
///
/// # Example
///
/// ```ignore
/// use renderpool::{PoolConfig, ProcessWorkerConfig, WorkerPool};
///
/// let pool = WorkerPool::with_processes(
///     PoolConfig::new().with_number_of_workers(4),
///     ProcessWorkerConfig::new("node").arg("render-worker.js"),
/// );
/// pool.start().await?;
///
/// let pdf = pool.execute(json!({"html": "<h1>Invoice</h1>"})).await?;
///
/// pool.kill();
/// ```
pub struct WorkerPool<W: Worker> {
    shared: Arc<Shared<W>>,
}

impl<W: Worker> Clone for WorkerPool<W> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<W: Worker> WorkerPool<W> {
    /// Create a pool; `factory` builds the worker for each slot at start
    pub fn new<F>(config: PoolConfig, factory: F) -> Self
    where
        F: Fn(SlotId) -> W + Send + Sync + 'static,
    {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                config,
                factory: Box::new(factory),
                state: Mutex::new(PoolState::new()),
                events,
                shutdown_tx,
            }),
        }
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Launch every worker
    ///
    /// Resolves once all workers are ready, or with the first start error as
    /// soon as it occurs. On error every worker of this attempt is killed and
    /// the pool goes back to [`PoolStatus::Stopped`]. The same happens when
    /// the returned future is dropped before it completes, so a start wrapped
    /// in a timeout can be retried.
    ///
    /// Tasks submitted before start are dispatched once it succeeds.
    #[instrument(skip(self), fields(workers = self.shared.config.number_of_workers))]
    pub async fn start(&self) -> Result<(), PoolError> {
        self.shared.config.validate()?;

        let workers: Vec<Arc<W>> = {
            let mut state = self.shared.state.lock();
            match state.status {
                PoolStatus::Starting | PoolStatus::Running => return Err(PoolError::AlreadyRunning),
                PoolStatus::Killed => return Err(PoolError::ShutDown),
                PoolStatus::Stopped => {}
            }
            state.status = PoolStatus::Starting;

            // Registered before launching so that `kill` reaches them.
            state.workers = (0..self.shared.config.number_of_workers)
                .map(|index| Arc::new((self.shared.factory)(SlotId(index))))
                .collect();
            state.workers.clone()
        };
        let _attempt = StartAttempt {
            shared: &*self.shared,
        };

        info!(
            workers = workers.len(),
            timeout_ms = self.shared.config.timeout.as_millis() as u64,
            "Starting worker pool"
        );

        let starts = workers.iter().enumerate().map(|(index, worker)| async move {
            worker.start().await.map_err(|source| PoolError::Start {
                slot: SlotId(index),
                source,
            })
        });

        let mut shutdown = self.shared.shutdown_signal();
        let started = tokio::select! {
            biased;
            _ = shutdown.wait_for(|killed| *killed) => Err(PoolError::ShutDown),
            result = futures::future::try_join_all(starts) => result.map(|_| ()),
        };

        match started {
            Ok(()) => {}
            Err(PoolError::ShutDown) => {
                warn!("Worker pool killed while starting");
                return Err(PoolError::ShutDown);
            }
            Err(err) => {
                error!(error = %err, "Worker pool failed to start");
                return Err(err);
            }
        }

        {
            let mut state = self.shared.state.lock();
            if state.status == PoolStatus::Killed {
                warn!("Worker pool killed while starting");
                return Err(PoolError::ShutDown);
            }
            state.free = (0..workers.len()).map(SlotId).collect();
            state.status = PoolStatus::Running;
        }

        info!("Worker pool started");

        while self.shared.try_flush_queue() {}

        Ok(())
    }

    /// Submit a task
    ///
    /// Never blocks: the task is dispatched to the first free worker, or
    /// appended to the backlog when every worker is busy. The backlog is
    /// unbounded. The returned handle resolves to the task's result.
    pub fn execute(&self, task: W::Task) -> TaskHandle<W::Output> {
        let (reply, handle) = task_channel();

        let mut state = self.shared.state.lock();
        if state.status == PoolStatus::Killed {
            drop(state);
            reply.send(Err(PoolError::ShutDown));
            return handle;
        }

        match state.acquire() {
            Some((slot, worker)) => {
                drop(state);
                debug!(%slot, "Dispatching task");
                self.shared.spawn_dispatch(slot, worker, task, reply);
            }
            None => {
                state.queue.push(task, reply);
                debug!(queued = state.queue.len(), "All workers busy, task queued");
            }
        }

        handle
    }

    /// Submit a task and wait for its result
    pub async fn run(&self, task: W::Task) -> TaskResult<W::Output> {
        self.execute(task).await
    }

    /// Dispatch the oldest queued task if a worker is free
    ///
    /// The pool already does this after every completed dispatch; calling it
    /// speculatively is harmless. Returns whether a task was dispatched.
    pub fn try_flush_queue(&self) -> bool {
        self.shared.try_flush_queue()
    }

    /// Kill every worker without waiting for in-flight tasks
    ///
    /// Queued tasks and in-flight dispatches resolve with
    /// [`PoolError::ShutDown`]. The pool cannot be restarted afterwards.
    #[instrument(skip(self))]
    pub fn kill(&self) {
        let (workers, queued) = {
            let mut state = self.shared.state.lock();
            if state.status == PoolStatus::Killed {
                return;
            }
            state.status = PoolStatus::Killed;
            state.free.clear();
            (std::mem::take(&mut state.workers), state.queue.drain())
        };

        self.shared.shutdown_tx.send_replace(true);

        for worker in &workers {
            worker.kill();
        }

        info!(
            workers = workers.len(),
            dropped_tasks = queued.len(),
            "Worker pool killed"
        );

        for task in queued {
            task.reply.send(Err(PoolError::ShutDown));
        }
    }

    /// Current lifecycle state
    pub fn status(&self) -> PoolStatus {
        self.shared.state.lock().status
    }

    /// Counts of busy, free and queued work
    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.shared.state.lock();
        let workers = state.workers.len();
        let free = state.free.len();
        let busy = match state.status {
            PoolStatus::Running => workers - free,
            _ => 0,
        };
        PoolSnapshot {
            status: state.status,
            workers,
            busy,
            free,
            queued: state.queue.len(),
        }
    }

    /// Subscribe to pool events
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.shared.events.subscribe()
    }
}
