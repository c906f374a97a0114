//! Dispatch of one task on one worker slot
//!
//! ```text
//!            ┌──► WORKER_SUCCESS ──┐
//! PENDING ───┼──► WORKER_FAILURE ──┼──► DONE
//!            └──► TIMEOUT ─────────┘
//! ```
//!
//! The worker call is raced against the deadline and the pool's kill signal.
//! Whichever finishes first wins; the losing futures are dropped, so a late
//! worker result can never reach the submitter.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::manager::Shared;
use super::queue::Reply;
use super::PoolEvent;
use crate::error::{PoolError, WorkerError};
use crate::worker::{SlotId, Worker};

enum Outcome<O> {
    Success(O),
    Failure(WorkerError),
    TimedOut,
    ShutDown,
}

pub(super) struct Dispatch<W: Worker> {
    slot: SlotId,
    worker: Arc<W>,
    task: W::Task,
    reply: Reply<W::Output>,
}

impl<W: Worker> Dispatch<W> {
    pub(super) fn new(slot: SlotId, worker: Arc<W>, task: W::Task, reply: Reply<W::Output>) -> Self {
        Self {
            slot,
            worker,
            task,
            reply,
        }
    }

    /// Drive the dispatch to completion
    ///
    /// The slot is busy on entry. It is released (and the queue drained)
    /// before the submitter is answered, on every path except shutdown.
    /// A worker that timed out or died is restarted before its slot is
    /// released.
    pub(super) async fn run(self, shared: Arc<Shared<W>>) {
        let Dispatch {
            slot,
            worker,
            task,
            reply,
        } = self;
        let timeout = shared.config.timeout;
        let mut shutdown = shared.shutdown_signal();
        let started = Instant::now();

        let outcome = tokio::select! {
            biased;
            _ = shutdown.wait_for(|killed| *killed) => Outcome::ShutDown,
            result = tokio::time::timeout(timeout, worker.execute(task)) => match result {
                Ok(Ok(output)) => Outcome::Success(output),
                Ok(Err(err)) => Outcome::Failure(err),
                Err(_) => Outcome::TimedOut,
            },
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Outcome::Success(output) => {
                debug!(%slot, elapsed_ms, "Task completed");
                shared.release(slot);
                reply.send(Ok(output));
            }
            Outcome::Failure(err) if err.is_fatal() => {
                warn!(%slot, elapsed_ms, error = %err, "Worker died during task, restarting");
                if !restart(slot, &*worker, &*shared, &mut shutdown).await {
                    reply.send(Err(PoolError::ShutDown));
                    return;
                }
                shared.release(slot);
                reply.send(Err(PoolError::Worker(err)));
            }
            Outcome::Failure(err) => {
                warn!(%slot, elapsed_ms, error = %err, "Worker reported task failure");
                shared.release(slot);
                reply.send(Err(PoolError::Worker(err)));
            }
            Outcome::TimedOut => {
                warn!(
                    %slot,
                    timeout_ms = timeout.as_millis() as u64,
                    "Task timed out, recycling worker"
                );
                shared.emit(PoolEvent::Timeout { slot });

                if !restart(slot, &*worker, &*shared, &mut shutdown).await {
                    reply.send(Err(PoolError::ShutDown));
                    return;
                }
                shared.release(slot);
                reply.send(Err(PoolError::Timeout { slot, timeout }));
            }
            Outcome::ShutDown => {
                debug!(%slot, elapsed_ms, "Pool killed during dispatch");
                reply.send(Err(PoolError::ShutDown));
            }
        }
    }
}

/// Recycle the worker in place unless the pool is killed first
///
/// Returns `false` when the kill signal won; the half-restarted worker is
/// killed again and the slot stays out of the free set.
async fn restart<W: Worker>(
    slot: SlotId,
    worker: &W,
    shared: &Shared<W>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let recycled = tokio::select! {
        biased;
        _ = shutdown.wait_for(|killed| *killed) => None,
        result = worker.recycle() => Some(result),
    };

    match recycled {
        Some(Ok(())) => {
            info!(%slot, "Worker recycled");
            shared.emit(PoolEvent::WorkerRecycled { slot });
            true
        }
        Some(Err(err)) => {
            error!(%slot, error = %err, "Failed to recycle worker");
            shared.emit(PoolEvent::RecycleFailed {
                slot,
                error: err.to_string(),
            });
            true
        }
        None => {
            debug!(%slot, "Pool killed while recycling worker");
            worker.kill();
            false
        }
    }
}
