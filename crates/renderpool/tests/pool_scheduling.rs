//! Scheduling tests for WorkerPool, driven by scripted mock workers.
//!
//! Time-sensitive tests run on a paused clock, so deadlines and delays
//! resolve deterministically.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::Instant;

use renderpool::testing::{MockEvent, MockLog, MockTask, MockWorker};
use renderpool::{PoolConfig, PoolError, PoolEvent, PoolStatus, SlotId, TaskHandle, WorkerPool};

const TIMEOUT: Duration = Duration::from_millis(50);

fn mock_pool(workers: usize, log: &Arc<MockLog>) -> WorkerPool<MockWorker> {
    let log = Arc::clone(log);
    WorkerPool::new(
        PoolConfig::new()
            .with_number_of_workers(workers)
            .with_timeout(TIMEOUT),
        move |slot| MockWorker::new(slot, Arc::clone(&log)),
    )
}

/// Await a handle in the background, recording when it resolved
fn completion(
    handle: TaskHandle<String>,
) -> tokio::task::JoinHandle<(Result<String, PoolError>, Instant)> {
    tokio::spawn(async move {
        let result = handle.await;
        (result, Instant::now())
    })
}

// ============================================
// Admission
// ============================================

#[tokio::test(start_paused = true)]
async fn test_n_tasks_on_n_workers_dispatch_immediately() {
    for workers in 1..=4 {
        let log = MockLog::new();
        let pool = mock_pool(workers, &log);
        pool.start().await.unwrap();

        let _handles: Vec<_> = (0..workers).map(|_| pool.execute(MockTask::hang())).collect();

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.busy, workers);
        assert_eq!(snapshot.free, 0);
        assert_eq!(snapshot.queued, 0);

        pool.kill();
    }
}

#[tokio::test(start_paused = true)]
async fn test_one_task_over_capacity_is_queued() {
    let log = MockLog::new();
    let pool = mock_pool(2, &log);
    pool.start().await.unwrap();

    let first = pool.execute(MockTask::succeed_after("first", Duration::from_millis(10)));
    let _second = pool.execute(MockTask::hang());
    let third = pool.execute(MockTask::succeed_after("third", Duration::from_millis(10)));

    let snapshot = pool.snapshot();
    assert_eq!(snapshot.busy, 2);
    assert_eq!(snapshot.queued, 1);

    assert_eq!(first.await.unwrap(), "first");

    // The freed slot already picked up the queued task.
    let snapshot = pool.snapshot();
    assert_eq!(snapshot.queued, 0);
    assert_eq!(snapshot.busy, 2);

    assert_eq!(third.await.unwrap(), "third");
    pool.kill();
}

#[tokio::test(start_paused = true)]
async fn test_queue_preserves_submission_order() {
    let log = MockLog::new();
    let pool = mock_pool(1, &log);
    pool.start().await.unwrap();

    let blocker = pool.execute(MockTask::succeed_after("blocker", Duration::from_millis(10)));
    let a = pool.execute(MockTask::succeed_after("a", Duration::from_millis(1)));
    let b = pool.execute(MockTask::succeed("b"));
    assert_eq!(pool.snapshot().queued, 2);

    assert_eq!(blocker.await.unwrap(), "blocker");
    assert_eq!(a.await.unwrap(), "a");
    assert_eq!(b.await.unwrap(), "b");

    let order: Vec<String> = log.executions().into_iter().map(|(_, label)| label).collect();
    assert_eq!(order, vec!["blocker", "a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn test_tasks_submitted_before_start_run_after_start() {
    let log = MockLog::new();
    let pool = mock_pool(2, &log);

    let early = pool.execute(MockTask::succeed("early"));
    assert_eq!(pool.snapshot().queued, 1);

    pool.start().await.unwrap();
    assert_eq!(early.await.unwrap(), "early");
    assert_eq!(pool.snapshot().queued, 0);
}

// ============================================
// Completion paths
// ============================================

#[tokio::test(start_paused = true)]
async fn test_result_before_deadline_completes_normally() {
    let log = MockLog::new();
    let pool = mock_pool(1, &log);
    let mut events = pool.subscribe();
    pool.start().await.unwrap();

    let result = pool
        .execute(MockTask::succeed_after("page", Duration::from_millis(10)))
        .await;
    assert_eq!(result.unwrap(), "page");

    // Let the original deadline pass; it must not fire.
    tokio::time::sleep(TIMEOUT * 2).await;

    assert!(log.recycles().is_empty());
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(pool.snapshot().free, 1);
}

#[tokio::test(start_paused = true)]
async fn test_result_after_deadline_is_weak_timeout() {
    let log = MockLog::new();
    let pool = mock_pool(1, &log);
    let mut events = pool.subscribe();
    pool.start().await.unwrap();

    let err = pool
        .execute(MockTask::succeed_after("too-late", Duration::from_millis(100)))
        .await
        .unwrap_err();

    assert!(err.is_weak());
    assert!(matches!(err, PoolError::Timeout { slot: SlotId(0), timeout } if timeout == TIMEOUT));
    assert_eq!(log.recycles(), vec![SlotId(0)]);

    assert_eq!(events.recv().await.unwrap(), PoolEvent::Timeout { slot: SlotId(0) });
    assert_eq!(
        events.recv().await.unwrap(),
        PoolEvent::WorkerRecycled { slot: SlotId(0) }
    );

    // The slot is usable again.
    assert_eq!(pool.run(MockTask::succeed("next")).await.unwrap(), "next");
}

#[tokio::test(start_paused = true)]
async fn test_worker_failure_reaches_submitter_and_frees_slot() {
    let log = MockLog::new();
    let pool = mock_pool(1, &log);
    pool.start().await.unwrap();

    let failing = pool.execute(MockTask::fail_after("invalid markup", Duration::from_millis(5)));
    let queued = pool.execute(MockTask::hang());
    assert_eq!(pool.snapshot().queued, 1);

    let err = failing.await.unwrap_err();
    assert!(!err.is_weak());
    assert!(matches!(err, PoolError::Worker(_)));
    assert_eq!(err.to_string(), "task failed: invalid markup");

    // Failure drains the queue like the other paths.
    let snapshot = pool.snapshot();
    assert_eq!(snapshot.queued, 0);
    assert_eq!(snapshot.busy, 1);
    assert!(log.recycles().is_empty());

    drop(queued);
    pool.kill();
}

#[tokio::test(start_paused = true)]
async fn test_failure_before_deadline_leaves_deadline_silent() {
    let log = MockLog::new();
    let pool = mock_pool(1, &log);
    let mut events = pool.subscribe();
    pool.start().await.unwrap();

    let err = pool
        .execute(MockTask::fail_after("broken template", Duration::from_millis(10)))
        .await
        .unwrap_err();
    assert!(!err.is_weak());

    tokio::time::sleep(TIMEOUT * 2).await;

    assert!(log.recycles().is_empty());
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(pool.snapshot().free, 1);
}

#[tokio::test(start_paused = true)]
async fn test_crashed_worker_is_restarted_before_reuse() {
    let log = MockLog::new();
    let pool = mock_pool(2, &log);
    let mut events = pool.subscribe();
    pool.start().await.unwrap();

    let err = pool.execute(MockTask::crash()).await.unwrap_err();
    assert!(!err.is_weak());
    assert_eq!(err.to_string(), "task failed: worker process exited");
    assert_eq!(log.recycles(), vec![SlotId(0)]);
    assert_eq!(
        events.recv().await.unwrap(),
        PoolEvent::WorkerRecycled { slot: SlotId(0) }
    );

    for page in ["page-1", "page-2", "page-3"] {
        assert_eq!(pool.run(MockTask::succeed(page)).await.unwrap(), page);
    }
    let slots: Vec<SlotId> = log.executions().into_iter().map(|(slot, _)| slot).collect();
    assert_eq!(slots, vec![SlotId(0); 4]);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_drains_queue() {
    let log = MockLog::new();
    let pool = mock_pool(1, &log);
    pool.start().await.unwrap();

    let stuck = pool.execute(MockTask::hang());
    let waiting = pool.execute(MockTask::succeed("after-recycle"));

    assert!(stuck.await.unwrap_err().is_weak());
    assert_eq!(pool.snapshot().queued, 0);
    assert_eq!(waiting.await.unwrap(), "after-recycle");

    let executions = log.executions();
    assert_eq!(executions.len(), 2);
    assert_eq!(executions[1], (SlotId(0), "after-recycle".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_two_workers_one_hung_scenario() {
    let log = MockLog::new();
    let pool = mock_pool(2, &log);
    pool.start().await.unwrap();
    let begin = Instant::now();

    let task1 = completion(pool.execute(MockTask::succeed_after("task-1", Duration::from_millis(10))));
    let task2 = completion(pool.execute(MockTask::hang()));
    let task3 = completion(pool.execute(MockTask::succeed_after("task-3", Duration::from_millis(10))));
    assert_eq!(pool.snapshot().queued, 1);

    let (result1, done1) = task1.await.unwrap();
    assert_eq!(result1.unwrap(), "task-1");
    let at1 = done1 - begin;
    assert!(at1 >= Duration::from_millis(10) && at1 < Duration::from_millis(15));

    let (result3, done3) = task3.await.unwrap();
    assert_eq!(result3.unwrap(), "task-3");
    assert!(done3 - begin < TIMEOUT);

    let (result2, done2) = task2.await.unwrap();
    let err = result2.unwrap_err();
    assert!(err.is_weak());
    assert!(matches!(err, PoolError::Timeout { slot: SlotId(1), .. }));
    assert!(done2 - begin >= TIMEOUT);

    // Task 3 went to worker A once task 1 freed it; worker B was recycled.
    assert_eq!(
        log.executions(),
        vec![
            (SlotId(0), "task-1".to_string()),
            (SlotId(1), "hang".to_string()),
            (SlotId(0), "task-3".to_string()),
        ]
    );
    assert_eq!(log.recycles(), vec![SlotId(1)]);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_handle_does_not_stall_pool() {
    let log = MockLog::new();
    let pool = mock_pool(1, &log);
    pool.start().await.unwrap();

    drop(pool.execute(MockTask::succeed_after("ignored", Duration::from_millis(5))));
    let next = pool.execute(MockTask::succeed("next"));

    assert_eq!(next.await.unwrap(), "next");
}

// ============================================
// Lifecycle
// ============================================

#[tokio::test(start_paused = true)]
async fn test_start_reports_first_failure_without_waiting() {
    let log = MockLog::new();
    let worker_log = Arc::clone(&log);
    let pool = WorkerPool::new(
        PoolConfig::new().with_number_of_workers(3).with_timeout(TIMEOUT),
        move |slot| {
            let worker = MockWorker::new(slot, Arc::clone(&worker_log));
            match slot.index() {
                1 => worker.with_start_failure(),
                2 => worker.with_start_delay(Duration::from_secs(60)),
                _ => worker,
            }
        },
    );

    let begin = Instant::now();
    let err = pool.start().await.unwrap_err();

    assert!(matches!(err, PoolError::Start { slot: SlotId(1), .. }));
    assert!(begin.elapsed() < Duration::from_secs(60));
    assert_eq!(pool.status(), PoolStatus::Stopped);

    let mut killed = log.kills();
    killed.sort();
    assert_eq!(killed, vec![SlotId(0), SlotId(1), SlotId(2)]);
}

#[tokio::test(start_paused = true)]
async fn test_kill_mid_dispatch() {
    let log = MockLog::new();
    let pool = mock_pool(1, &log);
    pool.start().await.unwrap();

    let in_flight = pool.execute(MockTask::hang());
    let queued = pool.execute(MockTask::succeed("never"));
    tokio::task::yield_now().await;

    pool.kill();

    assert!(matches!(in_flight.await, Err(PoolError::ShutDown)));
    assert!(matches!(queued.await, Err(PoolError::ShutDown)));
    assert_eq!(log.kills(), vec![SlotId(0)]);
    assert_eq!(pool.status(), PoolStatus::Killed);
    assert!(log.recycles().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_kill_during_recycle_answers_shutdown() {
    let log = MockLog::new();
    let worker_log = Arc::clone(&log);
    let pool = WorkerPool::new(
        PoolConfig::new().with_number_of_workers(1).with_timeout(TIMEOUT),
        move |slot| {
            MockWorker::new(slot, Arc::clone(&worker_log)).with_recycle_delay(Duration::from_secs(10))
        },
    );
    let mut events = pool.subscribe();
    pool.start().await.unwrap();

    let stuck = pool.execute(MockTask::hang());
    assert_eq!(events.recv().await.unwrap(), PoolEvent::Timeout { slot: SlotId(0) });
    tokio::time::sleep(Duration::from_millis(10)).await;

    pool.kill();

    assert!(matches!(stuck.await, Err(PoolError::ShutDown)));

    // The interrupted recycle never completes.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(log.recycles().is_empty());
    assert!(matches!(log.events().last(), Some(MockEvent::Killed(SlotId(0)))));
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test(start_paused = true)]
async fn test_zero_worker_config_is_rejected_at_start() {
    let log = MockLog::new();
    let worker_log = Arc::clone(&log);
    let config = PoolConfig {
        number_of_workers: 0,
        timeout: TIMEOUT,
    };
    let pool = WorkerPool::new(config, move |slot| {
        MockWorker::new(slot, Arc::clone(&worker_log))
    });

    let err = pool.start().await.unwrap_err();
    assert!(matches!(err, PoolError::InvalidConfig(_)));
    assert_eq!(pool.status(), PoolStatus::Stopped);
    assert!(log.starts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_dropped_start_rolls_back_and_can_be_retried() {
    let log = MockLog::new();
    let worker_log = Arc::clone(&log);
    let pool = WorkerPool::new(
        PoolConfig::new().with_number_of_workers(2).with_timeout(TIMEOUT),
        move |slot| {
            MockWorker::new(slot, Arc::clone(&worker_log)).with_start_delay(Duration::from_secs(5))
        },
    );
    let early = pool.execute(MockTask::succeed("early"));

    let attempt = tokio::time::timeout(Duration::from_secs(1), pool.start()).await;
    assert!(attempt.is_err());

    assert_eq!(pool.status(), PoolStatus::Stopped);
    assert!(log.starts().is_empty());
    let mut killed = log.kills();
    killed.sort();
    assert_eq!(killed, vec![SlotId(0), SlotId(1)]);

    pool.start().await.unwrap();
    assert_eq!(pool.status(), PoolStatus::Running);
    assert_eq!(early.await.unwrap(), "early");
}

#[tokio::test(start_paused = true)]
async fn test_kill_while_starting() {
    let log = MockLog::new();
    let worker_log = Arc::clone(&log);
    let pool = WorkerPool::new(
        PoolConfig::new().with_number_of_workers(2).with_timeout(TIMEOUT),
        move |slot| {
            MockWorker::new(slot, Arc::clone(&worker_log)).with_start_delay(Duration::from_secs(5))
        },
    );
    let queued = pool.execute(MockTask::succeed("never"));

    let starting = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.start().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(pool.status(), PoolStatus::Starting);

    pool.kill();

    assert!(matches!(starting.await.unwrap(), Err(PoolError::ShutDown)));
    assert!(matches!(queued.await, Err(PoolError::ShutDown)));
    assert_eq!(pool.status(), PoolStatus::Killed);
    assert!(log.starts().is_empty());

    let mut killed = log.kills();
    killed.sort();
    assert_eq!(killed, vec![SlotId(0), SlotId(1)]);
}

#[test_log::test(tokio::test)]
async fn test_clones_share_workers() {
    let log = MockLog::new();
    let pool = mock_pool(1, &log);
    let other = pool.clone();
    pool.start().await.unwrap();

    assert_eq!(other.status(), PoolStatus::Running);
    assert_eq!(other.run(MockTask::succeed("shared")).await.unwrap(), "shared");

    other.kill();
    assert_eq!(pool.status(), PoolStatus::Killed);
}
