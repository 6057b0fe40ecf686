//! Integration tests for core-async.
//!
//! These tests drive real scheduler loops the way the bridge does: one loop per
//! test, tasks spawned through a tracked spawner, loop closed at the end.

use core_async::runtime::{LoopOptions, SchedulerLoop};
use core_async::task::TaskError;
use core_async::{sync, task, time};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

fn new_loop() -> SchedulerLoop {
    SchedulerLoop::new(LoopOptions::default()).unwrap()
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[test]
fn test_tasks_interleave_on_one_thread() {
    let scheduler = new_loop();
    let spawner = scheduler.spawner();
    let log = Rc::new(RefCell::new(Vec::new()));

    let log_a = log.clone();
    let log_b = log.clone();
    scheduler.block_on(async move {
        let a = spawner
            .spawn(async move {
                log_a.borrow_mut().push("a1");
                task::yield_now().await;
                log_a.borrow_mut().push("a2");
            })
            .unwrap();
        let b = spawner
            .spawn(async move {
                log_b.borrow_mut().push("b1");
                task::yield_now().await;
                log_b.borrow_mut().push("b2");
            })
            .unwrap();
        a.await.unwrap();
        b.await.unwrap();
    });

    assert_eq!(*log.borrow(), vec!["a1", "b1", "a2", "b2"]);
    scheduler.close(time::Duration::from_secs(1));
}

#[test]
fn test_detached_task_only_runs_while_driven() {
    let scheduler = new_loop();
    let spawner = scheduler.spawner();
    let (tx, mut rx) = sync::oneshot::channel();

    let _handle = spawner
        .spawn(async move {
            let _ = tx.send("ran");
        })
        .unwrap();

    assert!(rx.try_recv().is_err());
    let value = scheduler.block_on(rx).unwrap();
    assert_eq!(value, "ran");
    scheduler.close(time::Duration::from_secs(1));
}

#[test]
fn test_abort_then_join_observes_cancellation() {
    let scheduler = new_loop();
    let spawner = scheduler.spawner();
    let dropped = Arc::new(AtomicBool::new(false));

    let guard = SetOnDrop(dropped.clone());
    let _handle = spawner
        .spawn(async move {
            let _guard = guard;
            time::sleep(time::Duration::from_secs(3600)).await;
        })
        .unwrap();

    // Let the task reach its sleep.
    scheduler.block_on(task::yield_now());

    let tracked = scheduler.registry().take_all();
    for task in &tracked {
        task.abort();
    }
    let outcomes = scheduler.block_on(futures::future::join_all(
        tracked.into_iter().map(|task| task.join()),
    ));

    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].1.as_ref().unwrap_err().is_cancelled());
    assert!(dropped.load(Ordering::SeqCst));
    scheduler.close(time::Duration::from_secs(1));
}

#[test]
fn test_closing_loop_drops_pending_tasks() {
    let scheduler = new_loop();
    let spawner = scheduler.spawner();
    let dropped = Arc::new(AtomicBool::new(false));

    let guard = SetOnDrop(dropped.clone());
    let handle = spawner
        .spawn(async move {
            let _guard = guard;
            std::future::pending::<()>().await;
        })
        .unwrap();
    scheduler.block_on(task::yield_now());

    scheduler.close(time::Duration::from_secs(1));

    assert!(dropped.load(Ordering::SeqCst));
    let outcome = futures::executor::block_on(handle);
    assert_eq!(outcome, Err(TaskError::Cancelled));
}

#[test]
fn test_timeout_on_loop() {
    let scheduler = new_loop();
    let result = scheduler.block_on(async {
        time::timeout(
            time::Duration::from_millis(10),
            time::sleep(time::Duration::from_secs(5)),
        )
        .await
    });
    assert!(result.is_err());
    scheduler.close(time::Duration::from_secs(1));
}

#[test]
fn test_task_local_scope_spans_awaits() {
    core_async::task_local! {
        static REQUEST: u32;
    }

    let scheduler = new_loop();
    let seen = scheduler.block_on(REQUEST.scope(7, async {
        task::yield_now().await;
        REQUEST.get()
    }));
    assert_eq!(seen, 7);
    scheduler.close(time::Duration::from_secs(1));
}

#[tokio::test]
async fn test_unbounded_channel_preserves_order() {
    let (tx, mut rx) = sync::mpsc::unbounded_channel();
    for i in 0..5 {
        tx.send(i).unwrap();
    }
    drop(tx);

    let mut received = Vec::new();
    while let Some(value) = rx.recv().await {
        received.push(value);
    }
    assert_eq!(received, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_notify() {
    let notify = Arc::new(sync::Notify::new());
    let notify_clone = notify.clone();

    let handle = tokio::spawn(async move {
        notify_clone.notified().await;
        "notified"
    });

    time::sleep(time::Duration::from_millis(10)).await;
    notify.notify_one();

    assert_eq!(handle.await.unwrap(), "notified");
}
