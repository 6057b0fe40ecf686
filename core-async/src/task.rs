//! Tracked task spawning on the scheduler loop.
//!
//! Every task spawned through a [`LocalSpawner`] is recorded in the loop's
//! [`TaskRegistry`] under a sequential [`TaskId`]. The registry keeps the
//! task's `JoinHandle`, so whoever shuts the loop down can enumerate the work
//! that was spawned and never awaited, cancel it, and observe how each task
//! ended. The caller gets an awaitable [`TaskHandle`] for the task's output.
//!
//! # Examples
//!
//! ```rust
//! use core_async::runtime::{LoopOptions, SchedulerLoop};
//! use core_async::task::TaskError;
//!
//! let scheduler = SchedulerLoop::new(LoopOptions::default()).unwrap();
//! let spawner = scheduler.spawner();
//!
//! scheduler.block_on(async move {
//!     let handle = spawner.spawn(std::future::pending::<()>()).unwrap();
//!     handle.abort();
//!     assert_eq!(handle.await, Err(TaskError::Cancelled));
//! });
//! # scheduler.close(std::time::Duration::from_secs(1));
//! ```

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll};

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::LocalSet;
use tracing::trace;

pub use tokio::task::{yield_now, AbortHandle, JoinError, JoinHandle};

/// Identifier of a tracked task, unique within one scheduler loop.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Error returned when a task cannot be spawned.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    #[error("scheduler loop is closed; task was not spawned")]
    LoopClosed,
}

/// How a tracked task failed to produce its output.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task was aborted, or its loop closed before it finished.
    #[error("task was cancelled")]
    Cancelled,

    /// The task panicked; carries the panic message.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }
}

/// Result type for tracked tasks.
pub type Result<T> = std::result::Result<T, TaskError>;

/// Awaitable handle to a tracked task's output.
///
/// Dropping the handle detaches the task; it keeps running and stays in the
/// registry until it finishes or the loop is swept.
pub struct TaskHandle<T> {
    id: TaskId,
    receiver: oneshot::Receiver<Result<T>>,
    abort: AbortHandle,
}

impl<T> TaskHandle<T> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Requests cancellation. The task stops at its next suspension point.
    pub fn abort(&self) {
        self.abort.abort();
    }
}

impl<T> fmt::Debug for TaskHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish()
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without a value: the task was torn down.
            Poll::Ready(Err(_)) => Poll::Ready(Err(TaskError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A registry entry: the join handle of one tracked task.
pub struct TrackedTask {
    id: TaskId,
    handle: JoinHandle<()>,
}

impl TrackedTask {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Requests cancellation without waiting for it.
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Waits for the task to terminate and returns how it ended.
    pub async fn join(self) -> (TaskId, std::result::Result<(), JoinError>) {
        let id = self.id;
        (id, self.handle.await)
    }
}

impl fmt::Debug for TrackedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedTask")
            .field("id", &self.id)
            .field("finished", &self.is_finished())
            .finish()
    }
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    tasks: Vec<TrackedTask>,
    pruned: usize,
}

/// Shared record of every task spawned through a loop's spawners.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Rc<RefCell<RegistryInner>>,
}

impl TaskRegistry {
    fn allocate_id(&self) -> TaskId {
        let mut inner = self.inner.borrow_mut();
        inner.next_id += 1;
        TaskId(inner.next_id)
    }

    /// Records a new task, dropping entries whose task already finished so
    /// their output is released.
    fn track(&self, id: TaskId, handle: JoinHandle<()>) {
        let mut inner = self.inner.borrow_mut();
        let before = inner.tasks.len();
        inner.tasks.retain(|task| !task.is_finished());
        inner.pruned += before - inner.tasks.len();
        inner.tasks.push(TrackedTask { id, handle });
    }

    /// Number of finished tasks dropped from the registry before shutdown.
    pub fn pruned_count(&self) -> usize {
        self.inner.borrow().pruned
    }

    /// Number of recorded tasks, finished or not.
    pub fn len(&self) -> usize {
        self.inner.borrow().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of recorded tasks that have not terminated yet.
    pub fn outstanding_count(&self) -> usize {
        self.inner
            .borrow()
            .tasks
            .iter()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Removes and returns every recorded task.
    pub fn take_all(&self) -> Vec<TrackedTask> {
        std::mem::take(&mut self.inner.borrow_mut().tasks)
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.len())
            .finish()
    }
}

/// Spawns tracked tasks onto one scheduler loop.
///
/// The spawner holds the loop weakly: once the loop is closed, spawning fails
/// with [`SpawnError::LoopClosed`] instead of resurrecting it.
#[derive(Clone)]
pub struct LocalSpawner {
    local: Weak<LocalSet>,
    registry: TaskRegistry,
}

impl LocalSpawner {
    pub(crate) fn new(local: Weak<LocalSet>, registry: TaskRegistry) -> Self {
        Self { local, registry }
    }

    /// Spawns `future` onto the loop and records it in the registry.
    ///
    /// The task starts running the next time the loop is driven. If it
    /// panics, the handle resolves to [`TaskError::Panicked`] and the panic
    /// stays visible to the registry.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::LoopClosed`] if the loop has been closed.
    pub fn spawn<F>(&self, future: F) -> std::result::Result<TaskHandle<F::Output>, SpawnError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let local = self.local.upgrade().ok_or(SpawnError::LoopClosed)?;
        let id = self.registry.allocate_id();
        let (sender, receiver) = oneshot::channel();

        let handle = local.spawn_local(async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(output) => {
                    let _ = sender.send(Ok(output));
                }
                Err(payload) => {
                    let _ = sender.send(Err(TaskError::Panicked(panic_message(payload.as_ref()))));
                    std::panic::resume_unwind(payload);
                }
            }
        });

        let abort = handle.abort_handle();
        self.registry.track(id, handle);
        trace!(task = %id, "spawned tracked task");

        Ok(TaskHandle {
            id,
            receiver,
            abort,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.local.strong_count() == 0
    }
}

impl fmt::Debug for LocalSpawner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSpawner")
            .field("closed", &self.is_closed())
            .field("registry", &self.registry)
            .finish()
    }
}

/// Extracts a readable message from a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{LoopOptions, SchedulerLoop};
    use std::time::Duration;

    fn scheduler() -> SchedulerLoop {
        SchedulerLoop::new(LoopOptions::default()).unwrap()
    }

    #[test]
    fn test_spawn_and_await() {
        let scheduler = scheduler();
        let spawner = scheduler.spawner();

        let value = scheduler.block_on(async move { spawner.spawn(async { 42 }).unwrap().await });

        assert_eq!(value, Ok(42));
        assert_eq!(scheduler.registry().len(), 1);
        assert_eq!(scheduler.registry().outstanding_count(), 0);
        scheduler.close(Duration::from_secs(1));
    }

    #[test]
    fn test_task_ids_are_sequential() {
        let scheduler = scheduler();
        let spawner = scheduler.spawner();

        let first = spawner.spawn(async {}).unwrap();
        let second = spawner.spawn(async {}).unwrap();

        assert_eq!(first.id().as_u64() + 1, second.id().as_u64());
        assert_eq!(second.id().to_string(), format!("task-{}", second.id().as_u64()));
        scheduler.close(Duration::from_secs(1));
    }

    #[test]
    fn test_panicking_task_reports_message() {
        let scheduler = scheduler();
        let spawner = scheduler.spawner();

        let result = scheduler.block_on(async move {
            spawner
                .spawn(async {
                    panic!("kaboom");
                })
                .unwrap()
                .await
        });
        assert_eq!(result, Err(TaskError::Panicked("kaboom".to_string())));

        let tracked = scheduler.registry().take_all();
        assert_eq!(tracked.len(), 1);
        let (_, outcome) = scheduler.block_on(tracked.into_iter().next().unwrap().join());
        assert!(outcome.unwrap_err().is_panic());
        scheduler.close(Duration::from_secs(1));
    }

    #[test]
    fn test_abort_resolves_handle_as_cancelled() {
        let scheduler = scheduler();
        let spawner = scheduler.spawner();

        let result = scheduler.block_on(async move {
            let handle = spawner.spawn(std::future::pending::<()>()).unwrap();
            handle.abort();
            handle.await
        });

        assert!(result.unwrap_err().is_cancelled());
        scheduler.close(Duration::from_secs(1));
    }

    #[test]
    fn test_finished_tasks_are_pruned_on_spawn() {
        let scheduler = scheduler();
        let spawner = scheduler.spawner();

        for i in 0..100 {
            let spawner = spawner.clone();
            let value = scheduler.block_on(async move { spawner.spawn(async move { i }).unwrap().await });
            assert_eq!(value, Ok(i));
        }
        let _pending = spawner.spawn(std::future::pending::<()>()).unwrap();

        assert_eq!(scheduler.registry().len(), 1);
        assert_eq!(scheduler.registry().pruned_count(), 100);
        assert_eq!(scheduler.registry().outstanding_count(), 1);
        scheduler.close(Duration::from_secs(1));
    }

    #[test]
    fn test_take_all_empties_registry() {
        let scheduler = scheduler();
        let spawner = scheduler.spawner();
        let _detached = spawner.spawn(std::future::pending::<()>()).unwrap();

        assert_eq!(scheduler.registry().outstanding_count(), 1);
        let tasks = scheduler.registry().take_all();
        assert_eq!(tasks.len(), 1);
        assert!(scheduler.registry().is_empty());
        scheduler.close(Duration::from_secs(1));
    }

    #[test]
    fn test_panic_message_variants() {
        let static_payload: Box<dyn Any + Send> = Box::new("static");
        let owned_payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other_payload: Box<dyn Any + Send> = Box::new(7_u8);

        assert_eq!(panic_message(static_payload.as_ref()), "static");
        assert_eq!(panic_message(owned_payload.as_ref()), "owned");
        assert_eq!(panic_message(other_payload.as_ref()), "non-string panic payload");
    }
}
