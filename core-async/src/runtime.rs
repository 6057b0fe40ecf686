//! Scheduler loop ownership.
//!
//! A [`SchedulerLoop`] is a Tokio current-thread runtime paired with a
//! [`LocalSet`], owned by exactly one test instance. Tasks spawned on it may be
//! `!Send`, run only while the loop is being driven through
//! [`SchedulerLoop::block_on`], and are dropped when the loop closes.
//!
//! The loop is an explicit handle: nothing is installed as an ambient
//! "current loop", so two tests can never observe each other's executor.

use std::future::Future;
use std::io;
use std::rc::Rc;
use std::time::Duration;

pub use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{JoinHandle, LocalSet};
use tracing::{debug, trace};

use crate::task::{LocalSpawner, TaskRegistry};

/// Options used when building a [`SchedulerLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopOptions {
    /// Enable the timer driver (`sleep`, `timeout`, `interval`).
    pub enable_time: bool,
    /// Enable the I/O driver (sockets, pipes).
    pub enable_io: bool,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self {
            enable_time: true,
            enable_io: true,
        }
    }
}

/// A single-threaded cooperative scheduler loop.
///
/// Field order matters: the `LocalSet` is dropped before the runtime so that
/// any task still owned by it is released while its drivers exist.
pub struct SchedulerLoop {
    local: Rc<LocalSet>,
    registry: TaskRegistry,
    runtime: Runtime,
}

impl SchedulerLoop {
    /// Builds a fresh loop.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the runtime drivers cannot be created.
    pub fn new(options: LoopOptions) -> io::Result<Self> {
        let mut builder = Builder::new_current_thread();
        if options.enable_time {
            builder.enable_time();
        }
        if options.enable_io {
            builder.enable_io();
        }
        let runtime = builder.build()?;

        debug!(?options, "scheduler loop created");

        Ok(Self {
            local: Rc::new(LocalSet::new()),
            registry: TaskRegistry::default(),
            runtime,
        })
    }

    /// Drives the loop until `future` completes, running every local task
    /// that becomes ready in the meantime.
    ///
    /// # Panics
    ///
    /// Panics if called from inside an async runtime (see [`inside_runtime`]).
    pub fn block_on<F>(&self, future: F) -> F::Output
    where
        F: Future,
    {
        self.local.block_on(&self.runtime, future)
    }

    /// Spawns a task that is *not* recorded in the registry.
    ///
    /// Reserved for machinery that manages its own lifetime; anything spawned
    /// here is invisible to the shutdown sweep.
    pub fn spawn_untracked<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        trace!("spawning untracked task");
        self.local.spawn_local(future)
    }

    /// Returns a spawner whose tasks are recorded in this loop's registry.
    pub fn spawner(&self) -> LocalSpawner {
        LocalSpawner::new(Rc::downgrade(&self.local), self.registry.clone())
    }

    /// The registry of tracked tasks.
    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Closes the loop, dropping every task it still owns and waiting up to
    /// `timeout` for blocking work to wind down.
    pub fn close(self, timeout: Duration) {
        let Self {
            local,
            registry,
            runtime,
        } = self;
        let leftover = registry.outstanding_count();
        drop(registry);
        drop(local);
        runtime.shutdown_timeout(timeout);
        debug!(leftover, "scheduler loop closed");
    }

    /// Closes the loop without blocking.
    ///
    /// Unlike [`close`](Self::close) this is safe to call from inside another
    /// runtime, where blocking shutdown would panic.
    pub fn close_in_background(self) {
        let Self {
            local,
            registry,
            runtime,
        } = self;
        drop(registry);
        drop(local);
        runtime.shutdown_background();
        debug!("scheduler loop closed in background");
    }
}

/// Returns true when the current thread is already driving an async runtime.
///
/// A scheduler loop cannot be driven from such a thread.
pub fn inside_runtime() -> bool {
    Handle::try_current().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_block_on_runs_local_tasks() {
        let scheduler = SchedulerLoop::new(LoopOptions::default()).unwrap();
        let hits = Rc::new(Cell::new(0));

        let hits_clone = hits.clone();
        let handle = scheduler.spawn_untracked(async move {
            hits_clone.set(hits_clone.get() + 1);
        });
        scheduler.block_on(handle).unwrap();

        assert_eq!(hits.get(), 1);
        assert!(scheduler.registry().is_empty());
        scheduler.close(Duration::from_secs(1));
    }

    #[test]
    fn test_loop_without_time_driver() {
        let options = LoopOptions {
            enable_time: false,
            enable_io: false,
        };
        let scheduler = SchedulerLoop::new(options).unwrap();
        assert_eq!(scheduler.block_on(async { 5 }), 5);
        scheduler.close(Duration::from_millis(10));
    }

    #[test]
    fn test_spawner_reports_closed_loop() {
        let scheduler = SchedulerLoop::new(LoopOptions::default()).unwrap();
        let spawner = scheduler.spawner();
        assert!(!spawner.is_closed());

        scheduler.close(Duration::from_secs(1));
        assert!(spawner.is_closed());
        assert!(spawner.spawn(async {}).is_err());
    }

    #[test]
    fn test_inside_runtime_detection() {
        assert!(!inside_runtime());

        let scheduler = SchedulerLoop::new(LoopOptions::default()).unwrap();
        assert!(scheduler.block_on(async { inside_runtime() }));
        scheduler.close(Duration::from_secs(1));
    }
}
