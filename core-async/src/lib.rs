//! Scheduler-loop layer for the isolated async test bridge.
//!
//! This crate owns everything that touches the async executor directly, so the
//! bridge crates above it never depend on Tokio themselves:
//!
//! - `runtime`: the per-test [`SchedulerLoop`](runtime::SchedulerLoop), a Tokio
//!   current-thread runtime paired with a `LocalSet`
//! - `task`: tracked spawning onto that loop, awaitable handles and the task
//!   registry consulted at shutdown
//! - `sync`: channel and synchronization primitives
//! - `time`: sleep, timeout and clock types
//!
//! # Examples
//!
//! ```rust
//! use core_async::runtime::{LoopOptions, SchedulerLoop};
//!
//! let scheduler = SchedulerLoop::new(LoopOptions::default()).unwrap();
//! let spawner = scheduler.spawner();
//!
//! let value = scheduler.block_on(async move {
//!     let handle = spawner.spawn(async { 21 * 2 }).unwrap();
//!     handle.await.unwrap()
//! });
//! assert_eq!(value, 42);
//! scheduler.close(std::time::Duration::from_secs(1));
//! ```

pub mod runtime;
pub mod sync;
pub mod task;
pub mod time;

pub use runtime::SchedulerLoop;
pub use task::{LocalSpawner, TaskHandle, TaskId};
pub use time::{sleep, Duration, Instant};

// Task-local storage is part of the executor surface; re-exported so callers
// can declare keys without a direct Tokio dependency.
pub use tokio::task_local;
