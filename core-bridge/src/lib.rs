//! # Core Bridge
//!
//! Runs the async lifecycle phases of a synchronous test (setup, body,
//! teardown, cleanups) on one long-lived task per test, so every phase shares
//! the same task-local [`context`] and the same single-threaded scheduler
//! loop. Background tasks spawned during the test are cancelled when the
//! lifecycle ends, and failures raised while they unwind are reported through
//! a [`FailureHook`].
//!
//! ## Quick start
//!
//! ```ignore
//! #[core_bridge::test]
//! async fn greets() {
//!     core_bridge::context::set(String::from("hello")).unwrap();
//!     assert_eq!(*core_bridge::context::get::<String>().unwrap(), "hello");
//! }
//! ```
//!
//! Driving the bridge by hand:
//!
//! ```
//! use core_bridge::{AsyncBridge, BridgeConfig};
//!
//! let mut bridge = AsyncBridge::new(BridgeConfig::default());
//! bridge.begin_lifecycle().unwrap();
//!
//! let answer = bridge.call_blocking(async { 6 * 7 }).unwrap();
//! assert_eq!(answer, 42);
//!
//! let report = bridge.end_lifecycle().unwrap();
//! assert_eq!(report.outstanding, 0);
//! ```
//!
//! ## Crate layout
//!
//! - [`AsyncBridge`]: lifecycle controller and blocking entry points
//! - [`IsolatedCase`]: full setup/body/teardown/cleanup driver
//! - [`context`]: task-local storage shared by all phases
//! - [`Spawner`]: tracked background tasks
//! - [`FailureHook`]: sink for failures found during shutdown

mod bridge;
mod case;
pub mod context;
mod controller;
mod error;
mod failure;
mod hook;
mod maybe_async;
mod queue;
mod spawner;

pub use case::{CaseHandle, CaseOutcome, CasePhase, IsolatedCase};
pub use controller::{AsyncBridge, LifecycleGuard, LifecyclePhase, ShutdownReport};
pub use error::{BridgeError, Result};
pub use failure::{Failure, Interrupt};
pub use hook::{FailureHook, TracingHook, UnhandledFailure, SHUTDOWN_FAILURE_MESSAGE};
pub use maybe_async::MaybeAsync;
pub use spawner::Spawner;

pub use core_async::task::{SpawnError, TaskError, TaskHandle, TaskId};
pub use core_runtime::{config, logging, BridgeConfig};

pub use core_bridge_macros::test;
