//! Lifecycle controller.
//!
//! [`AsyncBridge`] owns the per-test scheduler loop, the bridge task and the
//! rendezvous queue. A synchronous test driver uses it in three steps:
//!
//! 1. [`begin_lifecycle`](AsyncBridge::begin_lifecycle) builds a fresh loop,
//!    starts the bridge task and waits until it is ready.
//! 2. [`call_blocking`](AsyncBridge::call_blocking) and
//!    [`call_maybe_async`](AsyncBridge::call_maybe_async) run phases on the
//!    bridge task, one at a time, in submission order.
//! 3. [`end_lifecycle`](AsyncBridge::end_lifecycle) drains the queue,
//!    cancels every leftover spawned task, reports failures raised during
//!    cancellation and closes the loop.
//!
//! Dropping a running bridge performs step 3 as well.

use std::cell::RefCell;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use core_async::runtime::{self, LoopOptions, SchedulerLoop};
use core_async::sync::oneshot;
use core_async::task::{panic_message, JoinHandle, TrackedTask};
use core_async::time;
use core_runtime::BridgeConfig;
use futures::future::{join_all, LocalBoxFuture};
use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::bridge::{self, BridgeSettings};
use crate::context::CaseContext;
use crate::error::{BridgeError, Result};
use crate::failure::Failure;
use crate::hook::{FailureHook, TracingHook, UnhandledFailure};
use crate::maybe_async::MaybeAsync;
use crate::queue::{self, Outcome, RendezvousQueue};
use crate::spawner::Spawner;

type ShutdownHook = Box<dyn FnOnce() -> LocalBoxFuture<'static, ()>>;

/// Where a bridge is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// Never started.
    Idle,
    /// Accepting work.
    Running,
    /// Shutting down; no new work is accepted.
    Draining,
    /// Loop closed. The bridge can be started again.
    Closed,
}

/// What the shutdown sweep found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tracked tasks still running when the sweep started.
    pub outstanding: usize,
    /// Outstanding tasks that ended by cancellation.
    pub cancelled: usize,
    /// Outstanding tasks that ran to completion before cancellation landed.
    pub completed: usize,
    /// Outstanding tasks that failed while being cancelled.
    pub failures_reported: usize,
    /// Tracked tasks that had already finished before the sweep.
    pub already_finished: usize,
    pub drain_timed_out: bool,
    pub sweep_timed_out: bool,
}

struct BridgeState {
    scheduler: SchedulerLoop,
    queue: RendezvousQueue,
    bridge_task: RefCell<Option<JoinHandle<()>>>,
    shutdown_hooks: RefCell<Vec<ShutdownHook>>,
}

/// Drives async lifecycle phases from synchronous code.
///
/// The bridge is `!Send`: it must be driven from the thread that created its
/// lifecycle, and never from inside an async runtime.
pub struct AsyncBridge {
    config: BridgeConfig,
    hook: Arc<dyn FailureHook>,
    phase: LifecyclePhase,
    state: Option<BridgeState>,
}

impl AsyncBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            hook: Arc::new(TracingHook),
            phase: LifecyclePhase::Idle,
            state: None,
        }
    }

    /// Replaces the hook that receives failures found by the shutdown sweep.
    pub fn with_hook(mut self, hook: Arc<dyn FailureHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn is_running(&self) -> bool {
        self.state.is_some()
    }

    /// Number of work items submitted in the current lifecycle.
    pub fn submitted_count(&self) -> u64 {
        self.state
            .as_ref()
            .map_or(0, |state| state.queue.submitted())
    }

    /// Creates the scheduler loop and starts the bridge task.
    ///
    /// Returns once the bridge task is ready to accept work.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::AlreadyInitialized`] if a lifecycle is active
    /// - [`BridgeError::InsideRuntime`] when called from async code
    /// - [`BridgeError::Config`] if the configuration is invalid
    /// - [`BridgeError::Runtime`] if the loop cannot be built
    pub fn begin_lifecycle(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Err(BridgeError::AlreadyInitialized);
        }
        if runtime::inside_runtime() {
            return Err(BridgeError::InsideRuntime);
        }
        self.config.validate()?;

        let scheduler = SchedulerLoop::new(LoopOptions {
            enable_time: self.config.enable_time,
            enable_io: self.config.enable_io,
        })?;
        let (queue, consumer) = queue::rendezvous();
        let (ready_tx, ready_rx) = oneshot::channel();

        let bridge_task = scheduler.spawn_untracked(bridge::run(
            consumer,
            ready_tx,
            CaseContext::new(),
            BridgeSettings::from(&self.config),
        ));

        if scheduler.block_on(ready_rx).is_err() {
            scheduler.close(self.config.shutdown_timeout);
            return Err(BridgeError::BridgeTerminated);
        }

        self.state = Some(BridgeState {
            scheduler,
            queue,
            bridge_task: RefCell::new(Some(bridge_task)),
            shutdown_hooks: RefCell::new(Vec::new()),
        });
        self.phase = LifecyclePhase::Running;
        debug!(debug = self.config.debug, "bridge lifecycle started");
        Ok(())
    }

    /// Runs `operation` on the bridge task and blocks until it finishes.
    ///
    /// While waiting, the scheduler loop is driven, so tasks spawned by
    /// earlier phases make progress too.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::Phase`] if the operation panicked
    /// - [`BridgeError::NotInitialized`] outside a lifecycle
    /// - [`BridgeError::InsideRuntime`] when called from async code
    /// - [`BridgeError::BridgeTerminated`] if the bridge task is gone
    ///
    /// # Panics
    ///
    /// A process-fatal [`Interrupt`](crate::Interrupt) raised by the
    /// operation resumes here as a panic.
    pub fn call_blocking<F>(&self, operation: F) -> Result<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let state = self.running_state()?;
        let waiter = state.queue.submit(operation)?;
        let outcome = state.scheduler.block_on(waiter);
        self.settle(state, outcome)
    }

    /// Like [`call_blocking`](Self::call_blocking), but gives up after
    /// `limit`.
    ///
    /// On timeout the result is abandoned: the operation keeps its place on
    /// the bridge task, and whatever it eventually produces is discarded.
    ///
    /// # Errors
    ///
    /// Everything `call_blocking` returns, plus [`BridgeError::TimedOut`] and
    /// [`BridgeError::TimerDisabled`] when the loop has no timer driver.
    pub fn call_blocking_with_timeout<F>(&self, operation: F, limit: Duration) -> Result<F::Output>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let state = self.running_state()?;
        if !self.config.enable_time {
            return Err(BridgeError::TimerDisabled);
        }

        let mut waiter = state.queue.submit(operation)?;
        let outcome = state.scheduler.block_on(async {
            match time::timeout(limit, &mut waiter).await {
                Ok(outcome) => Some(outcome),
                Err(_) => None,
            }
        });

        match outcome {
            Some(outcome) => self.settle(state, outcome),
            None => {
                waiter.abandon();
                warn!(?limit, "operation timed out; result abandoned");
                Err(BridgeError::TimedOut(limit))
            }
        }
    }

    /// Invokes `callable` and, if it returned a suspended computation, runs
    /// that on the bridge task.
    ///
    /// A ready value is returned directly without touching the queue. The
    /// lifecycle precondition is checked before `callable` runs.
    ///
    /// `callable` itself runs on the caller's thread, outside the bridge
    /// task, so it sees no case context; only a returned
    /// [`MaybeAsync::Pending`] future runs inside it.
    pub fn call_maybe_async<F, T>(&self, callable: F) -> Result<T>
    where
        F: FnOnce() -> MaybeAsync<T>,
        T: 'static,
    {
        self.running_state()?;
        match callable() {
            MaybeAsync::Ready(value) => Ok(value),
            MaybeAsync::Pending(future) => self.call_blocking(future),
        }
    }

    /// A spawner for background tasks on this lifecycle's loop.
    pub fn spawner(&self) -> Result<Spawner> {
        let state = self.state.as_ref().ok_or(BridgeError::NotInitialized)?;
        Ok(Spawner::new(state.scheduler.spawner()))
    }

    /// Registers an async hook to run after the shutdown sweep, before the
    /// loop closes. Hooks run in registration order, and only when the sweep
    /// found outstanding tasks; a lifecycle with none goes straight to
    /// closing the loop.
    pub fn add_shutdown_hook<F, Fut>(&self, hook: F) -> Result<()>
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let state = self.state.as_ref().ok_or(BridgeError::NotInitialized)?;
        state
            .shutdown_hooks
            .borrow_mut()
            .push(Box::new(move || hook().boxed_local()));
        Ok(())
    }

    /// Stops the bridge task, cancels leftover tasks and closes the loop.
    ///
    /// Waits for all work items queued before the call. The bridge returns
    /// to an uninitialized state and may be started again.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::NotInitialized`] outside a lifecycle
    /// - [`BridgeError::InsideRuntime`] when called from async code
    ///
    /// # Panics
    ///
    /// Resumes a fatal signal that terminated the bridge task and was not
    /// yet surfaced by a `call_blocking`.
    pub fn end_lifecycle(&mut self) -> Result<ShutdownReport> {
        if self.state.is_none() {
            return Err(BridgeError::NotInitialized);
        }
        if runtime::inside_runtime() {
            return Err(BridgeError::InsideRuntime);
        }
        let state = self.state.take().ok_or(BridgeError::NotInitialized)?;

        let (report, fatal) = self.shut_down(state);
        if let Some(payload) = fatal {
            std::panic::resume_unwind(payload);
        }
        Ok(report)
    }

    /// Starts a lifecycle that ends when the returned guard is dropped.
    pub fn enter(&mut self) -> Result<LifecycleGuard<'_>> {
        self.begin_lifecycle()?;
        Ok(LifecycleGuard { bridge: self })
    }

    fn running_state(&self) -> Result<&BridgeState> {
        let state = self.state.as_ref().ok_or(BridgeError::NotInitialized)?;
        if runtime::inside_runtime() {
            return Err(BridgeError::InsideRuntime);
        }
        Ok(state)
    }

    fn settle<T>(&self, state: &BridgeState, outcome: Option<Outcome<T>>) -> Result<T> {
        match outcome {
            Some(Ok(value)) => Ok(value),
            Some(Err(failure)) => Err(BridgeError::Phase(failure)),
            None => Err(self.bridge_terminated(state)),
        }
    }

    /// Collects the bridge task after it died. A fatal signal resumes here.
    fn bridge_terminated(&self, state: &BridgeState) -> BridgeError {
        let handle = state.bridge_task.borrow_mut().take();
        if let Some(handle) = handle {
            if let Err(join_error) = state.scheduler.block_on(handle) {
                if let Ok(payload) = join_error.try_into_panic() {
                    error!("bridge task terminated by a fatal signal");
                    std::panic::resume_unwind(payload);
                }
            }
        }
        BridgeError::BridgeTerminated
    }

    fn shut_down(
        &mut self,
        state: BridgeState,
    ) -> (ShutdownReport, Option<Box<dyn std::any::Any + Send>>) {
        self.phase = LifecyclePhase::Draining;
        let mut report = ShutdownReport::default();

        let fatal = self.drain(&state, &mut report);
        if self.sweep(&state, &mut report) {
            self.run_shutdown_hooks(&state);
        } else {
            debug!("no outstanding tasks; skipping shutdown hooks");
        }

        let BridgeState { scheduler, .. } = state;
        scheduler.close(self.config.shutdown_timeout);
        self.phase = LifecyclePhase::Closed;

        info!(
            outstanding = report.outstanding,
            cancelled = report.cancelled,
            failures = report.failures_reported,
            "bridge lifecycle ended"
        );
        (report, fatal)
    }

    /// Sends the stop marker and waits for the bridge task to consume it.
    fn drain(
        &self,
        state: &BridgeState,
        report: &mut ShutdownReport,
    ) -> Option<Box<dyn std::any::Any + Send>> {
        let handle = state.bridge_task.borrow_mut().take()?;
        if !state.queue.stop() {
            debug!("bridge task stopped before the stop marker was sent");
        }

        let limit = self.config.drain_timeout;
        let (joined, timed_out) = state.scheduler.block_on(async move {
            let mut handle = handle;
            match limit {
                None => (handle.await, false),
                Some(limit) => match time::timeout(limit, &mut handle).await {
                    Ok(joined) => (joined, false),
                    Err(_) => {
                        handle.abort();
                        (handle.await, true)
                    }
                },
            }
        });

        if timed_out {
            warn!(limit = ?self.config.drain_timeout, "queue did not drain in time; bridge task aborted");
            report.drain_timed_out = true;
        }

        joined.err().and_then(|join_error| join_error.try_into_panic().ok())
    }

    /// Cancels every tracked task that is still running and waits for all of
    /// them to finish. Returns false if nothing was outstanding.
    fn sweep(&self, state: &BridgeState, report: &mut ShutdownReport) -> bool {
        let (finished, outstanding): (Vec<TrackedTask>, Vec<TrackedTask>) = state
            .scheduler
            .registry()
            .take_all()
            .into_iter()
            .partition(TrackedTask::is_finished);

        report.already_finished = finished.len() + state.scheduler.registry().pruned_count();
        report.outstanding = outstanding.len();
        drop(finished);

        if outstanding.is_empty() {
            debug!("no outstanding tasks at shutdown");
            return false;
        }

        // Request every cancellation before awaiting any of them.
        for task in &outstanding {
            task.abort();
        }
        debug!(count = report.outstanding, "cancellation requested for outstanding tasks");

        let joins = join_all(outstanding.into_iter().map(TrackedTask::join));
        let results = match self.config.sweep_timeout {
            None => Some(state.scheduler.block_on(joins)),
            Some(limit) => state
                .scheduler
                .block_on(async move { time::timeout(limit, joins).await })
                .ok(),
        };

        let Some(results) = results else {
            warn!(limit = ?self.config.sweep_timeout, "cancelled tasks did not finish in time");
            report.sweep_timed_out = true;
            return true;
        };

        for (task, joined) in results {
            match joined {
                Ok(()) => report.completed += 1,
                Err(join_error) => match join_error.try_into_panic() {
                    Ok(payload) => {
                        report.failures_reported += 1;
                        let failure = Failure::from_panic(payload);
                        debug!(%task, %failure, "task failed during cancellation");
                        self.hook
                            .report(UnhandledFailure::during_shutdown(task, failure));
                    }
                    Err(_) => report.cancelled += 1,
                },
            }
        }
        true
    }

    fn run_shutdown_hooks(&self, state: &BridgeState) {
        let hooks = std::mem::take(&mut *state.shutdown_hooks.borrow_mut());
        for hook in hooks {
            let result = state
                .scheduler
                .block_on(AssertUnwindSafe(async move { hook().await }).catch_unwind());
            if let Err(payload) = result {
                error!(failure = %panic_message(payload.as_ref()), "shutdown hook panicked");
            }
        }
    }

    /// Ends a lifecycle that was never ended explicitly. Never panics.
    fn finalize(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        warn!("bridge lifecycle was not ended explicitly; finalizing");

        if runtime::inside_runtime() {
            let BridgeState { scheduler, .. } = state;
            scheduler.close_in_background();
            self.phase = LifecyclePhase::Closed;
            return;
        }

        match catch_unwind(AssertUnwindSafe(|| self.shut_down(state))) {
            Ok((_, Some(payload))) => {
                error!(
                    failure = %panic_message(payload.as_ref()),
                    "fatal signal discarded during finalization"
                );
            }
            Ok(_) => {}
            Err(payload) => {
                error!(failure = %panic_message(payload.as_ref()), "finalization failed");
            }
        }
        self.phase = LifecyclePhase::Closed;
    }
}

impl Default for AsyncBridge {
    fn default() -> Self {
        Self::new(BridgeConfig::default())
    }
}

impl Drop for AsyncBridge {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// A running lifecycle that ends when dropped.
///
/// Dereferences to the [`AsyncBridge`], so phases run through the guard.
pub struct LifecycleGuard<'a> {
    bridge: &'a mut AsyncBridge,
}

impl LifecycleGuard<'_> {
    /// Ends the lifecycle and returns the shutdown report.
    pub fn finish(self) -> Result<ShutdownReport> {
        self.bridge.end_lifecycle()
    }
}

impl std::ops::Deref for LifecycleGuard<'_> {
    type Target = AsyncBridge;

    fn deref(&self) -> &AsyncBridge {
        self.bridge
    }
}

impl Drop for LifecycleGuard<'_> {
    fn drop(&mut self) {
        self.bridge.finalize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge() -> AsyncBridge {
        AsyncBridge::new(BridgeConfig::default())
    }

    #[test]
    fn test_phase_transitions() {
        let mut bridge = bridge();
        assert_eq!(bridge.phase(), LifecyclePhase::Idle);

        bridge.begin_lifecycle().unwrap();
        assert_eq!(bridge.phase(), LifecyclePhase::Running);
        assert!(bridge.is_running());

        bridge.end_lifecycle().unwrap();
        assert_eq!(bridge.phase(), LifecyclePhase::Closed);
        assert!(!bridge.is_running());
    }

    #[test]
    fn test_calls_before_begin_fail_fast() {
        let bridge = bridge();
        assert!(matches!(
            bridge.call_blocking(async { 1 }),
            Err(BridgeError::NotInitialized)
        ));
        assert!(matches!(bridge.spawner(), Err(BridgeError::NotInitialized)));

        let mut invoked = false;
        let result = bridge.call_maybe_async(|| {
            invoked = true;
            MaybeAsync::ready(())
        });
        assert!(matches!(result, Err(BridgeError::NotInitialized)));
        assert!(!invoked);
    }

    #[test]
    fn test_end_without_begin() {
        let mut bridge = bridge();
        assert!(matches!(
            bridge.end_lifecycle(),
            Err(BridgeError::NotInitialized)
        ));
    }

    #[test]
    fn test_double_begin_rejected() {
        let mut bridge = bridge();
        bridge.begin_lifecycle().unwrap();
        assert!(matches!(
            bridge.begin_lifecycle(),
            Err(BridgeError::AlreadyInitialized)
        ));
        bridge.end_lifecycle().unwrap();
    }

    #[test]
    fn test_invalid_config_rejected_at_begin() {
        let config = BridgeConfig {
            drain_timeout: Some(Duration::ZERO),
            ..BridgeConfig::default()
        };
        let mut bridge = AsyncBridge::new(config);
        assert!(matches!(
            bridge.begin_lifecycle(),
            Err(BridgeError::Config(_))
        ));
        assert_eq!(bridge.phase(), LifecyclePhase::Idle);
    }

    #[test]
    fn test_timeout_needs_timer_driver() {
        let config = BridgeConfig {
            enable_time: false,
            ..BridgeConfig::default()
        };
        let mut bridge = AsyncBridge::new(config);
        bridge.begin_lifecycle().unwrap();
        assert!(matches!(
            bridge.call_blocking_with_timeout(async {}, Duration::from_millis(5)),
            Err(BridgeError::TimerDisabled)
        ));
        assert_eq!(bridge.call_blocking(async { 9 }).unwrap(), 9);
        bridge.end_lifecycle().unwrap();
    }

    #[test]
    fn test_drop_finalizes_running_bridge() {
        let mut bridge = bridge();
        bridge.begin_lifecycle().unwrap();
        let spawner = bridge.spawner().unwrap();
        spawner.spawn(std::future::pending::<()>()).unwrap();

        drop(bridge);
        assert!(spawner.is_closed());
    }

    #[test]
    fn test_guard_ends_lifecycle() {
        let mut bridge = bridge();
        {
            let guard = bridge.enter().unwrap();
            assert_eq!(guard.call_blocking(async { "inside" }).unwrap(), "inside");
        }
        assert_eq!(bridge.phase(), LifecyclePhase::Closed);

        let guard = bridge.enter().unwrap();
        let report = guard.finish().unwrap();
        assert_eq!(report, ShutdownReport::default());
    }

    #[test]
    fn test_submitted_count() {
        let mut bridge = bridge();
        bridge.begin_lifecycle().unwrap();
        bridge.call_blocking(async {}).unwrap();
        bridge.call_maybe_async(|| MaybeAsync::ready(())).unwrap();
        assert_eq!(bridge.submitted_count(), 1);
        bridge.end_lifecycle().unwrap();
        assert_eq!(bridge.submitted_count(), 0);
    }
}
