//! Isolated async test cases.
//!
//! [`IsolatedCase`] runs one test through a fresh [`AsyncBridge`]:
//!
//! 1. `set_up`, then `async_set_up`
//! 2. the body, if setup succeeded
//! 3. `async_tear_down`, then `tear_down`, if setup succeeded
//! 4. registered cleanups, last registered first, always
//! 5. the shutdown sweep
//!
//! Every async step runs on the same bridge task, so values stored in the
//! [`context`](crate::context) during setup are visible to the body and
//! teardown. A failing phase is recorded and the case moves on; the outcome
//! lists every failure with the phase that raised it.
//!
//! ```ignore
//! use core_bridge::{context, IsolatedCase};
//!
//! struct Port(u16);
//!
//! IsolatedCase::new("binds_port")
//!     .async_set_up(|_| async { context::set(Port(8080)).unwrap(); })
//!     .async_body(|_| async {
//!         assert_eq!(context::get::<Port>().unwrap().0, 8080);
//!     })
//!     .run()
//!     .assert_success();
//! ```

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::Arc;

use core_async::task::{SpawnError, TaskHandle};
use core_runtime::BridgeConfig;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use tracing::{debug, error, info_span};

use crate::controller::{AsyncBridge, ShutdownReport};
use crate::error::{BridgeError, Result};
use crate::failure::{Failure, Interrupt};
use crate::hook::FailureHook;
use crate::maybe_async::MaybeAsync;
use crate::spawner::Spawner;

type SyncPhase = Box<dyn FnOnce(&CaseHandle)>;
type AsyncPhase = Box<dyn FnOnce(CaseHandle) -> LocalBoxFuture<'static, ()>>;
type BodyPhase = Box<dyn FnOnce(CaseHandle) -> MaybeAsync<()>>;
type Cleanup = Box<dyn FnOnce() -> MaybeAsync<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CasePhase {
    SetUp,
    AsyncSetUp,
    Body,
    AsyncTearDown,
    TearDown,
    Cleanup,
}

/// Handle passed to every phase of a running case.
#[derive(Clone)]
pub struct CaseHandle {
    name: Rc<str>,
    spawner: Spawner,
    cleanups: Rc<RefCell<Vec<Cleanup>>>,
}

impl CaseHandle {
    fn new(name: &str, spawner: Spawner) -> Self {
        Self {
            name: Rc::from(name),
            spawner,
            cleanups: Rc::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spawner(&self) -> &Spawner {
        &self.spawner
    }

    /// Spawns a background task; it is cancelled when the case ends.
    pub fn spawn<F>(&self, future: F) -> std::result::Result<TaskHandle<F::Output>, SpawnError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.spawner.spawn(future)
    }

    /// Registers a cleanup to run after teardown.
    pub fn add_cleanup<F>(&self, cleanup: F)
    where
        F: FnOnce() + 'static,
    {
        self.cleanups
            .borrow_mut()
            .push(Box::new(move || MaybeAsync::Ready(cleanup())));
    }

    /// Registers an async cleanup; it runs on the bridge task.
    pub fn add_async_cleanup<F, Fut>(&self, cleanup: F)
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.cleanups
            .borrow_mut()
            .push(Box::new(move || MaybeAsync::pending(cleanup())));
    }

    pub fn pending_cleanups(&self) -> usize {
        self.cleanups.borrow().len()
    }

    fn pop_cleanup(&self) -> Option<Cleanup> {
        self.cleanups.borrow_mut().pop()
    }
}

impl fmt::Debug for CaseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaseHandle")
            .field("name", &self.name)
            .field("pending_cleanups", &self.pending_cleanups())
            .finish()
    }
}

/// Result of running an [`IsolatedCase`].
#[derive(Debug)]
pub struct CaseOutcome {
    name: String,
    failures: Vec<(CasePhase, Failure)>,
    error: Option<BridgeError>,
    shutdown: Option<ShutdownReport>,
}

impl CaseOutcome {
    fn new(name: String) -> Self {
        Self {
            name,
            failures: Vec::new(),
            error: None,
            shutdown: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Phase failures in the order they happened.
    pub fn failures(&self) -> &[(CasePhase, Failure)] {
        &self.failures
    }

    /// An error that kept the bridge from running or shutting down.
    pub fn error(&self) -> Option<&BridgeError> {
        self.error.as_ref()
    }

    pub fn shutdown(&self) -> Option<&ShutdownReport> {
        self.shutdown.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.error.is_none()
    }

    /// Panics unless the case succeeded.
    ///
    /// The first phase failure is resumed with its original payload; any
    /// further failures are logged first.
    pub fn assert_success(self) {
        let CaseOutcome {
            name,
            failures,
            error,
            ..
        } = self;

        let mut failures = failures.into_iter();
        if let Some((phase, first)) = failures.next() {
            for (other_phase, other) in failures {
                error!(case = %name, phase = ?other_phase, failure = %other, "additional failure");
            }
            if let Some(error) = &error {
                error!(case = %name, %error, "bridge error");
            }
            debug!(case = %name, ?phase, "re-raising first failure");
            first.resume();
        }

        if let Some(error) = error {
            panic!("case `{}` did not run cleanly: {}", name, error);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Collect,
    Raise,
}

struct CaseRun {
    mode: Mode,
    outcome: CaseOutcome,
}

impl CaseRun {
    /// Records a phase result. Returns true if the phase succeeded.
    fn record(&mut self, phase: CasePhase, result: Result<()>) -> bool {
        let error = match result {
            Ok(()) => return true,
            Err(error) => error,
        };

        if self.mode == Mode::Raise {
            error.resume();
        }

        match error {
            BridgeError::Phase(failure) => {
                debug!(case = %self.outcome.name, ?phase, %failure, "phase failed");
                self.outcome.failures.push((phase, failure));
            }
            other => self.bridge_error(other),
        }
        false
    }

    fn bridge_error(&mut self, error: BridgeError) {
        if self.mode == Mode::Raise {
            panic!("case `{}` did not run cleanly: {}", self.outcome.name, error);
        }
        error!(case = %self.outcome.name, %error, "bridge error");
        self.outcome.error.get_or_insert(error);
    }
}

/// Runs `phase`, turning a panic in its synchronous part into a phase
/// failure. Fatal signals keep unwinding.
fn guarded<F>(phase: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    match catch_unwind(AssertUnwindSafe(phase)) {
        Ok(result) => result,
        Err(payload) if Interrupt::is_interrupt(payload.as_ref()) => resume_unwind(payload),
        Err(payload) => Err(BridgeError::Phase(Failure::from_panic(payload))),
    }
}

/// One test case with optional sync and async lifecycle phases.
pub struct IsolatedCase {
    name: String,
    config: Option<BridgeConfig>,
    hook: Option<Arc<dyn FailureHook>>,
    set_up: Option<SyncPhase>,
    async_set_up: Option<AsyncPhase>,
    body: Option<BodyPhase>,
    async_tear_down: Option<AsyncPhase>,
    tear_down: Option<SyncPhase>,
}

impl IsolatedCase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: None,
            hook: None,
            set_up: None,
            async_set_up: None,
            body: None,
            async_tear_down: None,
            tear_down: None,
        }
    }

    /// Bridge configuration. Defaults to [`BridgeConfig::default`] with
    /// environment overrides applied.
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn FailureHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn set_up<F>(mut self, phase: F) -> Self
    where
        F: FnOnce(&CaseHandle) + 'static,
    {
        self.set_up = Some(Box::new(phase));
        self
    }

    pub fn async_set_up<F, Fut>(mut self, phase: F) -> Self
    where
        F: FnOnce(CaseHandle) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.async_set_up = Some(Box::new(move |case| phase(case).boxed_local()));
        self
    }

    /// A body that decides at runtime whether it needs the bridge task.
    pub fn body<F>(mut self, body: F) -> Self
    where
        F: FnOnce(CaseHandle) -> MaybeAsync<()> + 'static,
    {
        self.body = Some(Box::new(body));
        self
    }

    pub fn async_body<F, Fut>(self, body: F) -> Self
    where
        F: FnOnce(CaseHandle) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.body(move |case| MaybeAsync::pending(body(case)))
    }

    pub fn async_tear_down<F, Fut>(mut self, phase: F) -> Self
    where
        F: FnOnce(CaseHandle) -> Fut + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        self.async_tear_down = Some(Box::new(move |case| phase(case).boxed_local()));
        self
    }

    pub fn tear_down<F>(mut self, phase: F) -> Self
    where
        F: FnOnce(&CaseHandle) + 'static,
    {
        self.tear_down = Some(Box::new(phase));
        self
    }

    /// Runs the case, collecting failures instead of raising them.
    pub fn run(self) -> CaseOutcome {
        self.execute(Mode::Collect)
    }

    /// Runs the case, re-raising the first failure immediately.
    ///
    /// Later phases are skipped, but the lifecycle is still finalized.
    pub fn run_debug(self) -> ShutdownReport {
        self.execute(Mode::Raise).shutdown.unwrap_or_default()
    }

    fn execute(self, mode: Mode) -> CaseOutcome {
        let IsolatedCase {
            name,
            config,
            hook,
            set_up,
            async_set_up,
            body,
            async_tear_down,
            tear_down,
        } = self;

        let span = info_span!("isolated_case", case = %name);
        let _entered = span.enter();

        let mut run = CaseRun {
            mode,
            outcome: CaseOutcome::new(name.clone()),
        };

        let config = match config {
            Some(config) => config,
            None => match BridgeConfig::default().with_env_overrides() {
                Ok(config) => config,
                Err(error) => {
                    run.bridge_error(error.into());
                    return run.outcome;
                }
            },
        };

        let mut bridge = AsyncBridge::new(config);
        if let Some(hook) = hook {
            bridge = bridge.with_hook(hook);
        }

        let guard = match bridge.enter() {
            Ok(guard) => guard,
            Err(error) => {
                run.bridge_error(error);
                return run.outcome;
            }
        };
        let case = match guard.spawner() {
            Ok(spawner) => CaseHandle::new(&name, spawner),
            Err(error) => {
                run.bridge_error(error);
                return run.outcome;
            }
        };

        let mut set_up_ok = true;
        if let Some(phase) = set_up {
            let case = case.clone();
            set_up_ok = run.record(
                CasePhase::SetUp,
                guarded(move || {
                    phase(&case);
                    Ok(())
                }),
            );
        }
        if set_up_ok {
            if let Some(phase) = async_set_up {
                let case = case.clone();
                set_up_ok = run.record(
                    CasePhase::AsyncSetUp,
                    guarded(|| guard.call_blocking(phase(case))),
                );
            }
        }

        if set_up_ok {
            if let Some(body) = body {
                let case = case.clone();
                run.record(
                    CasePhase::Body,
                    guarded(|| guard.call_maybe_async(move || body(case))),
                );
            }
            if let Some(phase) = async_tear_down {
                let case = case.clone();
                run.record(
                    CasePhase::AsyncTearDown,
                    guarded(|| guard.call_blocking(phase(case))),
                );
            }
            if let Some(phase) = tear_down {
                let case = case.clone();
                run.record(
                    CasePhase::TearDown,
                    guarded(move || {
                        phase(&case);
                        Ok(())
                    }),
                );
            }
        }

        while let Some(cleanup) = case.pop_cleanup() {
            run.record(CasePhase::Cleanup, guarded(|| guard.call_maybe_async(cleanup)));
        }

        match guard.finish() {
            Ok(report) => run.outcome.shutdown = Some(report),
            Err(error) => run.bridge_error(error),
        }
        run.outcome
    }
}

impl fmt::Debug for IsolatedCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolatedCase")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("set_up", &self.set_up.is_some())
            .field("async_set_up", &self.async_set_up.is_some())
            .field("body", &self.body.is_some())
            .field("async_tear_down", &self.async_tear_down.is_some())
            .field("tear_down", &self.tear_down.is_some())
            .finish_non_exhaustive()
    }
}
