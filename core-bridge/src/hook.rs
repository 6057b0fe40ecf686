//! Reporting of failures nobody awaited.
//!
//! When the shutdown sweep cancels a leftover task and the task fails while
//! unwinding (a panicking `Drop`, for instance), the failure has no caller to
//! go to. It is handed to the bridge's [`FailureHook`] instead, exactly once
//! per task.

use core_async::task::TaskId;
use tracing::error;

use crate::failure::Failure;

/// Message attached to failures found by the shutdown sweep.
pub const SHUTDOWN_FAILURE_MESSAGE: &str = "unhandled failure during test shutdown";

/// A failure raised by a task during the shutdown sweep.
#[derive(Debug)]
pub struct UnhandledFailure {
    pub message: String,
    pub failure: Failure,
    pub task: TaskId,
}

impl UnhandledFailure {
    pub(crate) fn during_shutdown(task: TaskId, failure: Failure) -> Self {
        Self {
            message: SHUTDOWN_FAILURE_MESSAGE.to_string(),
            failure,
            task,
        }
    }
}

/// Receives failures that have no waiting caller.
#[cfg_attr(test, mockall::automock)]
pub trait FailureHook: Send + Sync {
    fn report(&self, failure: UnhandledFailure);
}

impl<F> FailureHook for F
where
    F: Fn(UnhandledFailure) + Send + Sync,
{
    fn report(&self, failure: UnhandledFailure) {
        self(failure)
    }
}

/// Default hook: logs the failure at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHook;

impl FailureHook for TracingHook {
    fn report(&self, failure: UnhandledFailure) {
        error!(
            task = %failure.task,
            failure = %failure.failure,
            "{}",
            failure.message
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_closure_hook() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let hook = move |failure: UnhandledFailure| {
            sink.lock().unwrap().push(failure.failure.message().to_string());
        };

        hook.report(UnhandledFailure {
            message: SHUTDOWN_FAILURE_MESSAGE.to_string(),
            failure: Failure::from_panic(Box::new("drop panicked")),
            task: TaskId::default(),
        });

        assert_eq!(*seen.lock().unwrap(), vec!["drop panicked".to_string()]);
    }

    #[test]
    fn test_mock_hook_receives_shutdown_message() {
        let mut hook = MockFailureHook::new();
        hook.expect_report()
            .withf(|failure| failure.message == SHUTDOWN_FAILURE_MESSAGE)
            .times(1)
            .return_const(());

        let hook: Arc<dyn FailureHook> = Arc::new(hook);
        hook.report(UnhandledFailure {
            message: SHUTDOWN_FAILURE_MESSAGE.to_string(),
            failure: Failure::from_panic(Box::new("late")),
            task: TaskId::default(),
        });
    }

    #[test]
    fn test_tracing_hook_does_not_panic() {
        core_runtime::logging::init_test_logging();
        TracingHook.report(UnhandledFailure {
            message: SHUTDOWN_FAILURE_MESSAGE.to_string(),
            failure: Failure::from_panic(Box::new(String::from("logged"))),
            task: TaskId::default(),
        });
    }
}
