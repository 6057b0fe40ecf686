//! Errors surfaced by the bridge.

use std::time::Duration;

use thiserror::Error;

use crate::failure::Failure;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("async bridge is not initialized; call begin_lifecycle() first")]
    NotInitialized,

    #[error("async bridge is already initialized; end_lifecycle() must run before it can start again")]
    AlreadyInitialized,

    #[error("async bridge cannot be driven from inside an async runtime")]
    InsideRuntime,

    #[error("phase failed: {0}")]
    Phase(Failure),

    #[error("bridge task terminated before delivering a result")]
    BridgeTerminated,

    #[error("operation did not complete within {0:?}")]
    TimedOut(Duration),

    #[error("timeouts need a scheduler loop built with the timer driver")]
    TimerDisabled,

    #[error("failed to build scheduler loop: {0}")]
    Runtime(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] core_runtime::Error),
}

impl BridgeError {
    /// True for errors caused by calling the bridge in the wrong state.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::NotInitialized | Self::AlreadyInitialized | Self::InsideRuntime
        )
    }

    /// The phase failure carried by this error, if any.
    pub fn into_failure(self) -> Option<Failure> {
        match self {
            Self::Phase(failure) => Some(failure),
            _ => None,
        }
    }

    /// Re-raises the error as a panic in the caller.
    ///
    /// Phase failures resume with their original payload so assertion
    /// messages survive the trip through the bridge.
    pub fn resume(self) -> ! {
        match self {
            Self::Phase(failure) => failure.resume(),
            other => panic!("{}", other),
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
