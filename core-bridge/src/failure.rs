//! Failures crossing the bridge.
//!
//! A phase fails by panicking (an `assert!` in a test body, an explicit
//! `panic!`). The bridge catches the panic on the bridge task and hands the
//! payload back to the synchronous caller as a [`Failure`], which can be
//! resumed to re-raise it with its original payload.
//!
//! A panic carrying an [`Interrupt`] is process-fatal instead: it is never
//! captured into a `Failure`, it terminates the bridge task and resurfaces in
//! the synchronous caller as-is.

use std::any::Any;
use std::fmt;

use core_async::task::panic_message;

/// A captured panic from a phase or a spawned task.
pub struct Failure {
    message: String,
    payload: Box<dyn Any + Send>,
}

impl Failure {
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast_ref::<Interrupt>() {
            Some(interrupt) => format!("interrupted: {}", interrupt.reason()),
            None => panic_message(payload.as_ref()),
        };
        Self { message, payload }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    pub fn into_panic(self) -> Box<dyn Any + Send> {
        self.payload
    }

    /// Re-raises the captured panic.
    pub fn resume(self) -> ! {
        std::panic::resume_unwind(self.payload)
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Failure")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Failure {}

/// Process-fatal signal, the analog of an interrupt or exit request.
///
/// Raise it with [`Interrupt::raise`]; the bridge never converts it into a
/// phase failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interrupt {
    reason: String,
}

impl Interrupt {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Panics with an `Interrupt` payload.
    pub fn raise(reason: impl Into<String>) -> ! {
        std::panic::panic_any(Self::new(reason))
    }

    /// True if a panic payload is an `Interrupt`.
    pub fn is_interrupt(payload: &(dyn Any + Send)) -> bool {
        payload.is::<Interrupt>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn test_failure_keeps_message_and_payload() {
        let payload = catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        let failure = Failure::from_panic(payload);

        assert_eq!(failure.message(), "boom 7");
        assert_eq!(failure.to_string(), "boom 7");
        assert_eq!(failure.downcast_ref::<String>().map(String::as_str), Some("boom 7"));
    }

    #[test]
    fn test_resume_re_raises_original_payload() {
        let failure = Failure::from_panic(Box::new("original"));
        let payload = catch_unwind(AssertUnwindSafe(|| failure.resume())).unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"original"));
    }

    #[test]
    fn test_interrupt_detection() {
        let payload = catch_unwind(|| Interrupt::raise("ctrl-c")).unwrap_err();
        assert!(Interrupt::is_interrupt(payload.as_ref()));

        let failure = Failure::from_panic(payload);
        assert_eq!(failure.message(), "interrupted: ctrl-c");

        let ordinary: Box<dyn Any + Send> = Box::new("plain");
        assert!(!Interrupt::is_interrupt(ordinary.as_ref()));
    }
}
