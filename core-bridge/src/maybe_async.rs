//! Results that may or may not need the scheduler loop.

use std::fmt;
use std::future::Future;

use futures::future::{self, LocalBoxFuture};
use futures::FutureExt;

/// What a possibly-async callable returned: a plain value, or a suspended
/// computation that still has to run on the bridge task.
pub enum MaybeAsync<T> {
    Ready(T),
    Pending(LocalBoxFuture<'static, T>),
}

impl<T> MaybeAsync<T> {
    pub fn ready(value: T) -> Self {
        Self::Ready(value)
    }

    pub fn pending<F>(future: F) -> Self
    where
        F: Future<Output = T> + 'static,
    {
        Self::Pending(future.boxed_local())
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn into_future(self) -> LocalBoxFuture<'static, T>
    where
        T: 'static,
    {
        match self {
            Self::Ready(value) => future::ready(value).boxed_local(),
            Self::Pending(future) => future,
        }
    }
}

impl<T> From<T> for MaybeAsync<T> {
    fn from(value: T) -> Self {
        Self::Ready(value)
    }
}

impl<T> fmt::Debug for MaybeAsync<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(_) => f.write_str("MaybeAsync::Ready(..)"),
            Self::Pending(_) => f.write_str("MaybeAsync::Pending(..)"),
        }
    }
}
