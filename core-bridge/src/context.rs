//! Task-local case context.
//!
//! The bridge task runs every phase of a test inside one [`CaseContext`]
//! scope, so values stored during setup are visible to the body, teardown and
//! cleanups. Values are keyed by type:
//!
//! ```ignore
//! struct Fixture(u32);
//!
//! // in an async setup phase
//! core_bridge::context::set(Fixture(7))?;
//!
//! // later, in the body
//! let fixture = core_bridge::context::get::<Fixture>().unwrap();
//! assert_eq!(fixture.0, 7);
//! ```
//!
//! Tasks spawned through the bridge's [`Spawner`](crate::Spawner) start with
//! a copy of the spawning task's context. Writes made by a spawned task stay
//! in its copy.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

use thiserror::Error;

core_async::task_local! {
    static CASE_CONTEXT: CaseContext;
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    #[error("no case context is active on this task")]
    Inactive,
}

/// Shared, type-keyed storage for one test case.
#[derive(Clone, Default)]
pub struct CaseContext {
    values: Rc<RefCell<HashMap<TypeId, Rc<dyn Any>>>>,
}

impl CaseContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new context holding the same values. Later writes to either side
    /// are not visible to the other.
    pub fn fork(&self) -> Self {
        Self {
            values: Rc::new(RefCell::new(self.values.borrow().clone())),
        }
    }

    /// True if both handles refer to the same storage.
    pub fn same_as(&self, other: &CaseContext) -> bool {
        Rc::ptr_eq(&self.values, &other.values)
    }

    pub fn len(&self) -> usize {
        self.values.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.borrow().is_empty()
    }

    pub fn insert<T: 'static>(&self, value: T) -> Option<Rc<T>> {
        self.values
            .borrow_mut()
            .insert(TypeId::of::<T>(), Rc::new(value))
            .and_then(|previous| previous.downcast::<T>().ok())
    }

    pub fn get<T: 'static>(&self) -> Option<Rc<T>> {
        self.values
            .borrow()
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn remove<T: 'static>(&self) -> Option<Rc<T>> {
        self.values
            .borrow_mut()
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.values.borrow().contains_key(&TypeId::of::<T>())
    }

    /// Runs `future` with this context installed as the current one.
    pub fn scope<F: Future>(self, future: F) -> impl Future<Output = F::Output> {
        CASE_CONTEXT.scope(self, future)
    }
}

impl fmt::Debug for CaseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaseContext")
            .field("len", &self.len())
            .finish()
    }
}

/// The context of the current task, if any.
pub fn current() -> Option<CaseContext> {
    CASE_CONTEXT.try_with(CaseContext::clone).ok()
}

pub fn is_active() -> bool {
    current().is_some()
}

/// Stores `value` in the current context, returning the value it replaced.
///
/// # Errors
///
/// Returns [`ContextError::Inactive`] outside of a case context.
pub fn set<T: 'static>(value: T) -> Result<Option<Rc<T>>, ContextError> {
    current()
        .map(|context| context.insert(value))
        .ok_or(ContextError::Inactive)
}

pub fn get<T: 'static>() -> Option<Rc<T>> {
    current().and_then(|context| context.get::<T>())
}

pub fn remove<T: 'static>() -> Option<Rc<T>> {
    current().and_then(|context| context.remove::<T>())
}

pub fn contains<T: 'static>() -> bool {
    current().map_or(false, |context| context.contains::<T>())
}

/// Wraps `future` so it runs with a copy of the current context.
///
/// The copy is taken now, not when the future is first polled.
pub(crate) fn inherit<F: Future>(future: F) -> impl Future<Output = F::Output> {
    let snapshot = current().map(|context| context.fork()).unwrap_or_default();
    snapshot.scope(future)
}
