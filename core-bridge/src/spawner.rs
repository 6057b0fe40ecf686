use std::future::Future;

use core_async::task::{LocalSpawner, SpawnError, TaskHandle};

use crate::context;

/// Spawns background tasks onto a bridge's scheduler loop.
///
/// Every task is tracked: whatever is still running when the lifecycle ends
/// is cancelled by the shutdown sweep. A spawned task starts with a copy of
/// the spawning task's case context.
#[derive(Debug, Clone)]
pub struct Spawner {
    inner: LocalSpawner,
}

impl Spawner {
    pub(crate) fn new(inner: LocalSpawner) -> Self {
        Self { inner }
    }

    /// # Errors
    ///
    /// Returns [`SpawnError::LoopClosed`] once the lifecycle has ended.
    pub fn spawn<F>(&self, future: F) -> Result<TaskHandle<F::Output>, SpawnError>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        self.inner.spawn(context::inherit(future))
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
