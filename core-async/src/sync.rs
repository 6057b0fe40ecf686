//! Synchronization primitives.
//!
//! All of these are async-aware Tokio primitives. The bridge itself relies on
//! `mpsc` for its rendezvous queue and `oneshot` for pending results; the rest
//! are re-exported for test code running on the scheduler loop.
//!
//! # Examples
//!
//! ```rust
//! use core_async::sync::{mpsc, oneshot};
//!
//! let (tx, mut rx) = mpsc::unbounded_channel::<u32>();
//! tx.send(7).unwrap();
//! assert_eq!(rx.try_recv().unwrap(), 7);
//!
//! let (done_tx, mut done_rx) = oneshot::channel::<()>();
//! drop(done_tx);
//! assert!(done_rx.try_recv().is_err());
//! ```

pub use tokio::sync::{
    broadcast, mpsc, oneshot, watch, Barrier, Mutex, MutexGuard, Notify, RwLock, Semaphore,
};
