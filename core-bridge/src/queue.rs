//! Rendezvous queue between the synchronous driver and the bridge task.
//!
//! The driver submits work items; the bridge task consumes them strictly in
//! submission order. Each item carries the write half of a one-shot result
//! slot ([`PendingResult`]); the driver keeps the read half
//! ([`ResultWaiter`]) and blocks on it.

use std::any::Any;
use std::cell::Cell;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};

use core_async::sync::{mpsc, oneshot};
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use tracing::trace;

use crate::error::{BridgeError, Result};
use crate::failure::{Failure, Interrupt};

/// Result of one operation as seen by the driver.
pub(crate) type Outcome<T> = std::result::Result<T, Failure>;

/// Write half of a result slot, resolved at most once by the bridge task.
pub(crate) struct PendingResult<T> {
    sender: oneshot::Sender<Outcome<T>>,
}

impl<T> PendingResult<T> {
    /// True once the waiting side has given up on this result.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.sender.is_closed()
    }

    /// Delivers the outcome. Returns false if the waiter was gone and the
    /// outcome was discarded.
    pub(crate) fn resolve(self, outcome: Outcome<T>) -> bool {
        if self.is_abandoned() {
            return false;
        }
        self.sender.send(outcome).is_ok()
    }
}

/// Read half of a result slot.
///
/// Resolves to `None` when the bridge task went away without resolving the
/// slot.
pub(crate) struct ResultWaiter<T> {
    receiver: oneshot::Receiver<Outcome<T>>,
}

impl<T> ResultWaiter<T> {
    /// Gives up on the result; the bridge task discards it when it arrives.
    pub(crate) fn abandon(mut self) {
        self.receiver.close();
    }
}

impl<T> Future for ResultWaiter<T> {
    type Output = Option<Outcome<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|result| result.ok())
    }
}

pub(crate) fn result_slot<T>() -> (PendingResult<T>, ResultWaiter<T>) {
    let (sender, receiver) = oneshot::channel();
    (PendingResult { sender }, ResultWaiter { receiver })
}

/// How a work item ended on the bridge task.
pub(crate) enum Completion {
    Delivered { failed: bool },
    Discarded { failed: bool },
    Fatal(Box<dyn Any + Send>),
}

/// A type-erased work item, runnable on the bridge task.
pub(crate) trait Execute {
    fn seq(&self) -> u64;

    fn execute(self: Box<Self>) -> LocalBoxFuture<'static, Completion>;
}

pub(crate) struct WorkItem<T> {
    seq: u64,
    pending: PendingResult<T>,
    operation: LocalBoxFuture<'static, T>,
}

impl<T: 'static> Execute for WorkItem<T> {
    fn seq(&self) -> u64 {
        self.seq
    }

    fn execute(self: Box<Self>) -> LocalBoxFuture<'static, Completion> {
        let WorkItem {
            pending, operation, ..
        } = *self;

        async move {
            let outcome = match AssertUnwindSafe(operation).catch_unwind().await {
                Ok(value) => Ok(value),
                Err(payload) if Interrupt::is_interrupt(payload.as_ref()) => {
                    return Completion::Fatal(payload);
                }
                Err(payload) => Err(Failure::from_panic(payload)),
            };

            let failed = outcome.is_err();
            if pending.resolve(outcome) {
                Completion::Delivered { failed }
            } else {
                Completion::Discarded { failed }
            }
        }
        .boxed_local()
    }
}

pub(crate) enum Message {
    Work(Box<dyn Execute>),
    Stop,
}

/// Producer side, owned by the controller.
pub(crate) struct RendezvousQueue {
    sender: mpsc::UnboundedSender<Message>,
    submitted: Cell<u64>,
}

/// Consumer side, owned by the bridge task.
pub(crate) struct QueueConsumer {
    receiver: mpsc::UnboundedReceiver<Message>,
}

pub(crate) fn rendezvous() -> (RendezvousQueue, QueueConsumer) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        RendezvousQueue {
            sender,
            submitted: Cell::new(0),
        },
        QueueConsumer { receiver },
    )
}

impl RendezvousQueue {
    /// Enqueues `operation` and returns the waiter for its result.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::BridgeTerminated`] if the bridge task has
    /// stopped consuming.
    pub(crate) fn submit<F>(&self, operation: F) -> Result<ResultWaiter<F::Output>>
    where
        F: Future + 'static,
        F::Output: 'static,
    {
        let seq = self.submitted.get();
        let (pending, waiter) = result_slot();
        let item = WorkItem {
            seq,
            pending,
            operation: operation.boxed_local(),
        };

        self.sender
            .send(Message::Work(Box::new(item)))
            .map_err(|_| BridgeError::BridgeTerminated)?;
        self.submitted.set(seq + 1);
        trace!(seq, "work item submitted");
        Ok(waiter)
    }

    /// Enqueues the stop marker. Returns false if the bridge task is gone.
    pub(crate) fn stop(&self) -> bool {
        self.sender.send(Message::Stop).is_ok()
    }

    /// Number of work items accepted so far.
    pub(crate) fn submitted(&self) -> u64 {
        self.submitted.get()
    }
}

impl QueueConsumer {
    pub(crate) async fn next(&mut self) -> Option<Message> {
        self.receiver.recv().await
    }
}
