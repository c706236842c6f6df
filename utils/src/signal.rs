//! Mechanisms for coordinating a one-time event across many tasks.
//!
//! A [Signal] is used in two places: as the cancellation token carried by a fetch
//! context and as the completion event of an in-flight fetch. In both cases one
//! party fires the event exactly once and any number of waiters observe it, including
//! waiters that only arrive after it fired.

use futures::{channel::oneshot, future::Shared, FutureExt};
use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// A one-time broadcast that can be awaited by many tasks.
///
/// Cloning a [Signal] is cheap and every clone resolves at the same time. Awaiting a
/// clone after the [Signaler] fired returns immediately.
///
/// If the [Signaler] is dropped without firing, open signals resolve to
/// `Err(oneshot::Canceled)`. Use [Signal::fired] when only an explicit fire should
/// wake the waiter.
///
/// _Note: Polling the same `Signal` after it has resolved will panic. Await a clone
/// (or the signal by value) rather than a reference that was already driven to
/// completion._
///
/// # Example
///
/// ```rust
/// use rangefetch_utils::signal::Signaler;
///
/// # futures::executor::block_on(async {
/// let (signaler, signal) = Signaler::new();
/// let waiter = signal.clone();
/// assert!(!signal.is_signaled());
///
/// signaler.signal();
/// waiter.await.unwrap();
/// assert!(signal.is_signaled());
/// # });
/// ```
#[derive(Clone)]
pub enum Signal {
    /// A signal that resolves when its [Signaler] fires (or is dropped).
    Open(Shared<oneshot::Receiver<()>>),
    /// A signal that has already resolved.
    Closed,
    /// A signal that never resolves.
    Never,
}

impl Signal {
    /// Returns a [Signal] that never resolves.
    ///
    /// Useful as the cancellation token of work that should never be canceled.
    pub fn never() -> Self {
        Self::Never
    }

    /// Returns whether the [Signaler] has fired.
    ///
    /// Does not register interest in the signal, so it can be called from
    /// synchronous code.
    pub fn is_signaled(&self) -> bool {
        match self {
            Self::Open(rx) => matches!(rx.peek(), Some(Ok(()))),
            Self::Closed => true,
            Self::Never => false,
        }
    }

    /// Resolves once the [Signaler] fires.
    ///
    /// Unlike awaiting the [Signal] directly, dropping the [Signaler] without firing
    /// leaves this future pending forever.
    pub async fn fired(self) {
        if self.await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}

impl Future for Signal {
    type Output = Result<(), oneshot::Canceled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut *self {
            Self::Open(rx) => Pin::new(rx).poll(cx),
            Self::Closed => Poll::Ready(Ok(())),
            Self::Never => Poll::Pending,
        }
    }
}

/// Fires a one-time [Signal] across many tasks.
pub struct Signaler {
    tx: oneshot::Sender<()>,
}

impl Signaler {
    /// Create a new [Signaler].
    ///
    /// Returns a [Signaler] and a [Signal] that will resolve when [Signaler::signal] is called.
    pub fn new() -> (Self, Signal) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, Signal::Open(rx.shared()))
    }

    /// Resolve all [Signal]s associated with this [Signaler].
    pub fn signal(self) {
        // All receivers may already be gone
        let _ = self.tx.send(());
    }
}
