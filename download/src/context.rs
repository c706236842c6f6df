//! Execution environment shared by every fetch started from the same [Download](crate::Download).

use rangefetch_utils::signal::Signal;
use std::future::Future;
use tokio::runtime::Handle;

/// Where fetch tasks run and when they must give up.
///
/// A [Context] pairs a Tokio runtime handle with a cancellation [Signal]. Once the
/// signal fires, every fetch still in flight fails with
/// [Error::Canceled](crate::Error::Canceled) and that failure is retained for the
/// affected offsets.
#[derive(Clone)]
pub struct Context {
    runtime: Handle,
    stopped: Signal,
}

impl Context {
    /// Create a new [Context] that spawns onto `runtime` and is canceled by `stopped`.
    pub fn new(runtime: Handle, stopped: Signal) -> Self {
        Self { runtime, stopped }
    }

    /// Create a [Context] on the current Tokio runtime that is never canceled.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current(), Signal::never())
    }

    /// Returns the cancellation [Signal].
    pub fn stopped(&self) -> Signal {
        self.stopped.clone()
    }

    /// Spawn a detached task onto the runtime.
    pub fn spawn<F>(&self, f: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(f);
    }
}
