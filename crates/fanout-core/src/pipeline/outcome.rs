//! The awaitable a pipeline hands back to its caller.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

/// Final result of a pipeline.
///
/// Await it from any async runtime, or block on it with [`wait`](Self::wait)
/// from synchronous code.
#[must_use = "an outcome does nothing unless awaited or waited on"]
#[derive(Debug)]
pub struct Outcome<O> {
    rx: oneshot::Receiver<Result<O>>,
}

impl<O> Outcome<O> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<O>>) -> Self {
        Self { rx }
    }

    /// Block the current thread until the pipeline settles.
    ///
    /// # Panics
    ///
    /// Panics when called from within an async execution context; await the
    /// outcome there instead.
    pub fn wait(self) -> Result<O> {
        self.rx.blocking_recv().unwrap_or(Err(Error::Closed))
    }
}

impl<O> Future for Outcome<O> {
    type Output = Result<O>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Closed)))
    }
}
