//! The cooperative executor every piece of scheduling logic runs on.
//!
//! The orchestrator is one dedicated thread driving a current-thread tokio
//! runtime. Continuations, worker completions, synchronous-fallback jobs and
//! timer callbacks are all spawned onto it, so no two of them ever run at
//! the same time.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::task::panic_message;

/// Cloneable handle to the orchestrator thread.
///
/// The thread shuts down once the last handle is dropped. Jobs posted after
/// that are dropped without running.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    handle: Handle,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let sender = self
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
    }
}

impl Orchestrator {
    /// Start a new orchestrator thread.
    pub fn new() -> Result<Self> {
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        thread::Builder::new()
            .name("fanout-orchestrator".to_string())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_time().build() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = handle_tx.send(Err(Error::from(e)));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));

                runtime.block_on(async {
                    let _ = shutdown_rx.await;
                });
                tracing::debug!("Orchestrator shut down");
            })?;

        let handle = handle_rx.recv().map_err(|_| Error::Closed)??;

        Ok(Self {
            inner: Arc::new(Inner {
                handle,
                shutdown: Mutex::new(Some(shutdown_tx)),
            }),
        })
    }

    /// Queue a job to run on the orchestrator thread.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        self.inner.handle.spawn(async move { run_job(job) });
    }

    /// Queue a job to run after `delay`.
    ///
    /// The returned handle cancels the job if it has not started yet.
    pub fn post_after(&self, delay: Duration, job: impl FnOnce() + Send + 'static) -> TimerHandle {
        let task = self.inner.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            run_job(job);
        });
        TimerHandle {
            abort: task.abort_handle(),
        }
    }
}

fn run_job(job: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
        tracing::error!(
            "Orchestrator job panicked: {}",
            panic_message(payload.as_ref())
        );
    }
}

/// Cancellation handle for a delayed job.
#[derive(Debug)]
pub struct TimerHandle {
    abort: tokio::task::AbortHandle,
}

impl TimerHandle {
    /// Cancel the timer. No effect if it already fired.
    pub fn cancel(&self) {
        self.abort.abort();
    }
}
