//! Where the units of a stage run.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;

use crate::config::{Env, stage_timeout};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::orchestrator::{Orchestrator, TimerHandle};
use crate::task::{TaskContext, TaskResult};
use crate::worker::{Completion, WorkerCapability, WorkerSpec};

type SharedWorker = Arc<Mutex<Box<dyn WorkerCapability>>>;

/// One execution slot of a stage: a worker capability, or the
/// orchestrator's own queue when no capability exists.
#[derive(Clone)]
pub(crate) enum Lane {
    Worker(SharedWorker),
    Deferred,
}

impl Lane {
    /// Release the worker behind this lane, if any.
    pub(crate) fn terminate(&self) {
        if let Lane::Worker(worker) = self {
            lock(worker).terminate();
        }
    }
}

fn lock(worker: &SharedWorker) -> MutexGuard<'_, Box<dyn WorkerCapability>> {
    worker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-stage state shared by every unit a scheduler starts.
pub(crate) struct StageRunner {
    context: Context,
    spec: WorkerSpec,
    task_context: Arc<TaskContext>,
    max_workers: usize,
    synchronous: bool,
}

impl StageRunner {
    pub(crate) fn new(context: Context, spec: WorkerSpec, max_workers: usize, synchronous: bool) -> Self {
        let task_context = Arc::new(spec.context());
        Self {
            context,
            spec,
            task_context,
            max_workers,
            synchronous,
        }
    }

    pub(crate) fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub(crate) fn env(&self) -> &Env {
        &self.spec.env
    }

    pub(crate) fn orchestrator(&self) -> &Orchestrator {
        self.context.orchestrator()
    }

    /// Acquire a lane for one more concurrent unit.
    pub(crate) fn open_lane(&self) -> Result<Lane> {
        match self.context.factory().create(&self.spec)? {
            Some(worker) => Ok(Lane::Worker(Arc::new(Mutex::new(worker)))),
            None if self.synchronous => Ok(Lane::Deferred),
            None => Err(Error::CapabilityUnavailable),
        }
    }

    /// Run one unit on `lane`. `on_done` runs on the orchestrator.
    pub(crate) fn dispatch(
        &self,
        lane: &Lane,
        payload: Value,
        on_done: impl FnOnce(TaskResult) + Send + 'static,
    ) {
        match lane {
            Lane::Worker(worker) => {
                let orchestrator = self.orchestrator().clone();
                let completion = Completion::new(move |result| {
                    orchestrator.post(move || on_done(result));
                });
                lock(worker).send(payload, completion);
            }
            Lane::Deferred => {
                let callable = self.spec.callable.clone();
                let ctx = Arc::clone(&self.task_context);
                self.orchestrator()
                    .post(move || on_done(callable.invoke(&ctx, payload)));
            }
        }
    }

    /// Start the stage deadline, if the environment sets one.
    pub(crate) fn start_timer(
        &self,
        on_expiry: impl FnOnce(Duration) + Send + 'static,
    ) -> Option<TimerHandle> {
        stage_timeout(self.env()).map(|deadline| {
            self.orchestrator()
                .post_after(deadline, move || on_expiry(deadline))
        })
    }
}
