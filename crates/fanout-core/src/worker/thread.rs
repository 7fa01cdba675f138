//! Thread-backed worker capabilities.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Sender};
use std::thread;

use serde_json::Value;

use crate::error::Result;
use crate::task::{Callable, TaskContext, TaskError};

use super::{Completion, WorkerCapability, WorkerFactory, WorkerSpec};

/// Runs each worker on its own OS thread.
#[derive(Debug, Default)]
pub struct ThreadWorkerFactory {
    spawned: Arc<AtomicUsize>,
}

impl ThreadWorkerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of worker threads started so far.
    pub fn spawned(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl WorkerFactory for ThreadWorkerFactory {
    fn create(&self, spec: &WorkerSpec) -> Result<Option<Box<dyn WorkerCapability>>> {
        let id = self.spawned.fetch_add(1, Ordering::SeqCst);
        let worker = ThreadWorker::start(id, spec.callable.clone(), spec.context())?;
        Ok(Some(Box::new(worker)))
    }
}

type Job = (Value, Completion);

struct ThreadWorker {
    jobs: Option<Sender<Job>>,
}

impl ThreadWorker {
    fn start(id: usize, callable: Callable, ctx: TaskContext) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();

        thread::Builder::new()
            .name(format!("fanout-worker-{}", id))
            .spawn(move || {
                while let Ok((payload, completion)) = rx.recv() {
                    let result = callable.invoke(&ctx, payload);
                    completion.complete(result);
                }
                tracing::trace!("Worker thread {} exiting", id);
            })?;

        Ok(Self { jobs: Some(tx) })
    }
}

impl WorkerCapability for ThreadWorker {
    fn send(&mut self, payload: Value, completion: Completion) {
        let Some(jobs) = self.jobs.as_ref() else {
            completion.complete(Err(terminated()));
            return;
        };
        if let Err(mpsc::SendError((_, completion))) = jobs.send((payload, completion)) {
            completion.complete(Err(terminated()));
        }
    }

    fn terminate(&mut self) {
        // Closing the queue lets the thread exit once its current unit is
        // done. A unit that never returns keeps its thread alive detached.
        self.jobs.take();
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn terminated() -> TaskError {
    TaskError::new("terminated", "worker has been terminated")
}
