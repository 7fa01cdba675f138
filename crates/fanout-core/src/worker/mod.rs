//! Worker capabilities: the opaque execution units schedulers dispatch to.
//!
//! # Transports
//!
//! - **`ThreadWorkerFactory`** - one OS thread per worker. Runs the callable's
//!   closure directly. Cheap, but a stuck unit cannot be killed.
//! - **`ProcessWorkerFactory`** - one `fanout-worker` child process per
//!   worker. Tasks are looked up by name in the worker's registry; busy
//!   workers can be killed with SIGKILL, idle ones go back to a warm pool.
//! - **`Unavailable`** - produces nothing, so every stage runs through the
//!   synchronous fallback (or fails when that is disabled).
//!
//! ```text
//! Scheduler (orchestrator thread)
//!     │
//!     ├── WorkerFactory::create(spec) ──► Box<dyn WorkerCapability>
//!     │
//!     ├── send(payload, completion)
//!     │       └── worker runs the task concurrently
//!     │       └── completion posted back onto the orchestrator
//!     │
//!     └── terminate()
//! ```

mod process;
mod thread;

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::config::Env;
use crate::error::Result;
use crate::task::{Callable, Requirements, TaskContext, TaskResult};

pub use process::ProcessWorkerFactory;
pub use thread::ThreadWorkerFactory;

/// Delivers the outcome of one `send` exactly once.
pub struct Completion {
    deliver: Box<dyn FnOnce(TaskResult) + Send>,
}

impl Completion {
    pub fn new(deliver: impl FnOnce(TaskResult) + Send + 'static) -> Self {
        Self {
            deliver: Box::new(deliver),
        }
    }

    /// Report the outcome of the unit.
    pub fn complete(self, result: TaskResult) {
        (self.deliver)(result)
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Completion")
    }
}

/// Handle to something that can run units of work concurrently with the
/// orchestrator.
pub trait WorkerCapability: Send {
    /// Dispatch one unit of work. The outcome arrives through `completion`.
    fn send(&mut self, payload: Value, completion: Completion);

    /// Release the worker. Idempotent and safe to call after completion.
    fn terminate(&mut self);
}

/// Everything a transport needs to build workers for one stage.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    /// Task every unit of the stage runs.
    pub callable: Callable,
    /// Pipeline environment merged with the stage environment.
    pub env: Env,
    /// Name under which tasks see the environment.
    pub namespace: String,
    /// Scripts, helper tasks and objects registered on the pipeline.
    pub requirements: Arc<Requirements>,
}

impl WorkerSpec {
    /// Build the context tasks of this stage run in.
    pub fn context(&self) -> TaskContext {
        TaskContext::from_requirements(self.env.clone(), &self.namespace, &self.requirements)
    }
}

/// Creates worker capabilities for a stage.
pub trait WorkerFactory: Send + Sync {
    /// Create a worker for `spec`.
    ///
    /// `Ok(None)` means this factory cannot provide workers at all, which
    /// sends the stage down the synchronous fallback path.
    fn create(&self, spec: &WorkerSpec) -> Result<Option<Box<dyn WorkerCapability>>>;

    /// Whether `create` can ever return a worker.
    fn is_supported(&self) -> bool {
        true
    }
}

/// Factory for environments without any worker transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unavailable;

impl WorkerFactory for Unavailable {
    fn create(&self, _spec: &WorkerSpec) -> Result<Option<Box<dyn WorkerCapability>>> {
        Ok(None)
    }

    fn is_supported(&self) -> bool {
        false
    }
}

impl<F: WorkerFactory + ?Sized> WorkerFactory for Arc<F> {
    fn create(&self, spec: &WorkerSpec) -> Result<Option<Box<dyn WorkerCapability>>> {
        (**self).create(spec)
    }

    fn is_supported(&self) -> bool {
        (**self).is_supported()
    }
}
