//! Runtime context shared by every stage of a pipeline.

use std::sync::Arc;

use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::worker::{ProcessWorkerFactory, ThreadWorkerFactory, Unavailable, WorkerFactory};

/// The orchestrator plus the worker transport a pipeline runs on.
///
/// Selecting the transport here, rather than through process-wide state,
/// lets pipelines with different transports live side by side.
///
/// # Example
///
/// ```
/// use fanout_core::{Context, Options, Pipeline};
/// use serde_json::json;
///
/// let context = Context::threaded().unwrap();
/// let total = Pipeline::from_value(Options::default(), context, json!([1, 2, 3]))
///     .unwrap()
///     .then(|v| Ok(json!(v.as_array().map(|a| a.len()).unwrap_or(0))))
///     .collect::<usize>()
///     .wait()
///     .unwrap();
/// assert_eq!(total, 3);
/// ```
#[derive(Clone)]
pub struct Context {
    orchestrator: Orchestrator,
    factory: Arc<dyn WorkerFactory>,
}

impl Context {
    /// Start a new orchestrator and use `factory` for workers.
    pub fn new(factory: impl WorkerFactory + 'static) -> Result<Self> {
        Ok(Self {
            orchestrator: Orchestrator::new()?,
            factory: Arc::new(factory),
        })
    }

    /// Combine an existing orchestrator with a factory.
    pub fn with_orchestrator(orchestrator: Orchestrator, factory: Arc<dyn WorkerFactory>) -> Self {
        Self {
            orchestrator,
            factory,
        }
    }

    /// Workers are OS threads.
    pub fn threaded() -> Result<Self> {
        Self::new(ThreadWorkerFactory::new())
    }

    /// Workers are `fanout-worker` processes.
    pub fn process() -> Result<Self> {
        Self::new(ProcessWorkerFactory::new()?)
    }

    /// No workers; every stage uses the synchronous fallback.
    pub fn synchronous() -> Result<Self> {
        Self::new(Unavailable)
    }

    /// Whether the transport can produce workers at all.
    pub fn is_supported(&self) -> bool {
        self.factory.is_supported()
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn factory(&self) -> &Arc<dyn WorkerFactory> {
        &self.factory
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("supported", &self.is_supported())
            .finish()
    }
}
