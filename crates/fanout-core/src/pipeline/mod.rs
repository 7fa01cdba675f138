//! Pipelines: chains of stages over single-assignment operations.
//!
//! Every transformation (`spawn`, `map`, `reduce`, `then`) returns a new
//! [`Pipeline`] immediately. Its work starts on the orchestrator once the
//! upstream operation settles.
//!
//! ```text
//! Pipeline (root, resolved with the input)
//!     │
//!     ├── map(task)      ── up to max_workers workers, results in input order
//!     │       │
//!     │       └── reduce(combine) ── pairwise tree over a work queue
//!     │               │
//!     │               └── finally(f) ──► Outcome (await or wait())
//!     │
//!     └── spawn(task)    ── whole value on one worker, optional timeout
//! ```
//!
//! # Module Structure
//!
//! - `lane` - where one unit of a stage runs (worker or synchronous fallback)
//! - `spawn` - single-unit stage with timeout
//! - `map` - bounded fan-out preserving input order
//! - `reduce` - pairwise tree reduction

mod lane;
mod map;
mod outcome;
mod reduce;
mod spawn;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::config::{Env, Options};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::operation::Operation;
use crate::task::{Callable, Requirement, Requirements, TaskError, panic_message};
use crate::worker::WorkerSpec;

use lane::StageRunner;

pub use outcome::Outcome;

/// One link of a pipeline.
///
/// Cloning a pipeline clones handles; both clones share the same
/// downstream operation.
#[derive(Clone)]
pub struct Pipeline {
    options: Arc<Options>,
    context: Context,
    operation: Operation<Value>,
    requirements: Arc<Requirements>,
}

impl Pipeline {
    /// Build a pipeline over an initial value or an upstream operation.
    ///
    /// The upstream wins when both are given. Neither is a
    /// [`Error::Construction`].
    pub fn new(
        options: Options,
        context: Context,
        data: Option<Value>,
        upstream: Option<Operation<Value>>,
    ) -> Result<Self> {
        options.validate()?;

        let operation = match (upstream, data) {
            (Some(operation), _) => operation,
            (None, Some(data)) => Operation::resolved(data),
            (None, None) => return Err(Error::Construction),
        };

        Ok(Self {
            options: Arc::new(options),
            context,
            operation,
            requirements: Arc::default(),
        })
    }

    /// Build a pipeline whose root already holds `data`.
    pub fn from_value(options: Options, context: Context, data: Value) -> Result<Self> {
        Self::new(options, context, Some(data), None)
    }

    /// Build a pipeline from any serializable value.
    pub fn from_serialize<T: Serialize>(options: Options, context: Context, data: &T) -> Result<Self> {
        Self::from_value(options, context, serde_json::to_value(data)?)
    }

    /// Build a pipeline that starts when `upstream` settles.
    pub fn from_operation(options: Options, context: Context, upstream: Operation<Value>) -> Result<Self> {
        Self::new(options, context, None, Some(upstream))
    }

    /// Start a new root over an existing stage's result, keeping its options,
    /// context and requirements.
    pub fn from_stage(stage: &Pipeline) -> Self {
        stage.derive(stage.operation.clone())
    }

    /// Register a script, helper task or object every worker of this
    /// pipeline (and the stages derived from it) must have available.
    pub fn require(mut self, requirement: impl Into<Requirement>) -> Self {
        Arc::make_mut(&mut self.requirements).push(requirement.into());
        self
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn requirements(&self) -> &Requirements {
        &self.requirements
    }

    /// The operation this stage resolves.
    pub fn operation(&self) -> &Operation<Value> {
        &self.operation
    }

    /// Apply `f` to the value on the orchestrator.
    ///
    /// An `Err` from `f`, or a panic in it, rejects the next stage. Upstream
    /// failures pass through unchanged.
    pub fn then<F>(&self, f: F) -> Pipeline
    where
        F: FnOnce(Value) -> Result<Value> + Send + 'static,
    {
        let downstream = Operation::new();
        let out = downstream.clone();

        self.on_upstream(move |result| {
            out.settle(result.and_then(|value| guarded(f, value)));
        });

        self.derive(downstream)
    }

    /// Like [`then`](Self::then), but a failure (from `f` or from upstream)
    /// is handed to `recover`, whose output resolves the next stage.
    pub fn then_or_recover<F, R>(&self, f: F, recover: R) -> Pipeline
    where
        F: FnOnce(Value) -> Result<Value> + Send + 'static,
        R: FnOnce(Error) -> Value + Send + 'static,
    {
        let downstream = Operation::new();
        let out = downstream.clone();

        self.on_upstream(move |result| {
            match result.and_then(|value| guarded(f, value)) {
                Ok(value) => out.resolve(value),
                Err(error) => {
                    tracing::debug!("Recovering from: {}", error);
                    out.settle(guarded(|e| Ok(recover(e)), error))
                }
            };
        });

        self.derive(downstream)
    }

    /// Leave the pipeline: run `f` on the final value and deliver the result
    /// through an [`Outcome`]. A failed pipeline fails the outcome with the
    /// original error.
    pub fn finally<O, F>(&self, f: F) -> Outcome<O>
    where
        O: Send + 'static,
        F: FnOnce(Value) -> O + Send + 'static,
    {
        self.bridge(move |value| guarded(|v| Ok(f(v)), value))
    }

    /// Leave the pipeline with the final value deserialized into `T`.
    pub fn collect<T>(&self) -> Outcome<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.bridge(|value| serde_json::from_value(value).map_err(Error::from))
    }

    fn bridge<O, F>(&self, f: F) -> Outcome<O>
    where
        O: Send + 'static,
        F: FnOnce(Value) -> Result<O> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.on_upstream(move |result| {
            let _ = tx.send(result.and_then(f));
        });
        Outcome::new(rx)
    }

    /// Run `f` on the orchestrator once this stage's operation settles.
    fn on_upstream(&self, f: impl FnOnce(Result<Value>) + Send + 'static) {
        let orchestrator = self.context.orchestrator().clone();
        self.operation
            .on_settled(move |result| orchestrator.post(move || f(result)));
    }

    /// Next link of the chain, resolved by `operation`.
    fn derive(&self, operation: Operation<Value>) -> Pipeline {
        Pipeline {
            options: Arc::clone(&self.options),
            context: self.context.clone(),
            operation,
            requirements: Arc::clone(&self.requirements),
        }
    }

    /// Everything a scheduler needs to run `callable` for one stage.
    fn runner(&self, callable: Callable, env: Option<Env>) -> StageRunner {
        let spec = WorkerSpec {
            callable,
            env: self.options.merged_env(env),
            namespace: self.options.env_namespace.clone(),
            requirements: Arc::clone(&self.requirements),
        };
        StageRunner::new(
            self.context.clone(),
            spec,
            self.options.max_workers,
            self.options.synchronous,
        )
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("options", &self.options)
            .field("operation", &self.operation)
            .finish()
    }
}

/// Run in-process user code, turning a panic into a failure.
fn guarded<I, O>(f: impl FnOnce(I) -> Result<O>, input: I) -> Result<O> {
    catch_unwind(AssertUnwindSafe(|| f(input))).unwrap_or_else(|payload| {
        Err(Error::WorkerFailure(TaskError::panic(panic_message(
            payload.as_ref(),
        ))))
    })
}

/// JSON type name used in type mismatch errors.
fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Take the elements of an array value or fail with a type mismatch.
fn expect_array(operation: &'static str, value: Value) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        other => Err(Error::TypeMismatch {
            operation,
            found: kind_of(&other),
        }),
    }
}
