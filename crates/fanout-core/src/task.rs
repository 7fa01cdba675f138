//! Callable descriptors and the context a task runs in.
//!
//! A [`Callable`] pairs a task name with an in-process closure. Thread
//! workers and the synchronous fallback invoke the closure directly; process
//! workers only ship the name and look the task up in the registry compiled
//! into the worker binary.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::Env;

/// Opaque error value reported by a worker.
///
/// Native panics and error types do not survive an isolation boundary, so
/// workers reduce every failure to a code and a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Machine-readable error code (e.g. `"panic"`, `"unknown_task"`).
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl TaskError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Error for input that does not have the shape a task expects.
    pub fn bad_input(message: impl Into<String>) -> Self {
        Self::new("bad_input", message)
    }

    /// Error for a task name that is not registered.
    pub fn unknown_task(name: &str) -> Self {
        Self::new("unknown_task", format!("no task registered under '{}'", name))
    }

    /// Error for a task that panicked.
    pub fn panic(message: impl Into<String>) -> Self {
        Self::new("panic", message)
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for TaskError {}

/// Result of running a task.
pub type TaskResult = std::result::Result<Value, TaskError>;

/// Signature of a task body.
pub type TaskFn = dyn Fn(&TaskContext, Value) -> TaskResult + Send + Sync;

/// A named unit of work that can run on any worker transport.
#[derive(Clone)]
pub struct Callable {
    name: String,
    func: Arc<TaskFn>,
}

impl Callable {
    /// Create a named callable.
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(&TaskContext, Value) -> TaskResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Create a callable without a registry name.
    ///
    /// Anonymous callables work on thread workers and under the synchronous
    /// fallback. Process workers reject them as unknown tasks.
    pub fn anonymous(
        func: impl Fn(&TaskContext, Value) -> TaskResult + Send + Sync + 'static,
    ) -> Self {
        Self::new(format!("anonymous-{}", uuid::Uuid::new_v4()), func)
    }

    /// Create a combiner for `reduce`, which receives its operands as a
    /// two-element array.
    pub fn binary(
        name: impl Into<String>,
        func: impl Fn(&TaskContext, Value, Value) -> TaskResult + Send + Sync + 'static,
    ) -> Self {
        Self::new(name, move |ctx, input| {
            let (a, b) = split_pair(input)?;
            func(ctx, a, b)
        })
    }

    /// Registry name of this callable.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the task, converting a panic into a [`TaskError`].
    pub fn invoke(&self, ctx: &TaskContext, input: Value) -> TaskResult {
        match catch_unwind(AssertUnwindSafe(|| (self.func)(ctx, input))) {
            Ok(result) => result,
            Err(payload) => Err(TaskError::panic(panic_message(payload.as_ref()))),
        }
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callable").field("name", &self.name).finish()
    }
}

fn split_pair(input: Value) -> std::result::Result<(Value, Value), TaskError> {
    match input {
        Value::Array(items) if items.len() == 2 => {
            let mut items = items.into_iter();
            match (items.next(), items.next()) {
                (Some(a), Some(b)) => Ok((a, b)),
                _ => Err(TaskError::bad_input("expected a pair")),
            }
        }
        other => Err(TaskError::bad_input(format!(
            "expected a two-element array, got {}",
            other
        ))),
    }
}

/// Extract a readable message from a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Auxiliary resource a worker must have available.
#[derive(Debug, Clone)]
pub enum Requirement {
    /// A script path or URL, handed to tasks verbatim.
    Script(String),
    /// A helper task that other tasks may call by name.
    Task(Callable),
    /// A named JSON object exposed alongside the environment.
    Object { name: String, value: Value },
}

impl Requirement {
    pub fn script(path: impl Into<String>) -> Self {
        Self::Script(path.into())
    }

    pub fn object(name: impl Into<String>, value: Value) -> Self {
        Self::Object {
            name: name.into(),
            value,
        }
    }
}

impl From<Callable> for Requirement {
    fn from(callable: Callable) -> Self {
        Self::Task(callable)
    }
}

/// Everything registered with `Pipeline::require`.
#[derive(Debug, Clone, Default)]
pub struct Requirements {
    pub scripts: Vec<String>,
    pub tasks: Vec<Callable>,
    pub objects: Vec<(String, Value)>,
}

impl Requirements {
    pub fn push(&mut self, requirement: Requirement) {
        match requirement {
            Requirement::Script(path) => self.scripts.push(path),
            Requirement::Task(callable) => self.tasks.push(callable),
            Requirement::Object { name, value } => self.objects.push((name, value)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty() && self.tasks.is_empty() && self.objects.is_empty()
    }

    /// Names of the helper tasks, in registration order.
    pub fn task_names(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.name().to_string()).collect()
    }

    /// Objects as a JSON map. Later registrations win on name collisions.
    pub fn objects_map(&self) -> Map<String, Value> {
        self.objects.iter().cloned().collect()
    }
}

/// What a task sees while it runs.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    env: Env,
    namespace: String,
    objects: Map<String, Value>,
    scripts: Vec<String>,
    helpers: FxHashMap<String, Callable>,
}

impl TaskContext {
    pub fn new(env: Env, namespace: impl Into<String>) -> Self {
        Self {
            env,
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Build the context for a stage from its requirements.
    pub fn from_requirements(env: Env, namespace: &str, requirements: &Requirements) -> Self {
        Self::new(env, namespace)
            .with_objects(requirements.objects_map())
            .with_scripts(requirements.scripts.clone())
            .with_helpers(requirements.tasks.iter().cloned())
    }

    pub fn with_objects(mut self, objects: Map<String, Value>) -> Self {
        self.objects = objects;
        self
    }

    pub fn with_scripts(mut self, scripts: Vec<String>) -> Self {
        self.scripts = scripts;
        self
    }

    pub fn with_helpers(mut self, helpers: impl IntoIterator<Item = Callable>) -> Self {
        self.helpers
            .extend(helpers.into_iter().map(|c| (c.name().to_string(), c)));
        self
    }

    /// The merged stage environment.
    pub fn env(&self) -> &Env {
        &self.env
    }

    /// Look up one environment entry.
    pub fn env_value(&self, key: &str) -> Option<&Value> {
        self.env.get(key)
    }

    /// Name under which the environment is published in [`globals`](Self::globals).
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Look up a required object by name.
    pub fn object(&self, name: &str) -> Option<&Value> {
        self.objects.get(name)
    }

    pub fn scripts(&self) -> &[String] {
        &self.scripts
    }

    /// Global scope of the task: the environment under its namespace plus
    /// every required object under its own name.
    pub fn globals(&self) -> Map<String, Value> {
        let mut globals = self.objects.clone();
        globals.insert(self.namespace.clone(), Value::Object(self.env.clone()));
        globals
    }

    /// Call a required helper task.
    pub fn call(&self, name: &str, input: Value) -> TaskResult {
        let helper = self
            .helpers
            .get(name)
            .ok_or_else(|| TaskError::unknown_task(name))?;
        helper.invoke(self, input)
    }
}
