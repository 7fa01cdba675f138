//! Worker side of the fanout process transport.
//!
//! A worker process reads [`WorkerCommand`]s from stdin, runs the named task
//! from its [`TaskRegistry`] and writes a [`WorkerResponse`] for each one to
//! stdout. Stdout carries the protocol only; logs go to stderr.

pub mod builtins;

use std::io::{BufReader, BufWriter, Read, Write};

use anyhow::{Context as _, Result};
use fanout_core::ipc::{WorkerCommand, WorkerResponse, read_message, write_message};
use fanout_core::{Callable, Env, TaskContext, TaskError, TaskResult};
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};

/// Tasks a worker process can run, by name.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    tasks: FxHashMap<String, Callable>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callable` under its own name, replacing any previous entry.
    pub fn register(&mut self, callable: Callable) -> &mut Self {
        self.tasks.insert(callable.name().to_string(), callable);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Callable> {
        self.tasks.get(name)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run one `Execute` command.
    fn execute(&self, request: &Request) -> TaskResult {
        let task = request.task.as_str();
        let callable = self.get(task).ok_or_else(|| TaskError::unknown_task(task))?;

        let payload: Value = parse(&request.payload_json, "payload")?;
        let env: Env = parse(&request.env_json, "environment")?;
        let objects: Map<String, Value> = parse(&request.objects_json, "objects")?;
        let helpers = request
            .helpers
            .iter()
            .map(|name| {
                self.get(name)
                    .cloned()
                    .ok_or_else(|| TaskError::unknown_task(name))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let ctx = TaskContext::new(env, request.namespace.as_str())
            .with_objects(objects)
            .with_scripts(request.scripts.clone())
            .with_helpers(helpers);

        callable.invoke(&ctx, payload)
    }
}

/// Fields of an `Execute` command.
struct Request {
    task: String,
    payload_json: String,
    env_json: String,
    namespace: String,
    objects_json: String,
    helpers: Vec<String>,
    scripts: Vec<String>,
}

fn parse<T: serde::de::DeserializeOwned>(json: &str, what: &str) -> std::result::Result<T, TaskError> {
    serde_json::from_str(json)
        .map_err(|e| TaskError::bad_input(format!("invalid {} JSON: {}", what, e)))
}

fn respond(result: TaskResult) -> WorkerResponse {
    match result {
        Ok(value) => match serde_json::to_string(&value) {
            Ok(payload_json) => WorkerResponse::Output { payload_json },
            Err(e) => WorkerResponse::Error {
                code: "serialization".to_string(),
                message: e.to_string(),
            },
        },
        Err(error) if error.code == "panic" => WorkerResponse::Panic {
            message: error.message,
        },
        Err(error) => WorkerResponse::Error {
            code: error.code,
            message: error.message,
        },
    }
}

/// Answer commands from `reader` on `writer` until shutdown or end of input.
pub fn serve<R: Read, W: Write>(registry: &TaskRegistry, reader: R, writer: W) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    loop {
        let command: WorkerCommand = match read_message(&mut reader) {
            Ok(command) => command,
            Err(e) => {
                // The parent closed the pipe or went away.
                tracing::debug!("Command stream ended: {}", e);
                return Ok(());
            }
        };

        let response = match command {
            WorkerCommand::Ping => WorkerResponse::Pong,
            WorkerCommand::Shutdown => {
                write_message(&mut writer, &WorkerResponse::ShuttingDown)
                    .context("Failed to acknowledge shutdown")?;
                tracing::debug!("Worker shutting down");
                return Ok(());
            }
            WorkerCommand::Execute {
                task,
                payload_json,
                env_json,
                namespace,
                objects_json,
                helpers,
                scripts,
            } => {
                tracing::trace!("Executing task {}", task);
                respond(registry.execute(&Request {
                    task,
                    payload_json,
                    env_json,
                    namespace,
                    objects_json,
                    helpers,
                    scripts,
                }))
            }
        };

        write_message(&mut writer, &response).context("Failed to write response")?;
    }
}

/// Render a worker failure for stderr, with a recovery hint when the root
/// cause is a fanout error.
pub fn render_error(err: &anyhow::Error) -> String {
    match err.downcast_ref::<fanout_core::Error>() {
        Some(core) => format!("{}: {}", err, core.with_hint()),
        None => format!("{:#}", err),
    }
}

/// Serve the parent process over stdin and stdout.
pub fn run(registry: &TaskRegistry) -> Result<()> {
    serve(registry, std::io::stdin().lock(), std::io::stdout().lock())
}
