//! Error types for fanout-core.

use std::time::Duration;

use thiserror::Error;

use crate::task::TaskError;

/// Result type for fanout-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in fanout-core.
///
/// Errors are `Clone` because a single rejected operation may be observed by
/// several downstream stages.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// A pipeline was built without an initial value or an upstream stage.
    #[error("one of 'data' or 'operation' is required")]
    Construction,

    /// `map` or `reduce` was applied to something that is not an array.
    #[error("data should be of type array to apply a {operation} function, found {found}")]
    TypeMismatch {
        operation: &'static str,
        found: &'static str,
    },

    /// `reduce` was applied to an empty array.
    #[error("cannot reduce an empty array")]
    EmptySequence,

    /// No worker transport and the synchronous fallback is disabled.
    #[error("workers do not exist and synchronous operation not allowed")]
    CapabilityUnavailable,

    /// A worker reported a failure.
    #[error("worker failed: {0}")]
    WorkerFailure(TaskError),

    /// A spawn stage exceeded its deadline.
    #[error("operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// IPC communication error with a worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(String),

    /// The orchestrator shut down before the result was delivered.
    #[error("orchestrator closed before the operation settled")]
    Closed,

    /// Invalid pipeline options.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<TaskError> for Error {
    fn from(e: TaskError) -> Self {
        Self::WorkerFailure(e)
    }
}

impl Error {
    /// Render the error together with a recovery hint when one is known.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Self::CapabilityUnavailable => Some(
                "enable the synchronous fallback with Options::with_synchronous(true) \
                 or use a context with a worker factory",
            ),
            Self::Ipc(msg) if msg.contains("fanout-worker") => Some(
                "build the worker with `cargo build -p fanout-worker` or set FANOUT_WORKER_PATH",
            ),
            Self::Timeout(_) => Some("raise the `timeout` entry of the stage environment"),
            Self::TypeMismatch { .. } => Some("map and reduce need an array upstream value"),
            _ => None,
        };

        match hint {
            Some(hint) => format!("{self}\n  hint: {hint}"),
            None => self.to_string(),
        }
    }

    /// Convert this error into the opaque form that crosses worker boundaries.
    pub fn to_task_error(&self) -> TaskError {
        match self {
            Self::WorkerFailure(inner) => inner.clone(),
            Self::Timeout(_) => TaskError::new("timeout", self.to_string()),
            Self::TypeMismatch { .. } => TaskError::new("type_mismatch", self.to_string()),
            other => TaskError::new("error", other.to_string()),
        }
    }
}
