//! Core engine for fanout pipelines.
//!
//! This crate provides:
//! - Single-assignment operations with callback chaining
//! - Pipelines that chain `spawn`, `map`, `reduce` and `then` stages
//! - Bounded worker scheduling with worker reuse and spawn timeouts
//! - Thread and process worker transports, plus a synchronous fallback
//! - Length-prefixed rkyv IPC for the `fanout-worker` process

pub mod config;
pub mod context;
pub mod error;
pub mod ipc;
pub mod operation;
pub mod orchestrator;
pub mod pipeline;
pub mod task;
pub mod worker;

pub use config::{Env, Options};
pub use context::Context;
pub use error::{Error, Result};
pub use operation::{Operation, OperationState};
pub use orchestrator::{Orchestrator, TimerHandle};
pub use pipeline::{Outcome, Pipeline};
pub use task::{Callable, Requirement, Requirements, TaskContext, TaskError, TaskResult};
pub use worker::{
    Completion, ProcessWorkerFactory, ThreadWorkerFactory, Unavailable, WorkerCapability,
    WorkerFactory, WorkerSpec,
};
