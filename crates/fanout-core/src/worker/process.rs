//! Process-backed worker capabilities.
//!
//! Each capability owns one `fanout-worker` process and an I/O thread that
//! writes `Execute` commands and blocks on the answers. Terminating an idle
//! capability hands its process back to the factory's pool; terminating a
//! busy one kills the process.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use serde_json::Value;

use crate::error::Result;
use crate::ipc::{WorkerCommand, WorkerHandle, WorkerKillHandle, WorkerPool, locate_worker_binary};
use crate::task::TaskError;

use super::{Completion, WorkerCapability, WorkerFactory, WorkerSpec};

/// Idle processes kept around when no size is given.
const DEFAULT_POOL_SIZE: usize = 4;

/// Runs each worker in its own `fanout-worker` process.
///
/// The callable is identified by name only, so every task a pipeline uses
/// must be registered in the worker binary.
pub struct ProcessWorkerFactory {
    pool: Arc<Mutex<WorkerPool>>,
}

impl ProcessWorkerFactory {
    /// Locate the worker binary and create a factory with an empty pool.
    pub fn new() -> Result<Self> {
        let path = locate_worker_binary(None)?;
        Ok(Self::with_path(path, DEFAULT_POOL_SIZE))
    }

    /// Create a factory for an explicit binary.
    pub fn with_path(worker_path: impl Into<PathBuf>, pool_size: usize) -> Self {
        Self {
            pool: Arc::new(Mutex::new(WorkerPool::new(worker_path.into(), pool_size))),
        }
    }

    /// Create a factory whose pool starts with `warm` running processes.
    pub fn with_warm_pool(worker_path: impl Into<PathBuf>, pool_size: usize, warm: usize) -> Result<Self> {
        let pool = WorkerPool::with_warm_workers(worker_path.into(), pool_size, warm)?;
        Ok(Self {
            pool: Arc::new(Mutex::new(pool)),
        })
    }

    /// Number of idle processes waiting in the pool.
    pub fn idle_workers(&self) -> usize {
        lock_pool(&self.pool).available_count()
    }

    pub fn worker_path(&self) -> PathBuf {
        lock_pool(&self.pool).worker_path().to_path_buf()
    }
}

fn lock_pool(pool: &Mutex<WorkerPool>) -> MutexGuard<'_, WorkerPool> {
    pool.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WorkerFactory for ProcessWorkerFactory {
    fn create(&self, spec: &WorkerSpec) -> Result<Option<Box<dyn WorkerCapability>>> {
        let handle = lock_pool(&self.pool).get()?;
        let worker = ProcessWorker::start(handle, CommandTemplate::new(spec)?, Arc::clone(&self.pool))?;
        Ok(Some(Box::new(worker)))
    }
}

/// Stage-wide part of every `Execute` command, serialized once.
#[derive(Clone)]
struct CommandTemplate {
    task: String,
    env_json: String,
    namespace: String,
    objects_json: String,
    helpers: Vec<String>,
    scripts: Vec<String>,
}

impl CommandTemplate {
    fn new(spec: &WorkerSpec) -> Result<Self> {
        Ok(Self {
            task: spec.callable.name().to_string(),
            env_json: serde_json::to_string(&spec.env)?,
            namespace: spec.namespace.clone(),
            objects_json: serde_json::to_string(&spec.requirements.objects_map())?,
            helpers: spec.requirements.task_names(),
            scripts: spec.requirements.scripts.clone(),
        })
    }

    fn execute(&self, payload: &Value) -> Result<WorkerCommand> {
        Ok(WorkerCommand::Execute {
            task: self.task.clone(),
            payload_json: serde_json::to_string(payload)?,
            env_json: self.env_json.clone(),
            namespace: self.namespace.clone(),
            objects_json: self.objects_json.clone(),
            helpers: self.helpers.clone(),
            scripts: self.scripts.clone(),
        })
    }
}

type Job = (WorkerCommand, Completion);

struct ProcessWorker {
    template: CommandTemplate,
    jobs: Option<Sender<Job>>,
    kill: WorkerKillHandle,
    busy: Arc<AtomicBool>,
}

impl ProcessWorker {
    fn start(handle: WorkerHandle, template: CommandTemplate, pool: Arc<Mutex<WorkerPool>>) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let kill = WorkerKillHandle::new(&handle);
        let busy = Arc::new(AtomicBool::new(false));

        let io_kill = kill.clone();
        let io_busy = Arc::clone(&busy);
        thread::Builder::new()
            .name(format!("fanout-ipc-{}", handle.pid()))
            .spawn(move || io_loop(handle, rx, io_busy, io_kill, pool))?;

        Ok(Self {
            template,
            jobs: Some(tx),
            kill,
            busy,
        })
    }
}

fn io_loop(
    mut handle: WorkerHandle,
    jobs: Receiver<Job>,
    busy: Arc<AtomicBool>,
    kill: WorkerKillHandle,
    pool: Arc<Mutex<WorkerPool>>,
) {
    while let Ok((cmd, completion)) = jobs.recv() {
        let result = handle
            .execute(&cmd)
            .unwrap_or_else(|e| Err(e.to_task_error()));
        busy.store(false, Ordering::SeqCst);
        completion.complete(result);
    }

    if kill.is_killed() {
        tracing::debug!("Dropping killed worker process {}", handle.pid());
        drop(handle);
    } else {
        lock_pool(&pool).put(handle);
    }
}

impl WorkerCapability for ProcessWorker {
    fn send(&mut self, payload: Value, completion: Completion) {
        let cmd = match self.template.execute(&payload) {
            Ok(cmd) => cmd,
            Err(e) => {
                completion.complete(Err(e.to_task_error()));
                return;
            }
        };

        let Some(jobs) = self.jobs.as_ref() else {
            completion.complete(Err(TaskError::new("terminated", "worker has been terminated")));
            return;
        };

        self.busy.store(true, Ordering::SeqCst);
        if let Err(mpsc::SendError((_, completion))) = jobs.send((cmd, completion)) {
            self.busy.store(false, Ordering::SeqCst);
            completion.complete(Err(TaskError::new("terminated", "worker I/O thread exited")));
        }
    }

    fn terminate(&mut self) {
        if self.jobs.take().is_none() {
            return;
        }
        if self.busy.load(Ordering::SeqCst) {
            tracing::debug!("Killing busy worker process");
            self.kill.kill();
        }
    }
}

impl Drop for ProcessWorker {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for ProcessWorkerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessWorkerFactory")
            .field("idle_workers", &self.idle_workers())
            .finish()
    }
}
