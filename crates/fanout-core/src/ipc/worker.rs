//! Worker process management.
//!
//! Provides `WorkerHandle` for spawning and communicating with isolated
//! worker processes, and `WorkerPool` for efficient worker reuse.

use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::task::{TaskError, TaskResult};

use super::protocol::{WorkerCommand, WorkerResponse, read_message, write_message};

const WORKER_BINARY: &str = if cfg!(windows) {
    "fanout-worker.exe"
} else {
    "fanout-worker"
};

/// Find the fanout-worker binary.
///
/// Looks in the following order:
/// 1. `explicit`, when given
/// 2. `FANOUT_WORKER_PATH` environment variable
/// 3. Same directory as the current executable (and its parent, which
///    covers test binaries under `target/<profile>/deps`)
/// 4. System PATH
/// 5. `target/debug` or `target/release` of the workspace during development
pub fn locate_worker_binary(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::Ipc(format!(
            "fanout-worker binary not found at '{}'",
            path.display()
        )));
    }

    if let Ok(path) = std::env::var("FANOUT_WORKER_PATH") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        for dir in [Some(exe_dir), exe_dir.parent()].into_iter().flatten() {
            let worker_path = dir.join(WORKER_BINARY);
            if worker_path.exists() {
                return Ok(worker_path);
            }
        }
    }

    if let Ok(path) = which::which(WORKER_BINARY) {
        return Ok(path);
    }

    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in &["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(WORKER_BINARY);
            if path.exists() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::Ipc(
        "Could not find fanout-worker binary. Set FANOUT_WORKER_PATH or ensure it's in PATH."
            .to_string(),
    ))
}

/// Handle to a worker process.
///
/// Provides methods to send commands, receive responses, and kill the process.
pub struct WorkerHandle {
    /// The child process.
    child: Child,
    /// Buffered stdin writer.
    stdin: BufWriter<std::process::ChildStdin>,
    /// Buffered stdout reader.
    stdout: BufReader<std::process::ChildStdout>,
    /// Whether the worker has been killed.
    killed: bool,
}

impl WorkerHandle {
    /// Spawn a worker process from `worker_path` and check it answers a ping.
    pub fn spawn(worker_path: &Path) -> Result<Self> {
        let mut child = Command::new(worker_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Let worker stderr pass through for debugging
            .spawn()
            .map_err(|e| {
                Error::Ipc(format!(
                    "Failed to spawn worker process '{}': {}",
                    worker_path.display(),
                    e
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Ipc("Failed to get worker stdout".to_string()))?;

        let mut handle = Self {
            child,
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
            killed: false,
        };

        handle.send_command(&WorkerCommand::Ping)?;
        match handle.recv_response()? {
            WorkerResponse::Pong => {
                tracing::debug!("Worker process {} ready", handle.pid());
                Ok(handle)
            }
            other => Err(Error::Ipc(format!(
                "Unexpected response from worker: {:?}",
                other
            ))),
        }
    }

    /// Send a command to the worker.
    pub fn send_command(&mut self, cmd: &WorkerCommand) -> Result<()> {
        if self.killed {
            return Err(Error::Ipc("Worker has been killed".to_string()));
        }
        write_message(&mut self.stdin, cmd)
    }

    /// Receive a response from the worker.
    pub fn recv_response(&mut self) -> Result<WorkerResponse> {
        if self.killed {
            return Err(Error::Ipc("Worker has been killed".to_string()));
        }
        read_message(&mut self.stdout)
    }

    /// Run one `Execute` command.
    ///
    /// The outer `Result` reports transport failures; the inner one is the
    /// task's own outcome.
    pub fn execute(&mut self, cmd: &WorkerCommand) -> Result<TaskResult> {
        self.send_command(cmd)?;

        match self.recv_response()? {
            WorkerResponse::Output { payload_json } => {
                let value: Value = serde_json::from_str(&payload_json)?;
                Ok(Ok(value))
            }
            WorkerResponse::Error { code, message } => Ok(Err(TaskError::new(code, message))),
            WorkerResponse::Panic { message } => Ok(Err(TaskError::panic(message))),
            other => Err(Error::Ipc(format!(
                "Unexpected response when executing: {:?}",
                other
            ))),
        }
    }

    /// Kill the worker process immediately.
    pub fn kill(&mut self) -> Result<()> {
        if self.killed {
            return Ok(());
        }

        let _ = self.send_command(&WorkerCommand::Shutdown);
        self.killed = true;

        // Give it a moment to shutdown gracefully
        std::thread::sleep(Duration::from_millis(10));

        // Force kill if still running
        if let Err(e) = self.child.kill() {
            // Process already exited, which is fine
            if e.kind() != std::io::ErrorKind::InvalidInput {
                tracing::warn!("Failed to kill worker: {}", e);
            }
        }

        // Wait to reap zombie
        let _ = self.child.wait();

        Ok(())
    }

    /// Check if the worker process is still running.
    pub fn is_alive(&mut self) -> bool {
        if self.killed {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Get the process ID of the worker.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Graceful shutdown - ask worker to exit cleanly.
    pub fn shutdown(mut self) -> Result<()> {
        if self.killed {
            return Ok(());
        }

        self.send_command(&WorkerCommand::Shutdown)?;
        let ack = self.recv_response();
        self.killed = true;

        match self.child.wait() {
            Ok(status) if status.success() => match ack {
                Ok(WorkerResponse::ShuttingDown) => Ok(()),
                Ok(other) => Err(Error::Ipc(format!(
                    "Unexpected response to shutdown: {:?}",
                    other
                ))),
                Err(e) => Err(e),
            },
            Ok(status) => Err(Error::Ipc(format!("Worker exited with status: {}", status))),
            Err(e) => Err(Error::Ipc(format!("Failed to wait for worker: {}", e))),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        let _ = self.kill();
    }
}

/// Pool of reusable worker processes.
///
/// Maintains a set of warm workers to avoid spawn overhead.
pub struct WorkerPool {
    /// Binary every worker is spawned from.
    worker_path: PathBuf,
    /// Available workers ready for use.
    available: Vec<WorkerHandle>,
    /// Maximum pool size.
    max_size: usize,
}

impl WorkerPool {
    /// Create an empty pool.
    pub fn new(worker_path: PathBuf, max_size: usize) -> Self {
        Self {
            worker_path,
            available: Vec::with_capacity(max_size),
            max_size,
        }
    }

    /// Create a pool and pre-warm it with `warm_count` workers.
    pub fn with_warm_workers(worker_path: PathBuf, max_size: usize, warm_count: usize) -> Result<Self> {
        let mut pool = Self::new(worker_path, max_size);
        for _ in 0..warm_count.min(max_size) {
            let worker = WorkerHandle::spawn(&pool.worker_path)?;
            pool.available.push(worker);
        }
        Ok(pool)
    }

    /// Get a worker from the pool, spawning if necessary.
    pub fn get(&mut self) -> Result<WorkerHandle> {
        while let Some(mut worker) = self.available.pop() {
            if worker.is_alive() {
                return Ok(worker);
            }
        }

        WorkerHandle::spawn(&self.worker_path)
    }

    /// Return a worker to the pool for reuse.
    ///
    /// If the pool is full, the worker is dropped (killed).
    pub fn put(&mut self, mut worker: WorkerHandle) {
        if !worker.is_alive() {
            return;
        }

        if self.available.len() < self.max_size {
            self.available.push(worker);
        }
    }

    /// Kill all workers in the pool.
    pub fn shutdown(&mut self) {
        for mut worker in self.available.drain(..) {
            let _ = worker.kill();
        }
    }

    /// Get the number of available workers.
    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    pub fn worker_path(&self) -> &Path {
        &self.worker_path
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Thread-safe handle for killing a worker from another thread.
///
/// The thread talking to the worker blocks on its stdout, so the kill has to
/// go through the pid rather than the `WorkerHandle`.
#[derive(Clone)]
pub struct WorkerKillHandle {
    /// Process ID of the worker.
    pid: u32,
    /// Whether the kill has been requested.
    killed: Arc<AtomicBool>,
}

impl WorkerKillHandle {
    /// Create a kill handle for a worker.
    pub fn new(worker: &WorkerHandle) -> Self {
        Self {
            pid: worker.pid(),
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Kill the worker process.
    pub fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }

        #[cfg(unix)]
        {
            // SAFETY: sending a signal to a pid has no memory-safety
            // requirements.
            unsafe {
                libc::kill(self.pid as i32, libc::SIGKILL);
            }
        }

        #[cfg(not(unix))]
        tracing::warn!(
            "Cannot kill worker {} from another thread on this platform",
            self.pid
        );
    }

    /// Check if kill has been requested.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }
}
