//! Starting Stage-2 workers.
//!
//! A [`WorkerSpawner`] hands the supervisor a byte pipe in each direction plus
//! a [`WorkerHandle`] to wait on or kill. [`ProcessSpawner`] re-executes the
//! server binary with the hidden `stage2-worker` subcommand; [`TaskSpawner`]
//! runs the same loop in a Tokio task over in-memory pipes.

use crate::server::isolation::child::run_worker;
use core::time::Duration;
use nemo_core::{Error, Result};
use std::{path::PathBuf, process::Stdio};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    process::{Child, Command},
    task::JoinHandle,
};

const TASK_PIPE_CAPACITY: usize = 64 * 1024;

pub type WorkerStdin = Box<dyn AsyncWrite + Send + Unpin>;
pub type WorkerStdout = Box<dyn AsyncRead + Send + Unpin>;

/// A freshly started Stage-2 worker.
pub struct SpawnedWorker {
    pub stdin: WorkerStdin,
    pub stdout: WorkerStdout,
    pub handle: WorkerHandle,
}

pub enum WorkerHandle {
    Process(Child),
    Task(JoinHandle<Result<()>>),
}

impl WorkerHandle {
    /// Waits for the worker to exit and describes how it ended.
    ///
    /// Cancel-safe. Must not be awaited again after it has returned.
    pub async fn wait(&mut self) -> String {
        match self {
            Self::Process(child) => match child.wait().await {
                Ok(status) => status.to_string(),
                Err(e) => format!("wait failed: {e}"),
            },
            Self::Task(handle) => match handle.await {
                Ok(Ok(())) => "exited".to_string(),
                Ok(Err(e)) => format!("failed: {e}"),
                Err(e) => format!("panicked or aborted: {e}"),
            },
        }
    }

    /// Forcibly terminates the worker. A worker that already exited is left
    /// alone.
    pub async fn kill(&mut self) {
        match self {
            Self::Process(child) => {
                if let Some(pid) = child.id() {
                    tracing::debug!("Killing Stage-2 process (pid {pid})");
                }
                if let Err(e) = child.kill().await {
                    tracing::debug!("kill on exited worker process: {e}");
                }
            }
            Self::Task(handle) => handle.abort(),
        }
    }
}

pub trait WorkerSpawner: Send + Sync {
    /// Starts one worker that tags its results with `processor_id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerSpawn`] if the worker cannot be started.
    fn spawn(&self, processor_id: usize) -> Result<SpawnedWorker>;
}

/// Spawns Stage-2 workers as child processes of `program`.
pub struct ProcessSpawner {
    program: PathBuf,
    transform_delay: Duration,
}

impl ProcessSpawner {
    pub const fn new(program: PathBuf, transform_delay: Duration) -> Self {
        Self {
            program,
            transform_delay,
        }
    }

    /// Spawns workers from the currently running executable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WorkerSpawn`] if the executable path is unavailable.
    pub fn current_exe(transform_delay: Duration) -> Result<Self> {
        let program = std::env::current_exe().map_err(|e| Error::WorkerSpawn {
            context: format!("cannot locate the server executable: {e}"),
        })?;
        Ok(Self::new(program, transform_delay))
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, processor_id: usize) -> Result<SpawnedWorker> {
        let mut child = Command::new(&self.program)
            .arg("stage2-worker")
            .arg("--processor-id")
            .arg(processor_id.to_string())
            .arg("--transform-delay-ms")
            .arg(self.transform_delay.as_millis().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::WorkerSpawn {
                context: format!("{}: {e}", self.program.display()),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| Error::WorkerSpawn {
            context: "stdin not captured".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::WorkerSpawn {
            context: "stdout not captured".to_string(),
        })?;

        tracing::debug!(
            "Spawned Stage-2 process {processor_id} (pid {})",
            child.id().unwrap_or_default()
        );

        Ok(SpawnedWorker {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            handle: WorkerHandle::Process(child),
        })
    }
}

/// Runs Stage-2 workers as Tokio tasks in the server process.
///
/// The worker still only talks through a byte pipe, but it shares the
/// server's address space and a panic or hang is not contained.
pub struct TaskSpawner {
    transform_delay: Duration,
}

impl TaskSpawner {
    pub const fn new(transform_delay: Duration) -> Self {
        Self { transform_delay }
    }
}

impl WorkerSpawner for TaskSpawner {
    fn spawn(&self, processor_id: usize) -> Result<SpawnedWorker> {
        let (server_side, worker_side) = tokio::io::duplex(TASK_PIPE_CAPACITY);
        let (server_read, server_write) = tokio::io::split(server_side);
        let (worker_read, worker_write) = tokio::io::split(worker_side);

        let handle = tokio::spawn(run_worker(
            processor_id,
            self.transform_delay,
            worker_read,
            worker_write,
        ));

        Ok(SpawnedWorker {
            stdin: Box::new(server_write),
            stdout: Box::new(server_read),
            handle: WorkerHandle::Task(handle),
        })
    }
}
