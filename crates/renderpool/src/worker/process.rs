//! Process-backed worker
//!
//! Launches an external program and talks to it over stdin/stdout using the
//! line protocol in [`super::protocol`]. The child's stderr is forwarded to
//! the log.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, instrument, trace, warn};

use super::protocol::{TaskRequest, WorkerMessage};
use super::{SlotId, Worker};
use crate::config::{duration_millis, PoolConfig};
use crate::error::WorkerError;
use crate::pool::WorkerPool;

/// Launch parameters for a worker process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessWorkerConfig {
    /// Program to launch (name resolved through PATH, or a path)
    pub program: PathBuf,

    /// Arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the process
    #[serde(default)]
    pub current_dir: Option<PathBuf>,

    /// How long to wait for the ready handshake
    #[serde(
        rename = "startup_timeout_ms",
        with = "duration_millis",
        default = "default_startup_timeout"
    )]
    pub startup_timeout: Duration,
}

fn default_startup_timeout() -> Duration {
    Duration::from_secs(10)
}

impl ProcessWorkerConfig {
    /// Create a configuration launching `program`
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            env: HashMap::new(),
            current_dir: None,
            startup_timeout: default_startup_timeout(),
        }
    }

    /// Append an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the process
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory
    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Set the handshake timeout
    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

struct WorkerIo {
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// Worker backed by one external process
///
/// Tasks and results are JSON values. The child process is killed when the
/// worker is killed, recycled or dropped.
pub struct ProcessWorker {
    slot: SlotId,
    config: ProcessWorkerConfig,
    child: Mutex<Option<Child>>,
    io: tokio::sync::Mutex<Option<WorkerIo>>,
    next_id: AtomicU64,
}

impl ProcessWorker {
    /// Create a worker for `slot`; nothing is launched until [`Worker::start`]
    pub fn new(slot: SlotId, config: ProcessWorkerConfig) -> Self {
        Self {
            slot,
            config,
            child: Mutex::new(None),
            io: tokio::sync::Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Slot this worker was created for
    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// OS process id of the running child, if any
    pub fn pid(&self) -> Option<u32> {
        self.child.lock().as_ref().and_then(Child::id)
    }

    /// Spawn the process and wait for its handshake
    async fn launch(&self) -> Result<(Child, WorkerIo), WorkerError> {
        let mut child = self.config.command().spawn().map_err(WorkerError::Spawn)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.start_kill();
            return Err(WorkerError::Protocol("worker stdio is not piped".into()));
        };
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(self.slot, stderr);
        }

        let mut stdout = BufReader::new(stdout).lines();
        let timeout = self.config.startup_timeout;

        let handshake = match tokio::time::timeout(timeout, stdout.next_line()).await {
            Err(_) => Err(WorkerError::StartupTimeout(timeout)),
            Ok(Err(err)) => Err(WorkerError::Io(err)),
            Ok(Ok(None)) => Err(WorkerError::Exited),
            Ok(Ok(Some(line))) => match serde_json::from_str::<WorkerMessage>(&line) {
                Ok(WorkerMessage::Ready) => Ok(()),
                _ => Err(WorkerError::Protocol(format!(
                    "expected ready handshake, got {line:?}"
                ))),
            },
        };

        if let Err(err) = handshake {
            let _ = child.start_kill();
            return Err(err);
        }

        Ok((child, WorkerIo { stdin, stdout }))
    }

    /// Kill the current child, if any, without waiting for it
    fn terminate(&self) {
        if let Some(mut child) = self.child.lock().take() {
            if let Err(err) = child.start_kill() {
                debug!(slot = %self.slot, error = %err, "Worker process already gone");
            }
        }
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    type Task = serde_json::Value;
    type Output = serde_json::Value;

    #[instrument(skip(self), fields(slot = %self.slot, program = %self.config.program.display()))]
    async fn start(&self) -> Result<(), WorkerError> {
        let mut io = self.io.lock().await;
        let (child, worker_io) = self.launch().await?;
        debug!(pid = ?child.id(), "Worker process ready");
        *self.child.lock() = Some(child);
        *io = Some(worker_io);
        Ok(())
    }

    async fn execute(&self, task: serde_json::Value) -> Result<serde_json::Value, WorkerError> {
        let mut guard = self.io.lock().await;
        let io = guard.as_mut().ok_or(WorkerError::NotRunning)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = serde_json::to_vec(&TaskRequest { id, task: &task })?;
        line.push(b'\n');
        io.stdin.write_all(&line).await?;
        io.stdin.flush().await?;
        trace!(slot = %self.slot, id, "Task written to worker");

        loop {
            let Some(line) = io.stdout.next_line().await? else {
                *guard = None;
                return Err(WorkerError::Exited);
            };
            if line.trim().is_empty() {
                continue;
            }

            let message: WorkerMessage = serde_json::from_str(&line)?;
            match message {
                WorkerMessage::Result { id: reply, output } if reply == id => return Ok(output),
                WorkerMessage::Error { id: reply, message } if reply == id => {
                    return Err(WorkerError::Task(message))
                }
                other => {
                    debug!(slot = %self.slot, expected = id, got = ?other.request_id(), "Skipping stale worker message");
                }
            }
        }
    }

    #[instrument(skip(self), fields(slot = %self.slot))]
    async fn recycle(&self) -> Result<(), WorkerError> {
        let mut io = self.io.lock().await;
        *io = None;
        self.terminate();

        let (child, worker_io) = self.launch().await?;
        debug!(pid = ?child.id(), "Worker process restarted");
        *self.child.lock() = Some(child);
        *io = Some(worker_io);
        Ok(())
    }

    fn kill(&self) {
        self.terminate();
        // A dispatch holding the io lock sees EOF once the child is gone.
        if let Ok(mut io) = self.io.try_lock() {
            *io = None;
        }
    }
}

fn forward_stderr(slot: SlotId, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(%slot, "worker: {}", line),
                Ok(None) => break,
                Err(err) => {
                    warn!(%slot, error = %err, "Lost worker stderr");
                    break;
                }
            }
        }
    });
}

impl WorkerPool<ProcessWorker> {
    /// Create a pool of process workers all launched from `worker`
    pub fn with_processes(config: PoolConfig, worker: ProcessWorkerConfig) -> Self {
        WorkerPool::new(config, move |slot| ProcessWorker::new(slot, worker.clone()))
    }
}
