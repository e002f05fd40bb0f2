//! Starting and stopping isolated workers, one per backup pair.

use super::worker::MirrorWorker;
use crate::error::{MirrorError, Result};
use crate::utils::Config;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum WorkerId {
    Pid(u32),
    Task(u64),
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerId::Pid(pid) => write!(f, "pid {}", pid),
            WorkerId::Task(id) => write!(f, "task {}", id),
        }
    }
}

/// How a worker ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerExit {
    Code(i32),
    Signal(i32),
    /// A task worker that returned after its stop flag was raised
    Stopped,
    Failed(String),
}

impl WorkerExit {
    fn from_status(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => WorkerExit::Code(code),
            (None, Some(signal)) => WorkerExit::Signal(signal),
            (None, None) => WorkerExit::Failed(status.to_string()),
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerExit::Code(code) => write!(f, "exit code {}", code),
            WorkerExit::Signal(signal) => write!(f, "killed by signal {}", signal),
            WorkerExit::Stopped => write!(f, "stopped"),
            WorkerExit::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// A running worker owned by the supervisor.
#[derive(Debug)]
pub enum WorkerHandle {
    Process {
        pid: u32,
        child: Child,
    },
    Task {
        id: u64,
        stop: Arc<AtomicBool>,
        outcome: Arc<Mutex<Option<WorkerExit>>>,
        join: JoinHandle<()>,
    },
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        match self {
            WorkerHandle::Process { pid, .. } => WorkerId::Pid(*pid),
            WorkerHandle::Task { id, .. } => WorkerId::Task(*id),
        }
    }

    /// Non-blocking check for a worker that already ended on its own.
    pub fn try_exit(&mut self) -> Option<WorkerExit> {
        match self {
            WorkerHandle::Process { child, .. } => match child.try_wait() {
                Ok(status) => status.map(WorkerExit::from_status),
                Err(e) => Some(WorkerExit::Failed(e.to_string())),
            },
            WorkerHandle::Task { outcome, .. } => outcome.lock().clone(),
        }
    }

    /// Ask the worker to stop and wait for it. Processes get SIGTERM and are
    /// killed once `grace` runs out; tasks only get their flag raised.
    pub async fn terminate(self, grace: Duration) -> WorkerExit {
        match self {
            WorkerHandle::Process { pid, mut child } => {
                if let Ok(Some(status)) = child.try_wait() {
                    return WorkerExit::from_status(status);
                }

                // SAFETY: plain syscall; the child has not been reaped yet so
                // the pid still belongs to it
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }

                match tokio::time::timeout(grace, child.wait()).await {
                    Ok(Ok(status)) => WorkerExit::from_status(status),
                    Ok(Err(e)) => WorkerExit::Failed(e.to_string()),
                    Err(_) => {
                        warn!("Worker pid {} ignored SIGTERM, killing it", pid);
                        if let Err(e) = child.kill().await {
                            return WorkerExit::Failed(e.to_string());
                        }
                        match child.wait().await {
                            Ok(status) => WorkerExit::from_status(status),
                            Err(e) => WorkerExit::Failed(e.to_string()),
                        }
                    }
                }
            }
            WorkerHandle::Task {
                id,
                stop,
                outcome,
                join,
            } => {
                stop.store(true, Ordering::Relaxed);
                match tokio::time::timeout(grace, join).await {
                    Ok(Ok(())) => outcome.lock().clone().unwrap_or(WorkerExit::Stopped),
                    Ok(Err(e)) => WorkerExit::Failed(e.to_string()),
                    Err(_) => {
                        // A blocking thread cannot be killed; it is left to finish
                        warn!("Worker task {} did not stop within {:?}", id, grace);
                        WorkerExit::Failed("did not stop in time".to_string())
                    }
                }
            }
        }
    }
}

/// Run `body` on the blocking pool as a task worker.
pub(crate) fn spawn_task<F>(id: u64, body: F) -> WorkerHandle
where
    F: FnOnce(&AtomicBool) -> Result<()> + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let outcome = Arc::new(Mutex::new(None));

    let flag = Arc::clone(&stop);
    let slot = Arc::clone(&outcome);
    let join = tokio::task::spawn_blocking(move || {
        let exit = match body(&flag) {
            Ok(()) => WorkerExit::Stopped,
            Err(e) => {
                warn!("Worker task {} failed: {}", id, e);
                WorkerExit::Failed(e.to_string())
            }
        };
        *slot.lock() = Some(exit);
    });

    WorkerHandle::Task {
        id,
        stop,
        outcome,
        join,
    }
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start mirroring `source` onto `target` (both already canonical).
    async fn launch(&self, source: &Path, target: &Path) -> Result<WorkerHandle>;
}

/// Runs each worker as a child process of the current executable.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    config: Config,
}

impl ProcessLauncher {
    pub fn new(config: &Config) -> Result<Self> {
        let program = std::env::current_exe()?;
        Ok(Self::with_program(program, config))
    }

    pub fn with_program(program: impl Into<PathBuf>, config: &Config) -> Self {
        Self {
            program: program.into(),
            config: config.clone(),
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, source: &Path, target: &Path) -> Result<WorkerHandle> {
        let mut command = Command::new(&self.program);
        command
            .arg("worker")
            .arg("--source")
            .arg(source)
            .arg("--target")
            .arg(target)
            // Workers read their tunables through the same env layer
            .env("MIRROR_MAX_WATCHES", self.config.max_watches.to_string())
            .env("MIRROR_POLL_INTERVAL_MS", self.config.poll_interval_ms.to_string())
            .env("MIRROR_EVENT_BUFFER_SIZE", self.config.event_buffer_size.to_string())
            .env("MIRROR_LOG_FILTER", &self.config.log_filter)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| MirrorError::WorkerSpawn(format!("{}: {}", self.program.display(), e)))?;
        let pid = child
            .id()
            .ok_or_else(|| MirrorError::WorkerSpawn("worker exited before it was tracked".to_string()))?;

        info!("Started worker pid {} for {}", pid, source.display());
        Ok(WorkerHandle::Process { pid, child })
    }
}

/// Runs each worker on the blocking thread pool of the current runtime.
#[derive(Debug)]
pub struct TaskLauncher {
    config: Config,
    next_id: AtomicU64,
}

impl TaskLauncher {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl WorkerLauncher for TaskLauncher {
    async fn launch(&self, source: &Path, target: &Path) -> Result<WorkerHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let worker = MirrorWorker::new(source, target, &self.config);
        debug!("Starting worker task {} for {}", id, source.display());
        Ok(spawn_task(id, move |stop| worker.run(stop)))
    }
}
