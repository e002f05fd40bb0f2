//! Table of active backup pairs and the actor that owns it.

use super::fsops;
use super::launcher::{ProcessLauncher, TaskLauncher, WorkerExit, WorkerHandle, WorkerId, WorkerLauncher};
use super::path_map::{canonical, roots_overlap};
use super::restore::{RestoreEngine, RestoreReport};
use crate::error::{MirrorError, Result};
use crate::utils::{Config, IsolationMode, LogBuffer};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

const REAP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PairStatus {
    pub target: PathBuf,
    pub worker: WorkerId,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

/// Active pairs sharing one source root.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceGroup {
    pub source: PathBuf,
    pub targets: Vec<PairStatus>,
}

#[derive(Debug)]
struct ActivePair {
    worker: WorkerHandle,
    started_at: DateTime<Utc>,
    started: Instant,
}

pub struct BackupSupervisor {
    // Ordered so listings group naturally by source
    pairs: BTreeMap<(PathBuf, PathBuf), ActivePair>,
    launcher: Arc<dyn WorkerLauncher>,
    max_backups: usize,
    grace: Duration,
    logs: LogBuffer,
}

impl BackupSupervisor {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, config: &Config, logs: LogBuffer) -> Self {
        Self {
            pairs: BTreeMap::new(),
            launcher,
            max_backups: config.max_backups,
            grace: config.termination_grace(),
            logs,
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Validate the pair, prepare the target and start its worker.
    pub async fn add(&mut self, source: &Path, target: &Path) -> Result<WorkerId> {
        let result = self.try_add(source, target).await;
        if let Err(e) = &result {
            self.logs
                .add_pair_log("warn", format!("Rejected: {}", e), source, target);
        }
        result
    }

    async fn try_add(&mut self, source: &Path, target: &Path) -> Result<WorkerId> {
        if self.pairs.len() >= self.max_backups {
            return Err(MirrorError::BackupCapacity {
                limit: self.max_backups,
            });
        }

        let source = canonical(source)?;
        let target = resolve_target(target)?;
        if roots_overlap(&source, &target) {
            return Err(MirrorError::RecursiveBackup {
                source_root: source,
                target_root: target,
            });
        }
        if !fs::metadata(&source)?.is_dir() {
            return Err(not_a_directory(&source));
        }

        let key = (source, target);
        if self.pairs.contains_key(&key) {
            let (source_root, target_root) = key;
            return Err(MirrorError::AlreadyExists {
                source_root,
                target_root,
            });
        }
        let (source, target) = key;

        let target = match fs::symlink_metadata(&target) {
            Ok(meta) if meta.is_dir() => {
                if !fsops::dir_is_empty(&target)? {
                    return Err(MirrorError::TargetNotEmpty(target));
                }
                target
            }
            Ok(_) => return Err(not_a_directory(&target)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir(&target)?;
                canonical(&target)?
            }
            Err(e) => return Err(e.into()),
        };

        let worker = self.launcher.launch(&source, &target).await?;
        let id = worker.id();

        info!("Backup started: {} -> {} ({})", source.display(), target.display(), id);
        self.logs
            .add_pair_log("info", format!("Backup started ({})", id), &source, &target);
        self.pairs.insert(
            (source, target),
            ActivePair {
                worker,
                started_at: Utc::now(),
                started: Instant::now(),
            },
        );
        Ok(id)
    }

    /// Stop the pair's worker and wait for it to exit.
    pub async fn remove(&mut self, source: &Path, target: &Path) -> Result<WorkerExit> {
        let key = (canonical(source)?, resolve_target(target)?);
        let pair = self.pairs.remove(&key).ok_or(MirrorError::NotFound)?;
        let (source, target) = key;

        let exit = pair.worker.terminate(self.grace).await;
        info!("Backup ended: {} -> {} ({})", source.display(), target.display(), exit);
        self.logs
            .add_pair_log("info", format!("Backup ended ({})", exit), &source, &target);
        Ok(exit)
    }

    pub fn list(&self) -> Vec<SourceGroup> {
        let mut groups: Vec<SourceGroup> = Vec::new();
        for ((source, target), pair) in &self.pairs {
            let status = PairStatus {
                target: target.clone(),
                worker: pair.worker.id(),
                started_at: pair.started_at,
                uptime_secs: pair.started.elapsed().as_secs(),
            };
            match groups.last_mut() {
                Some(group) if &group.source == source => group.targets.push(status),
                _ => groups.push(SourceGroup {
                    source: source.clone(),
                    targets: vec![status],
                }),
            }
        }
        groups
    }

    /// Drop pairs whose worker exited on its own.
    pub fn reap(&mut self) -> Vec<(PathBuf, PathBuf, WorkerExit)> {
        let exited: Vec<_> = self
            .pairs
            .iter_mut()
            .filter_map(|(key, pair)| pair.worker.try_exit().map(|exit| (key.clone(), exit)))
            .collect();

        exited
            .into_iter()
            .map(|((source, target), exit)| {
                self.pairs.remove(&(source.clone(), target.clone()));
                warn!("Worker for {} -> {} exited: {}", source.display(), target.display(), exit);
                self.logs
                    .add_pair_log("warn", format!("Worker exited ({})", exit), &source, &target);
                (source, target, exit)
            })
            .collect()
    }

    /// Terminate every worker and wait for all of them.
    pub async fn shutdown(&mut self) {
        let pairs = std::mem::take(&mut self.pairs);
        if pairs.is_empty() {
            return;
        }

        info!("Stopping {} backups", pairs.len());
        for ((source, target), pair) in pairs {
            let exit = pair.worker.terminate(self.grace).await;
            self.logs
                .add_pair_log("info", format!("Backup ended ({})", exit), &source, &target);
        }
    }
}

/// Canonical form of a target that may not exist yet: its parent must.
fn resolve_target(target: &Path) -> Result<PathBuf> {
    match canonical(target) {
        Ok(path) => Ok(path),
        Err(MirrorError::Canonicalize { source, .. }) if source.kind() == io::ErrorKind::NotFound => {
            let name = target.file_name().ok_or_else(|| MirrorError::Canonicalize {
                path: target.to_path_buf(),
                source,
            })?;
            let parent = match target.parent() {
                Some(p) if !p.as_os_str().is_empty() => p,
                _ => Path::new("."),
            };
            Ok(canonical(parent)?.join(name))
        }
        Err(e) => Err(e),
    }
}

fn not_a_directory(path: &Path) -> MirrorError {
    MirrorError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("{} is not a directory", path.display()),
    ))
}

enum Command {
    Add {
        source: PathBuf,
        target: PathBuf,
        reply: oneshot::Sender<Result<WorkerId>>,
    },
    Remove {
        source: PathBuf,
        target: PathBuf,
        reply: oneshot::Sender<Result<WorkerExit>>,
    },
    List {
        reply: oneshot::Sender<Vec<SourceGroup>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap clonable front to the supervisor task.
#[derive(Clone)]
pub struct SupervisorHandle {
    command_tx: mpsc::Sender<Command>,
    logs: LogBuffer,
}

impl SupervisorHandle {
    /// Build a supervisor with the launcher the config asks for and start
    /// its task. Must be called inside a tokio runtime.
    pub fn from_config(config: &Config) -> Result<Self> {
        let launcher: Arc<dyn WorkerLauncher> = match config.isolation {
            IsolationMode::Process => Arc::new(ProcessLauncher::new(config)?),
            IsolationMode::Task => Arc::new(TaskLauncher::new(config)),
        };
        let logs = LogBuffer::new(config.activity_log_entries);
        Ok(Self::spawn(BackupSupervisor::new(launcher, config, logs)))
    }

    pub fn spawn(supervisor: BackupSupervisor) -> Self {
        Self::spawn_with_interval(supervisor, REAP_INTERVAL)
    }

    pub fn spawn_with_interval(supervisor: BackupSupervisor, reap_every: Duration) -> Self {
        let (command_tx, command_rx) = mpsc::channel(32);
        let logs = supervisor.logs.clone();
        tokio::spawn(Self::process_commands(supervisor, command_rx, reap_every));
        Self { command_tx, logs }
    }

    async fn process_commands(
        mut supervisor: BackupSupervisor,
        mut rx: mpsc::Receiver<Command>,
        reap_every: Duration,
    ) {
        let mut ticker = tokio::time::interval(reap_every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Add { source, target, reply }) => {
                        let _ = reply.send(supervisor.add(&source, &target).await);
                    }
                    Some(Command::Remove { source, target, reply }) => {
                        let _ = reply.send(supervisor.remove(&source, &target).await);
                    }
                    Some(Command::List { reply }) => {
                        let _ = reply.send(supervisor.list());
                    }
                    Some(Command::Shutdown { reply }) => {
                        supervisor.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        // Every handle dropped
                        supervisor.shutdown().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    supervisor.reap();
                }
            }
        }
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(build(reply))
            .await
            .map_err(|_| MirrorError::SupervisorGone)?;
        response.await.map_err(|_| MirrorError::SupervisorGone)
    }

    pub async fn add(&self, source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Result<WorkerId> {
        let (source, target) = (source.into(), target.into());
        self.request(|reply| Command::Add {
            source,
            target,
            reply,
        })
        .await?
    }

    pub async fn remove(&self, source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Result<WorkerExit> {
        let (source, target) = (source.into(), target.into());
        self.request(|reply| Command::Remove {
            source,
            target,
            reply,
        })
        .await?
    }

    pub async fn list(&self) -> Result<Vec<SourceGroup>> {
        self.request(|reply| Command::List { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Restore runs outside the actor; it does not touch the pair table.
    pub async fn restore(&self, source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Result<RestoreReport> {
        let (source, target) = (source.into(), target.into());
        let (s, t) = (source.clone(), target.clone());
        let result = tokio::task::spawn_blocking(move || RestoreEngine::new().restore(&s, &t))
            .await
            .map_err(|e| MirrorError::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))?;

        match &result {
            Ok(report) => self
                .logs
                .add_pair_log("info", format!("Restore complete: {}", report), &source, &target),
            Err(e) => {
                error!("Restore of {} failed: {}", source.display(), e);
                self.logs
                    .add_pair_log("error", format!("Restore failed: {}", e), &source, &target)
            }
        }
        result
    }

    pub fn logs(&self) -> &LogBuffer {
        &self.logs
    }
}
