use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced to whoever drives the supervisor, restore or a worker.
///
/// `Display` is the one-line diagnostic printed by the shell and returned by
/// the HTTP API, so keep the messages short.
#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("cannot resolve {}: {source}", path.display())]
    Canonicalize {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "recursive backup not allowed: {} and {} overlap",
        source_root.display(),
        target_root.display()
    )]
    RecursiveBackup {
        source_root: PathBuf,
        target_root: PathBuf,
    },

    #[error("backup already exists: {} -> {}", source_root.display(), target_root.display())]
    AlreadyExists {
        source_root: PathBuf,
        target_root: PathBuf,
    },

    #[error("target not empty: {}", .0.display())]
    TargetNotEmpty(PathBuf),

    #[error("too many backups (limit {limit})")]
    BackupCapacity { limit: usize },

    #[error("max watches reached (limit {limit}), {} left unwatched", path.display())]
    WatchCapacity { limit: usize, path: PathBuf },

    #[error("backup not found")]
    NotFound,

    #[error("cannot initialize change notifications: {0}")]
    Notification(#[source] io::Error),

    #[error("failed to start worker: {0}")]
    WorkerSpawn(String),

    #[error("supervisor is not running")]
    SupervisorGone,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl MirrorError {
    /// Validation and capacity errors leave all state untouched; the caller
    /// can simply retry with different input.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            MirrorError::Canonicalize { .. }
                | MirrorError::RecursiveBackup { .. }
                | MirrorError::AlreadyExists { .. }
                | MirrorError::TargetNotEmpty(_)
                | MirrorError::BackupCapacity { .. }
                | MirrorError::NotFound
        )
    }
}

pub type Result<T> = std::result::Result<T, MirrorError>;
