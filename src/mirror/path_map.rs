//! Translation between a source tree and its mirror.

use crate::error::{MirrorError, Result};
use std::path::{Path, PathBuf};

/// Maps absolute paths under `source_root` to the same relative location
/// under `target_root` and back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapper {
    source_root: PathBuf,
    target_root: PathBuf,
}

impl PathMapper {
    pub fn new(source_root: impl Into<PathBuf>, target_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            target_root: target_root.into(),
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn target_root(&self) -> &Path {
        &self.target_root
    }

    /// `None` when `path` is not under the source root.
    pub fn to_target(&self, path: &Path) -> Option<PathBuf> {
        rebase(path, &self.source_root, &self.target_root)
    }

    /// Inverse of [`PathMapper::to_target`], used by restore.
    pub fn to_source(&self, path: &Path) -> Option<PathBuf> {
        rebase(path, &self.target_root, &self.source_root)
    }

    /// Mapper for the reverse direction (mirror onto source).
    pub fn reversed(&self) -> Self {
        Self::new(self.target_root.clone(), self.source_root.clone())
    }
}

fn rebase(path: &Path, from: &Path, to: &Path) -> Option<PathBuf> {
    let relative = path.strip_prefix(from).ok()?;
    if relative.as_os_str().is_empty() {
        // join("") would leave a trailing separator
        return Some(to.to_path_buf());
    }
    Some(to.join(relative))
}

/// Absolute, symlink-free form of an existing path.
pub fn canonical(path: &Path) -> Result<PathBuf> {
    path.canonicalize().map_err(|source| MirrorError::Canonicalize {
        path: path.to_path_buf(),
        source,
    })
}

/// True when `child` is `parent` or lies below it. Compares whole
/// components, so `/data/src2` is not under `/data/src`.
pub fn is_subpath(parent: &Path, child: &Path) -> bool {
    child.starts_with(parent)
}

/// Roots that would make a mirror copy into itself.
pub fn roots_overlap(a: &Path, b: &Path) -> bool {
    is_subpath(a, b) || is_subpath(b, a)
}
