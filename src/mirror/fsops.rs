//! Node-level copy and delete primitives shared by live mirroring and restore.
//!
//! Every function here runs against trees other processes are mutating. A
//! source entry that disappears mid-walk is skipped, never reported as an
//! error; only the top-level node passed in by the caller yields `NotFound`.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::Path;
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Kind of a filesystem node as seen without following symlinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Directory,
    File,
    Symlink,
    /// Sockets, FIFOs, devices: never mirrored.
    Other,
}

impl NodeKind {
    pub fn of(file_type: fs::FileType) -> Self {
        if file_type.is_dir() {
            NodeKind::Directory
        } else if file_type.is_file() {
            NodeKind::File
        } else if file_type.is_symlink() {
            NodeKind::Symlink
        } else {
            NodeKind::Other
        }
    }
}

/// Current kind of `path`, or `None` if nothing is there.
pub fn node_kind(path: &Path) -> io::Result<Option<NodeKind>> {
    match fs::symlink_metadata(path) {
        Ok(meta) => Ok(Some(NodeKind::of(meta.file_type()))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub directories: u64,
    pub files: u64,
    pub symlinks: u64,
    pub bytes: u64,
    /// Entries that vanished or could not be copied
    pub skipped: u64,
}

impl CopyStats {
    fn merge(&mut self, other: CopyStats) {
        self.directories += other.directories;
        self.files += other.files;
        self.symlinks += other.symlinks;
        self.bytes += other.bytes;
        self.skipped += other.skipped;
    }
}

pub fn is_vanished(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}

/// Copy the node at `src` to `dst`, recursing into directories.
///
/// An existing `dst` of a different kind is deleted first; an existing
/// directory is merged into. Symlinks are recreated with the same referent
/// and never followed.
pub fn copy_node(src: &Path, dst: &Path) -> io::Result<CopyStats> {
    let meta = fs::symlink_metadata(src)?;
    match NodeKind::of(meta.file_type()) {
        NodeKind::Directory => copy_tree(src, dst),
        NodeKind::File => {
            let bytes = copy_file(src, dst)?;
            Ok(CopyStats {
                files: 1,
                bytes,
                ..Default::default()
            })
        }
        NodeKind::Symlink => {
            copy_symlink(src, dst)?;
            Ok(CopyStats {
                symlinks: 1,
                ..Default::default()
            })
        }
        NodeKind::Other => {
            debug!("Skipping special file {}", src.display());
            Ok(CopyStats {
                skipped: 1,
                ..Default::default()
            })
        }
    }
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<CopyStats> {
    let mut stats = CopyStats::default();

    // Pre-order walk: every directory is created before its children
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                trace!("Skipping unreadable entry under {}: {}", src.display(), e);
                stats.skipped += 1;
                continue;
            }
        };

        let relative = match entry.path().strip_prefix(src) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let target = if relative.as_os_str().is_empty() {
            dst.to_path_buf()
        } else {
            dst.join(relative)
        };

        let result = match NodeKind::of(entry.file_type()) {
            NodeKind::Directory => ensure_dir(&target).map(|created| CopyStats {
                directories: u64::from(created),
                ..Default::default()
            }),
            NodeKind::File => copy_file(entry.path(), &target).map(|bytes| CopyStats {
                files: 1,
                bytes,
                ..Default::default()
            }),
            NodeKind::Symlink => copy_symlink(entry.path(), &target).map(|_| CopyStats {
                symlinks: 1,
                ..Default::default()
            }),
            NodeKind::Other => Ok(CopyStats {
                skipped: 1,
                ..Default::default()
            }),
        };

        match result {
            Ok(s) => stats.merge(s),
            Err(e) if is_vanished(&e) => {
                trace!("{} vanished during copy", entry.path().display());
                stats.skipped += 1;
            }
            Err(e) if relative.as_os_str().is_empty() => return Err(e),
            Err(e) => {
                debug!("Failed to copy {}: {}", entry.path().display(), e);
                stats.skipped += 1;
            }
        }
    }

    Ok(stats)
}

/// Make `dst` a directory. Returns whether a new directory was created.
///
/// Permission bits are not carried over: a read-only source directory would
/// otherwise lock the copy out of its own children.
pub fn ensure_dir(dst: &Path) -> io::Result<bool> {
    match node_kind(dst)? {
        Some(NodeKind::Directory) => return Ok(false),
        Some(_) => {
            remove_node(dst)?;
        }
        None => {}
    }

    fs::create_dir(dst)?;
    Ok(true)
}

/// Copy a regular file's bytes, replacing whatever is at `dst`.
pub fn copy_file(src: &Path, dst: &Path) -> io::Result<u64> {
    match node_kind(dst)? {
        // fs::copy would write through a symlink
        Some(NodeKind::File) | None => {}
        Some(_) => {
            remove_node(dst)?;
        }
    }
    fs::copy(src, dst)
}

/// Recreate the symlink at `src` as `dst`, replacing whatever is there.
pub fn copy_symlink(src: &Path, dst: &Path) -> io::Result<()> {
    let referent = fs::read_link(src)?;
    if node_kind(dst)?.is_some() {
        remove_node(dst)?;
    }
    symlink(&referent, dst)
}

/// Delete whatever is at `path`; directories are removed recursively.
/// Returns `false` when there was nothing to delete.
pub fn remove_node(path: &Path) -> io::Result<bool> {
    let result = match node_kind(path)? {
        None => return Ok(false),
        Some(NodeKind::Directory) => fs::remove_dir_all(path),
        Some(_) => fs::remove_file(path),
    };

    match result {
        Ok(()) => Ok(true),
        Err(e) if is_vanished(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

/// True when `path` is a directory with no entries.
pub fn dir_is_empty(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}
