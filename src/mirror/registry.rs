//! Live set of watched directories, keyed by watch handle.

use super::events::{WatchHandle, WatchSource};
use crate::error::MirrorError;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

#[derive(Debug)]
pub struct WatchRegistry {
    entries: HashMap<WatchHandle, PathBuf>,
    capacity: usize,
}

impl WatchRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Watch a single directory.
    ///
    /// The kernel hands back the existing handle when the same inode is
    /// watched twice (e.g. a directory renamed within the tree); that entry's
    /// path is updated in place and does not count against the capacity.
    pub fn register<S: WatchSource>(
        &mut self,
        source: &mut S,
        path: &Path,
    ) -> Result<WatchHandle, MirrorError> {
        if self.entries.len() >= self.capacity && !self.entries.values().any(|p| p == path) {
            return Err(MirrorError::WatchCapacity {
                limit: self.capacity,
                path: path.to_path_buf(),
            });
        }

        let handle = source.add_watch(path)?;
        if let Some(previous) = self.entries.insert(handle, path.to_path_buf()) {
            if previous != path {
                debug!("Watch {} moved from {} to {}", handle, previous.display(), path.display());
            }
        }
        trace!("Watching {} as {}", path.display(), handle);
        Ok(handle)
    }

    /// Watch `root` and every directory below it.
    ///
    /// Does nothing if `root` is not a directory (symlinks to directories
    /// included). Symlinks are never followed during the walk. Individual
    /// failures leave that directory unwatched; hitting the capacity stops
    /// the walk. Returns how many directories were registered.
    pub fn register_recursive<S: WatchSource>(&mut self, source: &mut S, root: &Path) -> usize {
        match fs::symlink_metadata(root) {
            Ok(meta) if meta.is_dir() => {}
            _ => return 0,
        }

        let mut registered = 0;
        let walker = WalkDir::new(root).follow_links(false).into_iter();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    trace!("Skipping unreadable entry under {}: {}", root.display(), e);
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }

            match self.register(source, entry.path()) {
                Ok(_) => registered += 1,
                Err(e @ MirrorError::WatchCapacity { .. }) => {
                    warn!("{}", e);
                    break;
                }
                // Vanished or unreadable: its subtree stays unwatched
                Err(e) => debug!("Cannot watch {}: {}", entry.path().display(), e),
            }
        }

        registered
    }

    pub fn resolve(&self, handle: WatchHandle) -> Option<&Path> {
        self.entries.get(&handle).map(PathBuf::as_path)
    }

    /// Forget one handle; other entries keep their handles.
    pub fn remove(&mut self, handle: WatchHandle) -> Option<PathBuf> {
        self.entries.remove(&handle)
    }

    /// Forget every entry at or below `path` and return their handles so the
    /// caller can release them at the source.
    pub fn remove_subtree(&mut self, path: &Path) -> Vec<WatchHandle> {
        let handles: Vec<WatchHandle> = self
            .entries
            .iter()
            .filter(|(_, p)| p.starts_with(path))
            .map(|(h, _)| *h)
            .collect();

        for handle in &handles {
            self.entries.remove(handle);
        }
        handles
    }

    pub fn handle_of(&self, path: &Path) -> Option<WatchHandle> {
        self.entries
            .iter()
            .find(|(_, p)| p.as_path() == path)
            .map(|(h, _)| *h)
    }
}

/// In-memory watch source for tests: hands out increasing handles and
/// returns the same handle when a path is watched again.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FakeWatchSource {
    pub next: i32,
    pub watched: HashMap<PathBuf, WatchHandle>,
    pub removed: Vec<WatchHandle>,
}

#[cfg(test)]
impl WatchSource for FakeWatchSource {
    fn add_watch(&mut self, path: &Path) -> std::io::Result<WatchHandle> {
        if !fs::symlink_metadata(path)?.is_dir() {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "not a directory"));
        }
        if let Some(handle) = self.watched.get(path) {
            return Ok(*handle);
        }
        self.next += 1;
        let handle = WatchHandle(self.next);
        self.watched.insert(path.to_path_buf(), handle);
        Ok(handle)
    }

    fn remove_watch(&mut self, handle: WatchHandle) -> std::io::Result<()> {
        self.watched.retain(|_, h| *h != handle);
        self.removed.push(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    #[test]
    fn test_register_recursive_walks_subdirectories() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        fs::create_dir_all(dir.path().join("d")).unwrap();
        fs::write(dir.path().join("a/file.txt"), b"x").unwrap();

        let mut source = FakeWatchSource::default();
        let mut registry = WatchRegistry::new(64);
        let count = registry.register_recursive(&mut source, dir.path());

        assert_eq!(count, 5);
        assert_eq!(registry.len(), 5);
        assert!(registry.handle_of(&dir.path().join("a/b/c")).is_some());
    }

    #[test]
    fn test_symlinked_directories_are_not_followed() {
        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        fs::create_dir_all(outside.path().join("x/y")).unwrap();
        symlink(outside.path(), dir.path().join("escape")).unwrap();
        symlink(dir.path(), dir.path().join("cycle")).unwrap();

        let mut source = FakeWatchSource::default();
        let mut registry = WatchRegistry::new(64);
        assert_eq!(registry.register_recursive(&mut source, dir.path()), 1);

        // A symlink root is not a directory
        let mut other = WatchRegistry::new(64);
        assert_eq!(other.register_recursive(&mut source, &dir.path().join("escape")), 0);
    }

    #[test]
    fn test_missing_root_is_noop() {
        let dir = tempdir().unwrap();
        let mut source = FakeWatchSource::default();
        let mut registry = WatchRegistry::new(4);
        assert_eq!(registry.register_recursive(&mut source, &dir.path().join("gone")), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_capacity_is_enforced() {
        let dir = tempdir().unwrap();
        for name in ["a", "b", "c", "d"] {
            fs::create_dir(dir.path().join(name)).unwrap();
        }

        let mut source = FakeWatchSource::default();
        let mut registry = WatchRegistry::new(3);
        assert_eq!(registry.register_recursive(&mut source, dir.path()), 3);
        assert_eq!(registry.len(), 3);

        let extra = dir.path().join("extra");
        fs::create_dir(&extra).unwrap();
        let err = registry.register(&mut source, &extra).unwrap_err();
        assert!(matches!(err, MirrorError::WatchCapacity { limit: 3, .. }));
    }

    #[test]
    fn test_remove_keeps_other_handles() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::create_dir_all(dir.path().join("b")).unwrap();

        let mut source = FakeWatchSource::default();
        let mut registry = WatchRegistry::new(8);
        let root = registry.register(&mut source, dir.path()).unwrap();
        let a = registry.register(&mut source, &dir.path().join("a")).unwrap();
        let b = registry.register(&mut source, &dir.path().join("b")).unwrap();

        assert_eq!(registry.remove(a), Some(dir.path().join("a")));
        assert_eq!(registry.resolve(a), None);
        assert_eq!(registry.resolve(root), Some(dir.path()));
        assert_eq!(registry.resolve(b), Some(dir.path().join("b").as_path()));
        assert_eq!(registry.remove(a), None);
    }

    #[test]
    fn test_remove_subtree() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("moved/inner")).unwrap();
        fs::create_dir_all(dir.path().join("moved2")).unwrap();

        let mut source = FakeWatchSource::default();
        let mut registry = WatchRegistry::new(8);
        registry.register_recursive(&mut source, dir.path());

        let removed = registry.remove_subtree(&dir.path().join("moved"));
        assert_eq!(removed.len(), 2);
        assert_eq!(registry.len(), 2);
        assert!(registry.handle_of(&dir.path().join("moved2")).is_some());
    }

    #[test]
    fn test_reregistering_same_handle_updates_path() {
        let dir = tempdir().unwrap();
        let old = dir.path().join("old");
        fs::create_dir(&old).unwrap();

        let mut source = FakeWatchSource::default();
        let mut registry = WatchRegistry::new(2);
        let handle = registry.register(&mut source, &old).unwrap();

        // The kernel returns the same handle for a renamed inode
        let new = dir.path().join("new");
        fs::rename(&old, &new).unwrap();
        source.watched.insert(new.clone(), handle);

        assert_eq!(registry.register(&mut source, &new).unwrap(), handle);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.resolve(handle), Some(new.as_path()));
    }
}
