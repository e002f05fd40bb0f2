//! Turns change notifications into idempotent actions on the mirror.

use super::events::{ChangeEvent, OpMask, WatchSource};
use super::fsops::{self, NodeKind};
use super::path_map::PathMapper;
use super::registry::WatchRegistry;
use super::restore::prune_extraneous;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn};

/// A single step applied to the target tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorAction {
    /// Copy whatever is at `source` (directory tree, file or symlink).
    CreateNode { source: PathBuf, target: PathBuf },
    /// Re-copy the content at `source`.
    UpdateNode { source: PathBuf, target: PathBuf },
    /// Remove `target`. `moved` is set when the source left through a rename,
    /// in which case watches below `source` are released as well.
    DeleteNode {
        source: PathBuf,
        target: PathBuf,
        moved: bool,
    },
}

impl MirrorAction {
    pub fn target(&self) -> &Path {
        match self {
            MirrorAction::CreateNode { target, .. }
            | MirrorAction::UpdateNode { target, .. }
            | MirrorAction::DeleteNode { target, .. } => target,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventDispatcher {
    mapper: PathMapper,
}

impl EventDispatcher {
    pub fn new(mapper: PathMapper) -> Self {
        Self { mapper }
    }

    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    /// Work out which actions an event calls for, without touching the
    /// filesystem. Events for handles the registry no longer knows yield
    /// nothing.
    pub fn plan(&self, event: &ChangeEvent, registry: &WatchRegistry) -> Vec<MirrorAction> {
        let Some(watched) = registry.resolve(event.handle) else {
            trace!("Dropping event for unknown watch {}", event.handle);
            return Vec::new();
        };

        let source = match &event.name {
            Some(name) => watched.join(name),
            None => watched.to_path_buf(),
        };
        let Some(target) = self.mapper.to_target(&source) else {
            debug!("{} is outside the mirrored tree", source.display());
            return Vec::new();
        };

        let mut actions = Vec::new();
        let mask = event.mask;

        if mask.intersects(OpMask::CREATED | OpMask::RENAMED_TO) {
            actions.push(MirrorAction::CreateNode {
                source: source.clone(),
                target: target.clone(),
            });
        }
        if mask.intersects(OpMask::DELETED | OpMask::RENAMED_FROM) {
            actions.push(MirrorAction::DeleteNode {
                source: source.clone(),
                target: target.clone(),
                moved: mask.contains(OpMask::RENAMED_FROM),
            });
        }
        if mask.contains(OpMask::MODIFIED) {
            actions.push(MirrorAction::UpdateNode { source, target });
        }

        actions
    }

    /// Apply one event. Never fails: races and I/O errors are logged and the
    /// affected action is skipped.
    pub fn dispatch<S: WatchSource>(
        &self,
        event: &ChangeEvent,
        registry: &mut WatchRegistry,
        watches: &mut S,
    ) -> Vec<MirrorAction> {
        if event.mask.contains(OpMask::OVERFLOW) {
            self.resync(registry, watches);
            return Vec::new();
        }

        let actions = self.plan(event, registry);
        for action in &actions {
            self.apply(action, registry, watches);
        }

        if event.mask.contains(OpMask::WATCH_INVALIDATED) {
            if let Some(path) = registry.remove(event.handle) {
                debug!("Watch {} on {} invalidated", event.handle, path.display());
            }
        }

        actions
    }

    fn apply<S: WatchSource>(&self, action: &MirrorAction, registry: &mut WatchRegistry, watches: &mut S) {
        match action {
            MirrorAction::CreateNode { source, target } => {
                let kind = match fsops::node_kind(source) {
                    Ok(Some(kind)) => kind,
                    Ok(None) => {
                        trace!("{} vanished before it could be mirrored", source.display());
                        return;
                    }
                    Err(e) => {
                        debug!("Cannot inspect {}: {}", source.display(), e);
                        return;
                    }
                };

                if kind == NodeKind::Directory {
                    // Watch first so entries created during the copy still raise events
                    registry.register_recursive(watches, source);
                }
                self.copy(source, target);
            }
            MirrorAction::UpdateNode { source, target } => match fsops::node_kind(source) {
                Ok(Some(NodeKind::File | NodeKind::Symlink)) => self.copy(source, target),
                Ok(_) => {}
                Err(e) => debug!("Cannot inspect {}: {}", source.display(), e),
            },
            MirrorAction::DeleteNode { source, target, moved } => {
                if *moved {
                    for handle in registry.remove_subtree(source) {
                        // Fails harmlessly if the kernel already dropped it
                        let _ = watches.remove_watch(handle);
                    }
                }
                match fsops::remove_node(target) {
                    Ok(true) => trace!("Removed {}", target.display()),
                    Ok(false) => {}
                    Err(e) => warn!("Failed to remove {}: {}", target.display(), e),
                }
            }
        }
    }

    fn copy(&self, source: &Path, target: &Path) {
        match fsops::copy_node(source, target) {
            Ok(stats) => trace!("Mirrored {} ({} bytes)", source.display(), stats.bytes),
            Err(e) if fsops::is_vanished(&e) => {
                trace!("{} vanished during copy", source.display())
            }
            Err(e) => warn!("Failed to mirror {}: {}", source.display(), e),
        }
    }

    /// Bring the whole mirror back in line after the kernel dropped events.
    pub fn resync<S: WatchSource>(&self, registry: &mut WatchRegistry, watches: &mut S) {
        let source = self.mapper.source_root();
        let target = self.mapper.target_root();
        warn!("Notification queue overflowed, resyncing {}", source.display());

        registry.register_recursive(watches, source);
        match fsops::copy_node(source, target) {
            Ok(stats) => info!("Resync copied {} files", stats.files),
            Err(e) => warn!("Resync of {} failed: {}", source.display(), e),
        }
        match prune_extraneous(target, source) {
            Ok(pruned) if pruned > 0 => info!("Resync pruned {} stale entries", pruned),
            Ok(_) => {}
            Err(e) => warn!("Resync prune of {} failed: {}", target.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::events::WatchHandle;
    use crate::mirror::registry::FakeWatchSource;
    use std::fs;
    use std::os::unix::fs::symlink;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        src: PathBuf,
        dst: PathBuf,
        dispatcher: EventDispatcher,
        registry: WatchRegistry,
        watches: FakeWatchSource,
        root: WatchHandle,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let src = dir.path().join("src");
            let dst = dir.path().join("dst");
            fs::create_dir_all(&src).unwrap();
            fs::create_dir_all(&dst).unwrap();

            let mut watches = FakeWatchSource::default();
            let mut registry = WatchRegistry::new(64);
            let root = registry.register(&mut watches, &src).unwrap();

            Self {
                dispatcher: EventDispatcher::new(PathMapper::new(&src, &dst)),
                _dir: dir,
                src,
                dst,
                registry,
                watches,
                root,
            }
        }

        fn dispatch(&mut self, mask: OpMask, name: Option<&str>) -> Vec<MirrorAction> {
            self.dispatch_on(self.root, mask, name)
        }

        fn dispatch_on(&mut self, handle: WatchHandle, mask: OpMask, name: Option<&str>) -> Vec<MirrorAction> {
            let event = ChangeEvent::new(handle, mask, name);
            self.dispatcher.dispatch(&event, &mut self.registry, &mut self.watches)
        }
    }

    #[test]
    fn test_created_file_is_copied() {
        let mut fx = Fixture::new();
        fs::write(fx.src.join("a.txt"), b"hello").unwrap();

        let actions = fx.dispatch(OpMask::CREATED, Some("a.txt"));

        assert_eq!(
            actions,
            vec![MirrorAction::CreateNode {
                source: fx.src.join("a.txt"),
                target: fx.dst.join("a.txt"),
            }]
        );
        assert_eq!(fs::read(fx.dst.join("a.txt")).unwrap(), b"hello");
    }

    #[test]
    fn test_created_directory_is_copied_and_watched() {
        let mut fx = Fixture::new();
        fs::create_dir_all(fx.src.join("new/inner")).unwrap();
        fs::write(fx.src.join("new/inner/f"), b"f").unwrap();

        fx.dispatch(OpMask::CREATED, Some("new"));

        assert_eq!(fs::read(fx.dst.join("new/inner/f")).unwrap(), b"f");
        let inner = fx.registry.handle_of(&fx.src.join("new/inner")).expect("inner watched");

        // Grandchildren created later are observed through the new watch
        fs::write(fx.src.join("new/inner/g"), b"g").unwrap();
        fx.dispatch_on(inner, OpMask::CREATED, Some("g"));
        assert_eq!(fs::read(fx.dst.join("new/inner/g")).unwrap(), b"g");
    }

    #[test]
    fn test_created_symlink_is_recreated() {
        let mut fx = Fixture::new();
        symlink("../elsewhere", fx.src.join("link")).unwrap();
        fs::write(fx.dst.join("link"), b"stale").unwrap();

        fx.dispatch(OpMask::CREATED, Some("link"));

        assert_eq!(fs::read_link(fx.dst.join("link")).unwrap(), Path::new("../elsewhere"));
    }

    #[test]
    fn test_vanished_source_is_skipped() {
        let mut fx = Fixture::new();
        let actions = fx.dispatch(OpMask::CREATED, Some("gone.txt"));
        assert_eq!(actions.len(), 1);
        assert!(!fx.dst.join("gone.txt").exists());
    }

    #[test]
    fn test_modified_is_idempotent() {
        let mut fx = Fixture::new();
        fs::write(fx.src.join("a.txt"), b"v1").unwrap();
        fx.dispatch(OpMask::CREATED, Some("a.txt"));

        fs::write(fx.src.join("a.txt"), b"version two").unwrap();
        fx.dispatch(OpMask::MODIFIED, Some("a.txt"));
        fx.dispatch(OpMask::MODIFIED, Some("a.txt"));

        assert_eq!(fs::read(fx.dst.join("a.txt")).unwrap(), b"version two");
    }

    #[test]
    fn test_deleted_removes_target() {
        let mut fx = Fixture::new();
        fs::write(fx.dst.join("a.txt"), b"old").unwrap();

        fx.dispatch(OpMask::DELETED, Some("a.txt"));
        assert!(!fx.dst.join("a.txt").exists());

        // Deleting again is a no-op
        fx.dispatch(OpMask::DELETED, Some("a.txt"));
    }

    #[test]
    fn test_rename_within_tree() {
        let mut fx = Fixture::new();
        fs::write(fx.src.join("old.txt"), b"data").unwrap();
        fx.dispatch(OpMask::CREATED, Some("old.txt"));

        fs::rename(fx.src.join("old.txt"), fx.src.join("new.txt")).unwrap();
        fx.dispatch(OpMask::RENAMED_FROM, Some("old.txt"));
        fx.dispatch(OpMask::RENAMED_TO, Some("new.txt"));

        assert!(!fx.dst.join("old.txt").exists());
        assert_eq!(fs::read(fx.dst.join("new.txt")).unwrap(), b"data");
    }

    #[test]
    fn test_rename_halves_out_of_order() {
        let mut fx = Fixture::new();
        fs::write(fx.src.join("old.txt"), b"data").unwrap();
        fx.dispatch(OpMask::CREATED, Some("old.txt"));

        fs::rename(fx.src.join("old.txt"), fx.src.join("new.txt")).unwrap();
        fx.dispatch(OpMask::RENAMED_TO, Some("new.txt"));
        fx.dispatch(OpMask::RENAMED_FROM, Some("old.txt"));

        assert!(!fx.dst.join("old.txt").exists());
        assert_eq!(fs::read(fx.dst.join("new.txt")).unwrap(), b"data");
    }

    #[test]
    fn test_directory_moved_out_releases_watches() {
        let mut fx = Fixture::new();
        fs::create_dir_all(fx.src.join("d/e")).unwrap();
        fx.dispatch(OpMask::CREATED, Some("d"));
        let inner = fx.registry.handle_of(&fx.src.join("d/e")).unwrap();
        assert_eq!(fx.registry.len(), 3);

        let outside = fx._dir.path().join("outside");
        fs::rename(fx.src.join("d"), &outside).unwrap();
        fx.dispatch(OpMask::RENAMED_FROM, Some("d"));

        assert!(!fx.dst.join("d").exists());
        assert_eq!(fx.registry.len(), 1);
        assert!(fx.watches.removed.contains(&inner));

        // Late events from the moved tree no longer resolve
        fs::write(outside.join("e/late"), b"x").unwrap();
        assert!(fx.dispatch_on(inner, OpMask::CREATED, Some("late")).is_empty());
        assert!(!fx.dst.join("d/e/late").exists());
    }

    #[test]
    fn test_watch_invalidated_only_deregisters() {
        let mut fx = Fixture::new();
        fs::create_dir(fx.src.join("sub")).unwrap();
        let sub = fx.registry.register(&mut fx.watches, &fx.src.join("sub")).unwrap();
        fs::write(fx.dst.join("keep"), b"k").unwrap();

        let actions = fx.dispatch_on(sub, OpMask::WATCH_INVALIDATED, None);

        assert!(actions.is_empty());
        assert_eq!(fx.registry.resolve(sub), None);
        assert!(fx.registry.resolve(fx.root).is_some());
        assert!(fx.dst.join("keep").exists());
    }

    #[test]
    fn test_unknown_handle_is_dropped() {
        let mut fx = Fixture::new();
        fs::write(fx.src.join("a.txt"), b"x").unwrap();
        let actions = fx.dispatch_on(WatchHandle(999), OpMask::CREATED, Some("a.txt"));
        assert!(actions.is_empty());
        assert!(!fx.dst.join("a.txt").exists());
    }

    #[test]
    fn test_combined_mask_applies_in_priority_order() {
        let fx = Fixture::new();
        let event = ChangeEvent::new(fx.root, OpMask::MODIFIED | OpMask::DELETED | OpMask::CREATED, Some("x"));
        let actions = fx.dispatcher.plan(&event, &fx.registry);
        assert!(matches!(actions[0], MirrorAction::CreateNode { .. }));
        assert!(matches!(actions[1], MirrorAction::DeleteNode { moved: false, .. }));
        assert!(matches!(actions[2], MirrorAction::UpdateNode { .. }));
    }

    #[test]
    fn test_overflow_resyncs_whole_tree() {
        let mut fx = Fixture::new();
        fs::create_dir(fx.src.join("missed")).unwrap();
        fs::write(fx.src.join("missed/file"), b"m").unwrap();
        fs::write(fx.dst.join("stale"), b"s").unwrap();

        fx.dispatch_on(WatchHandle(-1), OpMask::OVERFLOW, None);

        assert_eq!(fs::read(fx.dst.join("missed/file")).unwrap(), b"m");
        assert!(!fx.dst.join("stale").exists());
        assert!(fx.registry.handle_of(&fx.src.join("missed")).is_some());
    }
}
