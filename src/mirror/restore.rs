//! Reverse reconciliation: make a source tree match its mirror again.

use super::differ::ContentDiffer;
use super::fsops::{self, NodeKind};
use super::path_map::{canonical, roots_overlap, PathMapper};
use crate::error::{MirrorError, Result};
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::Path;
use tracing::{debug, info, trace, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub files_copied: u64,
    /// Files left alone because their digests already matched
    pub files_skipped: u64,
    pub dirs_created: u64,
    pub links_recreated: u64,
    pub entries_pruned: u64,
}

impl fmt::Display for RestoreReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files copied, {} unchanged, {} directories created, {} links recreated, {} entries pruned",
            self.files_copied,
            self.files_skipped,
            self.dirs_created,
            self.links_recreated,
            self.entries_pruned
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct RestoreEngine {
    differ: ContentDiffer,
}

impl RestoreEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy everything from `target` (the mirror) back onto `source`, then
    /// delete whatever `source` has that the mirror does not.
    pub fn restore(&self, source: &Path, target: &Path) -> Result<RestoreReport> {
        let source = canonical(source)?;
        let target = canonical(target)?;
        if roots_overlap(&source, &target) {
            return Err(MirrorError::RecursiveBackup {
                source_root: source,
                target_root: target,
            });
        }

        info!("Restoring {} from {}", source.display(), target.display());
        let mut report = self.copy_forward(&PathMapper::new(&source, &target))?;
        report.entries_pruned = prune_extraneous(&source, &target)?;

        info!("Restore of {} complete: {}", source.display(), report);
        Ok(report)
    }

    fn copy_forward(&self, mapper: &PathMapper) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();
        let mirror = mapper.target_root();

        for entry in WalkDir::new(mirror).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry under {}: {}", mirror.display(), e);
                    continue;
                }
            };
            let Some(dest) = mapper.to_source(entry.path()) else {
                continue;
            };

            let result = match NodeKind::of(entry.file_type()) {
                NodeKind::Directory => fsops::ensure_dir(&dest).map(|created| {
                    if created {
                        report.dirs_created += 1;
                    }
                }),
                NodeKind::File => self.restore_file(entry.path(), &dest, &mut report),
                NodeKind::Symlink => fsops::copy_symlink(entry.path(), &dest).map(|_| {
                    report.links_recreated += 1;
                }),
                NodeKind::Other => {
                    debug!("Skipping special file {}", entry.path().display());
                    Ok(())
                }
            };

            match result {
                Ok(()) => {}
                Err(e) if fsops::is_vanished(&e) => {
                    trace!("{} vanished during restore", entry.path().display())
                }
                Err(e) if entry.depth() == 0 => return Err(e.into()),
                Err(e) => warn!("Failed to restore {}: {}", dest.display(), e),
            }
        }

        Ok(report)
    }

    fn restore_file(&self, from: &Path, dest: &Path, report: &mut RestoreReport) -> io::Result<()> {
        if fsops::node_kind(dest)? == Some(NodeKind::File) && self.differ.same_content(from, dest) {
            report.files_skipped += 1;
            return Ok(());
        }
        fsops::copy_file(from, dest)?;
        report.files_copied += 1;
        Ok(())
    }
}

/// Delete every entry under `tree` that has no same-named entry under
/// `reference`. Returns how many top-level extraneous nodes were removed;
/// directories go with everything below them.
pub fn prune_extraneous(tree: &Path, reference: &Path) -> io::Result<u64> {
    let mapper = PathMapper::new(tree, reference);
    let mut pruned = 0;

    let mut walker = WalkDir::new(tree).follow_links(false).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                trace!("Skipping unreadable entry under {}: {}", tree.display(), e);
                continue;
            }
        };
        let Some(counterpart) = mapper.to_target(entry.path()) else {
            continue;
        };

        match fsops::node_kind(&counterpart) {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => {
                warn!("Cannot inspect {}, keeping {}: {}", counterpart.display(), entry.path().display(), e);
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }
        }

        if entry.file_type().is_dir() {
            walker.skip_current_dir();
        }
        match fsops::remove_node(entry.path()) {
            Ok(true) => {
                trace!("Pruned {}", entry.path().display());
                pruned += 1;
            }
            Ok(false) => {}
            Err(e) => warn!("Failed to prune {}: {}", entry.path().display(), e),
        }
    }

    Ok(pruned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;
    use std::path::PathBuf;
    use std::time::{Duration, SystemTime};
    use tempfile::{tempdir, TempDir};

    fn roots() -> (TempDir, PathBuf, PathBuf) {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir(&src).unwrap();
        fs::create_dir(&dst).unwrap();
        (dir, src, dst)
    }

    #[test]
    fn test_restore_makes_source_match_mirror() {
        let (_dir, src, dst) = roots();
        fs::create_dir_all(dst.join("docs/deep")).unwrap();
        fs::write(dst.join("docs/deep/a.txt"), b"mirror").unwrap();
        fs::write(dst.join("top.txt"), b"top").unwrap();
        symlink("top.txt", dst.join("link")).unwrap();

        fs::write(src.join("top.txt"), b"diverged").unwrap();
        fs::create_dir_all(src.join("extra/inner")).unwrap();
        fs::write(src.join("extra/inner/x"), b"x").unwrap();
        fs::write(src.join("stray.txt"), b"stray").unwrap();

        let report = RestoreEngine::new().restore(&src, &dst).unwrap();

        assert_eq!(fs::read(src.join("docs/deep/a.txt")).unwrap(), b"mirror");
        assert_eq!(fs::read(src.join("top.txt")).unwrap(), b"top");
        assert_eq!(fs::read_link(src.join("link")).unwrap(), Path::new("top.txt"));
        assert!(!src.join("extra").exists());
        assert!(!src.join("stray.txt").exists());
        assert_eq!(report.files_copied, 2);
        assert_eq!(report.dirs_created, 2);
        assert_eq!(report.links_recreated, 1);
        assert_eq!(report.entries_pruned, 2);
    }

    #[test]
    fn test_repeated_restore_rewrites_nothing() {
        let (_dir, src, dst) = roots();
        fs::create_dir(dst.join("d")).unwrap();
        fs::write(dst.join("d/f"), b"content").unwrap();

        let engine = RestoreEngine::new();
        engine.restore(&src, &dst).unwrap();
        let second = engine.restore(&src, &dst).unwrap();

        assert_eq!(second.files_copied, 0);
        assert_eq!(second.files_skipped, 1);
        assert_eq!(second.dirs_created, 0);
        assert_eq!(second.entries_pruned, 0);
    }

    #[test]
    fn test_matching_digest_is_skipped() {
        let (_dir, src, dst) = roots();
        fs::write(dst.join("same"), b"identical").unwrap();
        fs::write(src.join("same"), b"identical").unwrap();

        // Older mtime on the source copy: only the content decides
        let older = SystemTime::now() - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(src.join("same"))
            .unwrap()
            .set_modified(older)
            .unwrap();
        let before = fs::metadata(src.join("same")).unwrap().modified().unwrap();
        assert_ne!(before, fs::metadata(dst.join("same")).unwrap().modified().unwrap());

        let report = RestoreEngine::new().restore(&src, &dst).unwrap();

        assert_eq!(report.files_skipped, 1);
        assert_eq!(report.files_copied, 0);
        assert_eq!(fs::metadata(src.join("same")).unwrap().modified().unwrap(), before);
    }

    #[test]
    fn test_read_only_mirror_directory_is_restored() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, src, dst) = roots();
        fs::create_dir(dst.join("ro")).unwrap();
        fs::write(dst.join("ro/file.txt"), b"locked").unwrap();
        fs::set_permissions(dst.join("ro"), fs::Permissions::from_mode(0o555)).unwrap();

        let report = RestoreEngine::new().restore(&src, &dst);
        fs::set_permissions(dst.join("ro"), fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(report.unwrap().files_copied, 1);
        assert_eq!(fs::read(src.join("ro/file.txt")).unwrap(), b"locked");
    }

    #[test]
    fn test_type_change_is_replaced() {
        let (_dir, src, dst) = roots();
        fs::create_dir(dst.join("was_file")).unwrap();
        fs::write(dst.join("was_file/child"), b"c").unwrap();
        fs::write(dst.join("was_dir"), b"now a file").unwrap();

        fs::write(src.join("was_file"), b"old").unwrap();
        fs::create_dir_all(src.join("was_dir/sub")).unwrap();

        RestoreEngine::new().restore(&src, &dst).unwrap();

        assert_eq!(fs::read(src.join("was_file/child")).unwrap(), b"c");
        assert_eq!(fs::read(src.join("was_dir")).unwrap(), b"now a file");
    }

    #[test]
    fn test_deleted_in_mirror_is_removed_from_source() {
        let (_dir, src, dst) = roots();
        fs::write(src.join("a.txt"), b"hello").unwrap();
        fs::write(src.join("b.txt"), b"keep").unwrap();
        fs::write(dst.join("b.txt"), b"keep").unwrap();

        RestoreEngine::new().restore(&src, &dst).unwrap();

        assert!(!src.join("a.txt").exists());
        assert_eq!(fs::read(src.join("b.txt")).unwrap(), b"keep");
    }

    #[test]
    fn test_rejects_overlapping_and_missing_roots() {
        let (_dir, src, _dst) = roots();
        fs::create_dir(src.join("inner")).unwrap();
        let engine = RestoreEngine::new();

        assert!(matches!(
            engine.restore(&src, &src.join("inner")),
            Err(MirrorError::RecursiveBackup { .. })
        ));
        assert!(matches!(
            engine.restore(&src, &src),
            Err(MirrorError::RecursiveBackup { .. })
        ));
        assert!(matches!(
            engine.restore(&src, &src.join("missing")),
            Err(MirrorError::Canonicalize { .. })
        ));
        assert!(src.join("inner").exists());
    }

    #[test]
    fn test_prune_extraneous_keeps_counterparts() {
        let (_dir, tree, reference) = roots();
        fs::create_dir_all(tree.join("kept/gone")).unwrap();
        fs::write(tree.join("kept/file"), b"f").unwrap();
        fs::create_dir(reference.join("kept")).unwrap();
        fs::write(reference.join("kept/file"), b"other").unwrap();

        assert_eq!(prune_extraneous(&tree, &reference).unwrap(), 1);
        assert!(tree.join("kept/file").exists());
        assert!(!tree.join("kept/gone").exists());
    }

    #[test]
    fn test_prune_keeps_entries_it_cannot_inspect() {
        let (_dir, tree, reference) = roots();
        fs::create_dir(tree.join("shadowed")).unwrap();
        fs::write(tree.join("shadowed/inner"), b"i").unwrap();
        fs::write(tree.join("stray"), b"s").unwrap();
        // Looking up `shadowed/inner` under the reference fails with ENOTDIR
        fs::write(reference.join("shadowed"), b"file").unwrap();

        assert_eq!(prune_extraneous(&tree, &reference).unwrap(), 1);
        assert!(tree.join("shadowed/inner").exists());
        assert!(!tree.join("stray").exists());
    }
}
