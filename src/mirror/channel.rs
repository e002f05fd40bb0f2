//! Linux inotify channel behind the `WatchSource` / `NotificationSource` seams.

use super::events::{ChangeEvent, NotificationSource, OpMask, WatchHandle, WatchSource};
use inotify::{Event, EventMask, Inotify, WatchDescriptor, WatchMask};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::path::Path;
use tracing::trace;

/// Handle carried by queue overflow records, which belong to no watch.
pub const OVERFLOW_HANDLE: WatchHandle = WatchHandle(-1);

/// One event header plus a maximal file name.
const MIN_BUFFER_SIZE: usize = 16 + 256;

fn watch_mask() -> WatchMask {
    WatchMask::CREATE
        | WatchMask::DELETE
        | WatchMask::MODIFY
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::DELETE_SELF
        | WatchMask::ONLYDIR
        | WatchMask::DONT_FOLLOW
}

/// Operations of interest in a kernel event mask. Bits with no counterpart
/// (e.g. a bare `DELETE_SELF`) translate to nothing.
pub fn translate_mask(raw: EventMask) -> OpMask {
    let table = [
        (EventMask::CREATE, OpMask::CREATED),
        (EventMask::DELETE, OpMask::DELETED),
        (EventMask::MODIFY, OpMask::MODIFIED),
        (EventMask::MOVED_FROM, OpMask::RENAMED_FROM),
        (EventMask::MOVED_TO, OpMask::RENAMED_TO),
        (EventMask::IGNORED, OpMask::WATCH_INVALIDATED),
        (EventMask::Q_OVERFLOW, OpMask::OVERFLOW),
    ];

    table
        .iter()
        .filter(|(bit, _)| raw.contains(*bit))
        .fold(OpMask::empty(), |acc, (_, op)| acc | *op)
}

/// Non-blocking inotify instance, its read buffer, and the mapping between
/// kernel watch descriptors and the handles the registry works with.
#[derive(Debug)]
pub struct InotifyChannel {
    inotify: Inotify,
    buffer: Vec<u8>,
    watches: WatchTable,
}

#[derive(Debug, Default)]
struct WatchTable {
    handles: HashMap<WatchDescriptor, WatchHandle>,
    descriptors: HashMap<WatchHandle, WatchDescriptor>,
    next: i32,
}

impl WatchTable {
    fn insert(&mut self, wd: WatchDescriptor) -> WatchHandle {
        // The kernel hands back the existing descriptor for an inode that is
        // already watched
        if let Some(handle) = self.handles.get(&wd) {
            return *handle;
        }

        let handle = WatchHandle(self.next);
        self.next += 1;
        self.handles.insert(wd.clone(), handle);
        self.descriptors.insert(handle, wd);
        handle
    }

    fn release(&mut self, handle: WatchHandle) -> Option<WatchDescriptor> {
        let wd = self.descriptors.remove(&handle)?;
        self.handles.remove(&wd);
        Some(wd)
    }

    fn translate(&mut self, event: Event<&OsStr>) -> Option<ChangeEvent> {
        let mask = translate_mask(event.mask);
        if mask.is_empty() {
            trace!("Ignoring inotify mask {:?}", event.mask);
            return None;
        }

        if mask.contains(OpMask::OVERFLOW) {
            return Some(ChangeEvent {
                handle: OVERFLOW_HANDLE,
                mask,
                name: None,
            });
        }

        let Some(handle) = self.handles.get(&event.wd).copied() else {
            trace!("Dropping event for released watch ({:?})", event.mask);
            return None;
        };
        if mask.contains(OpMask::WATCH_INVALIDATED) {
            self.release(handle);
        }

        Some(ChangeEvent {
            handle,
            mask,
            name: event.name.map(OsStr::to_os_string),
        })
    }
}

impl InotifyChannel {
    pub fn new(buffer_size: usize) -> io::Result<Self> {
        Ok(Self {
            inotify: Inotify::init()?,
            buffer: vec![0u8; buffer_size.max(MIN_BUFFER_SIZE)],
            watches: WatchTable::default(),
        })
    }
}

impl WatchSource for InotifyChannel {
    fn add_watch(&mut self, path: &Path) -> io::Result<WatchHandle> {
        let wd = self.inotify.watches().add(path, watch_mask())?;
        Ok(self.watches.insert(wd))
    }

    fn remove_watch(&mut self, handle: WatchHandle) -> io::Result<()> {
        let wd = self.watches.release(handle).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no active watch {}", handle))
        })?;
        self.inotify.watches().remove(wd)
    }
}

impl NotificationSource for InotifyChannel {
    fn poll_events(&mut self) -> io::Result<Vec<ChangeEvent>> {
        let events = match self.inotify.read_events(&mut self.buffer) {
            Ok(events) => events,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let watches = &mut self.watches;
        Ok(events.filter_map(|event| watches.translate(event)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;

    fn poll_until(channel: &mut InotifyChannel, done: impl Fn(&[ChangeEvent]) -> bool) -> Vec<ChangeEvent> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = Vec::new();
        while !done(&seen) && Instant::now() < deadline {
            seen.extend(channel.poll_events().unwrap());
            std::thread::sleep(Duration::from_millis(10));
        }
        seen
    }

    #[test]
    fn test_translate_mask() {
        assert_eq!(translate_mask(EventMask::CREATE), OpMask::CREATED);
        assert_eq!(
            translate_mask(EventMask::MOVED_FROM | EventMask::MODIFY | EventMask::ISDIR),
            OpMask::RENAMED_FROM | OpMask::MODIFIED
        );
        assert_eq!(translate_mask(EventMask::IGNORED), OpMask::WATCH_INVALIDATED);
        assert_eq!(translate_mask(EventMask::Q_OVERFLOW), OpMask::OVERFLOW);
        assert!(translate_mask(EventMask::DELETE_SELF).is_empty());
    }

    #[test]
    fn test_channel_reports_creation() {
        let dir = tempdir().unwrap();
        let mut channel = InotifyChannel::new(4096).unwrap();
        let handle = channel.add_watch(dir.path()).unwrap();

        assert!(channel.poll_events().unwrap().is_empty());
        fs::write(dir.path().join("new.txt"), b"x").unwrap();

        let seen = poll_until(&mut channel, |events| !events.is_empty());
        let created = seen
            .iter()
            .find(|e| e.mask.contains(OpMask::CREATED))
            .expect("create event");
        assert_eq!(created.handle, handle);
        assert_eq!(created.name.as_deref(), Some(OsStr::new("new.txt")));
    }

    #[test]
    fn test_same_directory_keeps_its_handle() {
        let dir = tempdir().unwrap();
        let mut channel = InotifyChannel::new(4096).unwrap();
        let first = channel.add_watch(dir.path()).unwrap();
        assert_eq!(channel.add_watch(dir.path()).unwrap(), first);

        let other = dir.path().join("other");
        fs::create_dir(&other).unwrap();
        assert_ne!(channel.add_watch(&other).unwrap(), first);
    }

    #[test]
    fn test_deleted_directory_invalidates_its_watch() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();

        let mut channel = InotifyChannel::new(4096).unwrap();
        let handle = channel.add_watch(&sub).unwrap();
        fs::remove_dir(&sub).unwrap();

        let seen = poll_until(&mut channel, |events| {
            events.iter().any(|e| e.mask.contains(OpMask::WATCH_INVALIDATED))
        });
        let invalidated = seen
            .iter()
            .find(|e| e.mask.contains(OpMask::WATCH_INVALIDATED))
            .expect("invalidation event");
        assert_eq!(invalidated.handle, handle);
        assert_eq!(invalidated.name, None);

        // Already released by the kernel
        assert_eq!(
            channel.remove_watch(handle).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn test_removed_watch_goes_quiet() {
        let dir = tempdir().unwrap();
        let mut channel = InotifyChannel::new(4096).unwrap();
        let handle = channel.add_watch(dir.path()).unwrap();
        channel.remove_watch(handle).unwrap();

        fs::write(dir.path().join("late.txt"), b"x").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(channel.poll_events().unwrap().is_empty());
    }

    #[test]
    fn test_watch_rejects_non_directory() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("file");
        fs::write(&file, b"x").unwrap();

        let mut channel = InotifyChannel::new(4096).unwrap();
        assert!(channel.add_watch(&file).is_err());
    }
}
