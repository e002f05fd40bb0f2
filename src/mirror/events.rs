//! Change notifications as the dispatcher sees them, and the seams to the
//! kernel notification source.

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::ops::BitOr;
use std::path::Path;

/// Opaque identifier the notification source hands out per watched directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(pub i32);

impl fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wd{}", self.0)
    }
}

/// Set of operations carried by one notification record.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct OpMask(u8);

impl OpMask {
    pub const CREATED: OpMask = OpMask(1 << 0);
    pub const DELETED: OpMask = OpMask(1 << 1);
    pub const MODIFIED: OpMask = OpMask(1 << 2);
    pub const RENAMED_FROM: OpMask = OpMask(1 << 3);
    pub const RENAMED_TO: OpMask = OpMask(1 << 4);
    pub const WATCH_INVALIDATED: OpMask = OpMask(1 << 5);
    /// The kernel dropped events; the mirror may have diverged.
    pub const OVERFLOW: OpMask = OpMask(1 << 6);

    const NAMES: [(OpMask, &'static str); 7] = [
        (OpMask::CREATED, "Created"),
        (OpMask::DELETED, "Deleted"),
        (OpMask::MODIFIED, "Modified"),
        (OpMask::RENAMED_FROM, "RenamedFrom"),
        (OpMask::RENAMED_TO, "RenamedTo"),
        (OpMask::WATCH_INVALIDATED, "WatchInvalidated"),
        (OpMask::OVERFLOW, "Overflow"),
    ];

    pub const fn empty() -> Self {
        OpMask(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// All bits of `other` are set.
    pub const fn contains(self, other: OpMask) -> bool {
        self.0 & other.0 == other.0
    }

    /// Any bit of `other` is set.
    pub const fn intersects(self, other: OpMask) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for OpMask {
    type Output = OpMask;

    fn bitor(self, rhs: OpMask) -> OpMask {
        OpMask(self.0 | rhs.0)
    }
}

impl fmt::Debug for OpMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "OpMask({})", names.join(" | "))
    }
}

/// One decoded notification record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub handle: WatchHandle,
    pub mask: OpMask,
    /// Child name relative to the watched directory; `None` when the event
    /// is about the watched directory itself.
    pub name: Option<OsString>,
}

impl ChangeEvent {
    pub fn new(handle: WatchHandle, mask: OpMask, name: Option<&str>) -> Self {
        Self {
            handle,
            mask,
            name: name.map(OsString::from),
        }
    }
}

/// Something that can start and stop monitoring directories.
pub trait WatchSource {
    fn add_watch(&mut self, path: &Path) -> io::Result<WatchHandle>;

    fn remove_watch(&mut self, handle: WatchHandle) -> io::Result<()>;
}

/// A watch source that also delivers change records.
pub trait NotificationSource: WatchSource {
    /// Non-blocking read of the next batch. An empty batch means nothing is
    /// pending right now.
    fn poll_events(&mut self) -> io::Result<Vec<ChangeEvent>>;
}
