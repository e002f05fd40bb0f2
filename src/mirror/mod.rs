pub mod channel;
pub mod differ;
pub mod dispatcher;
pub mod events;
pub mod fsops;
pub mod launcher;
pub mod path_map;
pub mod registry;
pub mod restore;
pub mod supervisor;
pub mod worker;

pub use differ::{ContentDiffer, Digest};
pub use dispatcher::{EventDispatcher, MirrorAction};
pub use events::{ChangeEvent, NotificationSource, OpMask, WatchHandle, WatchSource};
pub use channel::InotifyChannel;
pub use launcher::{ProcessLauncher, TaskLauncher, WorkerExit, WorkerHandle, WorkerId, WorkerLauncher};
pub use path_map::PathMapper;
pub use registry::WatchRegistry;
pub use restore::{RestoreEngine, RestoreReport};
pub use supervisor::{BackupSupervisor, PairStatus, SourceGroup, SupervisorHandle};
pub use worker::MirrorWorker;
