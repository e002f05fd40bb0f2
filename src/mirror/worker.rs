//! Per-pair control loop: initial copy, then change propagation until told
//! to stop.

use super::dispatcher::EventDispatcher;
use super::events::NotificationSource;
use super::fsops;
use super::channel::InotifyChannel;
use super::path_map::PathMapper;
use super::registry::WatchRegistry;
use crate::error::{MirrorError, Result};
use crate::utils::Config;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct MirrorWorker {
    source_root: PathBuf,
    target_root: PathBuf,
    max_watches: usize,
    poll_interval: Duration,
    event_buffer_size: usize,
}

impl MirrorWorker {
    pub fn new(source_root: &Path, target_root: &Path, config: &Config) -> Self {
        Self {
            source_root: source_root.to_path_buf(),
            target_root: target_root.to_path_buf(),
            max_watches: config.max_watches,
            poll_interval: config.poll_interval(),
            event_buffer_size: config.event_buffer_size,
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn target_root(&self) -> &Path {
        &self.target_root
    }

    /// Mirror against the kernel's inotify until `stop` is raised.
    pub fn run(&self, stop: &AtomicBool) -> Result<()> {
        self.initial_copy()?;
        let channel = InotifyChannel::new(self.event_buffer_size).map_err(MirrorError::Notification)?;
        self.watch(channel, stop)
    }

    pub fn initial_copy(&self) -> Result<()> {
        let stats = fsops::copy_node(&self.source_root, &self.target_root)?;
        info!(
            "Initial copy of {} done: {} files, {} directories, {} links, {} bytes",
            self.source_root.display(),
            stats.files,
            stats.directories,
            stats.symlinks,
            stats.bytes
        );
        Ok(())
    }

    /// Register watches on the source tree, then consume events from
    /// `source` in arrival order until `stop` is raised.
    pub fn watch<S: NotificationSource>(&self, mut source: S, stop: &AtomicBool) -> Result<()> {
        let mut registry = WatchRegistry::new(self.max_watches);
        let watched = registry.register_recursive(&mut source, &self.source_root);
        info!("Watching {} directories under {}", watched, self.source_root.display());

        let dispatcher = EventDispatcher::new(PathMapper::new(&self.source_root, &self.target_root));

        while !stop.load(Ordering::Relaxed) {
            let batch = source.poll_events().map_err(MirrorError::Notification)?;
            if batch.is_empty() {
                thread::sleep(self.poll_interval);
                continue;
            }

            debug!("Dispatching {} events", batch.len());
            for event in &batch {
                dispatcher.dispatch(event, &mut registry, &mut source);
            }
        }

        info!("Stopped mirroring {}", self.source_root.display());
        Ok(())
    }
}
