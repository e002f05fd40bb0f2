//! Live one-way directory mirroring driven by inotify, with a hash-checked
//! restore back onto the source.

pub mod api;
pub mod error;
pub mod mirror;
pub mod shell;
pub mod utils;

pub use error::{MirrorError, Result};
