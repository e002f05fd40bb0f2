pub mod config;
pub mod logging;
pub mod log_buffer;

pub use config::{Config, IsolationMode, LogFormat};
pub use log_buffer::LogBuffer;
