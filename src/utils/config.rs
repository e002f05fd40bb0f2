use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Smallest buffer able to hold one inotify record with a maximal file name.
pub const MIN_EVENT_BUFFER: usize = 16 + 256;

/// How each backup pair's worker is isolated from the supervisor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// One child process per pair.
    #[default]
    Process,
    /// One blocking-pool thread per pair, stopped through a flag.
    Task,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of concurrently active backup pairs
    pub max_backups: usize,

    /// Maximum number of watched directories per worker
    pub max_watches: usize,

    /// Backoff between empty reads of the notification channel
    pub poll_interval_ms: u64,

    /// Bytes read from the notification channel per batch
    pub event_buffer_size: usize,

    /// How long a worker gets to exit after SIGTERM before it is killed
    pub termination_grace_ms: u64,

    /// Worker isolation backend
    pub isolation: IsolationMode,

    /// Listen address for `serve`
    pub api_bind: String,

    /// Default tracing filter, overridden by RUST_LOG
    pub log_filter: String,

    pub log_format: LogFormat,

    /// Entries kept in the in-memory activity log
    pub activity_log_entries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_backups: 32,
            max_watches: 1024,
            poll_interval_ms: 100,
            event_buffer_size: 4096,
            termination_grace_ms: 5000,
            isolation: IsolationMode::Process,
            api_bind: "127.0.0.1:8888".to_string(),
            log_filter: "info".to_string(),
            log_format: LogFormat::Text,
            activity_log_entries: 1000,
        }
    }
}

impl Config {
    /// Load config from defaults, an optional TOML file and `MIRROR_*`
    /// environment variables, in that order of precedence.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => Some((p.to_path_buf(), true)),
            None => default_config_path().map(|p| (p, false)),
        };

        let mut builder = config::Config::builder();
        if let Some((file, required)) = file {
            builder = builder.add_source(config::File::from(file).required(required));
        }
        builder = builder.add_source(config::Environment::with_prefix("MIRROR").try_parsing(true));

        let mut config: Config = builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")?;

        config.normalize();
        Ok(config)
    }

    fn normalize(&mut self) {
        if self.event_buffer_size < MIN_EVENT_BUFFER {
            self.event_buffer_size = MIN_EVENT_BUFFER;
        }
        if self.poll_interval_ms == 0 {
            self.poll_interval_ms = 1;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("dirmirror").join("config.toml"))
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    Config::load(path)
}
