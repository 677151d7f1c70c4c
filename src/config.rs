//! Server configuration
//!
//! Tunables for the audio loops plus the defaults the daemon opens its
//! streams with. Loaded from TOML; every field has a default so partial
//! files are fine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants;
use crate::error::{Error, Result};
use crate::protocol::{AudioFormat, StreamConfig};
use crate::threads::backoff::UnderrunBackoff;

/// Which hardware backend the daemon drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// In-memory device pacing itself in real time
    #[default]
    Memory,
    /// System sound card (requires the `cpal-backend` feature)
    Cpal,
}

/// Server-wide tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Idle time before an output enters standby
    pub standby_delay_ms: u64,
    /// Cycles an active track may underrun before eviction
    pub max_track_retries: u32,
    /// Same, for a track that has never been mixed
    pub max_track_startup_retries: u32,
    /// First sleep after a cycle with nothing to mix
    pub underrun_backoff_base_us: u64,
    /// Upper bound for the underrun sleep
    pub underrun_backoff_max_us: u64,
    /// Overflow chunks a duplication sink may queue
    pub max_overflow_buffers: usize,
    /// Shared memory granted to each client process
    pub client_heap_size: usize,
    /// Attempts to take a lock while dumping
    pub dump_lock_retries: u32,
    pub dump_lock_sleep_ms: u64,
    /// Mute all outputs by policy
    pub silent_mode: bool,
    /// Sleep after a capture client failed to drain its buffer
    pub record_overflow_sleep_ms: u64,
    pub daemon: DaemonConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            standby_delay_ms: constants::STANDBY_DELAY.as_millis() as u64,
            max_track_retries: constants::MAX_TRACK_RETRIES,
            max_track_startup_retries: constants::MAX_TRACK_STARTUP_RETRIES,
            underrun_backoff_base_us: constants::BUFFER_RECOVERY.as_micros() as u64,
            underrun_backoff_max_us: constants::MAX_BUFFER_RECOVERY.as_micros() as u64,
            max_overflow_buffers: constants::MAX_OVERFLOW_BUFFERS,
            client_heap_size: constants::CLIENT_HEAP_SIZE,
            dump_lock_retries: constants::DUMP_LOCK_RETRIES,
            dump_lock_sleep_ms: constants::DUMP_LOCK_SLEEP.as_millis() as u64,
            silent_mode: false,
            record_overflow_sleep_ms: constants::RECORD_OVERFLOW_SLEEP.as_millis() as u64,
            daemon: DaemonConfig::default(),
        }
    }
}

/// Streams the daemon binary opens at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub backend: Backend,
    pub output: StreamConfig,
    pub output_frame_count: usize,
    pub input: StreamConfig,
    pub input_frame_count: usize,
    /// Seconds between diagnostic dumps in the log; 0 disables them
    pub dump_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            output: StreamConfig::new(constants::DEFAULT_SAMPLE_RATE, AudioFormat::Pcm16, 2),
            output_frame_count: constants::DEFAULT_FRAME_COUNT,
            input: StreamConfig::new(constants::DEFAULT_SAMPLE_RATE, AudioFormat::Pcm16, 2),
            input_frame_count: constants::DEFAULT_FRAME_COUNT,
            dump_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Parse a TOML document
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: ServerConfig =
            toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// `<config dir>/audiomux/server.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("org", "audiomux", "audiomux")
            .map(|dirs| dirs.config_dir().join("server.toml"))
    }

    /// Load `path` (or the default path); defaults when the file is absent
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        tracing::info!("Loading config from {}", path.display());
        Self::load(&path)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_track_retries == 0 || self.max_track_startup_retries == 0 {
            return Err(Error::Config("track retries must be at least 1".into()));
        }
        if self.underrun_backoff_max_us < self.underrun_backoff_base_us {
            return Err(Error::Config(format!(
                "underrun backoff cap {}us is below its base {}us",
                self.underrun_backoff_max_us, self.underrun_backoff_base_us
            )));
        }
        if self.client_heap_size == 0 {
            return Err(Error::Config("client heap size must be non-zero".into()));
        }
        Ok(())
    }

    pub fn standby_delay(&self) -> Duration {
        Duration::from_millis(self.standby_delay_ms)
    }

    pub fn dump_lock_sleep(&self) -> Duration {
        Duration::from_millis(self.dump_lock_sleep_ms)
    }

    pub fn record_overflow_sleep(&self) -> Duration {
        Duration::from_millis(self.record_overflow_sleep_ms)
    }

    pub fn underrun_backoff(&self) -> UnderrunBackoff {
        UnderrunBackoff::new(
            Duration::from_micros(self.underrun_backoff_base_us),
            Duration::from_micros(self.underrun_backoff_max_us),
        )
    }
}
