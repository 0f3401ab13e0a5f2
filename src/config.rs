// src/config.rs

//! Manages the backup subsystem configuration: loading, defaulting, and
//! validation of the buffer, write-size, and disk-speed parameters.

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// One 32-bit word, the addressing unit of every backup buffer and file.
pub const WORD_BYTES: usize = 4;

fn default_data_buffer_size() -> usize {
    16 * 1024 * 1024
}
fn default_log_buffer_size() -> usize {
    16 * 1024 * 1024
}
fn default_min_write_size() -> usize {
    256 * 1024
}
fn default_max_write_size() -> usize {
    1024 * 1024
}
fn default_disk_sync_size() -> usize {
    4 * 1024 * 1024
}
fn default_disk_write_speed() -> usize {
    10 * 1024 * 1024
}
fn default_rate_tick() -> Duration {
    Duration::from_millis(100)
}
fn default_monitor_window() -> Duration {
    Duration::from_secs(1)
}

/// Configuration of the backup subsystem on one data node.
///
/// All sizes are in bytes; they are converted to 32-bit words internally.
/// Deserialized from the node's TOML configuration file under `[backup]`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct BackupConfig {
    /// Size of the data-file FlowBuffer.
    #[serde(default = "default_data_buffer_size")]
    pub data_buffer_size: usize,

    /// Size of the log-file FlowBuffer.
    #[serde(default = "default_log_buffer_size")]
    pub log_buffer_size: usize,

    /// Minimum file write size; reads from a FlowBuffer are at least this big.
    #[serde(default = "default_min_write_size")]
    pub min_write_size: usize,

    /// Maximum file write size; single reads from a FlowBuffer never exceed it.
    #[serde(default = "default_max_write_size")]
    pub max_write_size: usize,

    /// File-system auto-sync threshold for backup files.
    #[serde(default = "default_disk_sync_size")]
    pub disk_sync_size: usize,

    /// Ceiling on average bytes/second written to backup files on this node.
    #[serde(default = "default_disk_write_speed")]
    pub disk_write_speed: usize,

    /// Open data and redo-log files with compression.
    #[serde(default)]
    pub compressed_backup: bool,

    /// Open the data file with direct I/O.
    #[serde(default)]
    pub o_direct: bool,

    /// A diskless node rejects backup requests outright.
    #[serde(default)]
    pub diskless: bool,

    /// Period of the write-rate governor control loop.
    #[serde(default = "default_rate_tick", with = "humantime_serde")]
    pub rate_tick: Duration,

    /// Length of the disk-speed monitoring window; must be >= 1 second.
    #[serde(default = "default_monitor_window", with = "humantime_serde")]
    pub monitor_window: Duration,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            data_buffer_size: default_data_buffer_size(),
            log_buffer_size: default_log_buffer_size(),
            min_write_size: default_min_write_size(),
            max_write_size: default_max_write_size(),
            disk_sync_size: default_disk_sync_size(),
            disk_write_speed: default_disk_write_speed(),
            compressed_backup: false,
            o_direct: false,
            diskless: false,
            rate_tick: default_rate_tick(),
            monitor_window: default_monitor_window(),
        }
    }
}

impl BackupConfig {
    /// Loads the configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| anyhow!("could not read config file '{path}': {e}"))?;
        let config: BackupConfig = toml::from_str(&contents)
            .map_err(|e| anyhow!("could not parse config file '{path}': {e}"))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.min_write_size == 0 || self.min_write_size % WORD_BYTES != 0 {
            return Err(anyhow!(
                "min-write-size must be a non-zero multiple of {WORD_BYTES} bytes"
            ));
        }
        if self.max_write_size < self.min_write_size {
            return Err(anyhow!("max-write-size must be >= min-write-size"));
        }
        if self.data_buffer_size < 2 * self.max_write_size {
            return Err(anyhow!(
                "data-buffer-size must hold at least two maximum writes"
            ));
        }
        if self.log_buffer_size < 2 * self.max_write_size {
            return Err(anyhow!(
                "log-buffer-size must hold at least two maximum writes"
            ));
        }
        if self.disk_write_speed == 0 {
            return Err(anyhow!("disk-write-speed must be non-zero"));
        }
        if self.monitor_window < Duration::from_secs(1) {
            return Err(anyhow!("monitor-window must be at least one second"));
        }
        Ok(())
    }

    /// Data-file FlowBuffer size in words.
    pub fn data_buffer_words(&self) -> usize {
        self.data_buffer_size / WORD_BYTES
    }

    /// Log-file FlowBuffer size in words.
    pub fn log_buffer_words(&self) -> usize {
        self.log_buffer_size / WORD_BYTES
    }

    /// Minimum read window in words.
    pub fn min_write_words(&self) -> usize {
        self.min_write_size / WORD_BYTES
    }

    /// Maximum read window in words.
    pub fn max_write_words(&self) -> usize {
        self.max_write_size / WORD_BYTES
    }

    /// The governor quota in words per control period.
    pub fn speed_words_per_tick(&self) -> u64 {
        let per_sec = (self.disk_write_speed / WORD_BYTES) as u64;
        let tick_ms = self.rate_tick.as_millis().max(1) as u64;
        (per_sec * tick_ms) / 1000
    }
}
