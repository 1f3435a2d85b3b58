//! Configuration for pulsebridge
//!
//! Stored as TOML in the platform configuration directory. A missing file
//! yields the defaults.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Stream defaults
    pub stream: StreamConfig,
    /// Callback bridge settings
    pub bridge: BridgeConfig,
    /// Debug and logging settings
    pub debug: DebugConfig,
}

/// Defaults used when a stream is opened without explicit parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub channels: u16,
    pub sample_rate: f64,
    pub frames_per_buffer: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            channels: 2,
            sample_rate: 44_100.0,
            frames_per_buffer: 256,
        }
    }
}

/// Callback bridge settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Upper bound on a single fill hand-off. `None` waits forever.
    pub fill_timeout_ms: Option<u64>,
    /// Pending notifications held for the event handler before new ones are dropped
    pub event_queue_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            fill_timeout_ms: None,
            event_queue_capacity: 1024,
        }
    }
}

impl BridgeConfig {
    pub fn fill_timeout(&self) -> Option<Duration> {
        self.fill_timeout_ms.map(Duration::from_millis)
    }
}

/// Log verbosity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Debug settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: LogLevel,
    pub log_to_file: bool,
    pub log_path: PathBuf,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_to_file: false,
            log_path: PathBuf::from("pulsebridge.log"),
        }
    }
}

impl Config {
    /// Path of the configuration file
    pub fn path() -> Result<PathBuf, ConfigError> {
        let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(dir.join("pulsebridge").join("config.toml"))
    }

    /// Load the configuration, falling back to defaults if no file exists
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(&path)?;
        Self::from_toml(&text)
    }

    /// Parse a configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Save the configuration
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = Self::path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}
