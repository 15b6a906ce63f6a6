//! Configuration types and loading for the ORCA Deck daemon.
//!
//! Configuration is loaded from `~/.config/orca-deck/config.toml`.
//!
//! # Error Handling
//!
//! - If the config file doesn't exist, default values are returned.
//! - If the config file exists but is invalid, an error is returned (fail fast).
//!
//! # Example Configuration
//!
//! ```toml
//! [device]
//! port = "/dev/ttyACM0"
//! baud_rate = 115200
//! read_timeout_ms = 1000
//! reconnect_backoff_secs = 2
//!
//! [icon]
//! settle_delay_ms = 500
//! chunk_delay_ms = 100
//! chunk_size = 32
//!
//! [lock]
//! auto_lock_minutes = 15
//! poll_interval_secs = 5
//! idle_source = "serial"      # or "os"
//! idle_command = ["xprintidle"] # prints OS idle milliseconds; used when idle_source = "os"
//! trust_device_unlock = false # honor RFID_UNLOCK_OK from the keypad
//!
//! [automation]
//! paste_via_clipboard = false
//! opener = "xdg-open"
//!
//! [storage]
//! data_dir = "/home/me/.local/share/orca-deck"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The file parsed but its values contradict each other.
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub icon: IconConfig,
    pub lock: LockConfig,
    pub automation: AutomationConfig,
    pub storage: StorageConfig,
}

/// Serial link settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device path, e.g. `/dev/ttyACM0`. When unset the daemon keeps retrying
    /// and stays disconnected.
    pub port: Option<String>,
    /// Baud rate (default: 115200).
    pub baud_rate: u32,
    /// Per-read timeout in milliseconds (default: 1000).
    pub read_timeout_ms: u64,
    /// Delay between connection attempts in seconds (default: 2).
    pub reconnect_backoff_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            read_timeout_ms: 1000,
            reconnect_backoff_secs: 2,
        }
    }
}

impl DeviceConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }
}

/// Pacing of the icon upload sub-protocol.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IconConfig {
    /// Pause after `ICON_START` and before `ICON_END` (default: 500 ms).
    pub settle_delay_ms: u64,
    /// Pause between `ICON_DATA` chunks (default: 100 ms).
    pub chunk_delay_ms: u64,
    /// Bytes per `ICON_DATA` line (default: 32).
    pub chunk_size: usize,
}

impl Default for IconConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            chunk_delay_ms: 100,
            chunk_size: 32,
        }
    }
}

impl IconConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }
}

/// Where idle time is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IdleSource {
    /// Time since the last keypad event or unlock.
    #[default]
    Serial,
    /// OS-reported input idle time, when a probe is available.
    Os,
}

/// Lock and auto-lock settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Idle minutes before locking (default: 15). Zero disables auto-lock.
    pub auto_lock_minutes: u64,
    /// How often the idle check runs, in seconds (default: 5).
    pub poll_interval_secs: u64,
    pub idle_source: IdleSource,
    /// Command that prints the OS idle time in milliseconds.
    pub idle_command: Vec<String>,
    /// Unlock on `RFID_UNLOCK_OK` reported by the keypad itself (default: false).
    pub trust_device_unlock: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            auto_lock_minutes: 15,
            poll_interval_secs: 5,
            idle_source: IdleSource::Serial,
            idle_command: vec!["xprintidle".to_string()],
            trust_device_unlock: false,
        }
    }
}

impl LockConfig {
    /// `None` when auto-lock is disabled.
    pub fn auto_lock_after(&self) -> Option<Duration> {
        (self.auto_lock_minutes > 0).then(|| Duration::from_secs(self.auto_lock_minutes * 60))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// OS automation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    /// Paste the password through the clipboard instead of typing it.
    pub paste_via_clipboard: bool,
    /// Program used to open paths and URLs.
    pub opener: String,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            paste_via_clipboard: false,
            opener: default_opener().to_string(),
        }
    }
}

fn default_opener() -> &'static str {
    if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory. Defaults to `~/.local/share/orca-deck`.
    pub data_dir: Option<PathBuf>,
}

impl Config {
    /// Returns `~/.config/orca-deck/config.toml`, or `None` if the config
    /// directory cannot be determined.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("orca-deck").join("config.toml"))
    }

    /// Load configuration from the default path.
    ///
    /// - Returns `Ok(Config::default())` if no config file exists.
    /// - Returns `Err` if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check settings that depend on each other.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let command_missing = self
            .lock
            .idle_command
            .first()
            .map_or(true, |program| program.trim().is_empty());
        if self.lock.idle_source == IdleSource::Os && command_missing {
            return Err(ConfigError::Invalid(
                "[lock] idle_source = \"os\" needs an idle_command".to_string(),
            ));
        }
        Ok(())
    }

    /// The effective data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.storage.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("orca-deck")
        })
    }
}
