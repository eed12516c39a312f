//! Communication configuration
//!
//! Provides configuration file handling and validation for the serial link,
//! flow control, status polling, overrides, settings synchronization and
//! firmware flashing. Supports JSON and TOML file formats; the default file
//! lives in the platform-specific configuration directory.

use crate::error::{ConfigError, SettingsError, SettingsResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Port name that requests auto-detection
pub const AUTO_PORT: &str = "AUTO";

/// Serial connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Serial port, empty or `AUTO` to detect
    pub port: String,
    /// Baud rate, 0 selects the default rate
    pub baud_rate: u32,
    /// Open at odd parity first, then switch to none
    pub parity_handshake: bool,
    /// Read timeout of the serial handle in milliseconds
    pub read_timeout_ms: u64,
    /// Silence while connecting before a soft reset is sent
    pub connect_timeout_ms: u64,
    /// Send a soft reset right after opening the port
    pub reset_on_connect: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: AUTO_PORT.to_string(),
            baud_rate: 0,
            parity_handshake: true,
            read_timeout_ms: 10,
            connect_timeout_ms: 2000,
            reset_on_connect: false,
        }
    }
}

impl ConnectionSettings {
    /// Whether the port should be auto-detected
    pub fn wants_port_detection(&self) -> bool {
        self.port.is_empty() || self.port.eq_ignore_ascii_case(AUTO_PORT)
    }

    /// Read timeout as a duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Connect silence timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Firmware receive buffer accounting
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowControlSettings {
    /// Size of the firmware receive buffer in bytes
    pub rx_buffer_size: usize,
    /// Bytes kept free as headroom
    pub safety_margin: usize,
}

impl Default for FlowControlSettings {
    fn default() -> Self {
        Self {
            rx_buffer_size: 127,
            safety_margin: 5,
        }
    }
}

impl FlowControlSettings {
    /// Usable part of the receive buffer
    pub fn working_buffer_size(&self) -> usize {
        self.rx_buffer_size.saturating_sub(self.safety_margin)
    }
}

/// Status poll intervals in seconds per state
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusPollSettings {
    /// Interval while operational
    pub operational: f64,
    /// Interval while printing
    pub printing: f64,
    /// Interval while paused
    pub paused: f64,
    /// Interval while a FLUSH or SYNC barrier is pending
    pub syncing: f64,
}

impl Default for StatusPollSettings {
    fn default() -> Self {
        Self {
            operational: 2.0,
            printing: 5.0,
            paused: 0.2,
            syncing: 0.2,
        }
    }
}

/// Feedrate limits applied when rewriting `F` tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverrideSettings {
    /// Lowest feedrate sent to the firmware
    pub feedrate_min: u32,
    /// Highest feedrate sent to the firmware
    pub feedrate_max: u32,
}

impl Default for OverrideSettings {
    fn default() -> Self {
        Self {
            feedrate_min: 30,
            feedrate_max: 5000,
        }
    }
}

/// Timing of the settings verification cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsSyncSettings {
    /// Window in which the `$$` dump must arrive
    pub read_window_secs: f64,
    /// How often the table is checked while waiting
    pub check_interval_secs: f64,
    /// Correction rounds after the first one
    pub retries: u32,
    /// Pause between correction rounds
    pub retry_backoff_secs: f64,
}

impl Default for SettingsSyncSettings {
    fn default() -> Self {
        Self {
            read_window_secs: 10.0,
            check_interval_secs: 0.5,
            retries: 3,
            retry_backoff_secs: 2.0,
        }
    }
}

impl SettingsSyncSettings {
    /// Read window as a duration
    pub fn read_window(&self) -> Duration {
        Duration::from_secs_f64(self.read_window_secs)
    }

    /// Check interval as a duration
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs_f64(self.check_interval_secs)
    }

    /// Back-off as a duration
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.retry_backoff_secs)
    }
}

/// Firmware programmer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareSettings {
    /// Directory holding firmware images
    pub directory: PathBuf,
    /// Programmer executable
    pub programmer: String,
    /// Target part passed to the programmer
    pub part: String,
    /// Programmer protocol
    pub protocol: String,
}

impl Default for FirmwareSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("firmware"),
            programmer: "avrdude".to_string(),
            part: "atmega328p".to_string(),
            protocol: "arduino".to_string(),
        }
    }
}

/// Complete communication configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    /// Serial connection
    pub connection: ConnectionSettings,
    /// Flow control
    pub flow: FlowControlSettings,
    /// Status polling
    pub status_poll: StatusPollSettings,
    /// Feedrate limits
    pub overrides: OverrideSettings,
    /// Settings verification
    pub settings_sync: SettingsSyncSettings,
    /// Firmware flashing
    pub firmware: FirmwareSettings,
}

impl CommConfig {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Default location of the configuration file
    pub fn default_path() -> SettingsResult<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join("grbllink").join("config.toml"))
            .ok_or_else(|| {
                SettingsError::ConfigDirectory("no configuration directory on this platform".into())
            })
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let config: Self = read_document(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;
        write_document(path, self)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flow.working_buffer_size() < 2 {
            return Err(out_of_range("flow.safety_margin", self.flow.safety_margin));
        }

        let poll = &self.status_poll;
        for (key, value) in [
            ("status_poll.operational", poll.operational),
            ("status_poll.printing", poll.printing),
            ("status_poll.paused", poll.paused),
            ("status_poll.syncing", poll.syncing),
        ] {
            if !(value > 0.0) {
                return Err(out_of_range(key, value));
            }
        }

        if self.overrides.feedrate_min > self.overrides.feedrate_max {
            return Err(out_of_range(
                "overrides.feedrate_min",
                self.overrides.feedrate_min,
            ));
        }

        let sync = &self.settings_sync;
        if !(sync.check_interval_secs > 0.0) {
            return Err(out_of_range(
                "settings_sync.check_interval_secs",
                sync.check_interval_secs,
            ));
        }
        if sync.read_window_secs < sync.check_interval_secs {
            return Err(out_of_range(
                "settings_sync.read_window_secs",
                sync.read_window_secs,
            ));
        }
        if sync.retry_backoff_secs < 0.0 {
            return Err(out_of_range(
                "settings_sync.retry_backoff_secs",
                sync.retry_backoff_secs,
            ));
        }

        Ok(())
    }
}

fn out_of_range(key: &str, value: impl ToString) -> ConfigError {
    ConfigError::ValueOutOfRange {
        key: key.to_string(),
        value: value.to_string(),
    }
}

pub(crate) fn read_document<T: DeserializeOwned>(path: &Path) -> SettingsResult<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| SettingsError::LoadError(format!("{}: {}", path.display(), e)))?;

    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Ok(serde_json::from_str(&content)?),
        Some("toml") => Ok(toml::from_str(&content)?),
        other => Err(ConfigError::UnsupportedFormat(other.unwrap_or("").to_string()).into()),
    }
}

pub(crate) fn write_document<T: Serialize>(path: &Path, value: &T) -> SettingsResult<()> {
    let content = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::to_string_pretty(value)?,
        Some("toml") => toml::to_string_pretty(value)?,
        other => {
            return Err(ConfigError::UnsupportedFormat(other.unwrap_or("").to_string()).into())
        }
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)
        .map_err(|e| SettingsError::SaveError(format!("{}: {}", path.display(), e)))
}
