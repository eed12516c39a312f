//! Machine profile
//!
//! The profile describes one physical machine: its working volume, the
//! laser intensity ceiling, where the head parks after a job and which GRBL
//! settings the firmware is expected to hold.

use crate::config::{read_document, write_document};
use crate::error::{ConfigError, SettingsResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// A numeric GRBL setting value
///
/// GRBL prints integers without a decimal point; everything else is a float.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    /// Integer value, e.g. `$22=1`
    Int(i64),
    /// Float value, e.g. `$110=5000.000`
    Float(f64),
}

impl SettingValue {
    /// Parse a value the way GRBL prints it
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.contains('.') {
            raw.parse::<f64>().ok().map(Self::Float)
        } else {
            raw.parse::<i64>()
                .map(Self::Int)
                .ok()
                .or_else(|| raw.parse::<f64>().ok().map(Self::Float))
        }
    }

    /// Numeric value
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }
}

impl PartialEq for SettingValue {
    fn eq(&self, other: &Self) -> bool {
        self.as_f64() == other.as_f64()
    }
}

impl fmt::Display for SettingValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Laser limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaserSettings {
    /// Highest `S` value ever sent
    pub intensity_limit: u32,
}

impl Default for LaserSettings {
    fn default() -> Self {
        Self {
            intensity_limit: 1300,
        }
    }
}

/// Working volume in millimetres
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSettings {
    /// Width of the working area
    pub width: f64,
    /// Depth of the working area
    pub depth: f64,
    /// X offset of the working area
    pub working_area_shift_x: f64,
    /// Y offset of the working area
    pub working_area_shift_y: f64,
}

impl Default for VolumeSettings {
    fn default() -> Self {
        Self {
            width: 500.0,
            depth: 390.0,
            working_area_shift_x: 0.0,
            working_area_shift_y: 0.0,
        }
    }
}

/// Settings kept for older machines
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacySettings {
    /// Explicit park position on X after a job
    pub job_done_home_position_x: Option<f64>,
}

/// Expected firmware state
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GrblProfileSettings {
    /// Number of settings the firmware reports for `$$`
    pub settings_count: usize,
    /// Expected values keyed by setting id
    pub settings: BTreeMap<String, SettingValue>,
    /// Firmware image to flash on the next connect
    pub auto_update_file: Option<String>,
    /// Version that image contains
    pub auto_update_version: Option<String>,
}

/// Profile of one machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineProfile {
    /// Display name
    pub name: String,
    /// Laser limits
    pub laser: LaserSettings,
    /// Working volume
    pub volume: VolumeSettings,
    /// Legacy options
    pub legacy: LegacySettings,
    /// Expected firmware settings
    pub grbl: GrblProfileSettings,
}

impl Default for MachineProfile {
    fn default() -> Self {
        Self {
            name: "Default".to_string(),
            laser: LaserSettings::default(),
            volume: VolumeSettings::default(),
            legacy: LegacySettings::default(),
            grbl: GrblProfileSettings::default(),
        }
    }
}

impl MachineProfile {
    /// Load a profile from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let profile: Self = read_document(path)?;
        profile.expected_settings()?;
        Ok(profile)
    }

    /// Save a profile to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        write_document(path, self)
    }

    /// Where the head parks once a job is done
    pub fn home_position(&self) -> (f64, f64) {
        let x = self
            .legacy
            .job_done_home_position_x
            .unwrap_or(self.volume.width + self.volume.working_area_shift_x);
        let y = self.volume.depth + self.volume.working_area_shift_y;
        (x, y)
    }

    /// Expected settings keyed by numeric id
    pub fn expected_settings(&self) -> Result<BTreeMap<u32, SettingValue>, ConfigError> {
        self.grbl
            .settings
            .iter()
            .map(|(key, value)| {
                key.trim_start_matches('$')
                    .parse::<u32>()
                    .map(|id| (id, *value))
                    .map_err(|_| ConfigError::ValueOutOfRange {
                        key: format!("grbl.settings.{}", key),
                        value: value.to_string(),
                    })
            })
            .collect()
    }

    /// Set an expected setting
    pub fn set_expected_setting(&mut self, id: u32, value: SettingValue) {
        self.grbl.settings.insert(id.to_string(), value);
    }

    /// Forget a pending firmware auto-update
    pub fn clear_auto_update(&mut self) {
        self.grbl.auto_update_file = None;
        self.grbl.auto_update_version = None;
    }
}
