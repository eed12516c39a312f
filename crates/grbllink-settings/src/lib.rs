//! grbllink Settings Crate
//!
//! Handles the communication configuration and machine profiles.

pub mod config;
pub mod error;
pub mod profile;

pub use config::{
    CommConfig, ConnectionSettings, FirmwareSettings, FlowControlSettings, OverrideSettings,
    SettingsSyncSettings, StatusPollSettings, AUTO_PORT,
};
pub use error::{ConfigError, SettingsError, SettingsResult};
pub use profile::{
    GrblProfileSettings, LaserSettings, LegacySettings, MachineProfile, SettingValue,
    VolumeSettings,
};
