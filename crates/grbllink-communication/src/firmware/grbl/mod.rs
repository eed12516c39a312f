//! GRBL protocol support
//!
//! Parsers for every line class GRBL emits, the settings synchronizer, the
//! outgoing command pipeline, buffer diagnostics and the controller that runs
//! the reader, writer and status poll threads.

pub mod command_pipeline;
pub mod controller;
pub mod error_decoder;
pub mod meta_commands;
mod reader;
pub mod response_parser;
pub mod rx_stats;
pub mod settings;
pub mod state_machine;
pub mod status_parser;
pub mod tracker;
mod writer;

pub use command_pipeline::{CommandClass, CommandPipeline, Phase, PhaseOutcome};
pub use controller::{GrblController, GrblControllerBuilder, WriteOutcome};
pub use meta_commands::MetaCommand;
pub use response_parser::GrblResponse;
pub use rx_stats::RxBufferStats;
pub use settings::{GrblSettingsTable, SettingsSynchronizer, SettingsVerification};
pub use state_machine::StateMachine;
pub use status_parser::{StatusParser, StatusReport};
pub use tracker::{PauseDecision, PositionTracker};

/// Build without limit reporting and without rescue support
pub const GRBL_VERSION_20170919_22270FA: &str = "0.9g_22270fa";
/// First build that can rescue the head from the limit switches
pub const GRBL_VERSION_20180223_61638C5: &str = "0.9g_20180223_61638c5";
/// First build reporting free receive buffer with `ok:N`
pub const GRBL_VERSION_20180828_AC367FF: &str = "0.9g_20180828_ac367ff";
/// Current build
pub const GRBL_VERSION_20181116_A437781: &str = "0.9g_20181116_a437781";

/// Features that depend on the firmware build
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FirmwareInfo {
    /// Version from the startup banner
    pub version: Option<String>,
    /// Whether the head can be moved off the limit switches
    pub rescue_from_home: bool,
    /// Whether `ok` carries the free receive buffer
    pub reports_rx_buffer: bool,
    /// Whether status lines omit the `limits:` field
    pub legacy_status: bool,
}

impl FirmwareInfo {
    /// Derive the feature set from a banner version
    pub fn from_version(version: Option<&str>) -> Self {
        let is = |v: &str| version == Some(v);
        Self {
            version: version.map(str::to_string),
            rescue_from_home: !is(GRBL_VERSION_20170919_22270FA),
            reports_rx_buffer: !is(GRBL_VERSION_20170919_22270FA)
                && !is(GRBL_VERSION_20180223_61638C5),
            legacy_status: is(GRBL_VERSION_20170919_22270FA),
        }
    }
}
