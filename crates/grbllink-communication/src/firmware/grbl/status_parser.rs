//! GRBL Status Report Parsing
//!
//! This module parses `<...>` status reports of the laser GRBL builds:
//! run-state, machine and work position, free receive buffer, limit switch
//! flags and laser state. The oldest build omits the `limits:` field, so the
//! parser is built for one of two patterns.

use grbllink_core::{Position, RunState};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

static STATUS_REGEX: OnceLock<Regex> = OnceLock::new();
static LEGACY_STATUS_REGEX: OnceLock<Regex> = OnceLock::new();

const POSITIONS: &str = r"^<(?P<status>\w+),.*MPos:(?P<mpos_x>[0-9.\-]+),(?P<mpos_y>[0-9.\-]+),.*WPos:(?P<pos_x>[0-9.\-]+),(?P<pos_y>[0-9.\-]+),(?:.*RX:(?P<rx>\d+),)?";
const LIMITS: &str = r".*limits:(?P<limit_x>x?)(?P<limit_y>y?)z?,";
const LASER: &str = r".*laser (?P<laser_state>\w+):(?P<laser_intensity>\d+).*>";

fn status_regex() -> &'static Regex {
    STATUS_REGEX.get_or_init(|| {
        Regex::new(&format!("{}{}{}", POSITIONS, LIMITS, LASER)).expect("invalid regex pattern")
    })
}

fn legacy_status_regex() -> &'static Regex {
    LEGACY_STATUS_REGEX.get_or_init(|| {
        Regex::new(&format!("{}{}", POSITIONS, LASER)).expect("invalid regex pattern")
    })
}

/// A parsed status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Firmware run-state
    pub run_state: RunState,
    /// Machine position
    pub machine: Position,
    /// Work position
    pub work: Position,
    /// Free receive buffer, when reported
    pub rx_free: Option<u32>,
    /// X limit switch hit, `None` on builds without limit reporting
    pub limit_x: Option<bool>,
    /// Y limit switch hit, `None` on builds without limit reporting
    pub limit_y: Option<bool>,
    /// Whether the laser is on
    pub laser_on: bool,
    /// Current laser intensity
    pub laser_intensity: u32,
}

impl StatusReport {
    /// Whether the head sits on a limit switch
    pub fn in_home_position(&self) -> bool {
        self.limit_x.unwrap_or(false) || self.limit_y.unwrap_or(false)
    }
}

/// Status report parser for one firmware build
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusParser {
    legacy: bool,
}

impl StatusParser {
    /// Parser for builds reporting limit switches
    pub fn new() -> Self {
        Self { legacy: false }
    }

    /// Parser for the build without limit reporting
    pub fn legacy() -> Self {
        Self { legacy: true }
    }

    /// Whether the legacy pattern is used
    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    /// Parse a status line, `None` when it does not match
    pub fn parse(&self, line: &str) -> Option<StatusReport> {
        let regex = if self.legacy {
            legacy_status_regex()
        } else {
            status_regex()
        };
        let caps = regex.captures(line.trim())?;

        let number = |name: &str| -> Option<f64> { caps.name(name)?.as_str().parse().ok() };
        let machine = Position::new(number("mpos_x")?, number("mpos_y")?);
        let work = Position::new(number("pos_x")?, number("pos_y")?);
        let flag = |name: &str| caps.name(name).map(|m| !m.as_str().is_empty());

        Some(StatusReport {
            run_state: RunState::parse(caps.name("status")?.as_str()),
            machine,
            work,
            rx_free: caps.name("rx").and_then(|m| m.as_str().parse().ok()),
            limit_x: flag("limit_x"),
            limit_y: flag("limit_y"),
            laser_on: caps.name("laser_state")?.as_str() == "on",
            laser_intensity: caps.name("laser_intensity")?.as_str().parse().ok()?,
        })
    }
}
