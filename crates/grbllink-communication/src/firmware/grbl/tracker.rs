//! Position and run-state tracking
//!
//! The tracker keeps the latest machine and work position, the firmware
//! run-state and limit switch flags. Positions come from status reports and,
//! between reports, from the X/Y words of acknowledged motion commands.
//!
//! It also decides whether a status report reveals a pause nobody asked for.
//! Pause and resume take a firmware round trip, so reports arriving within
//! [`PAUSE_DEBOUNCE`] of the last request are not acted on.

use super::status_parser::StatusReport;
use grbllink_core::{Position, RunState};
use regex::Regex;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Reports younger than this after a pause or resume request are ignored
pub const PAUSE_DEBOUNCE: Duration = Duration::from_millis(300);

static X_COORD_REGEX: OnceLock<Regex> = OnceLock::new();
static Y_COORD_REGEX: OnceLock<Regex> = OnceLock::new();

fn x_coord_regex() -> &'static Regex {
    X_COORD_REGEX.get_or_init(|| {
        Regex::new(r"^G.*X(\d{1,3}\.?\d{0,3})(?:\D|$)").expect("invalid regex pattern")
    })
}

fn y_coord_regex() -> &'static Regex {
    Y_COORD_REGEX.get_or_init(|| {
        Regex::new(r"^G.*Y(\d{1,3}\.?\d{0,3})(?:\D|$)").expect("invalid regex pattern")
    })
}

/// What a status report asks the controller to do about pausing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseDecision {
    /// Nothing
    None,
    /// The firmware holds on its own, mirror it
    Pause,
    /// The firmware holds although no pause is intended, resume it
    ForceResume,
    /// The firmware runs again while the job is paused
    Resume,
}

/// Live position and run-state
#[derive(Debug, Clone)]
pub struct PositionTracker {
    run_state: RunState,
    machine: Position,
    work: Position,
    limit_x: Option<bool>,
    limit_y: Option<bool>,
    rx_free: Option<u32>,
    laser_on: bool,
    laser_intensity: u32,
    last_pause_request: Option<Instant>,
}

impl Default for PositionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionTracker {
    /// Unknown run-state, work position (-1, -1)
    pub fn new() -> Self {
        Self {
            run_state: RunState::Unknown,
            machine: Position::default(),
            work: Position::new(-1.0, -1.0),
            limit_x: None,
            limit_y: None,
            rx_free: None,
            laser_on: false,
            laser_intensity: 0,
            last_pause_request: None,
        }
    }

    /// Take over everything a status report carries.
    ///
    /// Returns the laser intensity when the laser is on.
    pub fn apply_status(&mut self, report: &StatusReport) -> Option<u32> {
        self.run_state = report.run_state.clone();
        self.machine = report.machine;
        self.work = report.work;
        if report.limit_x.is_some() {
            self.limit_x = report.limit_x;
        }
        if report.limit_y.is_some() {
            self.limit_y = report.limit_y;
        }
        if report.rx_free.is_some() {
            self.rx_free = report.rx_free;
        }
        self.laser_on = report.laser_on;
        self.laser_intensity = report.laser_intensity;
        report.laser_on.then_some(report.laser_intensity)
    }

    /// Refine the work position from an acknowledged command.
    ///
    /// Returns the new estimate when the command was a `G` command and a
    /// coordinate is known.
    pub fn apply_ack(&mut self, command: &str) -> Option<Position> {
        if !command.starts_with('G') {
            return None;
        }
        let coordinate = |regex: &Regex| -> Option<f64> {
            regex.captures(command)?.get(1)?.as_str().parse().ok()
        };
        if let Some(x) = coordinate(x_coord_regex()) {
            self.work.x = x;
        }
        if let Some(y) = coordinate(y_coord_regex()) {
            self.work.y = y;
        }
        (self.work.x >= 0.0 || self.work.y >= 0.0).then_some(self.work)
    }

    /// Remember when a pause or resume was requested
    pub fn mark_pause_request(&mut self, now: Instant) {
        self.last_pause_request = Some(now);
    }

    /// Decide whether the current run-state calls for a pause change.
    ///
    /// `intended` is only consulted for a `Queue` report while the job runs.
    pub fn pause_decision(
        &self,
        now: Instant,
        job_paused: bool,
        intended: impl FnOnce() -> bool,
    ) -> PauseDecision {
        let settled = self
            .last_pause_request
            .map_or(true, |at| now.saturating_duration_since(at) > PAUSE_DEBOUNCE);
        if !settled {
            return PauseDecision::None;
        }

        match self.run_state {
            RunState::Queue if !job_paused => {
                if intended() {
                    PauseDecision::Pause
                } else {
                    PauseDecision::ForceResume
                }
            }
            RunState::Run | RunState::Idle if job_paused => PauseDecision::Resume,
            _ => PauseDecision::None,
        }
    }

    /// Firmware run-state
    pub fn run_state(&self) -> &RunState {
        &self.run_state
    }

    /// Override the run-state; a soft reset makes the last report stale
    pub fn set_run_state(&mut self, run_state: RunState) {
        self.run_state = run_state;
    }

    /// Machine position
    pub fn machine_position(&self) -> Position {
        self.machine
    }

    /// Work position
    pub fn work_position(&self) -> Position {
        self.work
    }

    /// Limit switch flags (x, y), unknown counts as released
    pub fn limits(&self) -> (bool, bool) {
        (self.limit_x.unwrap_or(false), self.limit_y.unwrap_or(false))
    }

    /// Whether a report with limit data arrived yet
    pub fn limits_known(&self) -> bool {
        self.limit_x.is_some() && self.limit_y.is_some()
    }

    /// Whether the head sits on a limit switch
    pub fn in_home_position(&self) -> bool {
        let (x, y) = self.limits();
        x || y
    }

    /// Free receive buffer from the latest report
    pub fn rx_free(&self) -> Option<u32> {
        self.rx_free
    }

    /// Laser state from the latest report
    pub fn laser(&self) -> (bool, u32) {
        (self.laser_on, self.laser_intensity)
    }
}
