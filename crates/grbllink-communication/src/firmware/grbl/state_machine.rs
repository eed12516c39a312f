//! Machine state bookkeeping
//!
//! Owns the current [`MachineState`], the status poll interval that belongs to
//! it and the last error string. Notifying observers is left to the caller so
//! no callback runs while the state lock is held.

use grbllink_core::MachineState;
use grbllink_settings::StatusPollSettings;
use tracing::{debug, info};

/// Current machine state and its poll interval
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: MachineState,
    poll: StatusPollSettings,
    poll_interval_secs: f64,
    status_reports_enabled: bool,
    last_error: Option<String>,
}

impl StateMachine {
    /// Start in [`MachineState::None`] with polling off
    pub fn new(poll: StatusPollSettings) -> Self {
        Self {
            state: MachineState::None,
            poll,
            poll_interval_secs: 0.0,
            status_reports_enabled: true,
            last_error: None,
        }
    }

    /// Current state
    pub fn state(&self) -> MachineState {
        self.state
    }

    /// Change state.
    ///
    /// Returns `(old, new)` when the state changed, `None` when it already was `new`.
    pub fn transition(&mut self, new: MachineState) -> Option<(MachineState, MachineState)> {
        if self.state == new {
            return None;
        }
        let old = self.state;
        self.state = new;

        let interval = match new {
            MachineState::Operational => Some(self.poll.operational),
            MachineState::Printing => Some(self.poll.printing),
            MachineState::Paused => Some(self.poll.paused),
            _ => None,
        };
        if let Some(interval) = interval {
            if self.status_reports_enabled {
                self.poll_interval_secs = interval;
            }
        }

        info!("Changing monitoring state from '{}' to '{}'", old, new);
        Some((old, new))
    }

    /// Status poll interval in seconds, 0 means no polling
    pub fn poll_interval_secs(&self) -> f64 {
        self.poll_interval_secs
    }

    /// Poll interval while a barrier waits
    pub fn syncing_interval_secs(&self) -> f64 {
        self.poll.syncing
    }

    /// Override the poll interval
    pub fn set_poll_interval(&mut self, secs: f64) {
        debug!("Status poll interval set to {}s", secs);
        self.poll_interval_secs = secs.max(0.0);
    }

    /// Switch periodic status reports on or off.
    ///
    /// Returns whether they are enabled afterwards.
    pub fn toggle_status_reports(&mut self) -> bool {
        self.status_reports_enabled = !self.status_reports_enabled;
        self.poll_interval_secs = if self.status_reports_enabled {
            match self.state {
                MachineState::Printing => self.poll.printing,
                MachineState::Paused => self.poll.paused,
                _ => self.poll.operational,
            }
        } else {
            0.0
        };
        self.status_reports_enabled
    }

    /// Whether periodic status reports are enabled
    pub fn status_reports_enabled(&self) -> bool {
        self.status_reports_enabled
    }

    /// Last error message
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Replace the last error message
    pub fn set_last_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    /// State name, extended by the last error in error states
    pub fn state_string(&self) -> String {
        match (&self.last_error, self.state.is_error()) {
            (Some(error), true) => format!("{}: {}", self.state, error),
            _ => self.state.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_is_noop_for_same_state() {
        let mut sm = StateMachine::new(StatusPollSettings::default());
        assert_eq!(
            sm.transition(MachineState::Connecting),
            Some((MachineState::None, MachineState::Connecting))
        );
        assert_eq!(sm.transition(MachineState::Connecting), None);
    }

    #[test]
    fn test_poll_interval_follows_state() {
        let mut sm = StateMachine::new(StatusPollSettings::default());
        assert_eq!(sm.poll_interval_secs(), 0.0);
        sm.transition(MachineState::Operational);
        assert_eq!(sm.poll_interval_secs(), 2.0);
        sm.transition(MachineState::Printing);
        assert_eq!(sm.poll_interval_secs(), 5.0);
        sm.transition(MachineState::Paused);
        assert_eq!(sm.poll_interval_secs(), 0.2);
        sm.transition(MachineState::Locked);
        assert_eq!(sm.poll_interval_secs(), 0.2);
    }

    #[test]
    fn test_toggle_status_reports() {
        let mut sm = StateMachine::new(StatusPollSettings::default());
        sm.transition(MachineState::Printing);
        assert!(!sm.toggle_status_reports());
        assert_eq!(sm.poll_interval_secs(), 0.0);
        sm.transition(MachineState::Paused);
        assert_eq!(sm.poll_interval_secs(), 0.0);
        assert!(sm.toggle_status_reports());
        assert_eq!(sm.poll_interval_secs(), 0.2);
    }

    #[test]
    fn test_state_string_includes_error() {
        let mut sm = StateMachine::new(StatusPollSettings::default());
        sm.set_last_error("no serial port found");
        sm.transition(MachineState::ClosedWithError);
        assert!(sm.state_string().ends_with("no serial port found"));
    }
}
