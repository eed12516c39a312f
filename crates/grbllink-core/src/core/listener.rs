//! Observer and collaborator interfaces
//!
//! The communication manager receives one [`CommListener`] at construction time
//! and calls it synchronously from its reader, writer and operator threads.
//! Implementations must be cheap and must not block.

use crate::core::event::JobEvent;
use crate::data::{ConnectionInfo, JobProgress, Position, SelectedFile};
use crate::state::MachineState;

/// Listener trait for communication manager events
///
/// Every method has an empty default so implementors only override what they need.
pub trait CommListener: Send + Sync {
    /// Called after every state transition
    fn on_state_changed(&self, _old: MachineState, _new: MachineState) {}

    /// Called when a position becomes known.
    ///
    /// `machine` is absent when the update was derived from an acknowledged command.
    fn on_position_updated(&self, _machine: Option<Position>, _work: Position) {}

    /// Called after each job line is handed to the writer
    fn on_progress(&self, _progress: &JobProgress) {}

    /// Called when a job file is selected or unselected
    fn on_file_selected(&self, _file: Option<&SelectedFile>) {}

    /// Called once all lines and passes of a job were acknowledged
    fn on_print_job_done(&self) {}

    /// Called for job lifecycle events
    fn on_job_event(&self, _event: &JobEvent) {}

    /// Called with terminal-style traffic (`Send: ...`, `Recv: ...`)
    fn on_log(&self, _message: &str) {}

    /// Called whenever the last error changes
    fn on_error(&self, _message: &str) {}

    /// Called when the firmware announced itself
    fn on_connected(&self, _info: &ConnectionInfo) {}

    /// Called when the host should drop the connection
    fn on_force_disconnect(&self) {}
}

/// Listener that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpListener;

impl CommListener for NoOpListener {}

/// Receives laser intensity samples from status reports while the laser is on
pub trait LaserAnalytics: Send + Sync {
    /// Record one intensity sample
    fn add_laser_intensity(&self, intensity: u32);
}

/// Decides whether a firmware `Queue` state was requested by the operator
pub trait PauseOracle: Send + Sync {
    /// `true` when the pause was intended
    fn is_intended_pause(&self) -> bool;
}
