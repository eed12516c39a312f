//! # grbllink Core
//!
//! Core types and traits for grbllink.
//! Provides the machine state model, positions, the error taxonomy and the
//! observer interfaces the communication manager reports through.

pub mod core;
pub mod data;
pub mod error;
pub mod state;

pub use core::{
    BroadcastListener, CommEvent, CommListener, EventDispatcher, JobEvent, LaserAnalytics,
    NoOpListener, PauseOracle,
};

pub use data::{ConnectionInfo, JobProgress, Position, SelectedFile};

pub use error::{ConnectionError, ControllerError, Error, FirmwareError, JobError, Result};

pub use state::{MachineState, RunState};
