//! Machine lifecycle state and firmware run-state
//!
//! [`MachineState`] is the host-side view of the connection lifecycle.
//! [`RunState`] is the token GRBL reports in its `<...>` status lines.
//! The two are related but never interchangeable.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the communication manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MachineState {
    /// Nothing has happened yet
    #[default]
    None,
    /// Opening the serial port
    OpeningPort,
    /// Searching for a serial port
    DetectingPort,
    /// Searching for a baud rate
    DetectingBaudrate,
    /// Port open, waiting for the firmware banner
    Connecting,
    /// Ready for commands
    Operational,
    /// Streaming a job
    Printing,
    /// Job paused by hold
    Paused,
    /// Firmware alarm lock, `$X` or `$H` needed
    Locked,
    /// Homing cycle running
    Homing,
    /// Firmware image being written
    Flashing,
    /// Port closed
    Closed,
    /// Port closed after a fault
    ClosedWithError,
    /// Internal failure
    Error,
    /// Reserved for file transfers to the controller
    TransferringFile,
}

impl MachineState {
    /// Operational states accept commands and status polls.
    pub fn is_operational(self) -> bool {
        matches!(self, Self::Operational | Self::Printing | Self::Paused)
    }

    /// Whether a job is currently streaming.
    pub fn is_printing(self) -> bool {
        self == Self::Printing
    }

    /// Whether the job is held.
    pub fn is_paused(self) -> bool {
        self == Self::Paused
    }

    /// Whether the state leaves the port closed.
    pub fn is_closed(self) -> bool {
        matches!(self, Self::Closed | Self::ClosedWithError)
    }

    /// Whether the state is a fault state requiring operator action.
    pub fn is_error(self) -> bool {
        matches!(self, Self::Error | Self::ClosedWithError)
    }

    /// States in which an empty read means the firmware has not announced itself yet.
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::OpeningPort | Self::DetectingPort
        )
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "Offline",
            Self::OpeningPort => "Opening serial port",
            Self::DetectingPort => "Detecting serial port",
            Self::DetectingBaudrate => "Detecting baudrate",
            Self::Connecting => "Connecting",
            Self::Operational => "Operational",
            Self::Printing => "Printing",
            Self::Paused => "Paused",
            Self::Locked => "Locked",
            Self::Homing => "Homing",
            Self::Flashing => "Flashing",
            Self::Closed => "Closed",
            Self::ClosedWithError => "Error",
            Self::Error => "Error",
            Self::TransferringFile => "Transferring file to SD",
        };
        write!(f, "{}", name)
    }
}

/// Firmware run-state token from a status report
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RunState {
    /// Idle
    Idle,
    /// Executing motion
    Run,
    /// Motion queued but held, reported by the laser firmware
    Queue,
    /// Feed hold
    Hold,
    /// Homing cycle
    Home,
    /// Alarm lock
    Alarm,
    /// Safety door open
    Door,
    /// Check mode
    Check,
    /// Any other token
    Other(String),
    /// No status seen yet
    #[default]
    Unknown,
}

impl RunState {
    /// Parse a status token.
    pub fn parse(token: &str) -> Self {
        match token {
            "Idle" => Self::Idle,
            "Run" => Self::Run,
            "Queue" => Self::Queue,
            "Hold" => Self::Hold,
            "Home" => Self::Home,
            "Alarm" => Self::Alarm,
            "Door" => Self::Door,
            "Check" => Self::Check,
            other => Self::Other(other.to_string()),
        }
    }

    /// Motion is pending or executing.
    pub fn is_moving(&self) -> bool {
        matches!(self, Self::Run | Self::Queue)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Run => write!(f, "Run"),
            Self::Queue => write!(f, "Queue"),
            Self::Hold => write!(f, "Hold"),
            Self::Home => write!(f, "Home"),
            Self::Alarm => write!(f, "Alarm"),
            Self::Door => write!(f, "Door"),
            Self::Check => write!(f, "Check"),
            Self::Other(token) => write!(f, "{}", token),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}
