//! Data models shared between the communication manager and its host

use serde::{Deserialize, Serialize};
use std::fmt;

/// A planar position in millimetres
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// X coordinate
    pub x: f64,
    /// Y coordinate
    pub y: f64,
}

impl Position {
    /// Create a new position
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "X{:.3} Y{:.3}", self.x, self.y)
    }
}

/// Progress of the active print job
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct JobProgress {
    /// Fraction of payload bytes sent, `-1.0` when the size is unknown
    pub completion: f64,
    /// Byte offset in the job file
    pub file_position: u64,
    /// Seconds spent printing, excluding pauses
    pub print_time_secs: f64,
    /// Passes already finished
    pub finished_passes: u32,
    /// Passes requested
    pub passes: u32,
}

/// The file selected for printing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedFile {
    /// File name as given by the operator
    pub name: String,
    /// Size in bytes
    pub size: u64,
}

/// Information about an established connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Serial port name
    pub port: String,
    /// Baud rate in use
    pub baud_rate: u32,
    /// Firmware version from the startup banner
    pub firmware_version: Option<String>,
}
