//! Error handling for grbllink
//!
//! Provides error types for every layer of the communication stack:
//! - Connection errors (transport open/read/write)
//! - Controller errors (flow control, operations illegal in the current state)
//! - Firmware errors (alarms, error lines, settings verification, flashing)
//! - Job errors (print job files)
//!
//! All error types use `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Controller error type
///
/// Represents errors raised by the communication manager itself,
/// such as buffer overflows and operations refused in the current state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ControllerError {
    /// Controller is not connected
    #[error("Controller not connected")]
    NotConnected,

    /// Command does not fit into the firmware receive buffer
    #[error("Command too long: {length} bytes, buffer allows at most {max}")]
    CommandTooLong {
        /// Length of the rejected command.
        length: usize,
        /// Largest command length the working buffer accepts.
        max: usize,
    },

    /// Operation requires an operational machine
    #[error("Machine not operational (state: {state})")]
    NotOperational {
        /// The current state name.
        state: String,
    },

    /// Operation refused while the machine is busy
    #[error("Operation refused while {state}")]
    Busy {
        /// The current state name.
        state: String,
    },

    /// A print job was requested without a selected file
    #[error("No file selected")]
    NoFileSelected,

    /// Operator meta-command could not be parsed
    #[error("Invalid command '{command}': {reason}")]
    InvalidCommand {
        /// The offending command line.
        command: String,
        /// Why it was rejected.
        reason: String,
    },
}

/// Connection error type
///
/// Represents transport faults on the serial link.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectionError {
    /// No candidate serial port could be found
    #[error("No serial port found")]
    NoPortFound,

    /// Failed to open port
    #[error("Failed to open port {port}: {reason}")]
    FailedToOpen {
        /// The name of the port that failed to open.
        port: String,
        /// The reason the port failed to open.
        reason: String,
    },

    /// I/O error on the transport
    #[error("Serial I/O error: {reason}")]
    Io {
        /// The reason for the I/O error.
        reason: String,
    },
}

/// Firmware error type
///
/// Represents faults reported by, or concerning, the GRBL firmware.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FirmwareError {
    /// Settings did not converge to the expected profile
    #[error("Settings verification failed: {mismatches} setting(s) differ")]
    SettingsVerificationFailed {
        /// Number of settings still missing or different.
        mismatches: usize,
    },

    /// Flashing was refused before the programmer ran
    #[error("Flashing refused: {reason}")]
    FlashRefused {
        /// Why flashing did not start.
        reason: String,
    },

    /// The programmer tool reported a failure
    #[error("Flashing failed with exit code {code}")]
    FlashFailed {
        /// Process exit code of the programmer.
        code: i32,
        /// Captured programmer output.
        output: String,
    },
}

/// Print job error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    /// The job file does not exist
    #[error("File not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The job file could not be read
    #[error("Failed to read {path}: {reason}")]
    Read {
        /// Path of the job file.
        path: String,
        /// Underlying I/O reason.
        reason: String,
    },
}

/// Main error type for grbllink
///
/// A unified error type that can represent any error from all layers.
/// This is the primary error type used in public APIs.
#[derive(Error, Debug)]
pub enum Error {
    /// Controller error
    #[error(transparent)]
    Controller(#[from] ControllerError),

    /// Connection error
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Firmware error
    #[error(transparent)]
    Firmware(#[from] FirmwareError),

    /// Job error
    #[error(transparent)]
    Job(#[from] JobError),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an error from a string message
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Check if this is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Io(_))
    }

    /// Check if this is a controller error
    pub fn is_controller_error(&self) -> bool {
        matches!(self, Error::Controller(_))
    }

    /// Check if this is a firmware error
    pub fn is_firmware_error(&self) -> bool {
        matches!(self, Error::Firmware(_))
    }
}

/// Result type using Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_too_long_display() {
        let err = ControllerError::CommandTooLong {
            length: 130,
            max: 121,
        };
        assert_eq!(
            err.to_string(),
            "Command too long: 130 bytes, buffer allows at most 121"
        );
    }

    #[test]
    fn test_error_conversion() {
        let err: Error = ConnectionError::NoPortFound.into();
        assert!(err.is_connection_error());

        let err: Error = FirmwareError::SettingsVerificationFailed { mismatches: 3 }.into();
        assert!(err.is_firmware_error());
        assert_eq!(
            err.to_string(),
            "Settings verification failed: 3 setting(s) differ"
        );

        let err: Error = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone").into();
        assert!(err.is_connection_error());
        assert!(!err.is_controller_error());
    }
}
