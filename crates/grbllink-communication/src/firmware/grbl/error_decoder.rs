//! GRBL Error and Alarm Decoder
//!
//! The laser builds report alarms and errors as text, not numeric codes.
//! This module turns them into operator messages and tells which of them
//! need special treatment.

use grbllink_core::ControllerError;

/// What to do about an alarm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlarmInfo {
    /// Message for the operator
    pub message: String,
    /// Whether an error notification should fire
    pub notify: bool,
    /// Whether recent terminal traffic should be dumped to the log
    pub dump_terminal: bool,
}

impl AlarmInfo {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            notify: true,
            dump_terminal: true,
        }
    }
}

/// Decode an `ALARM:` line
pub fn decode_alarm(line: &str) -> AlarmInfo {
    if line.contains("Hard/soft limit") {
        AlarmInfo::new("Machine Limit Hit. Please reset the machine and do a homing cycle")
    } else if line.contains("Abort during cycle") {
        AlarmInfo {
            notify: false,
            ..AlarmInfo::new("Soft-reset detected. Please do a homing cycle")
        }
    } else if line.contains("Probe fail") {
        AlarmInfo::new("Probing has failed. Please reset the machine and do a homing cycle")
    } else {
        AlarmInfo::new(format!("GRBL alarm message: '{}'", line))
    }
}

/// The alarm raised locally when a command can never fit the receive buffer
pub fn command_too_long_alarm(command: &str, max: usize) -> AlarmInfo {
    AlarmInfo {
        dump_terminal: false,
        ..AlarmInfo::new(format!(
            "{}: {}",
            ControllerError::CommandTooLong {
                length: command.len(),
                max,
            },
            command
        ))
    }
}

/// Errors that are expected and carry no meaning for the operator
pub fn is_benign_error(line: &str) -> bool {
    // A fresh controller has no EEPROM content yet and says so once.
    line.contains("EEPROM read fail")
}

/// Format an `error:` line for the operator
pub fn format_error(line: &str) -> String {
    let detail = line
        .split_once(':')
        .map(|(_, rest)| rest.trim())
        .filter(|rest| !rest.is_empty())
        .unwrap_or(line);
    format!("GRBL Error: {}", detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_limit_alarm() {
        let info = decode_alarm("ALARM: Hard/soft limit");
        assert!(info.message.starts_with("Machine Limit Hit"));
        assert!(info.notify);
        assert!(info.dump_terminal);
    }

    #[test]
    fn test_decode_abort_alarm() {
        let info = decode_alarm("ALARM: Abort during cycle");
        assert!(!info.notify);
        assert!(info.message.starts_with("Soft-reset detected"));
    }

    #[test]
    fn test_decode_probe_and_generic_alarm() {
        assert!(decode_alarm("ALARM: Probe fail").message.contains("Probing"));
        assert_eq!(
            decode_alarm("ALARM: Something new").message,
            "GRBL alarm message: 'ALARM: Something new'"
        );
    }

    #[test]
    fn test_command_too_long_alarm() {
        let info = command_too_long_alarm(&"G".repeat(130), 120);
        assert!(info.notify);
        assert!(!info.dump_terminal);
        assert!(info
            .message
            .starts_with("Command too long: 130 bytes, buffer allows at most 120: GGG"));
    }

    #[test]
    fn test_benign_error() {
        assert!(is_benign_error("error: EEPROM read fail. Using defaults"));
        assert!(!is_benign_error("error: Bad number format"));
    }

    #[test]
    fn test_format_error() {
        assert_eq!(
            format_error("error: Bad number format"),
            "GRBL Error: Bad number format"
        );
        assert_eq!(format_error("error:"), "GRBL Error: error:");
    }
}
