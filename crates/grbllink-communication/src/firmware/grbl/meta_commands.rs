//! Operator meta-commands
//!
//! Terminal lines starting with `/` never reach the firmware. Each one maps to
//! a controller operation.

use std::fmt;

/// Help text listing every meta-command
pub const HELP: &[&str] = &[
    "/togglestatusreport",
    "/setstatusfrequency <interval secs>",
    "/feedrate <percent>",
    "/intensity <percent>",
    "/disconnect",
    "/reset",
    "/correct_settings",
    "/verify_grbl [<file>]",
    "/flash_grbl [<file>]",
];

/// A parsed meta-command
#[derive(Debug, Clone, PartialEq)]
pub enum MetaCommand {
    /// Switch periodic status polling on or off
    ToggleStatusReport,
    /// Set the status poll interval in seconds
    SetStatusFrequency(f64),
    /// Set the feedrate override in percent
    Feedrate(f64),
    /// Set the intensity override in percent
    Intensity(f64),
    /// Close the connection
    Disconnect,
    /// Send a soft reset
    Reset,
    /// Verify and correct firmware settings
    CorrectSettings,
    /// Verify the firmware image against a file
    VerifyGrbl(Option<String>),
    /// Write a firmware image
    FlashGrbl(Option<String>),
    /// Known command with a missing or malformed argument
    Invalid {
        /// The command word
        command: String,
        /// What is wrong
        reason: String,
    },
    /// Not a meta-command we know
    Unknown(String),
}

impl MetaCommand {
    /// Whether a terminal line is a meta-command
    pub fn is_meta(line: &str) -> bool {
        line.trim_start().starts_with('/')
    }

    /// Parse a `/command [argument]` line
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let mut tokens = line.split_whitespace();
        let word = tokens.next().unwrap_or_default().to_lowercase();
        let argument = tokens.next().map(str::to_string);

        let number = |what: &str| -> Result<f64, MetaCommand> {
            let invalid = |reason: String| MetaCommand::Invalid {
                command: word.clone(),
                reason,
            };
            match &argument {
                None => Err(invalid(format!("no {} given", what))),
                Some(raw) => raw
                    .parse::<f64>()
                    .map_err(|_| invalid(format!("invalid {} '{}'", what, raw))),
            }
        };

        let parsed = if word.starts_with("/togglestatusreport") {
            Ok(Self::ToggleStatusReport)
        } else if word.starts_with("/setstatusfrequency") {
            number("frequency").map(Self::SetStatusFrequency)
        } else if word.starts_with("/disconnect") {
            Ok(Self::Disconnect)
        } else if word.starts_with("/feedrate") {
            number("feedrate").map(Self::Feedrate)
        } else if word.starts_with("/intensity") {
            number("intensity").map(Self::Intensity)
        } else if word.starts_with("/reset") {
            Ok(Self::Reset)
        } else if word.starts_with("/flash_grbl") {
            Ok(Self::FlashGrbl(argument.clone()))
        } else if word.starts_with("/verify_grbl") {
            Ok(Self::VerifyGrbl(argument.clone()))
        } else if word.starts_with("/correct_settings") {
            Ok(Self::CorrectSettings)
        } else {
            Ok(Self::Unknown(line.to_string()))
        };

        parsed.unwrap_or_else(|invalid| invalid)
    }
}

impl fmt::Display for MetaCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ToggleStatusReport => write!(f, "/togglestatusreport"),
            Self::SetStatusFrequency(secs) => write!(f, "/setstatusfrequency {}", secs),
            Self::Feedrate(percent) => write!(f, "/feedrate {}", percent),
            Self::Intensity(percent) => write!(f, "/intensity {}", percent),
            Self::Disconnect => write!(f, "/disconnect"),
            Self::Reset => write!(f, "/reset"),
            Self::CorrectSettings => write!(f, "/correct_settings"),
            Self::VerifyGrbl(Some(file)) => write!(f, "/verify_grbl {}", file),
            Self::VerifyGrbl(None) => write!(f, "/verify_grbl"),
            Self::FlashGrbl(Some(file)) => write!(f, "/flash_grbl {}", file),
            Self::FlashGrbl(None) => write!(f, "/flash_grbl"),
            Self::Invalid { command, reason } => write!(f, "{}: {}", command, reason),
            Self::Unknown(line) => write!(f, "{}", line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(
            MetaCommand::parse("/togglestatusreport"),
            MetaCommand::ToggleStatusReport
        );
        assert_eq!(MetaCommand::parse(" /Disconnect "), MetaCommand::Disconnect);
        assert_eq!(MetaCommand::parse("/reset"), MetaCommand::Reset);
        assert_eq!(
            MetaCommand::parse("/correct_settings"),
            MetaCommand::CorrectSettings
        );
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(MetaCommand::parse("/feedrate 150"), MetaCommand::Feedrate(150.0));
        assert_eq!(MetaCommand::parse("/intensity 0"), MetaCommand::Intensity(0.0));
        assert_eq!(
            MetaCommand::parse("/setstatusfrequency 0.5"),
            MetaCommand::SetStatusFrequency(0.5)
        );
        assert_eq!(
            MetaCommand::parse("/flash_grbl grbl_new.hex"),
            MetaCommand::FlashGrbl(Some("grbl_new.hex".to_string()))
        );
        assert_eq!(MetaCommand::parse("/verify_grbl"), MetaCommand::VerifyGrbl(None));
    }

    #[test]
    fn test_parse_bad_arguments() {
        assert!(matches!(
            MetaCommand::parse("/feedrate"),
            MetaCommand::Invalid { .. }
        ));
        assert!(matches!(
            MetaCommand::parse("/setstatusfrequency fast"),
            MetaCommand::Invalid { .. }
        ));
    }

    #[test]
    fn test_unknown() {
        assert_eq!(
            MetaCommand::parse("/bogus"),
            MetaCommand::Unknown("/bogus".to_string())
        );
        assert!(MetaCommand::is_meta("  /reset"));
        assert!(!MetaCommand::is_meta("G1X1"));
    }
}
