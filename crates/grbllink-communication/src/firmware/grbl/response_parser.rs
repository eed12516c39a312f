//! GRBL Response Parser
//!
//! Classifies every line received from GRBL by its leading token. Only the
//! cheap parts are parsed here; status and settings lines are handed on raw
//! to their dedicated parsers.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

static VERSION_REGEX: OnceLock<Regex> = OnceLock::new();

fn version_regex() -> &'static Regex {
    VERSION_REGEX
        .get_or_init(|| Regex::new(r"^Grbl (?P<version>\S+)").expect("invalid regex pattern"))
}

/// GRBL response types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrblResponse {
    /// Nothing but whitespace
    Empty,
    /// `<...>` status report
    Status(String),
    /// `ok` or `ok:N`, N being the free receive buffer when reported
    Ok(Option<u32>),
    /// `error: ...`
    Error(String),
    /// `ALARM: ...`
    Alarm(String),
    /// `[...]` feedback message
    Feedback(String),
    /// `Grbl <version> ...` startup banner
    Startup {
        /// Firmware version, when the banner could be parsed
        version: Option<String>,
    },
    /// `$id=value (comment)` setting line
    Setting(String),
    /// `Corrupted line: ...` notice
    CorruptedLine(String),
    /// Anything else
    Other(String),
}

impl GrblResponse {
    /// Classify a trimmed line
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            Self::Empty
        } else if line.starts_with('<') {
            Self::Status(line.to_string())
        } else if line.starts_with("ok") {
            Self::Ok(parse_rx_free(line))
        } else if line.starts_with("err") {
            Self::Error(line.to_string())
        } else if line.starts_with("ALA") {
            Self::Alarm(line.to_string())
        } else if line.starts_with('[') {
            Self::Feedback(line.to_string())
        } else if line.starts_with("Grb") {
            Self::Startup {
                version: version_regex()
                    .captures(line)
                    .and_then(|caps| caps.name("version"))
                    .map(|m| m.as_str().to_string()),
            }
        } else if line.starts_with("Corru") {
            Self::CorruptedLine(line.to_string())
        } else if line.starts_with('$') {
            Self::Setting(line.to_string())
        } else {
            Self::Other(line.to_string())
        }
    }
}

fn parse_rx_free(line: &str) -> Option<u32> {
    line.split_once(':')
        .and_then(|(_, value)| value.trim().parse::<u32>().ok())
}

impl fmt::Display for GrblResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, ""),
            Self::Ok(Some(free)) => write!(f, "ok:{}", free),
            Self::Ok(None) => write!(f, "ok"),
            Self::Startup { version } => {
                write!(f, "Grbl {}", version.as_deref().unwrap_or("(unknown)"))
            }
            Self::Status(line)
            | Self::Error(line)
            | Self::Alarm(line)
            | Self::Feedback(line)
            | Self::Setting(line)
            | Self::CorruptedLine(line)
            | Self::Other(line) => write!(f, "{}", line),
        }
    }
}
