//! GRBL settings table and synchronizer
//!
//! `$$` makes GRBL print every setting as `$id=value (comment)`. The table
//! collects those lines; the synchronizer decides when a verification round
//! may start, waits for the dump to arrive and diffs it against the values the
//! machine profile expects. Every correction is a `$id=value` write bracketed
//! by FLUSH barriers so no motion is buffered while a setting changes.

use crate::communication::QueuedCommand;
use grbllink_settings::{SettingValue, SettingsSyncSettings};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

static SETTING_REGEX: OnceLock<Regex> = OnceLock::new();

fn setting_regex() -> &'static Regex {
    SETTING_REGEX.get_or_init(|| {
        Regex::new(r"^\$(?P<id>\d+)=(?P<value>\S+)(?:\s\((?P<comment>.*)\))?")
            .expect("invalid regex pattern")
    })
}

/// One firmware setting
#[derive(Debug, Clone, PartialEq)]
pub struct SettingEntry {
    /// Current value
    pub value: SettingValue,
    /// Description GRBL prints next to it
    pub comment: String,
}

/// Settings reported by the firmware
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GrblSettingsTable {
    entries: BTreeMap<u32, SettingEntry>,
}

impl GrblSettingsTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a `$id=value (comment)` line into the table.
    ///
    /// Returns the id on success.
    pub fn parse_line(&mut self, line: &str) -> Option<u32> {
        let caps = setting_regex().captures(line.trim())?;
        let id = caps.name("id")?.as_str().parse::<u32>().ok()?;
        let value = SettingValue::parse(caps.name("value")?.as_str())?;
        let comment = caps
            .name("comment")
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        self.entries.insert(id, SettingEntry { value, comment });
        Some(id)
    }

    /// Insert a value directly
    pub fn insert(&mut self, id: u32, value: SettingValue) {
        self.entries.insert(
            id,
            SettingEntry {
                value,
                comment: String::new(),
            },
        );
    }

    /// Look up a setting
    pub fn get(&self, id: u32) -> Option<&SettingEntry> {
        self.entries.get(&id)
    }

    /// Number of settings
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every setting
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterate in id order
    pub fn iter(&self) -> impl Iterator<Item = (&u32, &SettingEntry)> {
        self.entries.iter()
    }
}

/// Outcome of one verification round
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsVerification {
    /// Settings that are missing or differ, with the expected value
    pub mismatches: Vec<(u32, SettingValue)>,
    /// Settings the firmware reported
    pub actual_count: usize,
    /// Settings the firmware should report
    pub expected_count: usize,
}

impl SettingsVerification {
    /// Diff a table against the expected values
    pub fn compare(
        table: &GrblSettingsTable,
        expected: &BTreeMap<u32, SettingValue>,
        expected_count: usize,
    ) -> Self {
        let mismatches = expected
            .iter()
            .filter(|(id, value)| table.get(**id).map(|e| e.value) != Some(**value))
            .map(|(id, value)| (*id, *value))
            .collect();

        Self {
            mismatches,
            actual_count: table.len(),
            expected_count,
        }
    }

    /// Whether no correction is needed
    pub fn is_ok(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Whether the firmware reported the expected number of settings
    pub fn count_matches(&self) -> bool {
        self.expected_count == 0 || self.actual_count == self.expected_count
    }

    /// Commands that correct every mismatch
    pub fn corrective_commands(&self) -> Vec<QueuedCommand> {
        self.mismatches
            .iter()
            .flat_map(|(id, value)| {
                [
                    QueuedCommand::Flush,
                    QueuedCommand::line(format!("${}={}", id, value)),
                    QueuedCommand::Flush,
                ]
            })
            .collect()
    }
}

/// Schedules and times settings verification rounds
#[derive(Debug)]
pub struct SettingsSynchronizer {
    config: SettingsSyncSettings,
    last_request: Mutex<Option<Instant>>,
    last_result: Mutex<Option<SettingsVerification>>,
}

impl SettingsSynchronizer {
    /// Create a synchronizer
    pub fn new(config: SettingsSyncSettings) -> Self {
        Self {
            config,
            last_request: Mutex::new(None),
            last_result: Mutex::new(None),
        }
    }

    /// Timing configuration
    pub fn config(&self) -> &SettingsSyncSettings {
        &self.config
    }

    /// Claim a new round unless one started within the read window
    pub fn try_begin(&self, now: Instant) -> bool {
        let mut last = self.last_request.lock();
        match *last {
            Some(started) if now.saturating_duration_since(started) < self.config.read_window() => {
                false
            }
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Start a retry round regardless of the read window
    pub fn begin_retry(&self, now: Instant) {
        *self.last_request.lock() = Some(now);
    }

    /// Sleep in check intervals until `count()` reaches `target` or the window closes.
    ///
    /// Returns whether the target was reached.
    pub fn wait_for_table(&self, target: usize, count: impl Fn() -> usize) -> bool {
        let interval = self.config.check_interval();
        let mut waited = Duration::ZERO;
        while count() < target {
            if waited >= self.config.read_window() {
                return false;
            }
            std::thread::sleep(interval);
            waited += interval;
        }
        true
    }

    /// Remember the outcome of a round
    pub fn record(&self, verification: SettingsVerification) {
        *self.last_result.lock() = Some(verification);
    }

    /// Outcome of the latest round
    pub fn last_result(&self) -> Option<SettingsVerification> {
        self.last_result.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected(ids: &[(u32, SettingValue)]) -> BTreeMap<u32, SettingValue> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_parse_setting_lines() {
        let mut table = GrblSettingsTable::new();
        assert_eq!(table.parse_line("$22=1 (homing cycle, bool)"), Some(22));
        assert_eq!(table.parse_line("$110=5000.000 (x max rate, mm/min)"), Some(110));
        assert_eq!(table.parse_line("$13=0"), Some(13));
        assert_eq!(table.parse_line("$N0="), None);
        assert_eq!(table.parse_line("$$"), None);

        assert_eq!(table.len(), 3);
        assert_eq!(table.get(22).unwrap().value, SettingValue::Int(1));
        assert_eq!(table.get(22).unwrap().comment, "homing cycle, bool");
        assert!(matches!(
            table.get(110).unwrap().value,
            SettingValue::Float(_)
        ));
    }

    #[test]
    fn test_compare_finds_missing_and_different() {
        let mut table = GrblSettingsTable::new();
        table.insert(22, SettingValue::Int(1));
        table.insert(23, SettingValue::Int(0));

        let verification = SettingsVerification::compare(
            &table,
            &expected(&[
                (22, SettingValue::Float(1.0)),
                (23, SettingValue::Int(3)),
                (24, SettingValue::Float(25.0)),
            ]),
            3,
        );
        assert_eq!(
            verification.mismatches,
            vec![(23, SettingValue::Int(3)), (24, SettingValue::Float(25.0))]
        );
        assert!(!verification.count_matches());
        assert_eq!(
            verification.corrective_commands(),
            vec![
                QueuedCommand::Flush,
                QueuedCommand::line("$23=3"),
                QueuedCommand::Flush,
                QueuedCommand::Flush,
                QueuedCommand::line("$24=25"),
                QueuedCommand::Flush,
            ]
        );
    }

    #[test]
    fn test_try_begin_debounces_within_window() {
        let sync = SettingsSynchronizer::new(SettingsSyncSettings::default());
        let now = Instant::now();
        assert!(sync.try_begin(now));
        assert!(!sync.try_begin(now + Duration::from_secs(5)));
        assert!(sync.try_begin(now + Duration::from_secs(11)));
    }

    #[test]
    fn test_wait_for_table_gives_up_after_window() {
        let sync = SettingsSynchronizer::new(SettingsSyncSettings {
            read_window_secs: 0.05,
            check_interval_secs: 0.01,
            ..SettingsSyncSettings::default()
        });
        assert!(!sync.wait_for_table(3, || 1));
        assert!(sync.wait_for_table(3, || 3));
    }
}
