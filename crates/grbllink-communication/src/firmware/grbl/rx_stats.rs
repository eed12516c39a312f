//! Receive buffer statistics
//!
//! Firmware builds that answer `ok:N` report how many bytes of their receive
//! buffer are free. Every acknowledgment is counted here so the headroom seen
//! during a job can be reported when it ends.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Histogram of free receive buffer values
#[derive(Debug, Clone)]
pub struct RxBufferStats {
    histogram: BTreeMap<u32, u64>,
    count: u64,
    invalid: u64,
    supported: bool,
    started: DateTime<Utc>,
}

impl Default for RxBufferStats {
    fn default() -> Self {
        Self::new()
    }
}

impl RxBufferStats {
    /// Empty statistics
    pub fn new() -> Self {
        Self {
            histogram: BTreeMap::new(),
            count: 0,
            invalid: 0,
            supported: true,
            started: Utc::now(),
        }
    }

    /// Start over; `supported` tells whether the firmware reports the value at all
    pub fn reset(&mut self, supported: bool) {
        *self = Self::new();
        self.supported = supported;
    }

    /// Record one acknowledgment, `None` when its value could not be read
    pub fn add(&mut self, free: Option<u32>) {
        if !self.supported {
            return;
        }
        match free {
            Some(value) => {
                *self.histogram.entry(value).or_insert(0) += 1;
                self.count += 1;
            }
            None => self.invalid += 1,
        }
    }

    /// Whether the firmware reports free buffer space
    pub fn is_supported(&self) -> bool {
        self.supported
    }

    /// Valid samples
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Unreadable samples
    pub fn invalid(&self) -> u64 {
        self.invalid
    }

    /// When collection started
    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    /// Smallest value seen
    pub fn min(&self) -> u32 {
        self.histogram.keys().next().copied().unwrap_or(0)
    }

    /// Largest value seen
    pub fn max(&self) -> u32 {
        self.histogram.keys().next_back().copied().unwrap_or(0)
    }

    /// Mean value, 0 without samples
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let sum: u64 = self
            .histogram
            .iter()
            .map(|(value, hits)| *value as u64 * hits)
            .sum();
        sum as f64 / self.count as f64
    }

    /// One-line report.
    ///
    /// `print_time_secs` is used as duration when positive, otherwise the time
    /// since collection started.
    pub fn report(&self, print_time_secs: f64) -> String {
        if !self.supported {
            return "RxBufferStats: not supported by grbl.".to_string();
        }

        let duration = if print_time_secs > 0.0 {
            print_time_secs
        } else {
            (Utc::now() - self.started).num_milliseconds() as f64 / 1000.0
        };
        let per_sec = if duration > 0.0 {
            self.count as f64 / duration
        } else {
            0.0
        };
        let whole = duration.max(0.0) as u64;
        let data = self
            .histogram
            .iter()
            .map(|(value, hits)| format!("{}:{}", value, hits))
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "RxBufferStats: {} responses within {:02}:{:02}:{:02} ({:.2}s): {:.1} resp/s; invalid: {}; min: {}, max: {}, avg: {:.1} - All data: {}",
            self.count,
            whole / 3600,
            whole / 60 % 60,
            whole % 60,
            duration,
            per_sec,
            self.invalid,
            self.min(),
            self.max(),
            self.average(),
            data
        )
    }
}
