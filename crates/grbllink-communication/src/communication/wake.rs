//! Counting wake signal for the writer loop

use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// Signals pending before `set` stops counting
pub const DEFAULT_MAX_SIGNALS: u32 = 50;

/// A counting event
///
/// `set` adds one pending signal (up to a ceiling), `wait` returns as soon as
/// at least one signal is pending, and `clear` consumes one. Bursts of
/// acknowledgments therefore keep the writer running for as many cycles as
/// there were signals instead of collapsing into one wakeup.
#[derive(Debug)]
pub struct WakeSignal {
    count: Mutex<u32>,
    condvar: Condvar,
    max: u32,
}

impl WakeSignal {
    /// Create a signal with a ceiling of `max` pending signals
    pub fn new(max: u32) -> Self {
        Self {
            count: Mutex::new(0),
            condvar: Condvar::new(),
            max,
        }
    }

    /// Add a pending signal
    pub fn set(&self) {
        let mut count = self.count.lock();
        if *count < self.max {
            *count += 1;
        }
        self.condvar.notify_all();
    }

    /// Block until a signal is pending or `timeout` elapses.
    ///
    /// Returns whether a signal is pending.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock();
        if *count == 0 {
            self.condvar.wait_for(&mut count, timeout);
        }
        *count > 0
    }

    /// Consume one pending signal
    pub fn clear(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
    }

    /// Consume every pending signal
    pub fn clear_all(&self) {
        *self.count.lock() = 0;
    }

    /// Number of pending signals
    pub fn pending(&self) -> u32 {
        *self.count.lock()
    }
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIGNALS)
    }
}
