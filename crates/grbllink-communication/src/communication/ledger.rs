//! Flow control by receive-buffer accounting
//!
//! GRBL never reports how much of its receive buffer is free (older builds at
//! least), but it acknowledges every line with `ok` or `error` in send order.
//! The ledger keeps one entry per written line until its acknowledgment
//! arrives, so the sum of the entries approximates the buffer occupancy.
//!
//! # Features
//! - Admission check against the working buffer size
//! - FIFO acknowledgment
//! - Rejection of lines that can never fit

use std::collections::VecDeque;

/// Result of asking the ledger whether a command may be written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Write it now
    Fits,
    /// Wait for acknowledgments
    Deferred,
    /// The command can never fit
    TooLong,
}

/// A written but unacknowledged line
#[derive(Debug, Clone, PartialEq, Eq)]
struct LedgerEntry {
    command: String,
    /// Bytes on the wire, terminator included
    size: usize,
}

/// Outstanding command ledger
#[derive(Debug, Clone)]
pub struct FlowControlLedger {
    entries: VecDeque<LedgerEntry>,
    outstanding: usize,
    working_size: usize,
}

impl FlowControlLedger {
    /// Create a ledger for a buffer of `working_size` usable bytes
    pub fn new(working_size: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            outstanding: 0,
            working_size,
        }
    }

    /// Usable buffer size
    pub fn working_size(&self) -> usize {
        self.working_size
    }

    /// Longest command, without terminator, that can ever be admitted
    pub fn max_command_length(&self) -> usize {
        self.working_size.saturating_sub(2)
    }

    /// Decide whether `command` may be written now
    pub fn admit(&self, command: &str) -> Admission {
        let size = command.len() + 1;
        if size >= self.working_size {
            Admission::TooLong
        } else if self.outstanding + size < self.working_size {
            Admission::Fits
        } else {
            Admission::Deferred
        }
    }

    /// Record a written command
    pub fn record(&mut self, command: &str) {
        let size = command.len() + 1;
        self.outstanding += size;
        self.entries.push_back(LedgerEntry {
            command: command.to_string(),
            size,
        });
    }

    /// Pop the oldest entry for an `ok` or `error`.
    ///
    /// `None` means the acknowledgment had nothing to match.
    pub fn acknowledge(&mut self) -> Option<String> {
        let entry = self.entries.pop_front()?;
        self.outstanding -= entry.size;
        Some(entry.command)
    }

    /// Bytes currently outstanding, terminators included
    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding
    }

    /// Number of unacknowledged commands
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether every written command was acknowledged
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget all outstanding commands
    pub fn clear(&mut self) {
        self.entries.clear();
        self.outstanding = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_boundary() {
        let mut ledger = FlowControlLedger::new(122);
        let command = "G1X1".repeat(25);
        assert_eq!(ledger.admit(&command), Admission::Fits);
        ledger.record(&command);
        assert_eq!(ledger.outstanding_bytes(), 101);

        // 101 + 20 + 1 = 122 is not below the working size
        assert_eq!(ledger.admit(&"X".repeat(20)), Admission::Deferred);
        assert_eq!(ledger.admit(&"X".repeat(19)), Admission::Fits);
    }

    #[test]
    fn test_too_long_even_when_empty() {
        let ledger = FlowControlLedger::new(122);
        assert_eq!(ledger.max_command_length(), 120);
        assert_eq!(ledger.admit(&"G".repeat(120)), Admission::Fits);
        assert_eq!(ledger.admit(&"G".repeat(121)), Admission::TooLong);
        assert_eq!(ledger.admit(&"G".repeat(122)), Admission::TooLong);
    }

    #[test]
    fn test_acknowledge_on_empty_ledger() {
        let mut ledger = FlowControlLedger::new(122);
        assert_eq!(ledger.acknowledge(), None);
        assert_eq!(ledger.outstanding_bytes(), 0);
    }

    #[test]
    fn test_clear() {
        let mut ledger = FlowControlLedger::new(122);
        ledger.record("G0X0");
        ledger.record("G0Y0");
        ledger.clear();
        assert!(ledger.is_empty());
        assert_eq!(ledger.outstanding_bytes(), 0);
    }
}
