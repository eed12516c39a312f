//! Command sources feeding the writer
//!
//! Queued commands travel through [`CommandQueue`]; real-time bytes bypass it
//! through [`RealTimeFlags`] and are always serviced first.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Single-byte commands GRBL acts on immediately
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RealTimeCommand {
    /// Request a status report
    StatusReport = b'?',
    /// Feed hold
    FeedHold = b'!',
    /// Cycle start / resume
    CycleStart = b'~',
    /// Soft reset
    SoftReset = 0x18,
}

impl RealTimeCommand {
    /// Byte sent on the wire
    pub fn byte(self) -> u8 {
        self as u8
    }

    /// Match an operator command that is exactly one real-time byte
    pub fn from_command(command: &str) -> Option<Self> {
        match command {
            "?" => Some(Self::StatusReport),
            "!" => Some(Self::FeedHold),
            "~" => Some(Self::CycleStart),
            "\u{18}" => Some(Self::SoftReset),
            _ => None,
        }
    }
}

impl fmt::Display for RealTimeCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StatusReport => write!(f, "?"),
            Self::FeedHold => write!(f, "!"),
            Self::CycleStart => write!(f, "~"),
            Self::SoftReset => write!(f, "\\x18"),
        }
    }
}

/// Pending real-time intents, one flag each
#[derive(Debug, Default)]
pub struct RealTimeFlags {
    poll_status: AtomicBool,
    feed_hold: AtomicBool,
    cycle_start: AtomicBool,
    soft_reset: AtomicBool,
}

impl RealTimeFlags {
    /// Create cleared flags
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self, command: RealTimeCommand) -> &AtomicBool {
        match command {
            RealTimeCommand::StatusReport => &self.poll_status,
            RealTimeCommand::FeedHold => &self.feed_hold,
            RealTimeCommand::CycleStart => &self.cycle_start,
            RealTimeCommand::SoftReset => &self.soft_reset,
        }
    }

    /// Raise a flag
    pub fn request(&self, command: RealTimeCommand) {
        self.flag(command).store(true, Ordering::SeqCst);
    }

    /// Take the highest priority raised flag, clearing it.
    ///
    /// Order: status poll, feed hold, cycle start, soft reset.
    pub fn take_next(&self) -> Option<RealTimeCommand> {
        [
            RealTimeCommand::StatusReport,
            RealTimeCommand::FeedHold,
            RealTimeCommand::CycleStart,
            RealTimeCommand::SoftReset,
        ]
        .into_iter()
        .find(|&command| self.flag(command).swap(false, Ordering::SeqCst))
    }

    /// Clear every flag
    pub fn clear(&self) {
        self.poll_status.store(false, Ordering::SeqCst);
        self.feed_hold.store(false, Ordering::SeqCst);
        self.cycle_start.store(false, Ordering::SeqCst);
        self.soft_reset.store(false, Ordering::SeqCst);
    }
}

/// A unit of work for the writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedCommand {
    /// A text line
    Line(String),
    /// Wait until every written line was acknowledged
    Flush,
    /// Wait until acknowledged and the firmware stopped moving
    Sync,
}

impl QueuedCommand {
    /// Build a line command
    pub fn line(command: impl Into<String>) -> Self {
        Self::Line(command.into())
    }

    /// Map an operator or job line, turning `FLUSH` and `SYNC` into barriers
    pub fn from_line(command: impl Into<String>) -> Self {
        let command = command.into();
        match command.as_str() {
            "FLUSH" => Self::Flush,
            "SYNC" => Self::Sync,
            _ => Self::Line(command),
        }
    }

    /// Whether this is a barrier
    pub fn is_barrier(&self) -> bool {
        matches!(self, Self::Flush | Self::Sync)
    }
}

impl fmt::Display for QueuedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Line(command) => write!(f, "{}", command),
            Self::Flush => write!(f, "FLUSH"),
            Self::Sync => write!(f, "SYNC"),
        }
    }
}

/// Unbounded multi-producer FIFO consumed by the writer
#[derive(Debug, Default)]
pub struct CommandQueue {
    inner: Mutex<VecDeque<QueuedCommand>>,
}

impl CommandQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command
    pub fn push(&self, command: QueuedCommand) {
        self.inner.lock().push_back(command);
    }

    /// Append several commands atomically
    pub fn extend(&self, commands: impl IntoIterator<Item = QueuedCommand>) {
        self.inner.lock().extend(commands);
    }

    /// Take the oldest command
    pub fn pop(&self) -> Option<QueuedCommand> {
        self.inner.lock().pop_front()
    }

    /// Number of pending commands
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Discard every pending command, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let dropped = inner.len();
        inner.clear();
        dropped
    }

    /// Take every pending command
    pub fn drain(&self) -> Vec<QueuedCommand> {
        self.inner.lock().drain(..).collect()
    }
}
