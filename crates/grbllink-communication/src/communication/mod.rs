//! Transport layer
//!
//! Byte transports, the line assembler, the flow-control ledger, the command
//! queue with its real-time side channel and the writer's wake signal.

pub mod ledger;
pub mod line_reader;
pub mod queue;
pub mod serial;
pub mod wake;

use grbllink_core::Result;
use std::io;
use std::time::Duration;

pub use ledger::{Admission, FlowControlLedger};
pub use line_reader::LineBuffer;
pub use queue::{CommandQueue, QueuedCommand, RealTimeCommand, RealTimeFlags};
pub use serial::{
    list_ports, SerialPortInfo, SerialTransport, SerialTransportFactory, SerialWriter,
};
pub use wake::WakeSignal;

/// Baud rate used when none is configured
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// Parameters for opening a transport
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionParams {
    /// Port name
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Open at odd parity first, then reopen without parity
    pub parity_handshake: bool,
    /// Read timeout
    pub read_timeout: Duration,
}

impl ConnectionParams {
    /// Create parameters for a port
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            parity_handshake: true,
            read_timeout: Duration::from_millis(10),
        }
    }

    /// Set the read timeout
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Enable or disable the parity handshake
    pub fn with_parity_handshake(mut self, enabled: bool) -> Self {
        self.parity_handshake = enabled;
        self
    }
}

/// Writing half of a link
pub trait TransportWriter: Send {
    /// Write all bytes
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Byte-oriented, full duplex link to the firmware
pub trait Transport: Send {
    /// Read available bytes.
    ///
    /// Returns `Ok(0)` when nothing arrived within the read timeout.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Port name
    fn name(&self) -> String;

    /// Independent handle for writing.
    ///
    /// Reads block for up to the read timeout; writes through this handle
    /// never wait for them.
    fn try_clone_writer(&self) -> io::Result<Box<dyn TransportWriter>>;
}

/// Opens transports
pub trait TransportFactory: Send + Sync {
    /// Open a transport with the given parameters
    fn open(&self, params: &ConnectionParams) -> Result<Box<dyn Transport>>;

    /// Find a port when none is configured
    fn detect_port(&self) -> Option<String> {
        None
    }
}
