//! # grbllink Communication
//!
//! Talks to GRBL laser controllers over a serial line.
//! Provides the byte transports and flow-control primitives, the GRBL
//! protocol controller with its reader, writer and poller threads, firmware
//! flashing and print job streaming.

pub mod communication;
pub mod firmware;
pub mod job;

pub use communication::{
    list_ports, Admission, CommandQueue, ConnectionParams, FlowControlLedger, LineBuffer,
    QueuedCommand, RealTimeCommand, RealTimeFlags, SerialParity, SerialPortInfo,
    SerialTransport, SerialTransportFactory, SerialWriter, Transport, TransportFactory,
    TransportWriter, WakeSignal,
};

pub use firmware::grbl::{
    FirmwareInfo, GrblController, GrblControllerBuilder, GrblResponse, MetaCommand,
    SettingsVerification, StatusReport, WriteOutcome,
};
pub use firmware::{AvrdudeFlasher, FeedIntensityOverrides, FirmwareFlasher, FlashMode};

pub use job::PrintJob;
