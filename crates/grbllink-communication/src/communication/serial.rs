//! Serial port transport
//!
//! Provides the serialport-backed [`Transport`] used in production:
//! - Port enumeration and auto-detection
//! - The odd-then-none parity handshake some GRBL boards need on open
//! - Short read timeouts mapped to empty reads

use crate::communication::{
    ConnectionParams, SerialParity, Transport, TransportFactory, TransportWriter,
};
use grbllink_core::{ConnectionError, Result};
use std::io::{self, Read, Write};

/// Device name prefixes considered when auto-detecting a port
const CANDIDATE_PREFIXES: [&str; 7] = [
    "/dev/ttyUSB",
    "/dev/ttyACM",
    "/dev/ttyAMA",
    "/dev/tty.usb",
    "/dev/cu.",
    "/dev/cuaU",
    "/dev/rfcomm",
];

/// Information about an available serial port
#[derive(Debug, Clone, PartialEq)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0")
    pub port_name: String,

    /// Port description (e.g., "USB Serial Port")
    pub description: String,

    /// USB vendor ID if applicable
    pub vid: Option<u16>,

    /// USB product ID if applicable
    pub pid: Option<u16>,
}

impl SerialPortInfo {
    /// Create a new port info
    pub fn new(port_name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            description: description.into(),
            vid: None,
            pid: None,
        }
    }

    /// Set USB IDs
    pub fn with_usb_ids(mut self, vid: u16, pid: u16) -> Self {
        self.vid = Some(vid);
        self.pid = Some(pid);
        self
    }
}

/// List serial ports that may carry a GRBL controller
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(|e| {
        tracing::error!("Failed to enumerate serial ports: {}", e);
        ConnectionError::Io {
            reason: format!("failed to enumerate ports: {}", e),
        }
    })?;

    Ok(ports
        .iter()
        .filter(|port| is_candidate_port(&port.port_name))
        .map(|port| {
            let info = SerialPortInfo::new(&port.port_name, get_port_description(port));
            match &port.port_type {
                serialport::SerialPortType::UsbPort(usb) => info.with_usb_ids(usb.vid, usb.pid),
                _ => info,
            }
        })
        .collect())
}

/// Check if a port name matches one of the auto-detection patterns
pub fn is_candidate_port(port_name: &str) -> bool {
    CANDIDATE_PREFIXES
        .iter()
        .any(|prefix| port_name.starts_with(prefix))
}

/// Get a user-friendly description for a port
fn get_port_description(port: &serialport::SerialPortInfo) -> String {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb_info) => {
            format!(
                "USB {} {}",
                usb_info.manufacturer.as_deref().unwrap_or("Device"),
                usb_info.product.as_deref().unwrap_or("Serial Port")
            )
        }
        serialport::SerialPortType::BluetoothPort => "Bluetooth Serial".to_string(),
        serialport::SerialPortType::PciPort => "PCI Serial".to_string(),
        _ => "Serial Port".to_string(),
    }
}

/// Convert a parity setting to serialport format
fn to_serialport_parity(parity: SerialParity) -> serialport::Parity {
    match parity {
        SerialParity::None => serialport::Parity::None,
        SerialParity::Even => serialport::Parity::Even,
        SerialParity::Odd => serialport::Parity::Odd,
    }
}

/// Serial transport backed by the serialport crate
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl SerialTransport {
    /// Open a serial port with the given parameters
    pub fn open(params: &ConnectionParams) -> Result<Self> {
        if params.parity_handshake {
            // Boards with the CH340 bridge only sync after an odd-parity open.
            let probe = Self::open_with_parity(params, SerialParity::Odd)?;
            drop(probe);
        }
        Self::open_with_parity(params, SerialParity::None)
    }

    fn open_with_parity(params: &ConnectionParams, parity: SerialParity) -> Result<Self> {
        let builder = serialport::new(&params.port, params.baud_rate)
            .timeout(params.read_timeout)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(to_serialport_parity(parity))
            .flow_control(serialport::FlowControl::None);

        match builder.open() {
            Ok(port) => Ok(SerialTransport {
                port,
                name: params.port.clone(),
            }),
            Err(e) => {
                tracing::warn!("Failed to open serial port {}: {}", params.port, e);
                Err(ConnectionError::FailedToOpen {
                    port: params.port.clone(),
                    reason: e.to_string(),
                }
                .into())
            }
        }
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn name(&self) -> String {
        self.name.clone()
    }

    fn try_clone_writer(&self) -> io::Result<Box<dyn TransportWriter>> {
        let port = self.port.try_clone().map_err(io::Error::from)?;
        Ok(Box::new(SerialWriter { port }))
    }
}

/// Writing handle cloned from a [`SerialTransport`]
pub struct SerialWriter {
    port: Box<dyn serialport::SerialPort>,
}

impl TransportWriter for SerialWriter {
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.port.write_all(data)?;
        self.port.flush()
    }
}

/// Factory opening [`SerialTransport`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialTransportFactory;

impl TransportFactory for SerialTransportFactory {
    fn open(&self, params: &ConnectionParams) -> Result<Box<dyn Transport>> {
        Ok(Box::new(SerialTransport::open(params)?))
    }

    fn detect_port(&self) -> Option<String> {
        match list_ports() {
            Ok(ports) => ports.into_iter().next().map(|p| p.port_name),
            Err(e) => {
                tracing::warn!("Port detection failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_ports() {
        assert!(is_candidate_port("/dev/ttyUSB0"));
        assert!(is_candidate_port("/dev/ttyAMA0"));
        assert!(is_candidate_port("/dev/cu.usbserial-1410"));
        assert!(is_candidate_port("/dev/rfcomm0"));
        assert!(!is_candidate_port("/dev/ttyS0"));
        assert!(!is_candidate_port("COM3"));
    }

    #[test]
    fn test_parity_mapping() {
        assert_eq!(
            to_serialport_parity(SerialParity::Odd),
            serialport::Parity::Odd
        );
        assert_eq!(
            to_serialport_parity(SerialParity::None),
            serialport::Parity::None
        );
    }
}
