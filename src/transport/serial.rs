//! Serial port transport built on the `serialport` crate.
use super::{ChannelOpener, LineChannel};
use crate::acquisition::deadline_after;
use crate::error::TransportError;
use serde::Serialize;
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

const READ_CHUNK: usize = 1024;
const OPEN_TIMEOUT: Duration = Duration::from_millis(100);

/// Opens real serial ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialOpener;

impl ChannelOpener for SerialOpener {
    fn open(&self, port: &str, baud_rate: u32) -> Result<Box<dyn LineChannel>, TransportError> {
        let handle = serialport::new(port, baud_rate)
            .timeout(OPEN_TIMEOUT)
            .open()
            .map_err(|e| TransportError::Open {
                port: port.to_string(),
                message: e.to_string(),
            })?;
        debug!(port, baud_rate, "Serial port opened");
        Ok(Box::new(SerialLineChannel::new(port, handle)))
    }
}

/// A serial port framed into `\n`-terminated lines.
pub struct SerialLineChannel {
    port_name: String,
    port: Box<dyn SerialPort>,
    pending: Vec<u8>,
}

impl SerialLineChannel {
    /// Wrap an already opened port.
    pub fn new(port_name: impl Into<String>, port: Box<dyn SerialPort>) -> Self {
        Self {
            port_name: port_name.into(),
            port,
            pending: Vec::with_capacity(READ_CHUNK),
        }
    }

    /// Pop the next non-blank line out of the assembly buffer.
    fn take_pending_line(&mut self) -> Option<String> {
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw).trim().to_string();
            if !line.is_empty() {
                return Some(line);
            }
        }
        None
    }

    fn read_error(&self, source: std::io::Error) -> TransportError {
        match source.kind() {
            ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::UnexpectedEof => {
                TransportError::Disconnected {
                    port: self.port_name.clone(),
                }
            }
            _ => TransportError::Read {
                port: self.port_name.clone(),
                source,
            },
        }
    }
}

impl LineChannel for SerialLineChannel {
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        if let Some(line) = self.take_pending_line() {
            return Ok(Some(line));
        }

        let deadline = deadline_after(timeout);
        let mut buffer = [0u8; READ_CHUNK];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.port
                .set_timeout(remaining)
                .map_err(|e| self.read_error(e.into()))?;

            match self.port.read(&mut buffer) {
                Ok(0) => {
                    return Err(TransportError::Disconnected {
                        port: self.port_name.clone(),
                    })
                }
                Ok(n) => {
                    self.pending.extend_from_slice(&buffer[..n]);
                    if let Some(line) = self.take_pending_line() {
                        trace!(port = %self.port_name, line = %line.escape_default(), "Serial data received");
                        return Ok(Some(line));
                    }
                }
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
                Err(e) => return Err(self.read_error(e)),
            }
        }
    }

    fn write_command(&mut self, command: &[u8]) -> Result<(), TransportError> {
        trace!(port = %self.port_name, command = %String::from_utf8_lossy(command).escape_default(), "Writing command");
        self.port
            .write_all(command)
            .and_then(|()| self.port.flush())
            .map_err(|source| TransportError::Write {
                port: self.port_name.clone(),
                source,
            })
    }

    fn clear_input(&mut self) -> Result<(), TransportError> {
        self.pending.clear();
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| self.read_error(e.into()))
    }

    fn close(&mut self) {
        if let Err(e) = self.port.flush() {
            debug!(port = %self.port_name, error = %e, "Flush on close failed");
        }
    }

    fn port(&self) -> &str {
        &self.port_name
    }
}

/// A USB serial port that could host an acquisition device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortSummary {
    /// OS port name, e.g. `/dev/ttyACM0` or `COM3`.
    pub name: String,
    /// USB vendor id.
    pub vid: u16,
    /// USB product id.
    pub pid: u16,
    /// Product string, when the OS reports one.
    pub product: Option<String>,
}

/// List USB serial ports. Ports without vendor/product ids are skipped.
pub fn available_ports() -> Result<Vec<PortSummary>, TransportError> {
    let ports = serialport::available_ports().map_err(|e| TransportError::Open {
        port: "*".to_string(),
        message: e.to_string(),
    })?;

    Ok(ports
        .into_iter()
        .filter_map(|info| match info.port_type {
            SerialPortType::UsbPort(usb) => Some(PortSummary {
                name: info.port_name,
                vid: usb.vid,
                pid: usb.pid,
                product: usb.product,
            }),
            _ => None,
        })
        .collect())
}
