//! Line-oriented device transport.
//!
//! The acquisition core only talks to hardware through two traits:
//!
//! - [`LineChannel`]: an open link that yields newline-terminated lines with a
//!   bounded read timeout and accepts host commands.
//! - [`ChannelOpener`]: opens a [`LineChannel`] for a port at a given baud rate.
//!   Sessions keep the opener so they can re-open the link after a fault.
//!
//! [`TransportLink`] wraps an opener and the currently open channel and
//! implements the `LINK` handshake and the reconnect policy.

pub mod link;
pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;

pub use link::TransportLink;

use crate::error::TransportError;
use std::fmt;
use std::time::Duration;

/// An open, line-oriented connection to one device.
pub trait LineChannel: Send {
    /// Read the next complete line.
    ///
    /// Returns `Ok(None)` when `timeout` elapses without a full line, so callers
    /// can re-check their control flags.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError>;

    /// Write raw command bytes (terminator included) to the device.
    fn write_command(&mut self, command: &[u8]) -> Result<(), TransportError>;

    /// Discard anything the device sent that has not been read yet.
    fn clear_input(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Release the underlying connection.
    fn close(&mut self) {}

    /// Name of the port this channel is connected to.
    fn port(&self) -> &str;
}

/// Opens [`LineChannel`]s by port name.
pub trait ChannelOpener: Send + Sync {
    /// Open `port` at `baud_rate`.
    fn open(&self, port: &str, baud_rate: u32) -> Result<Box<dyn LineChannel>, TransportError>;
}

/// Host-to-device commands understood by the acquisition firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Announce the host after the port is opened.
    Link,
    /// Release the device before the port is closed.
    Unlink,
    /// Begin the behavioral program.
    StartProgram,
    /// End the behavioral program.
    EndProgram,
    /// Any other firmware command.
    Raw(String),
}

impl DeviceCommand {
    /// Command text without terminator.
    pub fn as_str(&self) -> &str {
        match self {
            DeviceCommand::Link => "LINK",
            DeviceCommand::Unlink => "UNLINK",
            DeviceCommand::StartProgram => "START-PROGRAM",
            DeviceCommand::EndProgram => "END-PROGRAM",
            DeviceCommand::Raw(command) => command.as_str(),
        }
    }

    /// Bytes written to the wire, newline-terminated.
    pub fn to_wire(&self) -> Vec<u8> {
        format!("{}\n", self.as_str()).into_bytes()
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_newline_terminated() {
        assert_eq!(DeviceCommand::Link.to_wire(), b"LINK\n");
        assert_eq!(DeviceCommand::EndProgram.to_wire(), b"END-PROGRAM\n");
        assert_eq!(
            DeviceCommand::Raw("SET-TIMEOUT 20".into()).to_wire(),
            b"SET-TIMEOUT 20\n"
        );
    }

    #[test]
    fn display_matches_wire_text() {
        assert_eq!(DeviceCommand::StartProgram.to_string(), "START-PROGRAM");
        assert_eq!(DeviceCommand::Unlink.to_string(), "UNLINK");
    }
}
