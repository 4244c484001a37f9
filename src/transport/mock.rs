//! In-process transport for tests and dry runs.
//!
//! A [`MockWire`] stands in for the device end of a serial cable: tests feed it
//! lines, inject disconnects and inspect the commands the host wrote. A
//! [`MockOpener`] maps port names to wires.

use super::{ChannelOpener, LineChannel};
use crate::acquisition::deadline_after;
use crate::error::TransportError;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
enum WireItem {
    Line(String),
    Disconnect,
}

#[derive(Debug, Default)]
struct WireState {
    incoming: VecDeque<WireItem>,
    written: Vec<String>,
    open_attempts: usize,
    refuse_opens: bool,
}

/// Device side of a simulated serial link.
#[derive(Debug, Default)]
pub struct MockWire {
    state: Mutex<WireState>,
    readable: Condvar,
}

impl MockWire {
    /// A wire with nothing queued.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue one line for the host to read.
    pub fn feed_line(&self, line: impl Into<String>) {
        self.state
            .lock()
            .incoming
            .push_back(WireItem::Line(line.into()));
        self.readable.notify_all();
    }

    /// Queue several lines in order.
    pub fn feed_lines<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut state = self.state.lock();
            state
                .incoming
                .extend(lines.into_iter().map(|line| WireItem::Line(line.into())));
        }
        self.readable.notify_all();
    }

    /// Make the next read (after already queued lines) fail as a disconnect.
    pub fn inject_disconnect(&self) {
        self.state.lock().incoming.push_back(WireItem::Disconnect);
        self.readable.notify_all();
    }

    /// Fail every future open of this wire.
    pub fn refuse_opens(&self) {
        self.state.lock().refuse_opens = true;
    }

    /// Accept opens again.
    pub fn accept_opens(&self) {
        self.state.lock().refuse_opens = false;
    }

    /// Commands the host has written, without terminators, oldest first.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().written.clone()
    }

    /// Number of open attempts, refused ones included.
    pub fn open_attempts(&self) -> usize {
        self.state.lock().open_attempts
    }

    /// Lines and disconnects not yet consumed by the host.
    pub fn pending(&self) -> usize {
        self.state.lock().incoming.len()
    }
}

/// [`ChannelOpener`] that hands out channels over attached [`MockWire`]s.
#[derive(Debug, Default)]
pub struct MockOpener {
    wires: Mutex<HashMap<String, Arc<MockWire>>>,
}

impl MockOpener {
    /// An opener with no ports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `wire` reachable as `port`.
    pub fn attach(&self, port: impl Into<String>, wire: Arc<MockWire>) {
        self.wires.lock().insert(port.into(), wire);
    }

    /// Builder form of [`attach`](Self::attach).
    pub fn with_wire(self, port: impl Into<String>, wire: Arc<MockWire>) -> Self {
        self.attach(port, wire);
        self
    }
}

impl ChannelOpener for MockOpener {
    fn open(&self, port: &str, _baud_rate: u32) -> Result<Box<dyn LineChannel>, TransportError> {
        let wire = self
            .wires
            .lock()
            .get(port)
            .cloned()
            .ok_or_else(|| TransportError::Open {
                port: port.to_string(),
                message: "no such port".to_string(),
            })?;

        {
            let mut state = wire.state.lock();
            state.open_attempts += 1;
            if state.refuse_opens {
                return Err(TransportError::Open {
                    port: port.to_string(),
                    message: "device not responding".to_string(),
                });
            }
        }

        Ok(Box::new(MockChannel {
            port: port.to_string(),
            wire,
            alive: true,
        }))
    }
}

/// Host side of a [`MockWire`].
#[derive(Debug)]
pub struct MockChannel {
    port: String,
    wire: Arc<MockWire>,
    alive: bool,
}

impl LineChannel for MockChannel {
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        if !self.alive {
            return Err(TransportError::Disconnected {
                port: self.port.clone(),
            });
        }

        let deadline = deadline_after(timeout);
        let mut state = self.wire.state.lock();
        loop {
            match state.incoming.pop_front() {
                Some(WireItem::Line(line)) => return Ok(Some(line)),
                Some(WireItem::Disconnect) => {
                    self.alive = false;
                    return Err(TransportError::Disconnected {
                        port: self.port.clone(),
                    });
                }
                None => {
                    if self.wire.readable.wait_until(&mut state, deadline).timed_out()
                        && state.incoming.is_empty()
                    {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn write_command(&mut self, command: &[u8]) -> Result<(), TransportError> {
        if !self.alive {
            return Err(TransportError::Write {
                port: self.port.clone(),
                source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "device disconnected"),
            });
        }
        let text = String::from_utf8_lossy(command).trim_end().to_string();
        self.wire.state.lock().written.push(text);
        Ok(())
    }

    fn port(&self) -> &str {
        &self.port
    }
}
