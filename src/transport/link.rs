//! Session-owned wrapper around the open channel.
//!
//! The reader thread holds the channel lock only for one bounded read at a
//! time and releases it fairly, so command writes from the controlling thread
//! wait at most one read timeout.

use super::{ChannelOpener, DeviceCommand, LineChannel};
use crate::acquisition::deadline_after;
use crate::config::RetryPolicy;
use crate::error::TransportError;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const ABORT_POLL: Duration = Duration::from_millis(10);

/// The connection to one device, re-openable through its [`ChannelOpener`].
pub struct TransportLink {
    port: String,
    baud_rate: u32,
    settle: Duration,
    opener: Arc<dyn ChannelOpener>,
    channel: Mutex<Option<Box<dyn LineChannel>>>,
}

impl TransportLink {
    /// Create a link that is not yet connected.
    pub fn new(
        port: impl Into<String>,
        baud_rate: u32,
        settle: Duration,
        opener: Arc<dyn ChannelOpener>,
    ) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            settle,
            opener,
            channel: Mutex::new(None),
        }
    }

    /// Port this link connects to.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Whether a channel is currently open.
    pub fn is_connected(&self) -> bool {
        self.channel.lock().is_some()
    }

    /// Open the port, wait for the device to settle, send `LINK` and clear stale input.
    pub fn connect(&self) -> Result<(), TransportError> {
        let mut channel = self.opener.open(&self.port, self.baud_rate)?;
        if !self.settle.is_zero() {
            debug!(port = %self.port, settle_ms = self.settle.as_millis(), "Waiting for device to settle");
            thread::sleep(self.settle);
        }
        channel.write_command(&DeviceCommand::Link.to_wire())?;
        channel.clear_input()?;

        if let Some(mut previous) = self.channel.lock().replace(channel) {
            previous.close();
        }
        info!(port = %self.port, baud_rate = self.baud_rate, "Device linked");
        Ok(())
    }

    /// Connect, retrying per `policy` when the first attempt fails.
    pub fn connect_with_retry(&self, policy: &RetryPolicy) -> Result<(), TransportError> {
        match self.connect() {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!(port = %self.port, error = %first, "Initial connect failed");
                self.reconnect(policy, || false, |_, _| {})
                    .map(|_| ())
                    .map_err(|last| last.unwrap_or(first))
            }
        }
    }

    /// Read one line with a bounded timeout.
    pub fn read_line(&self, timeout: Duration) -> Result<Option<String>, TransportError> {
        let mut guard = self.channel.lock();
        let result = match guard.as_mut() {
            Some(channel) => channel.read_line(timeout),
            None => Err(TransportError::NotConnected),
        };
        MutexGuard::unlock_fair(guard);
        result
    }

    /// Send a command to the device.
    pub fn send(&self, command: &DeviceCommand) -> Result<(), TransportError> {
        let mut guard = self.channel.lock();
        let channel = guard.as_mut().ok_or(TransportError::NotConnected)?;
        debug!(port = %self.port, %command, "Sending command");
        channel.write_command(&command.to_wire())
    }

    /// Drop the current channel and re-open it per `policy`.
    ///
    /// Returns `Ok(true)` once reconnected, `Ok(false)` if `should_abort` turned
    /// true while backing off, and `Err` with the last open error (if any attempt
    /// was made) when every attempt failed.
    pub fn reconnect(
        &self,
        policy: &RetryPolicy,
        should_abort: impl Fn() -> bool,
        mut on_failure: impl FnMut(u32, &TransportError),
    ) -> Result<bool, Option<TransportError>> {
        if let Some(mut stale) = self.channel.lock().take() {
            stale.close();
        }

        let mut last = None;
        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay_for(attempt);
            if !sleep_unless(delay, &should_abort) {
                debug!(port = %self.port, attempt, "Reconnect aborted");
                return Ok(false);
            }
            match self.connect() {
                Ok(()) => {
                    info!(port = %self.port, attempt, "Reconnected");
                    return Ok(true);
                }
                Err(err) => {
                    warn!(port = %self.port, attempt, max_attempts = policy.max_attempts, error = %err, "Reconnect attempt failed");
                    on_failure(attempt, &err);
                    last = Some(err);
                }
            }
        }
        Err(last)
    }

    /// Send `UNLINK` (best effort) and close the channel.
    pub fn disconnect(&self) {
        let Some(mut channel) = self.channel.lock().take() else {
            return;
        };
        if let Err(err) = channel.write_command(&DeviceCommand::Unlink.to_wire()) {
            warn!(port = %self.port, error = %err, "Failed to send UNLINK");
        }
        channel.close();
        info!(port = %self.port, "Serial port closed");
    }
}

/// Sleep for `duration` in short slices. Returns `false` if aborted early.
fn sleep_unless(duration: Duration, should_abort: &impl Fn() -> bool) -> bool {
    let deadline = deadline_after(duration);
    loop {
        if should_abort() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(ABORT_POLL));
    }
}
