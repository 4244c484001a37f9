//! Multi-device session registry.
//!
//! The controller maps [`SessionHandle`]s to [`Session`]s and enforces that a
//! device (by id or port) has at most one session that is not yet `Stopped`.
//! Sessions on different devices share nothing but the channel opener.

use super::{Session, SessionHandle, SessionNotice, SessionState, SessionStatus};
use crate::config::SessionConfig;
use crate::error::{AcquisitionError, AcquisitionResult};
use crate::sink::{EventLog, EventSink};
use crate::transport::{ChannelOpener, DeviceCommand};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Owns every session started in this process.
pub struct SessionController {
    opener: Arc<dyn ChannelOpener>,
    sessions: RwLock<HashMap<SessionHandle, Arc<Session>>>,
}

impl SessionController {
    /// An empty registry opening channels through `opener`.
    pub fn new(opener: Arc<dyn ChannelOpener>) -> Self {
        Self {
            opener,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Start a session on the device at `device_id`, which is also its port.
    pub fn start(
        &self,
        device_id: &str,
        config: SessionConfig,
        sink: Box<dyn EventSink>,
    ) -> AcquisitionResult<SessionHandle> {
        self.start_on(device_id, device_id, config, sink)
    }

    /// Start a session for `device_id` connected through `port`.
    ///
    /// Fails with `DeviceBusy` while another session for the same device id
    /// or port has not reached `Stopped`. The registry lock is released
    /// before the device is linked.
    pub fn start_on(
        &self,
        device_id: &str,
        port: &str,
        config: SessionConfig,
        sink: Box<dyn EventSink>,
    ) -> AcquisitionResult<SessionHandle> {
        let session = Arc::new(Session::new(
            device_id,
            port,
            config,
            Arc::clone(&self.opener),
            sink,
        )?);
        let handle = session.id();

        {
            let mut sessions = self.sessions.write();
            // No session lock is taken under the registry lock.
            let busy = sessions.values().any(|existing| {
                !existing.is_finished()
                    && (existing.device() == device_id || existing.port() == port)
            });
            if busy {
                warn!(device = device_id, port, "Device already has an active session");
                return Err(AcquisitionError::DeviceBusy {
                    device: device_id.to_string(),
                });
            }
            // Reserve the device while connecting.
            sessions.insert(handle, Arc::clone(&session));
        }

        if let Err(err) = session.start() {
            self.sessions.write().remove(&handle);
            return Err(err);
        }
        info!(device = device_id, port, session = %handle, "Session registered");
        Ok(handle)
    }

    fn get(&self, handle: SessionHandle) -> AcquisitionResult<Arc<Session>> {
        self.sessions
            .read()
            .get(&handle)
            .cloned()
            .ok_or(AcquisitionError::UnknownSession(handle))
    }

    /// Direct access to a session.
    pub fn session(&self, handle: SessionHandle) -> AcquisitionResult<Arc<Session>> {
        self.get(handle)
    }

    /// Pause the session; its reader keeps buffering.
    pub fn pause(&self, handle: SessionHandle) -> AcquisitionResult<()> {
        self.get(handle)?.pause()
    }

    /// Resume a paused session.
    pub fn resume(&self, handle: SessionHandle) -> AcquisitionResult<()> {
        self.get(handle)?.resume()
    }

    /// Stop and drain; returns once the session is `Stopped`.
    pub fn stop(&self, handle: SessionHandle) -> AcquisitionResult<()> {
        self.get(handle)?.stop()
    }

    /// Point-in-time status of one session.
    pub fn status(&self, handle: SessionHandle) -> AcquisitionResult<SessionStatus> {
        Ok(self.get(handle)?.status())
    }

    /// Subscribe to one session's notices.
    pub fn subscribe(
        &self,
        handle: SessionHandle,
    ) -> AcquisitionResult<broadcast::Receiver<SessionNotice>> {
        Ok(self.get(handle)?.subscribe())
    }

    /// The session's in-memory event log.
    pub fn event_log(&self, handle: SessionHandle) -> AcquisitionResult<EventLog> {
        Ok(self.get(handle)?.event_log())
    }

    /// Forward a command to the session's device.
    pub fn send_command(
        &self,
        handle: SessionHandle,
        command: &DeviceCommand,
    ) -> AcquisitionResult<()> {
        self.get(handle)?.send_command(command)
    }

    /// Handle of the session currently holding `device_id`.
    pub fn handle_for(&self, device_id: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .values()
            .find(|s| s.device() == device_id && !s.is_finished())
            .map(|s| s.id())
    }

    /// Status of every registered session, ordered by device.
    pub fn sessions(&self) -> Vec<SessionStatus> {
        let mut statuses: Vec<SessionStatus> =
            self.snapshot().iter().map(|s| s.status()).collect();
        statuses.sort_by(|a, b| a.device.cmp(&b.device));
        statuses
    }

    /// Stop every running or paused session and wait for all to finish.
    pub fn stop_all(&self) {
        for session in self.snapshot() {
            match session.stop() {
                Ok(()) => {}
                Err(AcquisitionError::InvalidTransition {
                    state: SessionState::Stopping,
                    ..
                }) => session.wait_stopped(),
                Err(_) => {}
            }
        }
    }

    /// Forget stopped sessions. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| !s.is_finished());
        before - sessions.len()
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }
}
