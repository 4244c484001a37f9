//! Device sessions.
//!
//! A [`Session`] owns one acquisition pipeline: a [`TransportLink`], an
//! [`EventQueue`](crate::acquisition::EventQueue), its [`ControlFlags`](crate::acquisition::ControlFlags),
//! and the reader/processor thread pair. Only the session mutates its
//! [`SessionState`]; the pipeline threads observe the flags.
//!
//! ## Threads
//!
//! `start()` spawns a supervisor thread (`session-<device>`) which spawns the
//! reader and processor, joins the reader, forces processing on for the
//! drain, joins the processor and finally disconnects and publishes
//! `Stopped`. Panics in either worker are caught at join and recorded as an
//! internal fault.
//!
//! ## Stop
//!
//! `stop()` returns only after the drain has finished: the queue is empty,
//! `program_running` is cleared and the link is closed.

pub mod controller;
pub mod limits;
pub mod state;

pub use controller::SessionController;
pub use state::{Fault, FaultKind, SessionNotice, SessionState, StopReason};

use crate::acquisition::processor::ProcessorTask;
use crate::acquisition::reader::ReaderTask;
use crate::acquisition::{PipelineContext, SessionStats};
use crate::config::SessionConfig;
use crate::error::{AcquisitionError, AcquisitionResult};
use crate::sink::{EventLog, EventSink, FanoutSink, MemorySink};
use crate::transport::{ChannelOpener, DeviceCommand, TransportLink};
use chrono::{DateTime, Utc};
use limits::ProgramClock;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Opaque identifier of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionHandle(Uuid);

impl SessionHandle {
    /// A fresh random handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Snapshot returned by [`Session::status`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: SessionHandle,
    pub device: String,
    pub port: String,
    /// Lifecycle state when the snapshot was taken.
    pub state: SessionState,
    /// Set once the session is `Stopped`.
    pub stop_reason: Option<StopReason>,
    pub stats: SessionStats,
    pub started_at: Option<DateTime<Utc>>,
    /// Time spent running, excluding pauses.
    #[serde(with = "humantime_serde")]
    pub active_time: Duration,
}

impl SessionStatus {
    /// The retained fault, if the session ended on one.
    pub fn fault(&self) -> Option<&Fault> {
        self.stop_reason.as_ref().and_then(StopReason::fault)
    }
}

struct SessionInner {
    state: SessionState,
    sink: Option<Box<dyn EventSink>>,
    requested: Option<StopReason>,
    stop_reason: Option<StopReason>,
    clock: ProgramClock,
    started_at: Option<DateTime<Utc>>,
    supervisor: Option<JoinHandle<()>>,
}

/// One acquisition session against one device.
pub struct Session {
    id: SessionHandle,
    device: String,
    config: SessionConfig,
    ctx: Arc<PipelineContext>,
    link: Arc<TransportLink>,
    log: EventLog,
    inner: Mutex<SessionInner>,
    stopped: Condvar,
    /// Mirrors `state == Stopped` for readers that must not lock `inner`.
    finished: AtomicBool,
}

impl Session {
    /// Create an `Idle` session for `device` on `port`.
    ///
    /// Every event is recorded into the session's [`EventLog`] and then
    /// passed to `sink`.
    pub fn new(
        device: impl Into<String>,
        port: impl Into<String>,
        config: SessionConfig,
        opener: Arc<dyn ChannelOpener>,
        sink: Box<dyn EventSink>,
    ) -> AcquisitionResult<Self> {
        config.validate().map_err(AcquisitionError::Config)?;
        let device = device.into();
        let log = EventLog::new();
        let mut fanout = FanoutSink::new().with(MemorySink::with_log(log.clone()));
        fanout.push(sink);

        let link = TransportLink::new(port, config.baud_rate, config.link_settle, opener);
        Ok(Self {
            id: SessionHandle::new(),
            ctx: Arc::new(PipelineContext::new(device.clone(), config.queue_capacity)),
            device,
            config,
            link: Arc::new(link),
            log,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                sink: Some(Box::new(fanout)),
                requested: None,
                stop_reason: None,
                clock: ProgramClock::default(),
                started_at: None,
                supervisor: None,
            }),
            stopped: Condvar::new(),
            finished: AtomicBool::new(false),
        })
    }

    /// Handle identifying this session.
    pub fn id(&self) -> SessionHandle {
        self.id
    }

    /// Device id given at creation.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Serial port the session reads from.
    pub fn port(&self) -> &str {
        self.link.port()
    }

    /// Validated configuration the session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// True once the session is `Stopped`. Takes no lock.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Active time so far.
    pub fn active_time(&self) -> Duration {
        self.inner.lock().clock.active_time(Instant::now())
    }

    /// In-memory record of every delivered event.
    pub fn event_log(&self) -> EventLog {
        self.log.clone()
    }

    /// Subscribe to this session's notices.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.ctx.subscribe()
    }

    /// Link the device, send `START-PROGRAM` and spawn the pipeline.
    ///
    /// Valid only from `Idle`. A failed connect leaves the session `Idle`.
    /// The session lock is not held while linking, so `status()` and the
    /// other sessions stay responsive during the link settle and retries.
    pub fn start(self: &Arc<Self>) -> AcquisitionResult<()> {
        // Taking the sink reserves the start; a concurrent start finds none.
        let sink = {
            let mut inner = self.inner.lock();
            let state = inner.state;
            if !state.can_start() {
                return Err(invalid("start", state));
            }
            let Some(sink) = inner.sink.take() else {
                return Err(invalid("start", state));
            };
            sink
        };

        if let Err(err) = self.link_device() {
            self.inner.lock().sink = Some(sink);
            return Err(err);
        }

        let mut inner = self.inner.lock();
        let flags = self.ctx.flags();
        flags.set_serial_active(true);
        flags.set_program_running(true);

        let name = format!("session-{}", self.device);
        let session = Arc::clone(self);
        let supervisor = thread::Builder::new()
            .name(name.clone())
            .spawn(move || session.supervise(sink));

        match supervisor {
            Ok(handle) => inner.supervisor = Some(handle),
            Err(source) => {
                flags.set_serial_active(false);
                flags.set_program_running(false);
                self.link.disconnect();
                let err = AcquisitionError::ThreadSpawn { name, source };
                let fault = Fault::new(FaultKind::Internal, err.to_string());
                inner.stop_reason = Some(StopReason::Fault(fault));
                self.set_state(&mut inner, SessionState::Stopped);
                drop(inner);
                self.stopped.notify_all();
                return Err(err);
            }
        }

        inner.clock.start(Instant::now());
        inner.started_at = Some(Utc::now());
        self.set_state(&mut inner, SessionState::Running);
        drop(inner);

        info!(
            device = %self.device,
            port = %self.port(),
            session = %self.id,
            queue_capacity = self.config.queue_capacity,
            "Session started"
        );

        if let Some(limits) = self.config.limits.clone() {
            if let Err(err) = limits::spawn_monitor(self, limits) {
                warn!(device = %self.device, error = %err, "Program limits will not be enforced");
            }
        }
        Ok(())
    }

    fn link_device(&self) -> AcquisitionResult<()> {
        self.link.connect_with_retry(&self.config.retry)?;
        if let Err(err) = self.link.send(&DeviceCommand::StartProgram) {
            self.link.disconnect();
            return Err(err.into());
        }
        Ok(())
    }

    /// Halt processing. The reader keeps filling the queue up to capacity.
    ///
    /// Returns once no event is being processed.
    pub fn pause(&self) -> AcquisitionResult<()> {
        let mut inner = self.inner.lock();
        if !inner.state.can_pause() {
            return Err(invalid("pause", inner.state));
        }
        self.ctx.flags().set_program_running(false);
        inner.clock.pause(Instant::now());
        self.set_state(&mut inner, SessionState::Paused);
        info!(device = %self.device, depth = self.ctx.queue().len(), "Session paused");
        Ok(())
    }

    /// Resume processing, starting with the lines buffered while paused.
    pub fn resume(&self) -> AcquisitionResult<()> {
        let mut inner = self.inner.lock();
        if !inner.state.can_resume() {
            return Err(invalid("resume", inner.state));
        }
        self.ctx.flags().set_program_running(true);
        inner.clock.resume(Instant::now());
        self.set_state(&mut inner, SessionState::Running);
        info!(device = %self.device, depth = self.ctx.queue().len(), "Session resumed");
        Ok(())
    }

    /// Stop reading, drain the queue and disconnect.
    pub fn stop(&self) -> AcquisitionResult<()> {
        self.stop_with(StopReason::Requested)
    }

    /// [`stop`](Self::stop) recording `reason` as the stop reason.
    pub fn stop_with(&self, reason: StopReason) -> AcquisitionResult<()> {
        let supervisor = {
            let mut inner = self.inner.lock();
            if !inner.state.can_stop() {
                return Err(invalid("stop", inner.state));
            }
            info!(device = %self.device, reason = %reason, depth = self.ctx.queue().len(), "Stopping session");
            inner.requested = Some(reason);
            inner.clock.stop(Instant::now());
            self.set_state(&mut inner, SessionState::Stopping);
            inner.supervisor.take()
        };

        // Stopping rejects every other transition, so the lock can be released
        // while the command waits for the channel.
        if let Err(err) = self.link.send(&DeviceCommand::EndProgram) {
            warn!(device = %self.device, error = %err, "Failed to send END-PROGRAM");
        }

        {
            let inner = self.inner.lock();
            // A fault may have finished the session while END-PROGRAM was out.
            if inner.state == SessionState::Stopping {
                let flags = self.ctx.flags();
                flags.set_serial_active(false);
                // Drain even when stopped from Paused.
                flags.set_program_running(true);
            }
        }

        if let Some(handle) = supervisor {
            if handle.join().is_err() {
                self.force_stopped("session supervisor panicked");
            }
        }
        self.wait_stopped();
        Ok(())
    }

    /// Send a raw command to the device while the session is active.
    pub fn send_command(&self, command: &DeviceCommand) -> AcquisitionResult<()> {
        let state = self.state();
        if !matches!(state, SessionState::Running | SessionState::Paused) {
            return Err(invalid("send a command to", state));
        }
        self.link.send(command)?;
        Ok(())
    }

    /// Block until the session is `Stopped`.
    pub fn wait_stopped(&self) {
        let mut inner = self.inner.lock();
        while inner.state != SessionState::Stopped {
            self.stopped.wait(&mut inner);
        }
    }

    /// Block until the session is `Stopped` or `timeout` elapses.
    pub fn wait_stopped_timeout(&self, timeout: Duration) -> bool {
        let deadline = crate::acquisition::deadline_after(timeout);
        let mut inner = self.inner.lock();
        while inner.state != SessionState::Stopped {
            if self.stopped.wait_until(&mut inner, deadline).timed_out() {
                return inner.state == SessionState::Stopped;
            }
        }
        true
    }

    /// Point-in-time status.
    pub fn status(&self) -> SessionStatus {
        let inner = self.inner.lock();
        SessionStatus {
            id: self.id,
            device: self.device.clone(),
            port: self.port().to_string(),
            state: inner.state,
            stop_reason: inner.stop_reason.clone(),
            stats: self.ctx.stats().snapshot(self.ctx.queue().len()),
            started_at: inner.started_at,
            active_time: inner.clock.active_time(Instant::now()),
        }
    }

    fn set_state(&self, inner: &mut SessionInner, state: SessionState) {
        inner.state = state;
        self.finished
            .store(state == SessionState::Stopped, Ordering::Release);
        self.ctx.notify(SessionNotice::StateChanged {
            device: self.device.clone(),
            state,
        });
    }

    fn supervise(self: Arc<Self>, sink: Box<dyn EventSink>) {
        let ctx = &self.ctx;
        let processor =
            match ProcessorTask::new(Arc::clone(ctx), sink, self.config.fail_fast_on_sink_error)
                .spawn()
            {
                Ok(handle) => Some(handle),
                Err(err) => {
                    ctx.record_fault(Fault::new(FaultKind::Internal, err.to_string()));
                    ctx.flags().set_serial_active(false);
                    None
                }
            };

        let reader = if processor.is_some() {
            match ReaderTask::new(Arc::clone(ctx), Arc::clone(&self.link), &self.config).spawn() {
                Ok(handle) => Some(handle),
                Err(err) => {
                    ctx.record_fault(Fault::new(FaultKind::Internal, err.to_string()));
                    None
                }
            }
        } else {
            None
        };

        if let Some(reader) = reader {
            if reader.join().is_err() {
                ctx.record_fault(Fault::new(FaultKind::Internal, "reader thread panicked"));
            }
        }
        ctx.queue().close();

        self.begin_drain();

        if let Some(processor) = processor {
            if processor.join().is_err() {
                ctx.record_fault(Fault::new(FaultKind::Internal, "processor thread panicked"));
            }
        }

        self.finish();
    }

    /// Enter `Stopping` if the reader ended without a stop request, and make
    /// sure the processor drains.
    fn begin_drain(&self) {
        let unrequested = {
            let mut inner = self.inner.lock();
            let flags = self.ctx.flags();
            flags.set_serial_active(false);
            let unrequested = inner.state.can_stop();
            if unrequested {
                inner.clock.stop(Instant::now());
                self.set_state(&mut inner, SessionState::Stopping);
            }
            flags.set_program_running(true);
            unrequested
        };
        if unrequested {
            if let Err(err) = self.link.send(&DeviceCommand::EndProgram) {
                debug!(device = %self.device, error = %err, "END-PROGRAM not sent");
            }
        }
        debug!(device = %self.device, depth = self.ctx.queue().len(), "Draining event queue");
    }

    fn finish(&self) {
        self.link.disconnect();

        let mut inner = self.inner.lock();
        // Under the lock so a stop still sending END-PROGRAM cannot re-raise it.
        self.ctx.flags().set_program_running(false);
        let reason = match self.ctx.fault() {
            Some(fault) => StopReason::Fault(fault),
            None => inner.requested.take().unwrap_or(StopReason::Requested),
        };
        inner.clock.stop(Instant::now());
        inner.stop_reason = Some(reason.clone());
        self.set_state(&mut inner, SessionState::Stopped);
        self.ctx.notify(SessionNotice::Stopped {
            device: self.device.clone(),
            reason: reason.clone(),
        });
        drop(inner);
        self.stopped.notify_all();

        let stats = self.ctx.stats().snapshot(self.ctx.queue().len());
        match reason.fault() {
            Some(fault) => error!(
                device = %self.device,
                kind = %fault.kind,
                reason = %fault.reason,
                delivered = stats.events_delivered,
                undelivered = stats.undelivered,
                "Session stopped on fault"
            ),
            None => info!(
                device = %self.device,
                reason = %reason,
                lines = stats.lines_read,
                delivered = stats.events_delivered,
                "Session stopped"
            ),
        }
    }

    fn force_stopped(&self, reason: &str) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Stopped {
            return;
        }
        error!(device = %self.device, reason, "Forcing session to Stopped");
        self.ctx.flags().set_program_running(false);
        let fault = Fault::new(FaultKind::Internal, reason);
        inner.stop_reason = Some(StopReason::Fault(fault));
        self.set_state(&mut inner, SessionState::Stopped);
        drop(inner);
        self.stopped.notify_all();
    }
}

fn invalid(operation: &'static str, state: SessionState) -> AcquisitionError {
    AcquisitionError::InvalidTransition { operation, state }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::NullSink;
    use crate::transport::mock::{MockOpener, MockWire};

    fn quick_config() -> SessionConfig {
        SessionConfig {
            queue_capacity: 16,
            read_timeout: Duration::from_millis(5),
            push_timeout: Duration::from_millis(5),
            link_settle: Duration::ZERO,
            ..SessionConfig::default()
        }
    }

    fn session_on(wire: &Arc<MockWire>) -> Arc<Session> {
        let opener = Arc::new(MockOpener::new().with_wire("COM4", Arc::clone(wire)));
        Arc::new(Session::new("box1", "COM4", quick_config(), opener, Box::new(NullSink)).unwrap())
    }

    #[test]
    fn new_session_is_idle() {
        let session = session_on(&MockWire::new());
        let status = session.status();
        assert_eq!(status.state, SessionState::Idle);
        assert!(status.started_at.is_none());
        assert_eq!(status.active_time, Duration::ZERO);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let opener = Arc::new(MockOpener::new());
        let config = SessionConfig {
            queue_capacity: 0,
            ..quick_config()
        };
        let result = Session::new("box1", "COM4", config, opener, Box::new(NullSink));
        assert!(matches!(result, Err(AcquisitionError::Config(_))));
    }

    #[test]
    fn failed_connect_leaves_session_idle_and_restartable() {
        let wire = MockWire::new();
        wire.refuse_opens();
        let opener = Arc::new(MockOpener::new().with_wire("COM4", Arc::clone(&wire)));
        let config = SessionConfig {
            retry: crate::config::RetryPolicy {
                max_attempts: 0,
                ..Default::default()
            },
            ..quick_config()
        };
        let session = Arc::new(Session::new("box1", "COM4", config, opener, Box::new(NullSink)).unwrap());

        assert!(matches!(session.start(), Err(AcquisitionError::Transport(_))));
        assert_eq!(session.state(), SessionState::Idle);

        wire.accept_opens();
        session.start().unwrap();
        session.stop().unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn handshake_commands_are_sent_in_order() {
        let wire = MockWire::new();
        let session = session_on(&wire);
        session.start().unwrap();
        session.stop().unwrap();
        assert_eq!(
            wire.commands(),
            vec!["LINK", "START-PROGRAM", "END-PROGRAM", "UNLINK"]
        );
    }

    #[test]
    fn transitions_from_wrong_state_fail_without_side_effects() {
        let wire = MockWire::new();
        let session = session_on(&wire);

        assert!(matches!(
            session.pause(),
            Err(AcquisitionError::InvalidTransition { operation: "pause", state: SessionState::Idle })
        ));
        assert!(session.stop().is_err());
        assert!(wire.commands().is_empty());

        session.start().unwrap();
        assert!(session.resume().is_err());
        assert!(session.start().is_err());
        session.pause().unwrap();
        assert!(session.pause().is_err());
        session.resume().unwrap();
        session.stop().unwrap();

        assert!(session.stop().is_err());
        assert!(session.resume().is_err());
        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.status().stop_reason, Some(StopReason::Requested));
    }

    #[test]
    fn notices_trace_the_lifecycle() {
        let wire = MockWire::new();
        let session = session_on(&wire);
        let mut notices = session.subscribe();

        session.start().unwrap();
        session.pause().unwrap();
        session.stop().unwrap();

        let mut states = Vec::new();
        while let Ok(notice) = notices.try_recv() {
            if let SessionNotice::StateChanged { state, .. } = notice {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![
                SessionState::Running,
                SessionState::Paused,
                SessionState::Stopping,
                SessionState::Stopped
            ]
        );
    }

    #[test]
    fn raw_commands_require_an_active_session() {
        let wire = MockWire::new();
        let session = session_on(&wire);
        let command = DeviceCommand::Raw("LH_LEVER_ACTIVE".into());
        assert!(session.send_command(&command).is_err());

        session.start().unwrap();
        session.send_command(&command).unwrap();
        session.stop().unwrap();
        assert!(wire.commands().contains(&"LH_LEVER_ACTIVE".to_string()));
    }

    struct SlowSink;

    impl EventSink for SlowSink {
        fn append(&mut self, _event: crate::event::Event) -> Result<(), crate::error::SinkError> {
            thread::sleep(Duration::from_millis(1));
            Ok(())
        }
    }

    fn slow_session_on(wire: &Arc<MockWire>) -> Arc<Session> {
        let opener = Arc::new(MockOpener::new().with_wire("COM4", Arc::clone(wire)));
        Arc::new(Session::new("box1", "COM4", quick_config(), opener, Box::new(SlowSink)).unwrap())
    }

    fn presses(count: u64) -> Vec<String> {
        (0..count).map(|i| format!("LH_LEVER,PRESS,{i},{i}")).collect()
    }

    fn wait_for_depth(session: &Session, depth: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.ctx.queue().len() < depth && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn assert_drained(session: &Session, lines: usize) {
        let flags = session.ctx.flags();
        assert!(!flags.program_running());
        assert!(!flags.serial_active());
        assert!(session.ctx.queue().is_empty());
        assert!(session.ctx.queue().is_closed());

        let status = session.status();
        assert_eq!(status.state, SessionState::Stopped);
        assert_eq!(status.stats.undelivered, 0);
        assert_eq!(status.stats.events_delivered, status.stats.lines_read);
        assert_eq!(session.event_log().len(), lines);
    }

    #[test]
    fn stop_while_running_drains_buffered_lines() {
        let wire = MockWire::new();
        let session = slow_session_on(&wire);
        session.start().unwrap();

        wire.feed_lines(presses(100));
        wait_for_depth(&session, 8);
        session.stop().unwrap();

        let lines = session.status().stats.lines_read as usize;
        assert!(lines > 0);
        assert_drained(&session, lines);
    }

    #[test]
    fn stop_while_paused_drains_buffered_lines() {
        let wire = MockWire::new();
        let session = slow_session_on(&wire);
        session.start().unwrap();
        session.pause().unwrap();

        wire.feed_lines(presses(10));
        wait_for_depth(&session, 10);
        assert_eq!(session.ctx.queue().len(), 10);
        session.stop().unwrap();

        assert_drained(&session, 10);
        assert_eq!(session.status().stop_reason, Some(StopReason::Requested));
    }

    #[test]
    fn finished_flag_follows_stopped_state() {
        let wire = MockWire::new();
        let session = session_on(&wire);
        assert!(!session.is_finished());
        session.start().unwrap();
        assert!(!session.is_finished());
        session.stop().unwrap();
        assert!(session.is_finished());
    }
}
