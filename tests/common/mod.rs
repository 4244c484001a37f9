//! Shared helpers for the integration tests.
#![allow(dead_code)]

use parking_lot::{Condvar, Mutex};
use reacher_daq::config::{RetryPolicy, SessionConfig};
use reacher_daq::error::SinkError;
use reacher_daq::event::Event;
use reacher_daq::logging::{self, TracingConfig};
use reacher_daq::session::{Session, SessionNotice};
use reacher_daq::sink::EventSink;
use reacher_daq::transport::mock::{MockOpener, MockWire};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Generous upper bound for anything the pipeline should finish quickly.
pub const SETTLE: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = logging::init(TracingConfig::new(tracing::Level::WARN).with_ansi(false));
}

/// Fast timeouts, no settle delay, two quick reconnect attempts.
pub fn quick_config(queue_capacity: usize) -> SessionConfig {
    SessionConfig {
        queue_capacity,
        read_timeout: Duration::from_millis(5),
        push_timeout: Duration::from_millis(5),
        link_settle: Duration::ZERO,
        retry: RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        },
        ..SessionConfig::default()
    }
}

/// A well-formed behavior line; the start timestamp doubles as an index.
pub fn press(i: u64) -> String {
    format!("LH_LEVER,ACTIVE_PRESS,{i},{}", i + 1)
}

pub fn presses(range: std::ops::Range<u64>) -> Vec<String> {
    range.map(press).collect()
}

/// An opener with one wire attached per port.
pub fn opener_with(ports: &[&str]) -> (Arc<MockOpener>, Vec<Arc<MockWire>>) {
    let opener = MockOpener::new();
    let wires = ports
        .iter()
        .map(|port| {
            let wire = MockWire::new();
            opener.attach(*port, Arc::clone(&wire));
            wire
        })
        .collect();
    (Arc::new(opener), wires)
}

/// A started session on `COM1` with its wire.
pub fn started_session(
    config: SessionConfig,
    sink: Box<dyn EventSink>,
) -> (Arc<Session>, Arc<MockWire>) {
    init_tracing();
    let (opener, mut wires) = opener_with(&["COM1"]);
    let wire = wires.remove(0);
    let session = Arc::new(
        Session::new("box1", "COM1", config, opener, sink).expect("Failed to create session"),
    );
    session.start().expect("Failed to start session");
    (session, wire)
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Every notice currently buffered on `rx`.
pub fn drain_notices(rx: &mut broadcast::Receiver<SessionNotice>) -> Vec<SessionNotice> {
    let mut notices = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(notice) => notices.push(notice),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return notices,
        }
    }
}

/// A gate that sinks can block on until a test opens it.
#[derive(Clone, Default)]
pub struct Gate {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn open(&self) {
        let (open, cvar) = &*self.state;
        *open.lock() = true;
        cvar.notify_all();
    }

    /// Block until opened; gives up after `timeout` so a broken test cannot hang.
    pub fn wait(&self, timeout: Duration) {
        let (open, cvar) = &*self.state;
        let deadline = Instant::now() + timeout;
        let mut guard = open.lock();
        while !*guard {
            if cvar.wait_until(&mut guard, deadline).timed_out() {
                return;
            }
        }
    }
}

/// Accepts every event, but each append waits for the gate first.
pub struct GatedSink {
    gate: Gate,
}

impl GatedSink {
    pub fn new(gate: Gate) -> Self {
        Self { gate }
    }
}

impl EventSink for GatedSink {
    fn append(&mut self, _event: Event) -> Result<(), SinkError> {
        self.gate.wait(SETTLE);
        Ok(())
    }
}

/// Rejects events whose line sequence number is listed.
pub struct RejectingSink {
    reject: HashSet<u64>,
}

impl RejectingSink {
    pub fn at(seqs: impl IntoIterator<Item = u64>) -> Self {
        Self {
            reject: seqs.into_iter().collect(),
        }
    }
}

impl EventSink for RejectingSink {
    fn append(&mut self, event: Event) -> Result<(), SinkError> {
        if self.reject.contains(&event.seq()) {
            return Err(SinkError::Rejected(format!("disk full at line {}", event.seq())));
        }
        Ok(())
    }
}
