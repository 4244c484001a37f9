//! In-memory event accumulation.
//!
//! Every session records into an [`EventLog`] alongside its configured sink,
//! so behavior counts and the latest device configuration can be queried while
//! the session runs and summarized after it ends.

use super::EventSink;
use crate::error::SinkError;
use crate::event::{BehaviorRecord, Event, EventKind};
use parking_lot::RwLock;
use std::sync::Arc;

const INFUSION_COMPONENT: &str = "PUMP";
const INFUSION_ACTION: &str = "INFUSION";

#[derive(Debug, Default)]
struct LogData {
    events: Vec<Event>,
    configuration: Option<serde_json::Value>,
    infusions: u64,
}

/// Cloneable read handle onto accumulated events.
///
/// Only the events themselves are stored; behavior and frame views are
/// derived when asked for.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    data: Arc<RwLock<LogData>>,
}

impl EventLog {
    /// An empty log.
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, event: Event) {
        let mut data = self.data.write();
        match event.kind() {
            EventKind::Behavior => {
                if is_infusion(&event) {
                    data.infusions += 1;
                }
            }
            EventKind::Frame => {}
            EventKind::Configuration => {
                data.configuration = event.configuration();
            }
        }
        data.events.push(event);
    }

    /// Number of events recorded.
    pub fn len(&self) -> usize {
        self.data.read().events.len()
    }

    /// True when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.data.read().events.is_empty()
    }

    /// Copy of every event, in delivery order.
    pub fn events(&self) -> Vec<Event> {
        self.data.read().events.clone()
    }

    /// Sequence numbers in delivery order.
    pub fn seqs(&self) -> Vec<u64> {
        self.data.read().events.iter().map(Event::seq).collect()
    }

    /// Behavior records in delivery order.
    pub fn behavior(&self) -> Vec<BehaviorRecord> {
        self.data
            .read()
            .events
            .iter()
            .filter_map(Event::behavior)
            .collect()
    }

    /// Frame timestamps in delivery order.
    pub fn frames(&self) -> Vec<u64> {
        self.data
            .read()
            .events
            .iter()
            .filter_map(Event::frame_timestamp)
            .collect()
    }

    /// Most recent device configuration block.
    pub fn configuration(&self) -> Option<serde_json::Value> {
        self.data.read().configuration.clone()
    }

    /// Pump infusions recorded so far.
    pub fn infusion_count(&self) -> u64 {
        self.data.read().infusions
    }

    /// Behavior events from `component` with `action`.
    pub fn count_action(&self, component: &str, action: &str) -> usize {
        self.data
            .read()
            .events
            .iter()
            .filter(|e| is_action(e, component, action))
            .count()
    }
}

fn is_action(event: &Event, component: &str, action: &str) -> bool {
    event.kind() == EventKind::Behavior
        && event.field("component") == Some(component)
        && event.field("action") == Some(action)
}

fn is_infusion(event: &Event) -> bool {
    is_action(event, INFUSION_COMPONENT, INFUSION_ACTION)
}

/// Sink that appends into an [`EventLog`].
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    log: EventLog,
}

impl MemorySink {
    /// A sink recording into a fresh log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record into an existing log.
    pub fn with_log(log: EventLog) -> Self {
        Self { log }
    }

    /// Handle onto the recorded events.
    pub fn log(&self) -> EventLog {
        self.log.clone()
    }
}

impl EventSink for MemorySink {
    fn append(&mut self, event: Event) -> Result<(), SinkError> {
        self.log.record(event);
        Ok(())
    }
}
