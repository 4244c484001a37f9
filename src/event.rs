//! Structured events parsed from device lines.
//!
//! The firmware emits three kinds of lines:
//!
//! | Line                                   | Kind            |
//! |----------------------------------------|-----------------|
//! | `{"timeout": 20, ...}`                 | `Configuration` |
//! | `component,action,start_ts,end_ts`     | `Behavior`      |
//! | `tag,timestamp`                        | `Frame`         |
//!
//! Timestamps are integer milliseconds on the device clock; `_` marks an
//! unset behavior timestamp. Fields keep their original text so
//! [`Event::to_line`] reproduces the line exactly.

use crate::acquisition::RawLine;
use crate::error::ParseError;
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

/// Placeholder the firmware sends for a timestamp that does not apply.
pub const UNSET_TIMESTAMP: &str = "_";

const BEHAVIOR_FIELDS: [&str; 4] = ["component", "action", "start_ts", "end_ts"];
const FRAME_FIELDS: [&str; 2] = ["tag", "timestamp"];
const CONFIGURATION_FIELD: &str = "configuration";

/// What a line described.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    /// Lever press, lick, pump infusion, cue and similar component actions.
    Behavior,
    /// Camera frame trigger.
    Frame,
    /// Device settings block.
    Configuration,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Behavior => write!(f, "Behavior"),
            EventKind::Frame => write!(f, "Frame"),
            EventKind::Configuration => write!(f, "Configuration"),
        }
    }
}

/// When an event happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventTime {
    /// Device clock, milliseconds.
    Device(u64),
    /// Host receipt time relative to the session epoch.
    Receipt(Duration),
}

/// One named payload value, kept as the device sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Field {
    /// Field name.
    pub name: &'static str,
    /// Field text.
    pub value: String,
}

/// A parsed device line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    seq: u64,
    kind: EventKind,
    time: EventTime,
    fields: Vec<Field>,
}

/// Typed view of a behavior event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BehaviorRecord {
    /// Emitting component, e.g. `LH_LEVER` or `PUMP`.
    pub component: String,
    /// What the component did, e.g. `PRESS` or `INFUSION`.
    pub action: String,
    /// Start on the device clock, when set.
    pub start_ms: Option<u64>,
    /// End on the device clock, when set.
    pub end_ms: Option<u64>,
}

impl Event {
    /// Parse a raw line. Lines without a device timestamp fall back to their
    /// receipt time measured from `epoch`.
    pub fn parse(line: &RawLine, epoch: Instant) -> Result<Self, ParseError> {
        let received = line.received_at().saturating_duration_since(epoch);
        Self::parse_text(line.seq(), line.text(), received)
    }

    /// Parse line text directly.
    pub fn parse_text(seq: u64, text: &str, received: Duration) -> Result<Self, ParseError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ParseError::Empty);
        }

        if text.starts_with('{') {
            return Self::parse_configuration(seq, text, received);
        }

        let parts: Vec<&str> = text.split(',').collect();
        match parts.len() {
            4 => {
                let start = parse_timestamp("start_ts", parts[2], true)?;
                let end = parse_timestamp("end_ts", parts[3], true)?;
                let time = start
                    .or(end)
                    .map_or(EventTime::Receipt(received), EventTime::Device);
                Ok(Self {
                    seq,
                    kind: EventKind::Behavior,
                    time,
                    fields: named_fields(&BEHAVIOR_FIELDS, &parts),
                })
            }
            2 => {
                let timestamp = parse_timestamp("timestamp", parts[1], false)?;
                let time = timestamp.map_or(EventTime::Receipt(received), EventTime::Device);
                Ok(Self {
                    seq,
                    kind: EventKind::Frame,
                    time,
                    fields: named_fields(&FRAME_FIELDS, &parts),
                })
            }
            fields => Err(ParseError::UnrecognizedShape { fields }),
        }
    }

    fn parse_configuration(seq: u64, text: &str, received: Duration) -> Result<Self, ParseError> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| ParseError::InvalidConfiguration(e.to_string()))?;
        if !value.is_object() {
            return Err(ParseError::InvalidConfiguration(
                "expected a JSON object".to_string(),
            ));
        }
        Ok(Self {
            seq,
            kind: EventKind::Configuration,
            time: EventTime::Receipt(received),
            fields: vec![Field {
                name: CONFIGURATION_FIELD,
                value: text.to_string(),
            }],
        })
    }

    /// Sequence number of the line this event came from.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Event kind.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Device timestamp, or receipt time when the device sent none.
    pub fn time(&self) -> EventTime {
        self.time
    }

    /// Payload fields in line order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }

    /// Field values in line order.
    pub fn values(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.value.as_str()).collect()
    }

    /// Re-serialize in the device's line format.
    pub fn to_line(&self) -> String {
        self.values().join(",")
    }

    /// Behavior view, for `Behavior` events.
    pub fn behavior(&self) -> Option<BehaviorRecord> {
        if self.kind != EventKind::Behavior {
            return None;
        }
        Some(BehaviorRecord {
            component: self.field("component")?.to_string(),
            action: self.field("action")?.to_string(),
            start_ms: self.field("start_ts").and_then(|v| v.parse().ok()),
            end_ms: self.field("end_ts").and_then(|v| v.parse().ok()),
        })
    }

    /// Frame timestamp, for `Frame` events.
    pub fn frame_timestamp(&self) -> Option<u64> {
        match (self.kind, self.time) {
            (EventKind::Frame, EventTime::Device(ms)) => Some(ms),
            _ => None,
        }
    }

    /// Settings block, for `Configuration` events.
    pub fn configuration(&self) -> Option<serde_json::Value> {
        if self.kind != EventKind::Configuration {
            return None;
        }
        serde_json::from_str(self.field(CONFIGURATION_FIELD)?).ok()
    }
}

fn parse_timestamp(
    field: &'static str,
    value: &str,
    allow_unset: bool,
) -> Result<Option<u64>, ParseError> {
    if allow_unset && value == UNSET_TIMESTAMP {
        return Ok(None);
    }
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|_| ParseError::InvalidTimestamp {
            field,
            value: value.to_string(),
        })
}

fn named_fields(names: &[&'static str], parts: &[&str]) -> Vec<Field> {
    names
        .iter()
        .zip(parts)
        .map(|(name, value)| Field {
            name: *name,
            value: (*value).to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECEIVED: Duration = Duration::from_millis(1500);

    #[test]
    fn parses_behavior_event_with_device_time() {
        let event = Event::parse_text(3, "LH_LEVER,ACTIVE_PRESS,10500,10620", RECEIVED).unwrap();
        assert_eq!(event.seq(), 3);
        assert_eq!(event.kind(), EventKind::Behavior);
        assert_eq!(event.time(), EventTime::Device(10500));

        let record = event.behavior().unwrap();
        assert_eq!(record.component, "LH_LEVER");
        assert_eq!(record.action, "ACTIVE_PRESS");
        assert_eq!(record.start_ms, Some(10500));
        assert_eq!(record.end_ms, Some(10620));
    }

    #[test]
    fn unset_start_falls_back_to_end_then_receipt() {
        let end_only = Event::parse_text(0, "PUMP,INFUSION,_,2000", RECEIVED).unwrap();
        assert_eq!(end_only.time(), EventTime::Device(2000));

        let neither = Event::parse_text(0, "CS,TONE,_,_", RECEIVED).unwrap();
        assert_eq!(neither.time(), EventTime::Receipt(RECEIVED));
        assert_eq!(neither.behavior().unwrap().start_ms, None);
    }

    #[test]
    fn parses_frame_event() {
        let event = Event::parse_text(1, "FRAME,84210", RECEIVED).unwrap();
        assert_eq!(event.kind(), EventKind::Frame);
        assert_eq!(event.frame_timestamp(), Some(84210));
        assert!(event.behavior().is_none());
    }

    #[test]
    fn parses_configuration_block() {
        let text = r#"{"trace_interval": 500, "timeout": 20}"#;
        let event = Event::parse_text(0, text, RECEIVED).unwrap();
        assert_eq!(event.kind(), EventKind::Configuration);
        assert_eq!(event.time(), EventTime::Receipt(RECEIVED));
        assert_eq!(event.configuration().unwrap()["timeout"], 20);
        assert_eq!(event.to_line(), text);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(Event::parse_text(0, "   ", RECEIVED), Err(ParseError::Empty));
        assert_eq!(
            Event::parse_text(0, "LH_LEVER,PRESS,100", RECEIVED),
            Err(ParseError::UnrecognizedShape { fields: 3 })
        );
        assert_eq!(
            Event::parse_text(0, "LH_LEVER,PRESS,soon,_", RECEIVED),
            Err(ParseError::InvalidTimestamp {
                field: "start_ts",
                value: "soon".into()
            })
        );
        assert!(matches!(
            Event::parse_text(0, "FRAME,_", RECEIVED),
            Err(ParseError::InvalidTimestamp { field: "timestamp", .. })
        ));
        assert!(matches!(
            Event::parse_text(0, "{not json", RECEIVED),
            Err(ParseError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            Event::parse_text(0, "[1, 2, 3]", RECEIVED),
            Err(ParseError::UnrecognizedShape { fields: 3 })
        ));
    }

    #[test]
    fn to_line_reproduces_fields() {
        for line in ["RH_LEVER,INACTIVE_PRESS,_,900", "FRAME,12", "LICK,LICK,5,6"] {
            let event = Event::parse_text(0, line, RECEIVED).unwrap();
            assert_eq!(event.to_line(), line);
        }
    }

    #[test]
    fn parse_uses_receipt_relative_to_epoch() {
        let epoch = Instant::now();
        let raw = RawLine::new(9, "CUE,ON,_,_".into(), epoch + Duration::from_millis(250));
        let event = Event::parse(&raw, epoch).unwrap();
        assert_eq!(event.seq(), 9);
        assert_eq!(event.time(), EventTime::Receipt(Duration::from_millis(250)));
    }
}
