//! Custom error types for the acquisition pipeline.
//!
//! `AcquisitionError` is the crate-wide error. Each pipeline stage has its own
//! leaf error which converts into it with `?`:
//!
//! - **`TransportError`**: the serial link failed to open, read or write, or the
//!   device disappeared. Retried per the session's `RetryPolicy`, then fatal.
//! - **`QueueError`**: the bounded event queue is saturated or closed. Saturation
//!   is a backpressure signal, never a discard; the offending line is handed back.
//! - **`ParseError`**: one malformed device line. Recovered locally by skipping the line.
//! - **`SinkError`**: the persistence layer refused an event. Reported, fatal only in
//!   fail-fast mode.
//! - **`InvalidTransition`** / **`DeviceBusy`**: caller misuse, rejected without side effects.

use crate::acquisition::RawLine;
use crate::session::{SessionHandle, SessionState};
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AcquisitionResult<T> = std::result::Result<T, AcquisitionError>;

#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Event queue saturated (capacity {capacity})")]
    QueueSaturated { capacity: usize },

    #[error("Event queue closed")]
    QueueClosed,

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Cannot {operation} a session that is {state}")]
    InvalidTransition {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Device '{device}' already has an active session")]
    DeviceBusy { device: String },

    #[error("Unknown session {0}")]
    UnknownSession(SessionHandle),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<figment::Error> for AcquisitionError {
    fn from(value: figment::Error) -> Self {
        AcquisitionError::Config(value.to_string())
    }
}

impl From<QueueError> for AcquisitionError {
    fn from(value: QueueError) -> Self {
        match value {
            QueueError::Saturated { capacity, .. } => AcquisitionError::QueueSaturated { capacity },
            QueueError::Closed(_) => AcquisitionError::QueueClosed,
        }
    }
}

/// Failures of the line-oriented device link.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open '{port}': {message}")]
    Open { port: String, message: String },

    #[error("Device on '{port}' disconnected")]
    Disconnected { port: String },

    #[error("Serial port not connected")]
    NotConnected,

    #[error("Write to '{port}' failed: {source}")]
    Write {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Read from '{port}' failed: {source}")]
    Read {
        port: String,
        #[source]
        source: std::io::Error,
    },
}

/// Rejected queue operations. Both variants give the line back to the caller.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Event queue saturated (capacity {capacity})")]
    Saturated { line: RawLine, capacity: usize },

    #[error("Event queue closed")]
    Closed(RawLine),
}

impl QueueError {
    /// Recover the line that could not be enqueued.
    pub fn into_line(self) -> RawLine {
        match self {
            QueueError::Saturated { line, .. } | QueueError::Closed(line) => line,
        }
    }
}

/// Malformed device output.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Empty line")]
    Empty,

    #[error("Unrecognized line with {fields} comma-separated fields")]
    UnrecognizedShape { fields: usize },

    #[error("Invalid timestamp in field '{field}': '{value}'")]
    InvalidTimestamp { field: &'static str, value: String },

    #[error("Invalid configuration block: {0}")]
    InvalidConfiguration(String),
}

/// Persistence failures reported by an `EventSink`.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Sink rejected event: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn queue_error_hands_back_the_line() {
        let line = RawLine::new(7, "LH,PRESS,1,2".to_string(), Instant::now());
        let err = QueueError::Saturated { line, capacity: 4 };
        let recovered = err.into_line();
        assert_eq!(recovered.seq(), 7);
        assert_eq!(recovered.text(), "LH,PRESS,1,2");
    }

    #[test]
    fn queue_error_converts_to_acquisition_error() {
        let line = RawLine::new(0, "x".to_string(), Instant::now());
        let err: AcquisitionError = QueueError::Closed(line).into();
        assert!(matches!(err, AcquisitionError::QueueClosed));
    }

    #[test]
    fn invalid_transition_names_operation_and_state() {
        let err = AcquisitionError::InvalidTransition {
            operation: "resume",
            state: SessionState::Running,
        };
        assert_eq!(err.to_string(), "Cannot resume a session that is Running");
    }
}
