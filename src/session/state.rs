//! Session lifecycle state, faults and notices.
//!
//! # State Machine
//!
//! ```text
//! Idle ──start──> Running ──stop──> Stopping ──drained──> Stopped
//!                   │   ▲              ▲
//!              pause│   │resume        │
//!                   ▼   │              │
//!                  Paused ───stop──────┘
//! ```
//!
//! A fatal fault takes `Running` or `Paused` to `Stopping` as well; the drain
//! still runs and the fault is retained as the stop reason.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Lifecycle state of one device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    /// Created, not yet started
    Idle,
    /// Reading and processing
    Running,
    /// Reading, processing halted
    Paused,
    /// Reader stopped, queue draining
    Stopping,
    /// Drained and disconnected (terminal)
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Running => write!(f, "Running"),
            SessionState::Paused => write!(f, "Paused"),
            SessionState::Stopping => write!(f, "Stopping"),
            SessionState::Stopped => write!(f, "Stopped"),
        }
    }
}

impl SessionState {
    /// Check if the state allows starting.
    pub fn can_start(&self) -> bool {
        matches!(self, SessionState::Idle)
    }

    /// Check if the state allows pausing.
    pub fn can_pause(&self) -> bool {
        matches!(self, SessionState::Running)
    }

    /// Check if the state allows resuming.
    pub fn can_resume(&self) -> bool {
        matches!(self, SessionState::Paused)
    }

    /// Check if the state allows stopping.
    pub fn can_stop(&self) -> bool {
        matches!(self, SessionState::Running | SessionState::Paused)
    }

    /// Whether the session holds its device (started and not yet stopped).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Running | SessionState::Paused | SessionState::Stopping
        )
    }
}

/// Pipeline stage a fault originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FaultKind {
    /// Link lost and not re-established.
    Transport,
    /// Sink error with fail-fast enabled.
    Sink,
    /// A pipeline thread panicked or could not be spawned.
    Internal,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::Transport => write!(f, "transport"),
            FaultKind::Sink => write!(f, "sink"),
            FaultKind::Internal => write!(f, "internal"),
        }
    }
}

/// A fatal session error with its diagnostic reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fault {
    /// Originating stage
    pub kind: FaultKind,
    /// Diagnostic reason
    pub reason: String,
    /// Wall-clock time the fault was recorded
    pub at: DateTime<Utc>,
}

impl Fault {
    /// Create a fault stamped with the current time.
    pub fn new(kind: FaultKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            at: Utc::now(),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} fault: {}", self.kind, self.reason)
    }
}

/// Why a session reached `Stopped`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// `stop()` was called.
    Requested,
    /// A program limit fired.
    LimitReached(String),
    /// A fatal fault ended the session.
    Fault(Fault),
}

impl StopReason {
    /// The fault, when the session ended on one.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            StopReason::Fault(fault) => Some(fault),
            _ => None,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => write!(f, "stop requested"),
            StopReason::LimitReached(limit) => write!(f, "limit reached: {limit}"),
            StopReason::Fault(fault) => write!(f, "{fault}"),
        }
    }
}

/// Out-of-band reports published on a session's notice channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum SessionNotice {
    /// The session moved to a new state.
    StateChanged { device: String, state: SessionState },
    /// A push waited out its timeout on a full queue and is being retried.
    QueueSaturated {
        device: String,
        seq: u64,
        capacity: usize,
    },
    /// A line was skipped because it did not parse.
    ParseError {
        device: String,
        seq: u64,
        reason: String,
    },
    /// The sink refused an event.
    SinkError {
        device: String,
        seq: u64,
        reason: String,
    },
    /// The link failed; `attempt` is zero for the initial failure.
    TransportFault {
        device: String,
        attempt: u32,
        reason: String,
    },
    /// The link was re-established.
    Reconnected { device: String, attempt: u32 },
    /// The session reached `Stopped`.
    Stopped { device: String, reason: StopReason },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_gated_by_state() {
        assert!(SessionState::Idle.can_start());
        assert!(!SessionState::Running.can_start());
        assert!(!SessionState::Stopped.can_start());

        assert!(SessionState::Running.can_pause());
        assert!(!SessionState::Paused.can_pause());

        assert!(SessionState::Paused.can_resume());
        assert!(!SessionState::Running.can_resume());

        assert!(SessionState::Running.can_stop());
        assert!(SessionState::Paused.can_stop());
        assert!(!SessionState::Stopping.can_stop());
        assert!(!SessionState::Stopped.can_stop());
        assert!(!SessionState::Idle.can_stop());
    }

    #[test]
    fn active_states_hold_the_device() {
        assert!(!SessionState::Idle.is_active());
        assert!(SessionState::Running.is_active());
        assert!(SessionState::Paused.is_active());
        assert!(SessionState::Stopping.is_active());
        assert!(!SessionState::Stopped.is_active());
    }

    #[test]
    fn stop_reason_exposes_fault() {
        let fault = Fault::new(FaultKind::Transport, "device on COM3 disconnected");
        let reason = StopReason::Fault(fault.clone());
        assert_eq!(reason.fault(), Some(&fault));
        assert_eq!(
            reason.to_string(),
            "transport fault: device on COM3 disconnected"
        );
        assert!(StopReason::Requested.fault().is_none());
    }

    #[test]
    fn notices_serialize_with_tag() {
        let notice = SessionNotice::StateChanged {
            device: "box1".into(),
            state: SessionState::Paused,
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["notice"], "state_changed");
        assert_eq!(json["state"], "Paused");
    }
}
