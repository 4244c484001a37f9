//! Program limits that stop a session automatically.
//!
//! Limits are evaluated against *active* time: wall time since the session
//! started minus every interval spent paused. The infusion limit counts
//! `PUMP,INFUSION` behavior events and, once reached, waits `stop_delay`
//! before stopping so the final infusion can complete.

use super::{Session, SessionState, StopReason};
use crate::error::{AcquisitionError, AcquisitionResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Interval between limit evaluations.
pub const LIMIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Which limits apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LimitKind {
    /// Stop after `time_limit` of active time
    Time,
    /// Stop `stop_delay` after `infusion_limit` infusions
    Infusion,
    /// Whichever of the two fires first
    Both,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKind::Time => write!(f, "Time"),
            LimitKind::Infusion => write!(f, "Infusion"),
            LimitKind::Both => write!(f, "Both"),
        }
    }
}

/// Automatic stop conditions for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Limit type
    pub kind: LimitKind,
    /// Active time after which the session stops
    #[serde(default, with = "humantime_serde")]
    pub time_limit: Option<Duration>,
    /// Infusions after which the stop delay starts
    #[serde(default)]
    pub infusion_limit: Option<u64>,
    /// Delay between reaching the infusion limit and stopping
    #[serde(default, with = "humantime_serde")]
    pub stop_delay: Duration,
}

impl LimitConfig {
    /// Time limit only.
    pub fn time(limit: Duration) -> Self {
        Self {
            kind: LimitKind::Time,
            time_limit: Some(limit),
            infusion_limit: None,
            stop_delay: Duration::ZERO,
        }
    }

    /// Infusion limit only.
    pub fn infusion(limit: u64, stop_delay: Duration) -> Self {
        Self {
            kind: LimitKind::Infusion,
            time_limit: None,
            infusion_limit: Some(limit),
            stop_delay,
        }
    }

    /// Check that the values the chosen kind needs are present.
    pub fn validate(&self) -> Result<(), String> {
        let needs_time = matches!(self.kind, LimitKind::Time | LimitKind::Both);
        let needs_infusion = matches!(self.kind, LimitKind::Infusion | LimitKind::Both);
        if needs_time && self.time_limit.is_none() {
            return Err(format!("limit kind {} requires time_limit", self.kind));
        }
        if needs_infusion && self.infusion_limit.is_none() {
            return Err(format!("limit kind {} requires infusion_limit", self.kind));
        }
        Ok(())
    }
}

/// Evaluates a [`LimitConfig`] over successive observations.
#[derive(Debug, Clone)]
pub struct LimitTracker {
    config: LimitConfig,
    infusion_reached_at: Option<Instant>,
}

impl LimitTracker {
    /// A tracker with no infusions counted.
    pub fn new(config: LimitConfig) -> Self {
        Self {
            config,
            infusion_reached_at: None,
        }
    }

    /// Returns a description of the limit once one has been met.
    pub fn check(&mut self, active: Duration, infusions: u64, now: Instant) -> Option<String> {
        let kind = self.config.kind;

        if matches!(kind, LimitKind::Time | LimitKind::Both) {
            if let Some(limit) = self.config.time_limit {
                if active >= limit {
                    return Some(format!(
                        "time limit of {} reached",
                        humantime::format_duration(limit)
                    ));
                }
            }
        }

        if matches!(kind, LimitKind::Infusion | LimitKind::Both) {
            if let Some(limit) = self.config.infusion_limit {
                if infusions >= limit {
                    let reached = *self.infusion_reached_at.get_or_insert(now);
                    if now.saturating_duration_since(reached) >= self.config.stop_delay {
                        return Some(format!("infusion limit of {limit} reached"));
                    }
                }
            }
        }

        None
    }
}

/// Active-time bookkeeping for one session.
#[derive(Debug, Clone, Default)]
pub struct ProgramClock {
    started: Option<Instant>,
    paused_since: Option<Instant>,
    paused_total: Duration,
    stopped: Option<Instant>,
}

impl ProgramClock {
    /// Begin counting active time at `now`.
    pub fn start(&mut self, now: Instant) {
        self.started = Some(now);
    }

    /// Stop accumulating until [`resume`](Self::resume).
    pub fn pause(&mut self, now: Instant) {
        if self.paused_since.is_none() {
            self.paused_since = Some(now);
        }
    }

    /// Accumulate again after a pause.
    pub fn resume(&mut self, now: Instant) {
        if let Some(since) = self.paused_since.take() {
            self.paused_total += now.saturating_duration_since(since);
        }
    }

    /// Freeze the clock. Later calls are ignored.
    pub fn stop(&mut self, now: Instant) {
        if self.stopped.is_some() {
            return;
        }
        self.resume(now);
        self.stopped = Some(now);
    }

    /// Time spent running, excluding pauses.
    pub fn active_time(&self, now: Instant) -> Duration {
        let Some(started) = self.started else {
            return Duration::ZERO;
        };
        let end = self.stopped.or(self.paused_since).unwrap_or(now);
        end.saturating_duration_since(started)
            .saturating_sub(self.paused_total)
    }
}

/// Start a thread that stops `session` once `config` is met.
///
/// The monitor holds only a weak reference and exits when the session stops
/// or is dropped.
pub(crate) fn spawn_monitor(session: &Arc<Session>, config: LimitConfig) -> AcquisitionResult<()> {
    let weak = Arc::downgrade(session);
    let name = format!("limits-{}", session.device());
    thread::Builder::new()
        .name(name.clone())
        .spawn(move || monitor(weak, LimitTracker::new(config)))
        .map(|_| ())
        .map_err(|source| AcquisitionError::ThreadSpawn { name, source })
}

fn monitor(weak: Weak<Session>, mut tracker: LimitTracker) {
    loop {
        thread::sleep(LIMIT_POLL_INTERVAL);
        let Some(session) = weak.upgrade() else {
            return;
        };

        match session.state() {
            SessionState::Running => {}
            SessionState::Idle | SessionState::Paused => continue,
            SessionState::Stopping | SessionState::Stopped => return,
        }

        let active = session.active_time();
        let infusions = session.event_log().infusion_count();
        debug!(device = %session.device(), active_ms = active.as_millis(), infusions, "Checking limits");

        if let Some(description) = tracker.check(active, infusions, Instant::now()) {
            info!(device = %session.device(), limit = %description, "Program limit met, stopping session");
            match session.stop_with(StopReason::LimitReached(description)) {
                Ok(()) | Err(AcquisitionError::InvalidTransition { .. }) => {}
                Err(err) => warn!(device = %session.device(), error = %err, "Limit stop failed"),
            }
            return;
        }
    }
}
