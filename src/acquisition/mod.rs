//! Producer/consumer pipeline for one device session.
//!
//! ```text
//!   device ──> LineChannel ──> ReaderTask ──> EventQueue ──> ProcessorTask ──> EventSink
//!                                  ▲                              ▲
//!                                  └──────── ControlFlags ────────┘
//! ```
//!
//! The reader thread only ever pushes, the processor thread only ever pops, and
//! the two observe the session's [`ControlFlags`]. Everything the two threads
//! share lives in a [`PipelineContext`].

pub mod flags;
pub mod processor;
pub mod queue;
pub mod reader;

pub use flags::ControlFlags;
pub use queue::EventQueue;

use crate::session::{Fault, SessionNotice};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::error;

/// Stand-in for timeouts too long to express as an [`Instant`].
const UNBOUNDED_WAIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `Instant::now() + timeout`, saturating instead of panicking on overflow.
pub(crate) fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(UNBOUNDED_WAIT))
        .unwrap_or(now)
}

/// One line of device output, stamped when the reader took it off the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    seq: u64,
    text: String,
    received_at: Instant,
}

impl RawLine {
    /// Create a line with its per-session sequence number and receipt instant.
    pub fn new(seq: u64, text: String, received_at: Instant) -> Self {
        Self {
            seq,
            text,
            received_at,
        }
    }

    /// Per-session sequence number, starting at zero.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Line content without the terminator.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Monotonic receipt time.
    pub fn received_at(&self) -> Instant {
        self.received_at
    }
}

/// Counters shared by the reader and processor threads.
#[derive(Debug, Default)]
pub struct PipelineStats {
    lines_read: AtomicU64,
    events_delivered: AtomicU64,
    parse_errors: AtomicU64,
    sink_errors: AtomicU64,
    saturation_events: AtomicU64,
    reconnects: AtomicU64,
    undelivered: AtomicU64,
}

impl PipelineStats {
    pub(crate) fn record_line_read(&self) {
        self.lines_read.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_delivered(&self) {
        self.events_delivered.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_sink_error(&self) {
        self.sink_errors.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_saturation(&self) {
        self.saturation_events.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn record_undelivered(&self, count: u64) {
        self.undelivered.fetch_add(count, Ordering::SeqCst);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self, queue_depth: usize) -> SessionStats {
        SessionStats {
            lines_read: self.lines_read.load(Ordering::SeqCst),
            events_delivered: self.events_delivered.load(Ordering::SeqCst),
            parse_errors: self.parse_errors.load(Ordering::SeqCst),
            sink_errors: self.sink_errors.load(Ordering::SeqCst),
            saturation_events: self.saturation_events.load(Ordering::SeqCst),
            reconnects: self.reconnects.load(Ordering::SeqCst),
            undelivered: self.undelivered.load(Ordering::SeqCst),
            queue_depth,
        }
    }
}

/// Serializable view of a session's pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// Lines taken off the transport.
    pub lines_read: u64,
    /// Events accepted by the sink.
    pub events_delivered: u64,
    /// Lines skipped because they did not parse.
    pub parse_errors: u64,
    /// Events the sink refused.
    pub sink_errors: u64,
    /// Pushes that hit the queue capacity and had to be retried.
    pub saturation_events: u64,
    /// Successful transport re-opens.
    pub reconnects: u64,
    /// Lines that could not be delivered after a fatal fault.
    pub undelivered: u64,
    /// Lines currently buffered in the queue.
    pub queue_depth: usize,
}

/// State shared between a session's reader and processor threads.
pub struct PipelineContext {
    device: String,
    flags: ControlFlags,
    queue: EventQueue,
    stats: PipelineStats,
    notices: broadcast::Sender<SessionNotice>,
    fault: Mutex<Option<Fault>>,
    epoch: Instant,
}

impl PipelineContext {
    pub(crate) fn new(device: String, queue_capacity: usize) -> Self {
        let (notices, _) = broadcast::channel(256);
        Self {
            device,
            flags: ControlFlags::new(),
            queue: EventQueue::new(queue_capacity),
            stats: PipelineStats::default(),
            notices,
            fault: Mutex::new(None),
            epoch: Instant::now(),
        }
    }

    /// Device identifier this pipeline reads from.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Control flags gating the reader and processor.
    pub fn flags(&self) -> &ControlFlags {
        &self.flags
    }

    /// Bounded queue between reader and processor.
    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    /// Pipeline counters.
    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Instant that receipt timestamps are measured from.
    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    /// Publish a notice; having no subscribers is not an error.
    pub(crate) fn notify(&self, notice: SessionNotice) {
        let _ = self.notices.send(notice);
    }

    /// Record a fatal fault. The first fault wins; later ones are only logged.
    pub(crate) fn record_fault(&self, fault: Fault) {
        let mut slot = self.fault.lock();
        if let Some(existing) = slot.as_ref() {
            error!(
                device = %self.device,
                first = %existing.reason,
                later = %fault.reason,
                "Additional fault after session already faulted"
            );
            return;
        }
        error!(device = %self.device, kind = ?fault.kind, reason = %fault.reason, "Session fault");
        *slot = Some(fault);
    }

    pub(crate) fn fault(&self) -> Option<Fault> {
        self.fault.lock().clone()
    }
}

/// Closes the queue when dropped, including during unwinding, so the peer
/// thread is never left blocked on a queue nobody will service.
pub(crate) struct CloseQueueOnDrop(pub(crate) Arc<PipelineContext>);

impl Drop for CloseQueueOnDrop {
    fn drop(&mut self) {
        self.0.queue().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::FaultKind;

    #[test]
    fn huge_timeouts_do_not_overflow_deadlines() {
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline > Instant::now() + Duration::from_secs(3600));

        let short = deadline_after(Duration::from_millis(10));
        assert!(short <= Instant::now() + Duration::from_millis(10));
    }

    #[test]
    fn stats_snapshot_reflects_counters() {
        let stats = PipelineStats::default();
        stats.record_line_read();
        stats.record_line_read();
        stats.record_delivered();
        stats.record_parse_error();
        stats.record_undelivered(3);

        let snap = stats.snapshot(5);
        assert_eq!(snap.lines_read, 2);
        assert_eq!(snap.events_delivered, 1);
        assert_eq!(snap.parse_errors, 1);
        assert_eq!(snap.undelivered, 3);
        assert_eq!(snap.queue_depth, 5);
    }

    #[test]
    fn first_fault_is_retained() {
        let ctx = PipelineContext::new("COM3".into(), 4);
        ctx.record_fault(Fault::new(FaultKind::Transport, "unplugged"));
        ctx.record_fault(Fault::new(FaultKind::Sink, "disk full"));

        let fault = ctx.fault().unwrap();
        assert_eq!(fault.kind, FaultKind::Transport);
        assert_eq!(fault.reason, "unplugged");
    }

    #[test]
    fn close_guard_closes_queue() {
        let ctx = Arc::new(PipelineContext::new("COM3".into(), 4));
        {
            let _guard = CloseQueueOnDrop(Arc::clone(&ctx));
            assert!(!ctx.queue().is_closed());
        }
        assert!(ctx.queue().is_closed());
    }
}
