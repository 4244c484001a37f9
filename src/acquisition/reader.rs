//! Producer side of the pipeline.
//!
//! The reader loops while `serial_active` is set: one bounded read from the
//! link, then a push onto the event queue. A full queue is never resolved by
//! dropping a line; the push is retried until it succeeds or the queue is
//! closed. Transport errors trigger the reconnect policy, and a link that
//! cannot be re-established ends the session with a transport fault.
//!
//! The queue is closed when the reader exits for any reason, so the
//! processor can finish draining.

use super::{CloseQueueOnDrop, PipelineContext, RawLine};
use crate::config::{RetryPolicy, SessionConfig};
use crate::error::{AcquisitionError, AcquisitionResult, QueueError, TransportError};
use crate::session::{Fault, FaultKind, SessionNotice};
use crate::transport::TransportLink;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Reads lines from a [`TransportLink`] into the session's event queue.
pub struct ReaderTask {
    ctx: Arc<PipelineContext>,
    link: Arc<TransportLink>,
    read_timeout: Duration,
    push_timeout: Duration,
    retry: RetryPolicy,
    next_seq: u64,
}

impl ReaderTask {
    /// A reader over `link` using the timeouts and retry policy in `config`.
    pub fn new(ctx: Arc<PipelineContext>, link: Arc<TransportLink>, config: &SessionConfig) -> Self {
        Self {
            ctx,
            link,
            read_timeout: config.read_timeout,
            push_timeout: config.push_timeout,
            retry: config.retry.clone(),
            next_seq: 0,
        }
    }

    /// Run the loop on a thread named `reader-<device>`.
    pub fn spawn(self) -> AcquisitionResult<JoinHandle<()>> {
        let name = format!("reader-{}", self.ctx.device());
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run())
            .map_err(|source| AcquisitionError::ThreadSpawn { name, source })
    }

    /// Run the loop on the current thread until `serial_active` clears or the
    /// link is lost for good.
    pub fn run(mut self) {
        let _close = CloseQueueOnDrop(Arc::clone(&self.ctx));
        let device = self.ctx.device().to_string();
        info!(device = %device, port = %self.link.port(), "Reader started");

        // A closed queue means the processor is gone; nothing read now could be delivered.
        while self.ctx.flags().serial_active() && !self.ctx.queue().is_closed() {
            match self.link.read_line(self.read_timeout) {
                Ok(Some(text)) => {
                    let line = RawLine::new(self.next_seq, text, Instant::now());
                    self.next_seq += 1;
                    self.ctx.stats().record_line_read();
                    if !self.enqueue(line) {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    if !self.ctx.flags().serial_active() {
                        debug!(device = %device, error = %err, "Transport error after stop, exiting");
                        break;
                    }
                    if !self.recover(err) {
                        break;
                    }
                }
            }
        }

        info!(device = %device, lines = self.next_seq, "Reader exiting");
    }

    /// Push with saturation retry. Returns `false` once the queue is closed.
    fn enqueue(&self, line: RawLine) -> bool {
        let queue = self.ctx.queue();
        let mut line = line;
        loop {
            match queue.push(line, self.push_timeout) {
                Ok(()) => return true,
                Err(QueueError::Saturated { line: back, capacity }) => {
                    self.ctx.stats().record_saturation();
                    warn!(
                        device = %self.ctx.device(),
                        seq = back.seq(),
                        capacity,
                        "Event queue saturated, retrying push"
                    );
                    self.ctx.notify(SessionNotice::QueueSaturated {
                        device: self.ctx.device().to_string(),
                        seq: back.seq(),
                        capacity,
                    });
                    line = back;
                }
                Err(QueueError::Closed(rejected)) => {
                    self.ctx.stats().record_undelivered(1);
                    warn!(device = %self.ctx.device(), seq = rejected.seq(), "Event queue closed, line not delivered");
                    return false;
                }
            }
        }
    }

    /// Apply the reconnect policy. Returns `true` when reading can continue.
    fn recover(&self, err: TransportError) -> bool {
        let ctx = &self.ctx;
        let device = ctx.device().to_string();
        warn!(device = %device, error = %err, "Transport error, reconnecting");
        ctx.notify(SessionNotice::TransportFault {
            device: device.clone(),
            attempt: 0,
            reason: err.to_string(),
        });

        let mut failed_attempts = 0u32;
        let outcome = self.link.reconnect(
            &self.retry,
            || !ctx.flags().serial_active(),
            |attempt, failure| {
                failed_attempts = attempt;
                ctx.notify(SessionNotice::TransportFault {
                    device: device.clone(),
                    attempt,
                    reason: failure.to_string(),
                });
            },
        );

        match outcome {
            Ok(true) => {
                ctx.stats().record_reconnect();
                ctx.notify(SessionNotice::Reconnected {
                    device,
                    attempt: failed_attempts + 1,
                });
                true
            }
            Ok(false) => false,
            Err(last) => {
                let reason = match last {
                    Some(last) => format!(
                        "{err}; reconnect failed after {} attempt(s): {last}",
                        self.retry.max_attempts
                    ),
                    None => format!("{err}; reconnect disabled"),
                };
                ctx.record_fault(Fault::new(FaultKind::Transport, reason));
                trace!(device = %device, "Reader giving up on link");
                false
            }
        }
    }
}
