//! Consumer side of the pipeline.
//!
//! Each pop-and-deliver step runs under the processing gate of
//! [`ControlFlags`](super::ControlFlags), so clearing `program_running` takes
//! effect before the setter returns. While paused the processor does not pop;
//! lines accumulate in the queue up to its capacity.
//!
//! The processor exits only when the queue is closed and empty.

use super::{CloseQueueOnDrop, PipelineContext, RawLine};
use crate::error::{AcquisitionError, AcquisitionResult, SinkError};
use crate::event::Event;
use crate::session::{Fault, FaultKind, SessionNotice};
use crate::sink::EventSink;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Bounded wait between re-checks of the run flag and the queue.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of one delivery step.
enum Step {
    Continue,
    Abort { seq: u64, error: SinkError },
}

/// Parses queued lines and forwards the events to a sink.
pub struct ProcessorTask {
    ctx: Arc<PipelineContext>,
    sink: Box<dyn EventSink>,
    fail_fast: bool,
}

impl ProcessorTask {
    /// A processor delivering into `sink`. With `fail_fast` the first sink
    /// error faults the session.
    pub fn new(ctx: Arc<PipelineContext>, sink: Box<dyn EventSink>, fail_fast: bool) -> Self {
        Self {
            ctx,
            sink,
            fail_fast,
        }
    }

    /// Run the loop on a thread named `processor-<device>`.
    pub fn spawn(self) -> AcquisitionResult<JoinHandle<()>> {
        let name = format!("processor-{}", self.ctx.device());
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run())
            .map_err(|source| AcquisitionError::ThreadSpawn { name, source })
    }

    /// Run until the queue is closed and drained.
    pub fn run(mut self) {
        let ctx = Arc::clone(&self.ctx);
        let _close = CloseQueueOnDrop(Arc::clone(&ctx));
        let flags = ctx.flags();
        let queue = ctx.queue();
        info!(device = %ctx.device(), fail_fast = self.fail_fast, "Processor started");

        loop {
            let mut step = flags.enter_step();
            if !flags.program_running() {
                flags.wait_for_resume(&mut step, POLL_INTERVAL);
                continue;
            }

            let line = match queue.pop_timeout(POLL_INTERVAL) {
                Ok(Some(line)) => line,
                Ok(None) => continue,
                Err(_) => break,
            };

            if let Step::Abort { seq, error } = self.process(line) {
                drop(step);
                self.abort(seq, &error);
                break;
            }
        }

        if let Err(err) = self.sink.flush() {
            error!(device = %ctx.device(), error = %err, "Sink flush failed");
        }
        let stats = ctx.stats().snapshot(queue.len());
        info!(
            device = %ctx.device(),
            delivered = stats.events_delivered,
            parse_errors = stats.parse_errors,
            sink_errors = stats.sink_errors,
            "Processor drained"
        );
    }

    fn process(&mut self, line: RawLine) -> Step {
        let ctx = &self.ctx;
        let seq = line.seq();

        let event = match Event::parse(&line, ctx.epoch()) {
            Ok(event) => event,
            Err(err) => {
                ctx.stats().record_parse_error();
                warn!(
                    device = %ctx.device(),
                    seq,
                    line = %line.text().escape_default(),
                    error = %err,
                    "Skipping malformed line"
                );
                ctx.notify(SessionNotice::ParseError {
                    device: ctx.device().to_string(),
                    seq,
                    reason: err.to_string(),
                });
                return Step::Continue;
            }
        };

        trace!(device = %ctx.device(), seq, kind = %event.kind(), "Delivering event");
        match self.sink.append(event) {
            Ok(()) => {
                ctx.stats().record_delivered();
                Step::Continue
            }
            Err(err) => {
                ctx.stats().record_sink_error();
                error!(device = %ctx.device(), seq, error = %err, "Sink rejected event");
                ctx.notify(SessionNotice::SinkError {
                    device: ctx.device().to_string(),
                    seq,
                    reason: err.to_string(),
                });
                if self.fail_fast {
                    Step::Abort { seq, error: err }
                } else {
                    Step::Continue
                }
            }
        }
    }

    /// Fail-fast shutdown: stop the reader, close the queue and count what is left.
    fn abort(&self, seq: u64, err: &SinkError) {
        let ctx = &self.ctx;
        ctx.flags().set_serial_active(false);
        ctx.queue().close();

        let mut remaining = 0u64;
        while ctx.queue().pop().is_ok() {
            remaining += 1;
        }
        ctx.stats().record_undelivered(remaining);
        debug!(device = %ctx.device(), remaining, "Discarded queue after fail-fast sink error");

        ctx.record_fault(Fault::new(
            FaultKind::Sink,
            format!("sink error at line {seq}: {err}; {remaining} queued line(s) not delivered"),
        ));
    }
}
