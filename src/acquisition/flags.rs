//! Per-session control flags.
//!
//! Two independent flags gate the pipeline:
//!
//! - `serial_active`: the reader keeps reading the transport while set.
//! - `program_running`: the processor keeps popping and delivering while set.
//!
//! Keeping them separate lets the reader keep draining the device while
//! processing is paused, and lets the processor finish the queue after the
//! reader has stopped.
//!
//! Changing `program_running` is synchronous: the processor holds the
//! processing gate for every pop-and-deliver step, and the setter takes the
//! gate after storing the new value. Once the setter returns, no step that
//! started under the old value is still in flight.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Atomically observed run flags shared by one reader/processor pair.
#[derive(Debug, Default)]
pub struct ControlFlags {
    serial_active: AtomicBool,
    program_running: AtomicBool,
    gate: Mutex<()>,
    resumed: Condvar,
}

impl ControlFlags {
    /// Both flags cleared.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the transport should be read.
    pub fn serial_active(&self) -> bool {
        self.serial_active.load(Ordering::SeqCst)
    }

    /// Whether queued lines should be processed and logged.
    pub fn program_running(&self) -> bool {
        self.program_running.load(Ordering::SeqCst)
    }

    /// Set `serial_active`. The reader observes it after its current read returns.
    pub fn set_serial_active(&self, active: bool) {
        self.serial_active.store(active, Ordering::SeqCst);
    }

    /// Set `program_running`, returning once the processor has observed it.
    ///
    /// Must not be called from inside a processing step (the gate is not reentrant).
    pub fn set_program_running(&self, running: bool) {
        self.program_running.store(running, Ordering::SeqCst);
        let _gate = self.gate.lock();
        self.resumed.notify_all();
    }

    /// Enter one processing step.
    pub(crate) fn enter_step(&self) -> MutexGuard<'_, ()> {
        self.gate.lock()
    }

    /// Park a paused processor until processing resumes or `timeout` elapses.
    pub(crate) fn wait_for_resume(&self, step: &mut MutexGuard<'_, ()>, timeout: Duration) {
        if !self.program_running() {
            let _ = self.resumed.wait_for(step, timeout);
        }
    }
}
