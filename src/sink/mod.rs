//! Event sinks.
//!
//! A sink receives every parsed [`Event`] of a session, in order, from that
//! session's processor thread. Sinks are not assumed to be thread-safe: the
//! processor owns its sink exclusively, and [`SharedSink`] serializes calls
//! when one sink must be fed by several sessions.

#[cfg(feature = "storage_csv")]
pub mod csv;
pub mod memory;

#[cfg(feature = "storage_csv")]
pub use self::csv::CsvSink;
pub use memory::{EventLog, MemorySink};

use crate::error::SinkError;
use crate::event::Event;
use parking_lot::Mutex;
use std::sync::Arc;

/// Append-only destination for parsed events.
pub trait EventSink: Send {
    /// Persist one event. Ownership of the event passes to the sink.
    fn append(&mut self, event: Event) -> Result<(), SinkError>;

    /// Push buffered output to durable storage.
    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

impl<S: EventSink + ?Sized> EventSink for Box<S> {
    fn append(&mut self, event: Event) -> Result<(), SinkError> {
        (**self).append(event)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }
}

/// Sink that accepts and discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn append(&mut self, _event: Event) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Forwards every event to each inner sink.
///
/// All sinks are attempted for every event; the first failure is returned.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl FanoutSink {
    /// A fanout with no sinks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Add a boxed sink after the existing ones.
    pub fn push(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Number of sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for FanoutSink {
    fn append(&mut self, event: Event) -> Result<(), SinkError> {
        let mut first_error = None;
        if let Some((last, rest)) = self.sinks.split_last_mut() {
            for sink in rest {
                if let Err(err) = sink.append(event.clone()) {
                    first_error.get_or_insert(err);
                }
            }
            if let Err(err) = last.append(event) {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        let mut first_error = None;
        for sink in &mut self.sinks {
            if let Err(err) = sink.flush() {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// A sink shared between sessions; each call takes the lock.
pub struct SharedSink<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> SharedSink<S> {
    /// Wrap `sink` for sharing between clones.
    pub fn new(sink: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(sink)),
        }
    }

    /// Run `f` with exclusive access to the inner sink.
    pub fn with_inner<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl<S> Clone for SharedSink<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: EventSink> EventSink for SharedSink<S> {
    fn append(&mut self, event: Event) -> Result<(), SinkError> {
        self.inner.lock().append(event)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.inner.lock().flush()
    }
}
