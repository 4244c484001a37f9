//! Bounded FIFO between the reader and processor threads.
//!
//! # Backpressure policy
//!
//! `push` blocks for at most the caller's timeout when the queue is full and then
//! returns [`QueueError::Saturated`] with the line handed back. Nothing is ever
//! discarded inside the queue; the reader decides to retry. `pop` blocks until a
//! line is available or the queue is closed *and* empty, so a closed queue still
//! drains completely.

use super::{deadline_after, RawLine};
use crate::error::QueueError;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use thiserror::Error;

/// The queue is closed and has nothing left to hand out.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Event queue closed")]
pub struct QueueClosed;

struct QueueInner {
    items: VecDeque<RawLine>,
    closed: bool,
}

/// Capacity-bounded, closable FIFO of [`RawLine`]s.
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl EventQueue {
    /// Create a queue holding at most `capacity` lines (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity.min(4096)),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Maximum number of buffered lines.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffered lines.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Append a line, waiting up to `timeout` for room.
    pub fn push(&self, line: RawLine, timeout: Duration) -> Result<(), QueueError> {
        self.push_until(line, deadline_after(timeout), false)
    }

    /// Append a line without waiting.
    pub fn try_push(&self, line: RawLine) -> Result<(), QueueError> {
        self.push_until(line, Instant::now(), true)
    }

    fn push_until(
        &self,
        line: RawLine,
        deadline: Instant,
        mut timed_out: bool,
    ) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(QueueError::Closed(line));
            }
            if inner.items.len() < self.capacity {
                inner.items.push_back(line);
                drop(inner);
                self.not_empty.notify_one();
                return Ok(());
            }
            if timed_out {
                return Err(QueueError::Saturated {
                    line,
                    capacity: self.capacity,
                });
            }
            timed_out = self.not_full.wait_until(&mut inner, deadline).timed_out();
        }
    }

    /// Take the oldest line, blocking until one arrives or the queue is closed and drained.
    pub fn pop(&self) -> Result<RawLine, QueueClosed> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(line) = inner.items.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Ok(line);
            }
            if inner.closed {
                return Err(QueueClosed);
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Like [`pop`](Self::pop) but gives up after `timeout`, returning `Ok(None)`.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<RawLine>, QueueClosed> {
        let deadline = deadline_after(timeout);
        let mut inner = self.inner.lock();
        loop {
            if let Some(line) = inner.items.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Ok(Some(line));
            }
            if inner.closed {
                return Err(QueueClosed);
            }
            if self.not_empty.wait_until(&mut inner, deadline).timed_out() {
                // One last look: an item may have landed right at the deadline.
                return match inner.items.pop_front() {
                    Some(line) => {
                        drop(inner);
                        self.not_full.notify_one();
                        Ok(Some(line))
                    }
                    None if inner.closed => Err(QueueClosed),
                    None => Ok(None),
                };
            }
        }
    }

    /// Refuse further pushes and wake every blocked thread. Idempotent.
    ///
    /// Returns `true` for the call that actually closed the queue.
    pub fn close(&self) -> bool {
        let newly_closed = {
            let mut inner = self.inner.lock();
            !std::mem::replace(&mut inner.closed, true)
        };
        self.not_empty.notify_all();
        self.not_full.notify_all();
        newly_closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn line(seq: u64) -> RawLine {
        RawLine::new(seq, format!("LH,PRESS,{seq},_"), Instant::now())
    }

    #[test]
    fn pops_in_push_order() {
        let queue = EventQueue::new(16);
        for seq in 0..10 {
            queue.try_push(line(seq)).unwrap();
        }
        let popped: Vec<u64> = (0..10).map(|_| queue.pop().unwrap().seq()).collect();
        assert_eq!(popped, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn full_queue_reports_saturation_and_returns_line() {
        let queue = EventQueue::new(3);
        for seq in 0..3 {
            queue.try_push(line(seq)).unwrap();
        }

        let err = queue.push(line(3), Duration::from_millis(20)).unwrap_err();
        match err {
            QueueError::Saturated { line, capacity } => {
                assert_eq!(line.seq(), 3);
                assert_eq!(capacity, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn blocked_push_completes_when_room_frees() {
        let queue = Arc::new(EventQueue::new(1));
        queue.try_push(line(0)).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(line(1), Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(queue.pop().unwrap().seq(), 0);
        producer.join().unwrap().unwrap();
        assert_eq!(queue.pop().unwrap().seq(), 1);
    }

    #[test]
    fn capacity_is_never_exceeded_under_contention() {
        let queue = Arc::new(EventQueue::new(8));
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..200 {
                        let mut pending = line(p * 1000 + i);
                        loop {
                            match queue.push(pending, Duration::from_millis(1)) {
                                Ok(()) => break,
                                Err(err) => pending = err.into_line(),
                            }
                        }
                        assert!(queue.len() <= 8);
                    }
                })
            })
            .collect();

        let mut received = 0;
        while received < 800 {
            if queue.pop_timeout(Duration::from_millis(50)).unwrap().is_some() {
                received += 1;
            }
            assert!(queue.len() <= 8);
        }
        for producer in producers {
            producer.join().unwrap();
        }
    }

    #[test]
    fn closed_queue_drains_then_reports_closed() {
        let queue = EventQueue::new(4);
        queue.try_push(line(0)).unwrap();
        queue.try_push(line(1)).unwrap();
        queue.close();

        assert!(matches!(queue.try_push(line(2)), Err(QueueError::Closed(_))));
        assert_eq!(queue.pop().unwrap().seq(), 0);
        assert_eq!(queue.pop().unwrap().seq(), 1);
        assert_eq!(queue.pop(), Err(QueueClosed));
        assert_eq!(queue.pop_timeout(Duration::from_millis(1)), Err(QueueClosed));
    }

    #[test]
    fn close_wakes_blocked_poppers() {
        let queue = Arc::new(EventQueue::new(4));
        let poppers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.pop())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        assert!(queue.close());
        assert!(!queue.close(), "second close is a no-op");

        for popper in poppers {
            assert_eq!(popper.join().unwrap(), Err(QueueClosed));
        }
    }

    #[test]
    fn pop_timeout_returns_none_when_idle() {
        let queue = EventQueue::new(4);
        assert_eq!(queue.pop_timeout(Duration::from_millis(5)), Ok(None));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let queue = EventQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.try_push(line(0)).unwrap();
        assert!(matches!(
            queue.try_push(line(1)),
            Err(QueueError::Saturated { .. })
        ));
    }
}
