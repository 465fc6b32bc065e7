//! Bounded per-device input report queue
//!
//! The transport worker is the producer, consumers drain it through the
//! coordinator's `read_report`. When the consumer falls behind, the oldest
//! report is evicted so the queue holds the freshest `capacity` reports
//! instead of growing without bound.
//!
//! ```text
//! read worker ──push──► [r3 r4 r5 r6] ──pop(timeout)──► consumer
//!                         ▲ full: r2 evicted, dropped += 1
//! ```

use parking_lot::{Condvar, Mutex};
use protocol::{QueueStats, Report};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Default number of buffered reports per device
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

struct QueueInner {
    reports: VecDeque<Report>,
    /// Total reports received (for stats)
    received: u64,
    /// Total reports dropped due to full queue
    dropped: u64,
    /// Set on close; wakes and releases blocked readers
    closed: bool,
}

/// FIFO of input reports with drop-oldest overflow
pub struct InputQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
    capacity: usize,
}

impl InputQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(QueueInner {
                reports: VecDeque::with_capacity(capacity),
                received: 0,
                dropped: 0,
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Append a report
    ///
    /// Returns the report that had to leave the queue, if any: the evicted
    /// oldest report on overflow, or `report` itself when the queue is
    /// closed. The caller owns its buffer again.
    pub fn push(&self, report: Report) -> Option<Report> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Some(report);
        }

        inner.received += 1;
        let evicted = if inner.reports.len() >= self.capacity {
            inner.dropped += 1;
            if inner.dropped == 1 || inner.dropped.is_power_of_two() {
                warn!(
                    "Input queue overflow for device {}, dropped oldest report (total dropped: {})",
                    report.device_id, inner.dropped
                );
            }
            inner.reports.pop_front()
        } else {
            None
        };

        trace!(
            "Queued report for device {}: len={}, buffered={}",
            report.device_id,
            report.bytes.len(),
            inner.reports.len() + 1
        );
        inner.reports.push_back(report);
        drop(inner);

        self.available.notify_one();
        evicted
    }

    /// Pop the oldest report, waiting up to `timeout` for one to arrive
    ///
    /// Returns `None` on timeout or once the queue is closed and empty.
    /// A timeout too large to represent as a deadline waits until a report
    /// arrives or the queue is closed.
    pub fn pop(&self, timeout: Duration) -> Option<Report> {
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.inner.lock();

        loop {
            if let Some(report) = inner.reports.pop_front() {
                return Some(report);
            }
            if inner.closed {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut inner, deadline).timed_out() {
                        return inner.reports.pop_front();
                    }
                }
                None => self.available.wait(&mut inner),
            }
        }
    }

    /// Pop without waiting
    pub fn try_pop(&self) -> Option<Report> {
        self.inner.lock().reports.pop_front()
    }

    /// Reject further pushes and wake every blocked reader
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Remove and return everything still buffered
    pub fn clear(&self) -> Vec<Report> {
        self.inner.lock().reports.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().reports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().reports.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            received: inner.received,
            dropped: inner.dropped,
            buffered: inner.reports.len(),
        }
    }
}

impl Default for InputQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
