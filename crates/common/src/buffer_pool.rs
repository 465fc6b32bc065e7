//! Reusable report buffers
//!
//! Input reports arrive at controller rates (hundreds per second per
//! device). The read workers take their receive buffers from this pool and
//! the coordinator returns them once a report has been drained, evicted or
//! discarded, so steady-state input does not allocate.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default number of idle buffers kept
pub const DEFAULT_MAX_BUFFERS: usize = 64;

/// Buffers with a larger capacity than this are not retained
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 4096;

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// `acquire` calls served from the free list
    pub hits: u64,
    /// `acquire` calls that had to allocate
    pub misses: u64,
    /// Buffers currently idle in the pool
    pub retained: usize,
}

/// Free-list of byte buffers
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_buffers: usize,
    max_buffer_size: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BufferPool {
    pub fn new(max_buffers: usize, max_buffer_size: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_buffers)),
            max_buffers,
            max_buffer_size,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Get a zeroed buffer of exactly `min_size` bytes
    ///
    /// Reuses an idle buffer whose capacity is large enough, otherwise
    /// allocates a new one.
    pub fn acquire(&self, min_size: usize) -> Vec<u8> {
        let recycled = {
            let mut free = self.free.lock();
            free.iter()
                .rposition(|buf| buf.capacity() >= min_size)
                .map(|idx| free.swap_remove(idx))
        };

        match recycled {
            Some(mut buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf.clear();
                buf.resize(min_size, 0);
                buf
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                vec![0u8; min_size]
            }
        }
    }

    /// Return a buffer to the pool
    ///
    /// The buffer is dropped instead when the pool is full or the buffer is
    /// oversized.
    pub fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() == 0 || buf.capacity() > self.max_buffer_size {
            return;
        }

        let mut free = self.free.lock();
        if free.len() < self.max_buffers {
            buf.clear();
            free.push(buf);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            retained: self.free.lock().len(),
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFERS, DEFAULT_MAX_BUFFER_SIZE)
    }
}
