//! Bounded byte history per monitor session.
//!
//! The hub appends every upstream chunk here before broadcasting it, so a
//! subscriber that joins late can be handed the recent tail without waiting
//! for the next live byte. Capacity is never reduced: a replay request larger
//! than the current capacity grows the buffer for future output.

use std::collections::VecDeque;

/// Default history kept per session.
pub const DEFAULT_RING_CAPACITY: usize = 64 * 1024;

/// Hard ceiling on how far a replay request may grow a session buffer.
pub const MAX_RING_CAPACITY: usize = 16 * 1024 * 1024;

pub struct RingBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.clamp(1, MAX_RING_CAPACITY);
        Self {
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity,
        }
    }

    /// Append `data`, evicting the oldest bytes past capacity.
    pub fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        if data.len() >= self.capacity {
            self.buf.clear();
            self.buf.extend(&data[data.len() - self.capacity..]);
            return;
        }

        let needed = self.buf.len() + data.len();
        if needed > self.capacity {
            self.buf.drain(..needed - self.capacity);
        }
        self.buf.extend(data);
    }

    /// The last `min(n, len)` bytes, oldest first.
    pub fn tail(&self, n: usize) -> Vec<u8> {
        let take = n.min(self.buf.len());
        self.buf.range(self.buf.len() - take..).copied().collect()
    }

    /// Grow capacity so future output can satisfy a replay of `requested` bytes.
    pub fn ensure_capacity(&mut self, requested: usize) {
        let requested = requested.min(MAX_RING_CAPACITY);
        if requested > self.capacity {
            self.capacity = requested;
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}
