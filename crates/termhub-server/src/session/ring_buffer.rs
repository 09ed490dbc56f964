//! Bounded chunk buffer for output replay on session reattach.
//!
//! Stores the most recent PTY output as the chunks it arrived in, so that a
//! reconnecting viewer can receive a scrollback snapshot without the server
//! keeping unbounded history.

use bytes::Bytes;
use std::collections::VecDeque;

/// Default replay capacity per session (1 MiB).
pub const DEFAULT_RING_BUFFER_CAPACITY: usize = 1024 * 1024;

/// A fixed-capacity FIFO of output chunks.
///
/// Eviction is whole-chunk: when an append pushes the total over capacity,
/// chunks are dropped from the front until it fits again.
#[derive(Debug)]
pub struct RingBuffer {
    chunks: VecDeque<Bytes>,
    /// Sum of `len()` over `chunks`.
    size: usize,
    capacity: usize,
}

impl RingBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            size: 0,
            capacity,
        }
    }

    /// Append a chunk, evicting the oldest chunks while over capacity.
    pub fn append(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }

        // A chunk that alone exceeds capacity keeps only its tail.
        let chunk = if chunk.len() > self.capacity {
            chunk.slice(chunk.len() - self.capacity..)
        } else {
            chunk
        };
        if chunk.is_empty() {
            return;
        }

        self.size += chunk.len();
        self.chunks.push_back(chunk);

        while self.size > self.capacity {
            match self.chunks.pop_front() {
                Some(evicted) => self.size -= evicted.len(),
                None => break,
            }
        }
    }

    /// Copy of the buffered chunks in append order.
    pub fn snapshot(&self) -> Vec<Bytes> {
        self.chunks.iter().cloned().collect()
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_RING_BUFFER_CAPACITY)
    }
}
