//! # Frame Buffer
//!
//! Accumulates the variable-size media frames a telephony leg sends and
//! hands them back out in fixed-size chunks sized for one transform call.
//!
//! ## Key Features:
//! - **Append-only input**: frames are pushed at the back and chunks drained
//!   from the front, so arrival order is preserved
//! - **No data loss**: whatever is left shorter than a chunk is returned by
//!   `take_remainder` when the leg's stream ends
//!
//! ## Sizing:
//! chunk_bytes = sample_rate × chunk_duration × bytes_per_sample.
//! For 8 kHz mu-law and 320 ms that is 8000 × 0.320 × 1 = 2560 bytes.

use std::collections::VecDeque;

/// Per-leg accumulator for inbound audio bytes.
///
/// ## Rust Concepts:
/// - **VecDeque**: ring buffer with cheap push at the back and drain at the front
/// - **Owned by one task**: the inbound relay direction is the only writer, so
///   no lock is needed
#[derive(Debug)]
pub struct FrameBuffer {
    bytes: VecDeque<u8>,
    chunk_size: usize,
    total_pushed: u64,
}

impl FrameBuffer {
    /// Create a buffer that releases chunks of exactly `chunk_size` bytes.
    /// A zero size is bumped to one byte.
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            bytes: VecDeque::with_capacity(chunk_size * 2),
            chunk_size,
            total_pushed: 0,
        }
    }

    /// Append one decoded media frame.
    pub fn push(&mut self, frame: &[u8]) {
        self.bytes.extend(frame.iter().copied());
        self.total_pushed += frame.len() as u64;
    }

    /// Remove and return the next full chunk, if one is available.
    pub fn next_chunk(&mut self) -> Option<Vec<u8>> {
        if self.bytes.len() < self.chunk_size {
            return None;
        }
        Some(self.bytes.drain(..self.chunk_size).collect())
    }

    /// Remove and return everything still buffered (shorter than a chunk
    /// once `next_chunk` has been drained). `None` when empty.
    pub fn take_remainder(&mut self) -> Option<Vec<u8>> {
        if self.bytes.is_empty() {
            return None;
        }
        Some(self.bytes.drain(..).collect())
    }

    /// Total bytes ever pushed.
    pub fn total_pushed(&self) -> u64 {
        self.total_pushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_are_released_only_when_full() {
        let mut buffer = FrameBuffer::new(2560);
        for _ in 0..9 {
            buffer.push(&[0xFF; 256]);
            assert!(buffer.next_chunk().is_none());
        }
        buffer.push(&[0xFF; 256]);
        let chunk = buffer.next_chunk().unwrap();
        assert_eq!(chunk.len(), 2560);
        assert!(buffer.take_remainder().is_none());
    }

    #[test]
    fn test_order_is_preserved_across_frames() {
        let mut buffer = FrameBuffer::new(4);
        buffer.push(&[1, 2, 3]);
        buffer.push(&[4, 5, 6]);
        assert_eq!(buffer.next_chunk().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(buffer.take_remainder().unwrap(), vec![5, 6]);
        assert!(buffer.take_remainder().is_none());
    }

    #[test]
    fn test_nothing_is_lost() {
        let mut buffer = FrameBuffer::new(100);
        let mut drained = 0;
        for size in [17usize, 160, 3, 99, 250] {
            buffer.push(&vec![7u8; size]);
            while let Some(chunk) = buffer.next_chunk() {
                drained += chunk.len();
            }
        }
        drained += buffer.take_remainder().map(|r| r.len()).unwrap_or(0);
        assert_eq!(drained as u64, buffer.total_pushed());
    }
}
