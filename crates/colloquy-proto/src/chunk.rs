//! Sliding-window file transfer state.
//!
//! The sender tracks two offsets: `chunk_start`, the last byte offset the
//! peer acknowledged (durable, persisted on the operation row), and
//! `sent_offset`, the in-memory high-water mark of transmitted data. The
//! unacknowledged span `sent_offset - chunk_start` never exceeds the
//! window. `sent_offset` starts unknown (−1) on every (re)connect; the
//! peer's first `next_chunk_start` answer seeds it.

use colloquy_types::{DATA_WINDOW_SIZE, MAX_CHUNK_SIZE, NOT_INITIALIZED};

/// Sender-side transfer state for one file operation.
#[derive(Clone, Debug)]
pub struct ChunkTransfer {
    /// Total file length in bytes.
    pub length: i64,
    /// Last acknowledged offset; `NOT_INITIALIZED` before any ACK.
    pub chunk_start: i64,
    /// Outgoing high-water mark; negative until the peer's position is
    /// known on this link.
    pub sent_offset: i64,
    /// Peer-echoed reception timestamp of the file descriptor, recorded
    /// when the transfer completes.
    pub received_timestamp: i64,
}

impl ChunkTransfer {
    /// Resume state from the durable `chunk_start` (or start fresh).
    pub fn new(length: i64, chunk_start: i64) -> Self {
        Self {
            length,
            chunk_start,
            sent_offset: NOT_INITIALIZED,
            received_timestamp: 0,
        }
    }

    /// Whether the peer's current position must be solicited before data
    /// can flow on this link.
    pub fn needs_probe(&self) -> bool {
        self.sent_offset < 0
    }

    /// Whether another data chunk may be transmitted now.
    pub fn is_ready_to_send(&self) -> bool {
        self.sent_offset < self.length
            && self.sent_offset >= 0
            && self.sent_offset - self.chunk_start < DATA_WINDOW_SIZE
    }

    /// Whether every byte has been acknowledged.
    pub fn is_complete(&self) -> bool {
        self.chunk_start >= self.length
    }

    /// Seed or advance state from a peer `next_chunk_start` answer.
    pub fn acknowledge(&mut self, next_chunk_start: i64) {
        if next_chunk_start > self.chunk_start {
            self.chunk_start = next_chunk_start;
        } else if self.chunk_start < 0 {
            self.chunk_start = next_chunk_start.max(0);
        }
        if self.sent_offset < next_chunk_start {
            self.sent_offset = next_chunk_start;
        }
    }

    /// The `(offset, size)` of the next data chunk, bounded by the window,
    /// the advised chunk size (doubled, capped at 256 KiB) and the file end.
    pub fn next_chunk(&self, best_chunk_size: usize) -> (i64, usize) {
        let offset = self.sent_offset.max(0);
        let per_iq = (best_chunk_size * 2).min(MAX_CHUNK_SIZE) as i64;
        let window_left = DATA_WINDOW_SIZE - (offset - self.chunk_start.max(0));
        let remaining = self.length - offset;
        let size = per_iq.min(window_left).min(remaining).max(0);
        (offset, size as usize)
    }

    /// Record that a chunk of `size` bytes was handed to the link.
    pub fn advance(&mut self, size: usize) {
        self.sent_offset = self.sent_offset.max(0) + size as i64;
    }
}

/// Receiver-side state: chunks are only accepted in order, and the answer
/// to any chunk (in or out of order) is the next expected offset.
#[derive(Clone, Debug)]
pub struct ChunkAssembly {
    /// Total expected length.
    pub length: i64,
    /// Next byte offset expected from the sender.
    pub next_chunk_start: i64,
}

impl ChunkAssembly {
    /// Fresh assembly for an announced file length.
    pub fn new(length: i64) -> Self {
        Self {
            length,
            next_chunk_start: 0,
        }
    }

    /// Offer one chunk. Returns `Some(offset)` to write at when the chunk
    /// is the expected one; the reply value is [`Self::next_chunk_start`]
    /// either way, which re-synchronizes a sender that drifted.
    pub fn accept(&mut self, chunk_start: i64, size: usize) -> Option<i64> {
        if chunk_start != self.next_chunk_start {
            tracing::debug!(
                chunk_start,
                expected = self.next_chunk_start,
                "out-of-order chunk dropped"
            );
            return None;
        }
        let offset = self.next_chunk_start;
        self.next_chunk_start += size as i64;
        Some(offset)
    }

    /// Whether every byte has arrived.
    pub fn is_complete(&self) -> bool {
        self.next_chunk_start >= self.length
    }
}
