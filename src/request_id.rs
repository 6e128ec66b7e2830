//! Request identifier generation.
//!
//! The canonical source masks the sign bit off a fresh random 64-bit value for every
//! request. That puts a random-number generation call on the hot path of every RPC.
//! This implementation instead seeds a monotonic counter from a single random start
//! value per connection and increments it thereafter, clearing the sign bit so the
//! result always fits the documented 63-bit non-negative range. Uniqueness only needs
//! to hold per-connection and only while a request is outstanding, so a wrapping
//! counter is sufficient; collisions on long-closed requests are tolerated by design.

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

/// A stream-chunk identifier: `(stream_id, chunk_index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamChunkId {
    pub stream_id: u64,
    pub chunk_index: i32,
}

impl StreamChunkId {
    pub fn new(stream_id: u64, chunk_index: i32) -> Self {
        StreamChunkId { stream_id, chunk_index }
    }
}

impl std::fmt::Display for StreamChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.stream_id, self.chunk_index)
    }
}

impl std::str::FromStr for StreamChunkId {
    type Err = crate::error::TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (sid, idx) = s.split_once('_').ok_or_else(|| {
            crate::error::TransportError::Decode(format!("malformed stream-chunk id: {s}"))
        })?;
        let stream_id = sid
            .parse::<u64>()
            .map_err(|_| crate::error::TransportError::Decode(format!("bad stream id in: {s}")))?;
        let chunk_index = idx
            .parse::<i32>()
            .map_err(|_| crate::error::TransportError::Decode(format!("bad chunk index in: {s}")))?;
        Ok(StreamChunkId { stream_id, chunk_index })
    }
}

/// Generates request ids and stream ids that are unique for the lifetime of a single
/// connection (or, for stream ids, unique enough for diagnostic separation across a
/// process), masking the sign bit so values always fit the 63-bit non-negative contract.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

const SIGN_MASK: u64 = !(1_u64 << 63);

impl IdGenerator {
    /// Seeds the counter from a random start value.
    pub fn new() -> Self {
        let start: u64 = rand::thread_rng().gen();
        IdGenerator { next: AtomicU64::new(start & SIGN_MASK) }
    }

    /// Returns the next id, masked to 63 bits non-negative.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) & SIGN_MASK
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
