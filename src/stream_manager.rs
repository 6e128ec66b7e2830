//! Server-side bookkeeping for chunked stream fetches.
//!
//! A stream is registered once (by application code, out of band from any RPC) and
//! then drained by a sequence of `ChunkFetchRequest`s that must arrive in strict
//! ascending order. [`OneForOneStreamManager`] is the one-stream-per-consumer
//! implementation described by the transport: each registered stream is associated
//! with exactly one channel (bound at registration time), and a connection drop
//! releases every buffer the stream had not yet served.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::buffer::ManagedBuffer;
use crate::error::TransportError;
use crate::request_id::StreamChunkId;

/// Capability surface a `TransportContext` uses to serve chunk fetches and to account
/// for how many chunks/streams are in flight on a given channel.
pub trait StreamManager: Send + Sync {
    /// Registers a new stream, binding it to the channel identified by
    /// `remote_address`, and returns the `stream_id` clients will fetch chunks from.
    /// `app_id` is an opaque authorization token checked by `check_authorization`;
    /// `None` means the stream carries no authorization requirement.
    fn register_stream(
        &self,
        app_id: Option<String>,
        buffers: Vec<ManagedBuffer>,
        remote_address: &str,
    ) -> String;

    /// Returns the next chunk for `stream_id`, enforcing strict ascending order on
    /// `chunk_index`. Returns `OutOfOrder` if `chunk_index` isn't exactly the next
    /// expected index, or if the stream is unknown or exhausted. Removes the stream
    /// from the registry once its last buffer has been served.
    fn get_chunk(&self, stream_id: &str, chunk_index: i32) -> Result<ManagedBuffer, TransportError>;

    /// Parses `stream_chunk_id` as the canonical `"{stream_id}_{chunk_index}"` text
    /// form and delegates to [`StreamManager::get_chunk`].
    fn open_stream(&self, stream_chunk_id: &str) -> Result<ManagedBuffer, TransportError>;

    /// Checks whether `client_app_id` is authorized to read `stream_id`. Succeeds if
    /// the stream carries no `app_id`, if the client presented no `app_id`, or if the
    /// two match; fails otherwise. Invoked once before the first chunk is served.
    fn check_authorization(
        &self,
        stream_id: &str,
        client_app_id: Option<&str>,
    ) -> Result<(), TransportError>;

    /// Releases every buffer not yet served for streams registered against
    /// `remote_address`, called when that channel goes inactive.
    fn connection_terminated(&self, remote_address: &str);

    /// Increments the in-flight chunk counter for `remote_address`.
    fn chunk_being_sent(&self, remote_address: &str);

    /// Decrements the in-flight chunk counter for `remote_address`.
    fn chunk_sent(&self, remote_address: &str);

    /// Increments the in-flight whole-stream-send counter for `remote_address`,
    /// tracking `StreamRequest`/`StreamResponse` traffic separately from indexed
    /// chunk fetches.
    fn stream_being_sent(&self, remote_address: &str);

    /// Decrements the in-flight whole-stream-send counter for `remote_address`.
    fn stream_sent(&self, remote_address: &str);

    /// How many chunks are currently in flight for `remote_address`, used to enforce
    /// `TransportConfig::max_chunks_being_transferred`.
    fn chunks_being_transferred(&self, remote_address: &str) -> usize;
}

struct StreamState {
    app_id: Option<String>,
    buffers: Vec<ManagedBuffer>,
    next_chunk_index: AtomicI32,
    owning_channel: String,
}

/// Per-channel in-flight counters for chunk and whole-stream sends.
#[derive(Default)]
struct ChannelCounters {
    chunks: usize,
    streams: usize,
}

/// Assigns each registered stream a single consumer and enforces that chunks are
/// fetched strictly in order, as `StreamState::next_chunk_index` tracks. A plain
/// `Mutex<HashMap<...>>` guards per-entry state, with atomics for fields mutated far
/// more often than the map itself is structurally changed.
pub struct OneForOneStreamManager {
    streams: Mutex<HashMap<String, StreamState>>,
    counters: Mutex<HashMap<String, ChannelCounters>>,
    next_stream_id: AtomicUsize,
}

impl Default for OneForOneStreamManager {
    fn default() -> Self {
        OneForOneStreamManager {
            streams: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            next_stream_id: AtomicUsize::new(rand::random::<u32>() as usize),
        }
    }
}

impl OneForOneStreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_chunk_locked(
        streams: &mut HashMap<String, StreamState>,
        stream_id: &str,
        chunk_index: i32,
    ) -> Result<ManagedBuffer, TransportError> {
        let state = streams
            .get(stream_id)
            .ok_or_else(|| TransportError::OutOfOrder(format!("unknown stream {stream_id}")))?;

        let expected = state.next_chunk_index.load(Ordering::SeqCst);
        if chunk_index != expected {
            return Err(TransportError::OutOfOrder(format!(
                "stream {stream_id} expected chunk {expected}, got {chunk_index}"
            )));
        }

        let buffer = state
            .buffers
            .get(chunk_index as usize)
            .cloned()
            .ok_or_else(|| {
                TransportError::OutOfOrder(format!("stream {stream_id} exhausted at chunk {chunk_index}"))
            })?;

        state.next_chunk_index.fetch_add(1, Ordering::SeqCst);
        let exhausted = (chunk_index + 1) as usize >= state.buffers.len();
        if exhausted {
            streams.remove(stream_id);
            debug!(stream_id = %stream_id, "stream exhausted, removed from registry");
        }
        Ok(buffer)
    }
}

impl StreamManager for OneForOneStreamManager {
    fn register_stream(
        &self,
        app_id: Option<String>,
        buffers: Vec<ManagedBuffer>,
        remote_address: &str,
    ) -> String {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed).to_string();
        let state = StreamState {
            app_id,
            buffers,
            next_chunk_index: AtomicI32::new(0),
            owning_channel: remote_address.to_string(),
        };
        self.streams.lock().unwrap().insert(stream_id.clone(), state);
        debug!(stream_id = %stream_id, remote = %remote_address, "stream registered");
        stream_id
    }

    fn get_chunk(&self, stream_id: &str, chunk_index: i32) -> Result<ManagedBuffer, TransportError> {
        let mut streams = self.streams.lock().unwrap();
        Self::get_chunk_locked(&mut streams, stream_id, chunk_index)
    }

    fn open_stream(&self, stream_chunk_id: &str) -> Result<ManagedBuffer, TransportError> {
        let id: StreamChunkId = stream_chunk_id.parse()?;
        self.get_chunk(&id.stream_id.to_string(), id.chunk_index)
    }

    fn check_authorization(
        &self,
        stream_id: &str,
        client_app_id: Option<&str>,
    ) -> Result<(), TransportError> {
        let streams = self.streams.lock().unwrap();
        let state = streams
            .get(stream_id)
            .ok_or_else(|| TransportError::Unauthorized(format!("unknown stream {stream_id}")))?;
        match (client_app_id, state.app_id.as_deref()) {
            (Some(client), Some(owner)) if client != owner => Err(TransportError::Unauthorized(format!(
                "client {client} is not authorized for stream {stream_id} (owned by {owner})"
            ))),
            _ => Ok(()),
        }
    }

    fn connection_terminated(&self, remote_address: &str) {
        let mut streams = self.streams.lock().unwrap();
        let dead: Vec<String> = streams
            .iter()
            .filter(|(_, state)| state.owning_channel == remote_address)
            .map(|(id, _)| id.clone())
            .collect();

        for stream_id in dead {
            if let Some(state) = streams.remove(&stream_id) {
                let next = state.next_chunk_index.load(Ordering::SeqCst).max(0) as usize;
                let unreleased = state.buffers.len().saturating_sub(next);
                if unreleased > 0 {
                    warn!(
                        stream_id = %stream_id,
                        unreleased,
                        "connection terminated, releasing unserved stream buffers"
                    );
                }
                for buffer in state.buffers.into_iter().skip(next) {
                    buffer.release();
                }
            }
        }
        self.counters.lock().unwrap().remove(remote_address);
    }

    fn chunk_being_sent(&self, remote_address: &str) {
        self.counters.lock().unwrap().entry(remote_address.to_string()).or_default().chunks += 1;
    }

    fn chunk_sent(&self, remote_address: &str) {
        if let Some(counters) = self.counters.lock().unwrap().get_mut(remote_address) {
            counters.chunks = counters.chunks.saturating_sub(1);
        }
    }

    fn stream_being_sent(&self, remote_address: &str) {
        self.counters.lock().unwrap().entry(remote_address.to_string()).or_default().streams += 1;
    }

    fn stream_sent(&self, remote_address: &str) {
        if let Some(counters) = self.counters.lock().unwrap().get_mut(remote_address) {
            counters.streams = counters.streams.saturating_sub(1);
        }
    }

    fn chunks_being_transferred(&self, remote_address: &str) -> usize {
        self.counters.lock().unwrap().get(remote_address).map(|c| c.chunks).unwrap_or(0)
    }
}
