//! Inbound demultiplexing of [`ResponseMessage`]s to the callback each one belongs to.
//!
//! One [`ResponseHandler`] lives per connection, shared between the loop task that
//! feeds it decoded frames and the [`crate::client::TransportClient`] that registers
//! callbacks before writing a request. Registration maps are `std::sync::Mutex`-guarded
//! `HashMap`s/`VecDeque`s: a single loop task mutates them on the happy path, but a
//! concurrent `TransportClient::close` or idle-timeout sweep can drain them from
//! another task, so every access goes through the mutex rather than relying on
//! single-writer discipline.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::TransportError;
use crate::request_id::StreamChunkId;
use crate::rpc_handler::{ChunkReceivedCallback, RpcResponseCallback, StreamCallback};
use crate::wire::message::ResponseMessage;

/// Tracks every request this connection's client has outstanding, and dispatches
/// inbound response frames to the matching callback exactly once.
pub struct ResponseHandler {
    remote_address: String,
    outstanding_rpcs: Mutex<HashMap<u64, Box<dyn RpcResponseCallback>>>,
    outstanding_fetches: Mutex<HashMap<StreamChunkId, Box<dyn ChunkReceivedCallback>>>,
    stream_callbacks: Mutex<VecDeque<(u64, Box<dyn StreamCallback>)>>,
    last_activity: Mutex<Instant>,
}

impl ResponseHandler {
    pub fn new(remote_address: String) -> Self {
        ResponseHandler {
            remote_address,
            outstanding_rpcs: Mutex::new(HashMap::new()),
            outstanding_fetches: Mutex::new(HashMap::new()),
            stream_callbacks: Mutex::new(VecDeque::new()),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Updates `last_activity`; called on every inbound or outbound frame.
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// How long it has been since the last inbound or outbound frame.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    /// The number of requests this connection is still waiting on a response for,
    /// consulted by the idle detector to distinguish an idle close from a stalled one.
    pub fn outstanding_count(&self) -> usize {
        self.outstanding_rpcs.lock().unwrap().len()
            + self.outstanding_fetches.lock().unwrap().len()
            + self.stream_callbacks.lock().unwrap().len()
    }

    pub fn register_rpc(&self, request_id: u64, callback: Box<dyn RpcResponseCallback>) {
        self.outstanding_rpcs.lock().unwrap().insert(request_id, callback);
    }

    pub fn remove_rpc(&self, request_id: u64) -> Option<Box<dyn RpcResponseCallback>> {
        self.outstanding_rpcs.lock().unwrap().remove(&request_id)
    }

    pub fn register_fetch(&self, id: StreamChunkId, callback: Box<dyn ChunkReceivedCallback>) {
        self.outstanding_fetches.lock().unwrap().insert(id, callback);
    }

    pub fn remove_fetch(&self, id: &StreamChunkId) -> Option<Box<dyn ChunkReceivedCallback>> {
        self.outstanding_fetches.lock().unwrap().remove(id)
    }

    /// Enqueues a stream callback for an in-order `StreamResponse`/`StreamFailure`.
    /// Callers (`TransportClient::stream`) must hold their own lock across this call
    /// and the `StreamRequest` write, so enqueue order matches send order.
    pub fn push_stream_callback(&self, stream_id: u64, callback: Box<dyn StreamCallback>) {
        self.stream_callbacks.lock().unwrap().push_back((stream_id, callback));
    }

    /// Removes the most recently enqueued stream callback. Used only to undo a
    /// `push_stream_callback` whose matching `StreamRequest` write then failed; the
    /// caller holds the client's own stream lock across both calls, so nothing else
    /// can have been pushed in between.
    pub fn pop_back_stream_callback(&self) -> Option<(u64, Box<dyn StreamCallback>)> {
        self.stream_callbacks.lock().unwrap().pop_back()
    }

    /// Dispatches one decoded response frame. Releases any body buffer it was handed
    /// once the matching callback has returned.
    pub fn handle_response(&self, message: ResponseMessage) {
        self.touch();
        match message {
            ResponseMessage::ChunkFetchSuccess { stream_chunk_id, body } => {
                match self.remove_fetch(&stream_chunk_id) {
                    Some(mut callback) => {
                        let bytes = match body.as_readable_bytes() {
                            Ok(b) => b,
                            Err(e) => {
                                warn!(%stream_chunk_id, error = %e, "failed to materialize chunk body");
                                body.release();
                                callback.on_failure(
                                    stream_chunk_id.chunk_index,
                                    TransportError::Decode(e.to_string()),
                                );
                                return;
                            }
                        };
                        callback.on_success(stream_chunk_id.chunk_index, bytes);
                        body.release();
                    }
                    None => {
                        warn!(%stream_chunk_id, "chunk fetch success for an unregistered (or already completed) fetch");
                        body.release();
                    }
                }
            }
            ResponseMessage::ChunkFetchFailure { stream_chunk_id, error } => {
                if let Some(mut callback) = self.remove_fetch(&stream_chunk_id) {
                    callback.on_failure(stream_chunk_id.chunk_index, TransportError::RemoteChunk(error));
                } else {
                    warn!(%stream_chunk_id, %error, "chunk fetch failure for an unregistered fetch");
                }
            }
            ResponseMessage::RpcResponse { request_id, body } => match self.remove_rpc(request_id) {
                Some(mut callback) => {
                    match body.as_readable_bytes() {
                        Ok(bytes) => callback.on_success(bytes),
                        Err(e) => callback.on_failure(TransportError::Decode(e.to_string())),
                    }
                    body.release();
                }
                None => {
                    warn!(request_id, "rpc response for an unregistered (or already completed) request");
                    body.release();
                }
            },
            ResponseMessage::RpcFailure { request_id, error } => {
                if let Some(mut callback) = self.remove_rpc(request_id) {
                    callback.on_failure(TransportError::RemoteRpc(error));
                } else {
                    warn!(request_id, %error, "rpc failure for an unregistered request");
                }
            }
            ResponseMessage::StreamResponse { stream_id, byte_count, body } => {
                let mut queue = self.stream_callbacks.lock().unwrap();
                match queue.front_mut() {
                    Some((id, callback)) if *id == stream_id => {
                        let bytes = match body.as_readable_bytes() {
                            Ok(b) => b,
                            Err(e) => {
                                body.release();
                                let (_, mut callback) = queue.pop_front().unwrap();
                                callback.on_failure(TransportError::Decode(e.to_string()));
                                return;
                            }
                        };
                        let delivered = bytes.len() as i64;
                        callback.on_data(bytes);
                        if delivered >= byte_count {
                            let (_, mut callback) = queue.pop_front().unwrap();
                            callback.on_complete();
                        }
                        body.release();
                    }
                    Some((id, _)) => {
                        warn!(stream_id, head = *id, "stream response doesn't match the head of the callback queue");
                        body.release();
                    }
                    None => {
                        warn!(stream_id, "stream response with no registered stream callback");
                        body.release();
                    }
                }
            }
            ResponseMessage::StreamFailure { stream_id, error } => {
                let mut queue = self.stream_callbacks.lock().unwrap();
                match queue.front() {
                    Some((id, _)) if *id == stream_id => {
                        let (_, mut callback) = queue.pop_front().unwrap();
                        callback.on_failure(TransportError::RemoteStream(error));
                    }
                    _ => warn!(stream_id, %error, "stream failure with no matching head-of-queue callback"),
                }
            }
        }
    }

    /// Drains every outstanding callback with `reason`, called on channel teardown
    /// (inactive, exception, or idle timeout). Idempotent: a second call finds nothing
    /// left to drain.
    pub fn drain_all(&self, reason: TransportError) {
        let rpcs: Vec<_> = self.outstanding_rpcs.lock().unwrap().drain().collect();
        let fetches: Vec<_> = self.outstanding_fetches.lock().unwrap().drain().collect();
        let streams: Vec<_> = self.stream_callbacks.lock().unwrap().drain(..).collect();

        if !rpcs.is_empty() || !fetches.is_empty() || !streams.is_empty() {
            debug!(
                remote = %self.remote_address,
                rpcs = rpcs.len(),
                fetches = fetches.len(),
                streams = streams.len(),
                %reason,
                "draining outstanding callbacks on channel teardown"
            );
        }

        for (_, mut callback) in rpcs {
            callback.on_failure(reason.clone());
        }
        for (id, mut callback) in fetches {
            callback.on_failure(id.chunk_index, reason.clone());
        }
        for (_, mut callback) in streams {
            callback.on_failure(reason.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct RecordingRpcCallback {
        success: Arc<AtomicBool>,
        failure: Arc<AtomicBool>,
    }

    impl RpcResponseCallback for RecordingRpcCallback {
        fn on_success(&mut self, _response: Bytes) {
            self.success.store(true, Ordering::SeqCst);
        }
        fn on_failure(&mut self, _error: TransportError) {
            self.failure.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn rpc_response_dispatches_to_the_registered_callback_exactly_once() {
        let handler = ResponseHandler::new("peer:1".to_string());
        let success = Arc::new(AtomicBool::new(false));
        let failure = Arc::new(AtomicBool::new(false));
        handler.register_rpc(
            1,
            Box::new(RecordingRpcCallback { success: success.clone(), failure: failure.clone() }),
        );

        handler.handle_response(ResponseMessage::RpcResponse {
            request_id: 1,
            body: crate::buffer::ManagedBuffer::from_memory(&b"ok"[..]),
        });

        assert!(success.load(Ordering::SeqCst));
        assert!(!failure.load(Ordering::SeqCst));
        assert_eq!(handler.outstanding_count(), 0);
    }

    #[test]
    fn unregistered_response_is_logged_and_discarded() {
        let handler = ResponseHandler::new("peer:1".to_string());
        // Should not panic even though nothing is registered for request id 7.
        handler.handle_response(ResponseMessage::RpcFailure { request_id: 7, error: "boom".into() });
    }

    #[test]
    fn drain_all_fails_every_outstanding_callback_once() {
        let handler = ResponseHandler::new("peer:1".to_string());
        let success = Arc::new(AtomicBool::new(false));
        let failure = Arc::new(AtomicBool::new(false));
        handler.register_rpc(
            1,
            Box::new(RecordingRpcCallback { success: success.clone(), failure: failure.clone() }),
        );

        handler.drain_all(TransportError::write_failed("peer:1", "connection reset"));

        assert!(failure.load(Ordering::SeqCst));
        assert_eq!(handler.outstanding_count(), 0);

        // A second drain is a no-op, not a double-failure.
        failure.store(false, Ordering::SeqCst);
        handler.drain_all(TransportError::write_failed("peer:1", "connection reset"));
        assert!(!failure.load(Ordering::SeqCst));
    }
}
