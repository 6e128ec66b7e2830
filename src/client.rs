//! The outbound API of a connection: `send_rpc`, `send_rpc_sync`, `send`, `upload_stream`,
//! `stream`, and `fetch_chunk`.
//!
//! One [`TransportClient`] exists per channel and is shared two ways: the side that
//! opened or accepted the connection holds it directly to make outbound calls, and
//! the request handler on the *other* side of the same call hands the very same
//! instance to the embedder's [`crate::rpc_handler::RpcHandler`] as the "reverse
//! client", since either endpoint can be requester and responder on one channel,
//! there is only ever one `TransportClient` per connection, not a pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::warn;

use crate::buffer::ManagedBuffer;
use crate::channel::Channel;
use crate::error::TransportError;
use crate::handler::response::ResponseHandler;
use crate::request_id::{IdGenerator, StreamChunkId};
use crate::rpc_handler::{ChunkReceivedCallback, RpcHandler, RpcResponseCallback, StreamCallback};
use crate::stream_manager::StreamManager;
use crate::wire::message::{Message, RequestMessage};

use std::sync::Arc;

/// The outbound half of a connection. `Arc<TransportClient>` is the `ReverseClient`
/// type the embedder's `RpcHandler` receives.
pub struct TransportClient {
    channel: Arc<dyn Channel>,
    response_handler: Arc<ResponseHandler>,
    rpc_handler: Arc<dyn RpcHandler>,
    stream_manager: Arc<dyn StreamManager>,
    remote_address: String,
    id_gen: IdGenerator,
    /// Serializes `stream()`'s enqueue-then-write so concurrent callers can't
    /// interleave their callback registration with someone else's frame write.
    stream_lock: AsyncMutex<()>,
    timed_out: AtomicBool,
    app_id: Mutex<Option<String>>,
    torn_down: AtomicBool,
}

impl TransportClient {
    pub fn new(
        channel: Arc<dyn Channel>,
        response_handler: Arc<ResponseHandler>,
        rpc_handler: Arc<dyn RpcHandler>,
        stream_manager: Arc<dyn StreamManager>,
    ) -> Self {
        let remote_address = channel.remote_address();
        TransportClient {
            channel,
            response_handler,
            rpc_handler,
            stream_manager,
            remote_address,
            id_gen: IdGenerator::new(),
            stream_lock: AsyncMutex::new(()),
            timed_out: AtomicBool::new(false),
            app_id: Mutex::new(None),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn remote_address(&self) -> String {
        self.remote_address.clone()
    }

    pub(crate) fn response_handler(&self) -> &Arc<ResponseHandler> {
        &self.response_handler
    }

    /// The opaque authorization token an external auth layer attached to this
    /// connection, if any. `None` until set.
    pub fn app_id(&self) -> Option<String> {
        self.app_id.lock().unwrap().clone()
    }

    pub fn set_app_id(&self, app_id: Option<String>) {
        *self.app_id.lock().unwrap() = app_id;
    }

    /// `true` once an external idle detector has flagged this connection as timed out.
    pub fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
    }

    /// Whether this connection can still be used to send a request.
    pub fn is_active(&self) -> bool {
        !self.is_timed_out() && self.channel.is_open()
    }

    async fn write_message(&self, message: Message) -> Result<(), TransportError> {
        let encoded = message.encode()?;
        let result = self.channel.send_frame(encoded.header.freeze(), encoded.body).await;
        match result {
            Ok(()) => {
                self.response_handler.touch();
                Ok(())
            }
            Err(e) => Err(TransportError::write_failed(self.remote_address(), e)),
        }
    }

    /// Sends an opaque RPC request and returns its request id immediately; `callback`
    /// is completed exactly once, either by an inbound `RpcResponse`/`RpcFailure`, by
    /// this write failing, or by channel teardown.
    pub async fn send_rpc(&self, message: Bytes, callback: Box<dyn RpcResponseCallback>) -> u64 {
        let request_id = self.id_gen.next_id();
        self.response_handler.register_rpc(request_id, callback);

        let body = ManagedBuffer::from_memory(message);
        let result = self
            .write_message(Message::Request(RequestMessage::RpcRequest { request_id, body }))
            .await;

        if let Err(e) = result {
            if let Some(mut cb) = self.response_handler.remove_rpc(request_id) {
                cb.on_failure(e);
            }
            self.channel.close().await;
        }
        request_id
    }

    /// Blocking (`.await`-ing) variant of `send_rpc`: builds a one-shot future, wires
    /// it into `send_rpc`, and waits up to `timeout`. A response that arrives after
    /// the deadline is logged and discarded by the (still-registered) callback; it is
    /// not unregistered, matching the source's documented tradeoff.
    pub async fn send_rpc_sync(&self, message: Bytes, timeout: Duration) -> Result<Bytes, TransportError> {
        struct OneShotCallback(Option<oneshot::Sender<Result<Bytes, TransportError>>>);

        impl RpcResponseCallback for OneShotCallback {
            fn on_success(&mut self, response: Bytes) {
                if let Some(tx) = self.0.take() {
                    let _ = tx.send(Ok(response));
                } else {
                    warn!("sync rpc response arrived after its deadline; discarding");
                }
            }
            fn on_failure(&mut self, error: TransportError) {
                if let Some(tx) = self.0.take() {
                    let _ = tx.send(Err(error));
                } else {
                    warn!(%error, "sync rpc failure arrived after its deadline; discarding");
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.send_rpc(message, Box::new(OneShotCallback(Some(tx)))).await;

        match tokio::time::timeout(timeout, rx).await {
            // Copy the payload into a fresh, independently-owned buffer: the response
            // handler releases the inbound frame buffer as soon as this callback
            // returns, and `rx` may be polled again after that point.
            Ok(Ok(Ok(bytes))) => Ok(Bytes::copy_from_slice(&bytes)),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_canceled)) => {
                Err(TransportError::Handler("rpc callback dropped without completing".to_string()))
            }
            Err(_elapsed) => Err(TransportError::SyncTimeout),
        }
    }

    /// Writes a fire-and-forget message. No registration, no callback, no delivery
    /// guarantee: a write failure is logged and otherwise ignored.
    pub async fn send(&self, message: Bytes) {
        let body = ManagedBuffer::from_memory(message);
        if let Err(e) = self.write_message(Message::Request(RequestMessage::OneWayMessage { body })).await {
            warn!(remote = %self.remote_address(), error = %e, "one-way message write failed");
        }
    }

    /// Registers `callback` and streams `meta` followed by `data` to the peer as a
    /// single `UploadStream` request.
    pub async fn upload_stream(
        &self,
        meta: Bytes,
        data: Bytes,
        callback: Box<dyn RpcResponseCallback>,
    ) -> u64 {
        let request_id = self.id_gen.next_id();
        self.response_handler.register_rpc(request_id, callback);

        let meta = ManagedBuffer::from_memory(meta);
        let data = ManagedBuffer::from_memory(data);
        let result = self
            .write_message(Message::Request(RequestMessage::UploadStream { request_id, meta, data }))
            .await;

        if let Err(e) = result {
            if let Some(mut cb) = self.response_handler.remove_rpc(request_id) {
                cb.on_failure(e);
            }
            self.channel.close().await;
        }
        request_id
    }

    /// Requests a single chunk by `(stream_id, chunk_index)`. The write listener, on
    /// failure, removes the registration and notifies `callback` with an I/O error.
    pub async fn fetch_chunk(&self, stream_id: u64, chunk_index: i32, callback: Box<dyn ChunkReceivedCallback>) {
        let id = StreamChunkId::new(stream_id, chunk_index);
        self.response_handler.register_fetch(id, callback);

        let result = self
            .write_message(Message::Request(RequestMessage::ChunkFetchRequest { stream_chunk_id: id }))
            .await;

        if let Err(e) = result {
            if let Some(mut cb) = self.response_handler.remove_fetch(&id) {
                cb.on_failure(chunk_index, e);
            }
            self.channel.close().await;
        }
    }

    /// Opens a named stream. Enqueues `callback` onto the response handler's ordered
    /// stream-callback queue and writes the `StreamRequest` atomically under this
    /// client's own lock, so a concurrent `stream()` call can't enqueue between this
    /// one's registration and its write.
    pub async fn stream(&self, stream_id: String, callback: Box<dyn StreamCallback>) {
        let _guard = self.stream_lock.lock().await;

        let numeric_id = stream_id.split_once('_').and_then(|(sid, _)| sid.parse::<u64>().ok()).unwrap_or(0);
        self.response_handler.push_stream_callback(numeric_id, callback);

        let result = self
            .write_message(Message::Request(RequestMessage::StreamRequest { stream_id }))
            .await;

        if let Err(e) = result {
            warn!(remote = %self.remote_address(), error = %e, "stream request write failed");
            if let Some((_, mut cb)) = self.response_handler.pop_back_stream_callback() {
                cb.on_failure(e);
            }
            self.channel.close().await;
        }
    }

    /// Closes the channel and fails every outstanding callback, as if the connection
    /// had gone inactive. Idempotent. Takes the `Arc` by value (clone it at the call
    /// site) since `&Arc<Self>` is not a receiver type stable Rust accepts.
    pub async fn close(self: Arc<Self>) {
        self.channel.close().await;
        let reason = TransportError::write_failed(self.remote_address(), "closed locally");
        self.teardown(reason).await;
    }

    /// Closes the channel with a specific teardown `reason` (used by the idle
    /// detector to distinguish an idle close from a stalled-connection timeout).
    pub(crate) async fn close_with_reason(self: Arc<Self>, reason: TransportError) {
        self.channel.close().await;
        self.teardown(reason).await;
    }

    /// Runs the teardown sequence exactly once regardless of which path (local
    /// close, idle detector, or the read loop noticing the peer went away)
    /// triggers it first.
    pub(crate) async fn teardown(self: Arc<Self>, reason: TransportError) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.response_handler.drain_all(reason);
        self.stream_manager.connection_terminated(&self.remote_address);
        self.rpc_handler.channel_inactive(&self);
    }
}
