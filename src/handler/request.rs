//! Inbound dispatch of [`RequestMessage`]s to the embedder's `RpcHandler`.
//!
//! One [`RequestHandler`] lives per connection, invoked directly, in order, by the
//! channel handler's own dispatch loop for every decoded request frame. `receive` runs
//! on that same task, so a slow embedder handler holds up this connection's next
//! request until it returns, per the concurrency model: keeping a handler off the
//! connection's critical path is the embedder's job, not this crate's.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{error, warn};

use crate::buffer::ManagedBuffer;
use crate::channel::Channel;
use crate::client::TransportClient;
use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::handler::response::ResponseHandler;
use crate::request_id::StreamChunkId;
use crate::rpc_handler::{RpcHandler, RpcResponseCallback};
use crate::stream_manager::StreamManager;
use crate::wire::message::{Message, RequestMessage, ResponseMessage};

/// Completes a single inbound `RpcRequest` by forwarding whichever outcome the
/// embedder's handler produces to a `oneshot` the dispatch loop is awaiting. Exactly
/// one of `on_success`/`on_failure` is delivered; a second call is logged and ignored.
struct OneshotResponseCallback {
    tx: Option<tokio::sync::oneshot::Sender<Result<Bytes, TransportError>>>,
}

impl RpcResponseCallback for OneshotResponseCallback {
    fn on_success(&mut self, response: Bytes) {
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(Ok(response));
            }
            None => warn!("rpc response callback invoked more than once; ignoring the extra call"),
        }
    }

    fn on_failure(&mut self, error: TransportError) {
        match self.tx.take() {
            Some(tx) => {
                let _ = tx.send(Err(error));
            }
            None => warn!(%error, "rpc failure callback invoked more than once; ignoring the extra call"),
        }
    }
}

/// Services inbound requests on one connection: RPCs, one-way messages, uploads, and
/// both flavors of stream read (indexed chunk fetch and named whole-stream pull).
pub struct RequestHandler {
    channel: Arc<dyn Channel>,
    rpc_handler: Arc<dyn RpcHandler>,
    stream_manager: Arc<dyn StreamManager>,
    reverse_client: Arc<TransportClient>,
    response_handler: Arc<ResponseHandler>,
    config: TransportConfig,
    remote_address: String,
}

impl RequestHandler {
    pub fn new(
        channel: Arc<dyn Channel>,
        rpc_handler: Arc<dyn RpcHandler>,
        stream_manager: Arc<dyn StreamManager>,
        reverse_client: Arc<TransportClient>,
        response_handler: Arc<ResponseHandler>,
        config: TransportConfig,
    ) -> Self {
        let remote_address = channel.remote_address();
        RequestHandler {
            channel,
            rpc_handler,
            stream_manager,
            reverse_client,
            response_handler,
            config,
            remote_address,
        }
    }

    async fn write(&self, message: Message) {
        match message.encode() {
            Ok(encoded) => {
                if let Err(e) = self.channel.send_frame(encoded.header.freeze(), encoded.body).await {
                    warn!(remote = %self.remote_address, error = %e, "request-handler write failed");
                    return;
                }
                self.response_handler.touch();
            }
            Err(e) => error!(remote = %self.remote_address, error = %e, "failed to encode outbound response"),
        }
    }

    /// Dispatches one decoded request frame. Never propagates an error: every
    /// failure mode this can hit is either written back to the peer as a failure
    /// response or logged, per §7's "a failure on a single request affects only that
    /// request" propagation policy.
    pub async fn handle_request(self: Arc<Self>, message: RequestMessage) {
        match message {
            RequestMessage::RpcRequest { request_id, body } => self.handle_rpc_request(request_id, body).await,
            RequestMessage::OneWayMessage { body } => self.handle_one_way(body).await,
            RequestMessage::UploadStream { request_id, meta, data } => {
                self.handle_upload_stream(request_id, meta, data).await
            }
            RequestMessage::ChunkFetchRequest { stream_chunk_id } => {
                self.handle_chunk_fetch(stream_chunk_id).await
            }
            RequestMessage::StreamRequest { stream_id } => self.handle_stream_request(stream_id).await,
        }
    }

    async fn handle_rpc_request(&self, request_id: u64, body: ManagedBuffer) {
        let bytes = match body.as_readable_bytes() {
            Ok(b) => b,
            Err(e) => {
                body.release();
                self.write_rpc_failure(request_id, e.to_string()).await;
                return;
            }
        };
        body.release();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let callback: Box<dyn RpcResponseCallback> = Box::new(OneshotResponseCallback { tx: Some(tx) });
        let reverse_client = self.reverse_client.clone();

        self.rpc_handler.receive(reverse_client, bytes, callback).await;

        let outcome = match rx.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Handler(
                "handler returned without completing the response callback".to_string(),
            )),
        };

        match outcome {
            Ok(response) => self.write_rpc_response(request_id, response).await,
            Err(e) => self.write_rpc_failure(request_id, e.to_string()).await,
        }
    }

    async fn handle_one_way(&self, body: ManagedBuffer) {
        let bytes = match body.as_readable_bytes() {
            Ok(b) => b,
            Err(e) => {
                warn!(remote = %self.remote_address, error = %e, "failed to materialize one-way message body");
                body.release();
                return;
            }
        };
        body.release();

        let reverse_client = self.reverse_client.clone();
        self.rpc_handler.receive_one_way(reverse_client, bytes).await;
    }

    async fn handle_upload_stream(&self, request_id: u64, meta: ManagedBuffer, data: ManagedBuffer) {
        let meta_bytes = match meta.as_readable_bytes() {
            Ok(b) => b,
            Err(e) => {
                meta.release();
                data.release();
                self.write_rpc_failure(request_id, e.to_string()).await;
                return;
            }
        };
        meta.release();

        let mut receiver = match self.rpc_handler.receive_stream(self.reverse_client.clone(), meta_bytes).await {
            Ok(receiver) => receiver,
            Err(e) => {
                data.release();
                self.write_rpc_failure(request_id, e.to_string()).await;
                return;
            }
        };

        let data_bytes = match data.as_readable_bytes() {
            Ok(b) => b,
            Err(e) => {
                data.release();
                self.write_rpc_failure(request_id, e.to_string()).await;
                return;
            }
        };
        data.release();

        // A failure mid-upload leaves the peer's data half-delivered with no way to
        // resynchronize; the whole channel goes down rather than just this request.
        if let Err(e) = receiver.on_data(data_bytes).await {
            error!(remote = %self.remote_address, error = %e, "upload data delivery failed, closing channel");
            self.channel.close().await;
            return;
        }

        match receiver.on_complete().await {
            Ok(()) => self.write_rpc_response(request_id, Bytes::new()).await,
            Err(e) => self.write_rpc_failure(request_id, e.to_string()).await,
        }
    }

    async fn handle_chunk_fetch(&self, stream_chunk_id: StreamChunkId) {
        let stream_id = stream_chunk_id.stream_id.to_string();
        let client_app_id = self.reverse_client.app_id();

        if let Err(e) = self.stream_manager.check_authorization(&stream_id, client_app_id.as_deref()) {
            self.write_chunk_fetch_failure(stream_chunk_id, e.to_string()).await;
            return;
        }

        match self.stream_manager.get_chunk(&stream_id, stream_chunk_id.chunk_index) {
            Ok(buffer) => self.send_chunk(stream_chunk_id, buffer).await,
            Err(e) => self.write_chunk_fetch_failure(stream_chunk_id, e.to_string()).await,
        }
    }

    async fn send_chunk(&self, stream_chunk_id: StreamChunkId, buffer: ManagedBuffer) {
        self.stream_manager.chunk_being_sent(&self.remote_address);
        let over_cap =
            self.stream_manager.chunks_being_transferred(&self.remote_address) > self.config.max_chunks_being_transferred;

        self.write(Message::Response(ResponseMessage::ChunkFetchSuccess {
            stream_chunk_id,
            body: buffer,
        }))
        .await;
        self.stream_manager.chunk_sent(&self.remote_address);

        if over_cap {
            warn!(
                remote = %self.remote_address,
                cap = self.config.max_chunks_being_transferred,
                "max_chunks_being_transferred exceeded, closing channel after the current write"
            );
            self.channel.close().await;
        }
    }

    async fn handle_stream_request(&self, stream_id: String) {
        let parsed: Result<StreamChunkId, TransportError> = stream_id.parse();
        let numeric_id = match &parsed {
            Ok(id) => id.stream_id,
            Err(_) => 0,
        };

        if let Ok(id) = &parsed {
            let client_app_id = self.reverse_client.app_id();
            if let Err(e) =
                self.stream_manager.check_authorization(&id.stream_id.to_string(), client_app_id.as_deref())
            {
                self.write_stream_failure(numeric_id, e.to_string()).await;
                return;
            }
        }

        match parsed.and_then(|_| self.stream_manager.open_stream(&stream_id)) {
            Ok(buffer) => {
                self.stream_manager.stream_being_sent(&self.remote_address);
                let byte_count = buffer.size() as i64;
                self.write(Message::Response(ResponseMessage::StreamResponse {
                    stream_id: numeric_id,
                    byte_count,
                    body: buffer,
                }))
                .await;
                self.stream_manager.stream_sent(&self.remote_address);
            }
            Err(e) => self.write_stream_failure(numeric_id, e.to_string()).await,
        }
    }

    async fn write_rpc_response(&self, request_id: u64, response: Bytes) {
        self.write(Message::Response(ResponseMessage::RpcResponse {
            request_id,
            body: ManagedBuffer::from_memory(response),
        }))
        .await;
    }

    async fn write_rpc_failure(&self, request_id: u64, error: String) {
        self.write(Message::Response(ResponseMessage::RpcFailure { request_id, error })).await;
    }

    async fn write_chunk_fetch_failure(&self, stream_chunk_id: StreamChunkId, error: String) {
        self.write(Message::Response(ResponseMessage::ChunkFetchFailure { stream_chunk_id, error })).await;
    }

    async fn write_stream_failure(&self, stream_id: u64, error: String) {
        self.write(Message::Response(ResponseMessage::StreamFailure { stream_id, error })).await;
    }
}
