//! The capability contract an embedder implements to answer RPCs, one-way messages,
//! and stream uploads arriving on a channel.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use crate::error::TransportError;
use crate::stream_manager::StreamManager;

/// A handle back to the peer a request arrived from, passed to every `RpcHandler`
/// callback so a handler can address a reply or inspect who it's talking to without
/// owning the channel itself.
pub type ReverseClient = Arc<crate::client::TransportClient>;

/// Completes a single in-flight RPC. Exactly one of `on_success`/`on_failure` must be
/// invoked, and at most once; invoking neither leaves the caller's request pending
/// forever (and, if the connection later drops, failed by the teardown sweep instead).
pub trait RpcResponseCallback: Send {
    fn on_success(&mut self, response: Bytes);
    fn on_failure(&mut self, error: TransportError);
}

/// Delivers the decoded data buffer for a chunk fetch, and the eventual pass/fail
/// outcome for the fetch as a whole.
pub trait ChunkReceivedCallback: Send {
    fn on_success(&mut self, chunk_index: i32, chunk: Bytes);
    fn on_failure(&mut self, chunk_index: i32, error: TransportError);
}

/// Delivers the body of a named `stream()` pull, which may arrive as more than one
/// `on_data` call before `on_complete` fires (mirroring `StreamResponse`'s `byte_count`
/// framing, which lets a stream's payload span more than one inbound frame).
pub trait StreamCallback: Send {
    fn on_data(&mut self, chunk: Bytes);
    fn on_complete(&mut self);
    fn on_failure(&mut self, error: TransportError);
}

/// Delivers chunks of an inbound upload as they arrive, and the terminal outcome.
/// `on_data` errors fail the channel outright (the upload is unrecoverable mid-stream);
/// `on_complete` errors surface only as an `RpcFailure` to the uploader.
#[async_trait]
pub trait UploadStreamReceiver: Send {
    async fn on_data(&mut self, chunk: Bytes) -> Result<(), TransportError>;
    async fn on_complete(&mut self) -> Result<(), TransportError>;
}

/// Discards a one-way message's (nonexistent) reply, logging if anything tries to
/// answer it anyway. The default `receive_one_way` implementation's callback.
struct DiscardingCallback;

impl RpcResponseCallback for DiscardingCallback {
    fn on_success(&mut self, _response: Bytes) {
        warn!("a one-way message handler answered via the response callback; the answer is discarded");
    }

    fn on_failure(&mut self, error: TransportError) {
        warn!(%error, "a one-way message handler's error is discarded (no caller is waiting)");
    }
}

/// The embedder-implemented application logic for a channel. One instance is shared
/// across every connection a `TransportContext` accepts or opens.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Services a two-way RPC request. The handler resolves the request by calling
    /// exactly one of `callback`'s methods, synchronously or from another task.
    async fn receive(&self, client: ReverseClient, message: Bytes, callback: Box<dyn RpcResponseCallback>);

    /// Services a one-way message, for which no reply is expected. The default
    /// implementation forwards to `receive` with a callback that discards any answer;
    /// override only if one-way messages need handling distinct from ordinary RPCs.
    async fn receive_one_way(&self, client: ReverseClient, message: Bytes) {
        self.receive(client, message, Box::new(DiscardingCallback)).await
    }

    /// Begins servicing an inbound upload. `meta` is the small header buffer sent
    /// alongside the upload's data; the returned receiver is fed the data buffer and
    /// then told the upload is complete. Unsupported by default.
    async fn receive_stream(
        &self,
        _client: ReverseClient,
        _meta: Bytes,
    ) -> Result<Box<dyn UploadStreamReceiver>, TransportError> {
        Err(TransportError::Handler("this handler does not accept stream uploads".to_string()))
    }

    /// The stream manager this handler serves chunk fetches out of.
    fn stream_manager(&self) -> Arc<dyn StreamManager>;

    /// Invoked once a channel becomes usable (after any handshake the embedder layers
    /// on top). No-op by default.
    fn channel_active(&self, _client: &ReverseClient) {}

    /// Invoked once a channel is no longer usable, after teardown has already failed
    /// every outstanding callback. No-op by default.
    fn channel_inactive(&self, _client: &ReverseClient) {}

    /// Invoked when an otherwise-unhandled error occurs on the channel (a framing or
    /// decode error, for instance). No-op by default.
    fn exception_caught(&self, _cause: &TransportError, _client: &ReverseClient) {}
}
