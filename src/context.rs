//! Pipeline assembly: wires a concrete channel to a fresh `TransportClient` and its
//! handler trio, and spawns the connection's dispatch loop.
//!
//! This is pure composition, no behavior of its own, following the pipeline order
//! laid out in the component design: `encoder -> frame_decoder -> decoder -> idle_state
//! -> channel_handler`. The frame decoder and decoder stages are realized by
//! `tokio_util::codec::FramedRead<_, FrameCodec>` plus `Message::decode`; idle
//! detection and routing are both folded into [`crate::handler::channel::ChannelHandler`].

use std::sync::Arc;

use tokio_util::codec::FramedRead;

use crate::channel::{Channel, DuplexChannel, TcpChannel};
use crate::client::TransportClient;
use crate::config::TransportConfig;
use crate::handler::channel::ChannelHandler;
use crate::handler::request::RequestHandler;
use crate::handler::response::ResponseHandler;
use crate::rpc_handler::RpcHandler;
use crate::wire::frame::FrameCodec;

/// Assembles the transport pipeline for every connection an embedder accepts or
/// opens, sharing one `RpcHandler` (and, through it, one `StreamManager`) across all
/// of them.
pub struct TransportContext {
    rpc_handler: Arc<dyn RpcHandler>,
    config: TransportConfig,
}

impl TransportContext {
    pub fn new(rpc_handler: Arc<dyn RpcHandler>, config: TransportConfig) -> Self {
        TransportContext { rpc_handler, config }
    }

    /// Wires up a server-side connection from an accepted TCP socket. The returned
    /// client is the same "reverse client" handle the embedder's `RpcHandler` will
    /// receive for every request this peer sends.
    pub fn accept_tcp(&self, stream: tokio::net::TcpStream) -> Arc<TransportClient> {
        let (channel, frame_stream) = TcpChannel::split(stream);
        self.spawn_pipeline(Arc::new(channel), frame_stream)
    }

    /// Opens a client-side connection by connecting out over TCP. Differs from
    /// `accept_tcp` only in which side originated the socket; the pipeline assembled
    /// from there on is identical.
    pub async fn connect_tcp(&self, addr: &str) -> std::io::Result<Arc<TransportClient>> {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        Ok(self.accept_tcp(stream))
    }

    /// Wires up an in-process connection over a `tokio::io::DuplexStream`, used by
    /// this crate's own integration tests to exercise the pipeline without a socket.
    pub fn attach_duplex(
        &self,
        stream: tokio::io::DuplexStream,
        remote_address: String,
    ) -> Arc<TransportClient> {
        let (read_half, write_half) = tokio::io::split(stream);
        let channel = DuplexChannel::new(write_half, remote_address);
        let frame_stream = FramedRead::new(read_half, FrameCodec);
        self.spawn_pipeline(Arc::new(channel), frame_stream)
    }

    fn spawn_pipeline<R>(
        &self,
        channel: Arc<dyn Channel>,
        frame_stream: FramedRead<R, FrameCodec>,
    ) -> Arc<TransportClient>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let remote_address = channel.remote_address();
        let response_handler = Arc::new(ResponseHandler::new(remote_address));
        let stream_manager = self.rpc_handler.stream_manager();

        let client = Arc::new(TransportClient::new(
            channel.clone(),
            response_handler.clone(),
            self.rpc_handler.clone(),
            stream_manager.clone(),
        ));

        let request_handler = Arc::new(RequestHandler::new(
            channel,
            self.rpc_handler.clone(),
            stream_manager,
            client.clone(),
            response_handler.clone(),
            self.config,
        ));

        let channel_handler = ChannelHandler::new(
            frame_stream,
            response_handler,
            request_handler,
            client.clone(),
            self.rpc_handler.clone(),
            self.config,
        );
        tokio::spawn(channel_handler.run());

        client
    }
}
