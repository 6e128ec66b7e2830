//! The abstract network event loop.
//!
//! This crate treats the concrete transport as an opaque [`Channel`]: something that
//! can write an encoded frame and report its own liveness and remote address. The
//! event loop that reads bytes off the wire, reassembles frames, and feeds decoded
//! [`crate::wire::message::Message`]s back in is out of scope for the embedder to
//! provide in general, but a `TcpChannel` is included here as the reference
//! implementation used by the crate's own integration tests and by [`crate::context::TransportContext`].

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::codec::FramedRead;
use tracing::{trace, warn};

use crate::buffer::ManagedBuffer;
use crate::error::TransportError;
use crate::wire::frame::FrameCodec;

/// A single bidirectional byte transport between two endpoints, abstracted away from
/// any particular network stack.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Writes one frame. `header` and `body` are written as distinct regions rather
    /// than concatenated first, per the message codec's "body is not copied" contract.
    /// On success or failure, the caller has handed ownership of `body` to this call;
    /// implementations must `release()` it exactly once before returning.
    ///
    /// Returns `anyhow::Result` rather than `TransportError` directly: this is the
    /// seam where the transport meets a concrete, implementation-specific I/O stack
    /// (a real socket, an in-memory duplex, or whatever an embedder supplies), and
    /// that stack's own errors are free to flow through unconverted. Callers turn the
    /// result into a `TransportError::WriteFailed` before it reaches a registered
    /// callback.
    async fn send_frame(&self, header: Bytes, body: Option<ManagedBuffer>) -> anyhow::Result<()>;

    /// The remote peer's address, used to annotate failures raised on teardown.
    fn remote_address(&self) -> String;

    /// Whether the channel is still open for writes.
    fn is_open(&self) -> bool;

    /// Closes the channel. Idempotent.
    async fn close(&self);
}

/// The reference `Channel` implementation: a `tokio::net::TcpStream` split into an
/// owned read half (driven by [`TcpChannel::spawn_read_loop`]) and a mutex-guarded
/// write half so concurrent senders don't interleave a header with someone else's body.
pub struct TcpChannel {
    writer: AsyncMutex<OwnedWriteHalf>,
    remote_address: String,
    open: AtomicBool,
}

impl TcpChannel {
    pub fn new(writer: OwnedWriteHalf, remote_address: String) -> Self {
        TcpChannel { writer: AsyncMutex::new(writer), remote_address, open: AtomicBool::new(true) }
    }

    /// Splits a connected stream into a `TcpChannel` for the write side and a
    /// `FramedRead` decoder stream for the read side. The caller is expected to drive
    /// the returned stream (typically via [`crate::handler::channel::ChannelHandler::run`]).
    pub fn split(stream: tokio::net::TcpStream) -> (TcpChannel, FramedRead<OwnedReadHalf, FrameCodec>) {
        let remote_address =
            stream.peer_addr().map(|a| a.to_string()).unwrap_or_else(|_| "unknown".to_string());
        let (read_half, write_half) = stream.into_split();
        let channel = TcpChannel::new(write_half, remote_address);
        let reader = FramedRead::new(read_half, FrameCodec);
        (channel, reader)
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn send_frame(&self, header: Bytes, body: Option<ManagedBuffer>) -> anyhow::Result<()> {
        if !self.is_open() {
            if let Some(body) = body {
                body.release();
            }
            return Err(TransportError::write_failed(self.remote_address(), "channel already closed").into());
        }

        let body_bytes = match &body {
            Some(b) => Some(b.as_readable_bytes()?),
            None => None,
        };
        let total_len = 8_i64
            + header.len() as i64
            + body_bytes.as_ref().map(|b| b.len() as i64).unwrap_or(0);

        let result = async {
            let mut writer = self.writer.lock().await;
            writer.write_i64(total_len).await?;
            writer.write_all(&header).await?;
            if let Some(b) = &body_bytes {
                writer.write_all(b).await?;
            }
            writer.flush().await
        }
        .await;

        if let Some(body) = body {
            body.release();
        }

        match result {
            Ok(()) => {
                trace!(remote = %self.remote_address, len = total_len, "frame written");
                Ok(())
            }
            Err(e) => {
                warn!(remote = %self.remote_address, error = %e, "write failed, closing channel");
                self.open.store(false, Ordering::SeqCst);
                Err(TransportError::write_failed(self.remote_address(), e).into())
            }
        }
    }

    fn remote_address(&self) -> String {
        self.remote_address.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// An in-process `Channel` built on a [`tokio::io::DuplexStream`], used by this crate's
/// integration tests to exercise the client/handler pipeline without a real socket.
pub struct DuplexChannel {
    writer: AsyncMutex<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
    remote_address: String,
    open: AtomicBool,
}

impl DuplexChannel {
    pub fn new(
        writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
        remote_address: String,
    ) -> Self {
        DuplexChannel { writer: AsyncMutex::new(writer), remote_address, open: AtomicBool::new(true) }
    }
}

#[async_trait]
impl Channel for DuplexChannel {
    async fn send_frame(&self, header: Bytes, body: Option<ManagedBuffer>) -> anyhow::Result<()> {
        if !self.is_open() {
            if let Some(body) = body {
                body.release();
            }
            return Err(TransportError::write_failed(self.remote_address(), "channel already closed").into());
        }

        let body_bytes = match &body {
            Some(b) => Some(b.as_readable_bytes()?),
            None => None,
        };
        let total_len = 8_i64
            + header.len() as i64
            + body_bytes.as_ref().map(|b| b.len() as i64).unwrap_or(0);

        let result = async {
            let mut writer = self.writer.lock().await;
            writer.write_i64(total_len).await?;
            writer.write_all(&header).await?;
            if let Some(b) = &body_bytes {
                writer.write_all(b).await?;
            }
            writer.flush().await
        }
        .await;

        if let Some(body) = body {
            body.release();
        }

        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                self.open.store(false, Ordering::SeqCst);
                Err(TransportError::write_failed(self.remote_address(), e).into())
            }
        }
    }

    fn remote_address(&self) -> String {
        self.remote_address.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

/// Reads raw bytes into a frame decoder and emits assembled frame payloads. Kept
/// separate from `Channel` so the write side (mutex-guarded, shared) and the read
/// side (single-owner, driven by one task) have distinct lifetimes.
pub struct FrameReader<R> {
    inner: FramedRead<R, FrameCodec>,
}

impl<R: tokio::io::AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        FrameReader { inner: FramedRead::new(reader, FrameCodec) }
    }

    pub async fn next_frame(&mut self) -> Option<Result<Bytes, TransportError>> {
        use futures::StreamExt;
        self.inner.next().await
    }
}
