//! The error taxonomy for the transport, as laid out in the error handling design.
//!
//! Each variant corresponds to exactly one of the failure modes a connection can hit:
//! framing/decode errors are fatal to the channel, while remote failures, timeouts and
//! authorization failures are scoped to a single in-flight request. Functions that sit
//! at the boundary with the abstract [`crate::channel::Channel`] collaborator keep returning
//! `anyhow::Result`, matching how the rest of the async I/O stack this crate is built
//! against is typed; this enum is what those errors get turned into before they reach
//! a registered callback.

use std::fmt;

/// A remote address, used to annotate failures that originate from channel teardown.
pub type RemoteAddress = String;

#[derive(thiserror::Error, Debug, Clone)]
pub enum TransportError {
    /// The frame length prefix was negative or exceeded the configured maximum.
    #[error("framing error: {0}")]
    Framing(String),

    /// An unknown message type code, or a frame that was truncated mid-header.
    #[error("decode error: {0}")]
    Decode(String),

    /// The remote side reported an `RpcFailure` for this request.
    #[error("remote rpc failure: {0}")]
    RemoteRpc(String),

    /// The remote side reported a `ChunkFetchFailure` for this chunk.
    #[error("remote chunk failure: {0}")]
    RemoteChunk(String),

    /// The remote side reported a `StreamFailure` for this stream.
    #[error("remote stream failure: {0}")]
    RemoteStream(String),

    /// The outbound write failed; the channel has been closed.
    #[error("write to {remote} failed: {reason}")]
    WriteFailed { remote: RemoteAddress, reason: String },

    /// `send_rpc_sync` exceeded its deadline. The callback remains registered; a late
    /// response is logged and discarded.
    #[error("rpc timed out waiting for response")]
    SyncTimeout,

    /// The channel was closed by the idle detector. `in_flight` distinguishes an idle
    /// close (no outstanding requests) from a stalled-connection timeout.
    #[error("channel to {remote} timed out ({kind})")]
    IdleTimeout { remote: RemoteAddress, kind: IdleTimeoutKind },

    /// A stream fetch was rejected by `check_authorization` before any bytes were served.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A `get_chunk` call violated strict in-order consumption, or ran past the end
    /// of the stream's buffer sequence.
    #[error("stream ordering violation: {0}")]
    OutOfOrder(String),

    /// The user-supplied `RpcHandler` returned an error (or panicked) while servicing
    /// a request. Surfaced to the caller as an `RpcFailure` carrying this message.
    #[error("handler error: {0}")]
    Handler(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleTimeoutKind {
    /// No requests were outstanding; the connection was simply idle.
    Idle,
    /// Requests were outstanding when the idle threshold was exceeded.
    RequestsInFlight,
}

impl fmt::Display for IdleTimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdleTimeoutKind::Idle => write!(f, "idle close"),
            IdleTimeoutKind::RequestsInFlight => write!(f, "requests in flight"),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Decode(err.to_string())
    }
}

impl TransportError {
    pub fn write_failed(remote: impl Into<RemoteAddress>, reason: impl fmt::Display) -> Self {
        TransportError::WriteFailed { remote: remote.into(), reason: reason.to_string() }
    }

    pub fn idle_timeout(remote: impl Into<RemoteAddress>, kind: IdleTimeoutKind) -> Self {
        TransportError::IdleTimeout { remote: remote.into(), kind }
    }
}
