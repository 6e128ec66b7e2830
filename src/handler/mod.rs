//! The per-connection request/response state machines, plus the glue that routes a
//! decoded [`crate::wire::message::Message`] to whichever one applies.
//!
//! [`response`] tracks every request this connection's [`crate::client::TransportClient`]
//! has outstanding and dispatches inbound [`crate::wire::message::ResponseMessage`]s to
//! the waiting callback. [`request`] is the mirror image: it services inbound
//! [`crate::wire::message::RequestMessage`]s against the embedder's `RpcHandler`. [`channel`]
//! is the thin dispatcher plus idle detector that ties both to a single `Channel`.

pub mod channel;
pub mod request;
pub mod response;

pub use channel::ChannelHandler;
pub use request::RequestHandler;
pub use response::ResponseHandler;
