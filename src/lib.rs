//! wire-transport: a bidirectional, framed, binary RPC transport.
//!
//! On each connection either endpoint may act as both requester and responder.
//! Four request flavors are multiplexed over a single byte pipe:
//!
//! - opaque single-shot RPCs (`send_rpc` / `send_rpc_sync`)
//! - one-way fire-and-forget messages (`send`)
//! - client-initiated chunked stream pulls (`fetch_chunk`, `stream`)
//! - client-to-server uploads (`upload_stream`)
//!
//! ## Main components
//!
//! - [`wire`]: length-prefixed frame codec and the typed message codec.
//! - [`buffer`]: a polymorphic, refcounted byte carrier (`ManagedBuffer`).
//! - [`stream_manager`]: server-side registration and ordered delivery of chunk streams.
//! - [`handler`]: the per-connection response-side and request-side state machines.
//! - [`client`]: the outbound API (`TransportClient`).
//! - [`context`]: pipeline assembly tying a `Channel` to a client/handler pair.
//! - [`rpc_handler`]: the capability traits an embedder implements (`RpcHandler`, `StreamManager`).
//!
//! The concrete network event loop is out of scope: this crate treats the wire as an
//! abstract [`channel::Channel`] that accepts encoded frames and delivers decoded ones.
//! Configuration loading, authentication, and connection pooling are left to the embedder;
//! this crate only defines the [`config::TransportConfig`] values it reads.

pub mod buffer;
pub mod channel;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod request_id;
pub mod rpc_handler;
pub mod stream_manager;
pub mod wire;

pub use buffer::ManagedBuffer;
pub use client::TransportClient;
pub use config::TransportConfig;
pub use context::TransportContext;
pub use error::TransportError;
pub use rpc_handler::{ChunkReceivedCallback, RpcHandler, RpcResponseCallback, StreamCallback};
pub use stream_manager::{OneForOneStreamManager, StreamManager};
pub use wire::message::{Message, RequestMessage, ResponseMessage};
