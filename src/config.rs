//! Transport configuration.
//!
//! Loading these values from a file or environment is out of scope for this crate;
//! the embedder constructs a `TransportConfig` directly.

use std::time::Duration;

/// Tunables read by the [`crate::handler::channel::ChannelHandler`] idle detector and the
/// request handler's chunk-send throttle.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    /// How long a connection may sit idle before the channel handler acts on it.
    pub connection_timeout: Duration,

    /// Per-channel cap on chunks concurrently being transferred. Exceeding it closes
    /// the channel once the current write completes.
    pub max_chunks_being_transferred: usize,

    /// Whether idle connections with zero outstanding requests should be closed.
    pub close_idle_connections: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            connection_timeout: Duration::from_secs(120),
            max_chunks_being_transferred: 256,
            close_idle_connections: true,
        }
    }
}
