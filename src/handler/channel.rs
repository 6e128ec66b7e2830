//! Glue: routes each decoded frame to the request or response handler, and detects
//! idle/stalled connections.
//!
//! One [`ChannelHandler`] drives a single connection's dispatch loop for its
//! lifetime. It owns nothing the other side of the connection needs back (see the
//! cyclic-ownership note in the crate's design notes): the [`crate::client::TransportClient`]
//! it hands out as the "reverse client" doesn't hold a reference to this handler.

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::client::TransportClient;
use crate::config::TransportConfig;
use crate::error::{IdleTimeoutKind, TransportError};
use crate::handler::request::RequestHandler;
use crate::handler::response::ResponseHandler;
use crate::rpc_handler::RpcHandler;
use crate::wire::message::Message;

/// Drives one connection: decodes inbound frames off `frame_stream`, dispatches
/// requests and responses, and closes the connection on idle/stall/decode failure.
pub struct ChannelHandler {
    frame_stream: Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>,
    response_handler: Arc<ResponseHandler>,
    request_handler: Arc<RequestHandler>,
    client: Arc<TransportClient>,
    rpc_handler: Arc<dyn RpcHandler>,
    config: TransportConfig,
}

impl ChannelHandler {
    pub fn new(
        frame_stream: impl Stream<Item = Result<Bytes, TransportError>> + Send + 'static,
        response_handler: Arc<ResponseHandler>,
        request_handler: Arc<RequestHandler>,
        client: Arc<TransportClient>,
        rpc_handler: Arc<dyn RpcHandler>,
        config: TransportConfig,
    ) -> Self {
        ChannelHandler {
            frame_stream: Box::pin(frame_stream),
            response_handler,
            request_handler,
            client,
            rpc_handler,
            config,
        }
    }

    /// Drives this connection to completion. Returns once the channel has gone
    /// inactive by any path (peer EOF, decode error, local close, or idle timeout);
    /// by the time it returns, every outstanding callback has been failed exactly
    /// once via `TransportClient::teardown`.
    pub async fn run(mut self) {
        self.rpc_handler.channel_active(&self.client);

        loop {
            let next = tokio::time::timeout(self.config.connection_timeout, self.frame_stream.next()).await;
            match next {
                Ok(Some(Ok(payload))) => {
                    self.response_handler.touch();
                    match Message::decode(payload) {
                        Ok(Message::Request(req)) => {
                            self.request_handler.clone().handle_request(req).await;
                        }
                        Ok(Message::Response(resp)) => self.response_handler.handle_response(resp),
                        Err(e) => {
                            warn!(remote = %self.client.remote_address(), error = %e, "message decode failed, closing channel");
                            self.rpc_handler.exception_caught(&e, &self.client);
                            self.client.clone().teardown(e).await;
                            break;
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    warn!(remote = %self.client.remote_address(), error = %e, "frame decode failed, closing channel");
                    self.rpc_handler.exception_caught(&e, &self.client);
                    self.client.clone().teardown(e).await;
                    break;
                }
                Ok(None) => {
                    debug!(remote = %self.client.remote_address(), "peer closed the connection");
                    let reason =
                        TransportError::write_failed(self.client.remote_address(), "connection closed by peer");
                    self.client.clone().teardown(reason).await;
                    break;
                }
                Err(_elapsed) => {
                    if self.handle_idle_tick().await {
                        break;
                    }
                }
            }
        }
    }

    /// Fired when no frame arrived within `connection_timeout`. Returns `true` if the
    /// connection was closed as a result.
    async fn handle_idle_tick(&self) -> bool {
        if self.response_handler.idle_for() < self.config.connection_timeout {
            // A frame landed right at the timeout boundary; nothing to do yet.
            return false;
        }

        let outstanding = self.response_handler.outstanding_count();
        if outstanding == 0 {
            if !self.config.close_idle_connections {
                return false;
            }
            debug!(remote = %self.client.remote_address(), "closing idle connection with no outstanding requests");
            let reason = TransportError::idle_timeout(self.client.remote_address(), IdleTimeoutKind::Idle);
            self.client.clone().close_with_reason(reason).await;
            true
        } else {
            warn!(
                remote = %self.client.remote_address(),
                outstanding,
                "connection stalled with requests in flight, timing out"
            );
            self.client.mark_timed_out();
            let reason =
                TransportError::idle_timeout(self.client.remote_address(), IdleTimeoutKind::RequestsInFlight);
            self.client.clone().close_with_reason(reason).await;
            true
        }
    }
}
