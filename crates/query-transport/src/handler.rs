//! Request handler seam between the transport and the rest of the worker

use crate::error::Result;
use crate::registry::ConnectionId;
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;

/// Identity of the connection a frame arrived on
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    /// Connection ID
    pub id: ConnectionId,
    /// Remote address
    pub peer_addr: SocketAddr,
    /// Whether the connection is TLS-wrapped
    pub tls: bool,
}

/// Receives fully decoded frames from the query server
///
/// Frames from one connection are handed over one at a time, in arrival
/// order; the next frame is not read until `handle` returns. Implementations
/// must not block the event loop.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle one frame, optionally replying with a frame on the same connection
    ///
    /// Returning an error closes the connection.
    async fn handle(&self, ctx: &ConnectionContext, frame: Bytes) -> Result<Option<Bytes>>;
}
