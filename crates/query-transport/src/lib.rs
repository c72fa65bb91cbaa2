//! Inbound frame transport for Query Engine workers
//!
//! Every worker exposes one TCP port, optionally TLS-wrapped, that peers use
//! to push query-fragment traffic. This crate accepts those connections,
//! splits the byte stream into length-prefixed frames and hands each frame to
//! an injected [`RequestHandler`]. A process-wide [`PooledAllocator`] tracks
//! how much memory connection buffers hold, and the [`MemoryGuardian`] closes
//! the heaviest connections before that memory starves unrelated queries.
//!
//! # Architecture
//!
//! - **FrameCodec**: 4-byte big-endian length prefix, then payload
//! - **ConnectionRegistry**: concurrent map of live connections
//! - **MemoryGuardian**: trip/reset hysteresis, shedding and accept gating
//! - **QueryServer**: accept and I/O event loop groups, TLS, dispatch
//! - **client**: framed outbound connections for remote mailboxes
//!
//! # Example
//!
//! ```no_run
//! use query_transport::{
//!     ConnectionContext, PooledAllocator, QueryServer, RequestHandler, Result, TransportConfig,
//! };
//! use bytes::Bytes;
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl RequestHandler for Echo {
//!     async fn handle(&self, _ctx: &ConnectionContext, frame: Bytes) -> Result<Option<Bytes>> {
//!         Ok(Some(frame))
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let config = TransportConfig::new(8098);
//!     let allocator = PooledAllocator::new(config.allocator.clone());
//!     let mut server = QueryServer::new(config, allocator, Arc::new(Echo))?;
//!     server.start()?;
//!     // ...
//!     server.shutdown()
//! }
//! ```

pub mod backend;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod guardian;
pub mod handler;
pub mod memory;
pub mod registry;
pub mod server;
pub mod tls;

// Re-exports
pub use backend::IoBackend;
pub use client::{connect, BoxedStream, ConnectOptions, FrameConnection};
pub use codec::{FrameCodec, DEFAULT_MAX_FRAME_LENGTH, LENGTH_FIELD_SIZE};
pub use config::TransportConfig;
pub use error::{Result, TransportError};
pub use guardian::{AcceptGate, GuardianAction, GuardianConfig, GuardianStats, MemoryGuardian};
pub use handler::{ConnectionContext, RequestHandler};
pub use memory::{
    AccountUsage, AllocatorConfig, AllocatorMetrics, BufferAccount, MemoryKind, PooledAllocator,
};
pub use registry::{ConnectionId, ConnectionRecord, ConnectionRegistry, Registration};
pub use server::QueryServer;
pub use tls::{TlsClientConfig, TlsConfig};
