//! Error types for the query transport

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while accepting, framing or serving connections
#[derive(Error, Debug)]
pub enum TransportError {
    /// Listening socket could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Socket or stream I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS material or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Frame length field exceeds the configured maximum
    #[error("Frame of {size} bytes exceeds maximum frame length {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Pooled memory limit reached, the connection is shed
    #[error("Pooled memory exhausted: requested {requested} bytes with {used} in use (limit {limit})")]
    ResourceExhausted {
        requested: usize,
        used: usize,
        limit: usize,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Event loop construction or teardown failure
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// The injected request handler rejected a frame
    #[error("Handler error: {0}")]
    Handler(String),

    /// Operation requires a started server
    #[error("Server is not started")]
    NotStarted,

    /// Server was already started
    #[error("Server is already started")]
    AlreadyStarted,

    /// Bounded wait expired
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// Whether the error came from the memory guardian refusing an allocation
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, TransportError::ResourceExhausted { .. })
    }
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;
