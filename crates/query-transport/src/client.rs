//! Framed client connections to a remote query server

use crate::codec::{FrameCodec, DEFAULT_MAX_FRAME_LENGTH};
use crate::error::{Result, TransportError};
use crate::tls::TlsClientConfig;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

/// Byte stream a client connection runs over, plain or TLS
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Boxed client stream
pub type BoxedStream = Box<dyn AsyncStream>;

/// Client connection speaking length-prefixed frames
pub type FrameConnection = Framed<BoxedStream, FrameCodec>;

/// Options for outbound connections
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Bound on TCP connect and TLS handshake, each
    pub connect_timeout: Duration,
    /// Largest frame accepted from the server
    pub max_frame_length: usize,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
    /// TLS settings; plain TCP when absent
    pub tls: Option<TlsClientConfig>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            tcp_nodelay: true,
            tls: None,
        }
    }
}

impl ConnectOptions {
    /// Connect over TLS
    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Set the maximum frame length
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }
}

/// Open a framed connection to `addr`
pub async fn connect(addr: SocketAddr, options: &ConnectOptions) -> Result<FrameConnection> {
    let stream = timeout(options.connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| TransportError::Timeout(options.connect_timeout))??;
    stream.set_nodelay(options.tcp_nodelay)?;

    let stream: BoxedStream = match &options.tls {
        Some(tls) => {
            let connector = tls.create_connector()?;
            let server_name = tls.server_name()?;
            let tls_stream = timeout(options.connect_timeout, connector.connect(server_name, stream))
                .await
                .map_err(|_| TransportError::Timeout(options.connect_timeout))?
                .map_err(|e| {
                    TransportError::Tls(format!("handshake with {} failed: {}", addr, e))
                })?;
            debug!("Connected to {} over TLS", addr);
            Box::new(tls_stream)
        }
        None => {
            debug!("Connected to {}", addr);
            Box::new(stream)
        }
    };

    let codec = FrameCodec::new().with_max_frame_length(options.max_frame_length);
    Ok(Framed::new(stream, codec))
}
