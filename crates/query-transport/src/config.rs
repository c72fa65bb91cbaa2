//! Query server configuration

use crate::codec::DEFAULT_MAX_FRAME_LENGTH;
use crate::error::{Result, TransportError};
use crate::guardian::GuardianConfig;
use crate::memory::AllocatorConfig;
use crate::tls::TlsConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration for the query server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address to bind
    pub host: String,
    /// Port to bind, 0 for an ephemeral port
    pub port: u16,
    /// Use the OS-native event loop when available
    pub native_transport_enabled: bool,
    /// TLS material; plain TCP when absent
    pub tls: Option<TlsConfig>,
    /// Threads in the accept group
    pub accept_threads: usize,
    /// Threads in the I/O group
    pub io_threads: usize,
    /// Listen backlog
    pub accept_backlog: u32,
    /// Enable SO_KEEPALIVE on accepted sockets
    pub tcp_keepalive: bool,
    /// Enable TCP_NODELAY on accepted sockets
    pub tcp_nodelay: bool,
    /// Largest accepted frame payload in bytes
    pub max_frame_length: usize,
    /// TLS handshake timeout in milliseconds
    pub handshake_timeout_ms: u64,
    /// Grace period for event loops at shutdown in milliseconds, 0 = immediate
    pub shutdown_grace_ms: u64,
    /// Pooled allocator layout
    pub allocator: AllocatorConfig,
    /// Memory guardian thresholds
    pub guardian: GuardianConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            host: "0.0.0.0".to_string(),
            port: 8098,
            native_transport_enabled: true,
            tls: None,
            accept_threads: 1,
            io_threads: cores * 2,
            accept_backlog: 128,
            tcp_keepalive: true,
            tcp_nodelay: true,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            handshake_timeout_ms: 10_000,
            shutdown_grace_ms: 0,
            allocator: AllocatorConfig::default(),
            guardian: GuardianConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Create a configuration listening on the given port
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TransportConfig = serde_json::from_str(&contents)
            .map_err(|e| TransportError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the bind host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Enable TLS
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Enable or disable native event loops
    pub fn with_native_transport(mut self, enabled: bool) -> Self {
        self.native_transport_enabled = enabled;
        self
    }

    /// Set the I/O group size
    pub fn with_io_threads(mut self, threads: usize) -> Self {
        self.io_threads = threads;
        self
    }

    /// Set the maximum frame length
    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    /// Set the memory guardian thresholds
    pub fn with_guardian(mut self, guardian: GuardianConfig) -> Self {
        self.guardian = guardian;
        self
    }

    /// Set the shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    /// `host:port` to bind
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// TLS handshake timeout
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Event loop grace period at shutdown
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Reject unusable settings
    pub fn validate(&self) -> Result<()> {
        if self.accept_threads == 0 || self.io_threads == 0 {
            return Err(TransportError::Config(
                "accept and io thread counts must be positive".to_string(),
            ));
        }
        if self.accept_backlog == 0 {
            return Err(TransportError::Config(
                "accept backlog must be positive".to_string(),
            ));
        }
        if self.max_frame_length == 0 {
            return Err(TransportError::Config(
                "max frame length must be positive".to_string(),
            ));
        }
        self.guardian.validate()
    }
}
