//! Event-loop backend negotiation
//!
//! The reactor behind every runtime is the poller of the host OS. Selecting a
//! backend only decides which flavour is reported and how event-loop threads
//! are named; it never changes what the server does.

use std::fmt;
use tokio::runtime::{Builder, Runtime};

use crate::error::{Result, TransportError};

/// I/O backend driving the server's event loops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoBackend {
    /// Linux epoll
    Epoll,
    /// BSD / Darwin kqueue
    Kqueue,
    /// Portable fallback
    Portable,
}

impl IoBackend {
    /// Native backend of the host OS, if it has one
    pub fn native() -> Option<Self> {
        if cfg!(any(target_os = "linux", target_os = "android")) {
            Some(IoBackend::Epoll)
        } else if cfg!(any(
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd",
            target_os = "dragonfly"
        )) {
            Some(IoBackend::Kqueue)
        } else {
            None
        }
    }

    /// Pick the most efficient backend allowed by configuration
    pub fn negotiate(native_enabled: bool) -> Self {
        let backend = match (native_enabled, Self::native()) {
            (true, Some(native)) => native,
            _ => IoBackend::Portable,
        };

        if backend == IoBackend::Portable {
            let reason = if !native_enabled {
                "native transports disabled"
            } else {
                "no native backend for this platform"
            };
            tracing::info!("Using portable event loop, {}", reason);
        } else {
            tracing::info!("Using {} event loop", backend);
        }
        backend
    }

    /// Whether this is an OS-native backend
    pub fn is_native(&self) -> bool {
        !matches!(self, IoBackend::Portable)
    }

    /// Short lowercase name
    pub fn name(&self) -> &'static str {
        match self {
            IoBackend::Epoll => "epoll",
            IoBackend::Kqueue => "kqueue",
            IoBackend::Portable => "portable",
        }
    }

    /// Build a multi-threaded event loop group on this backend
    pub fn event_loop_group(&self, role: &str, threads: usize) -> Result<Runtime> {
        Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name(format!("query-server-{}-{}", self.name(), role))
            .enable_all()
            .build()
            .map_err(|e| {
                TransportError::Runtime(format!("failed to build {} event loop: {}", role, e))
            })
    }
}

impl fmt::Display for IoBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
