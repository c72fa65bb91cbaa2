//! Registry of live inbound connections
//!
//! Connections are inserted when accepted and removed when their
//! [`Registration`] is dropped, whatever way the connection task exits.
//! Identifiers are generated from a counter and never reused.

use crate::memory::AccountUsage;
use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Unique identifier for an accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Bookkeeping for one live connection
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    /// Connection ID
    pub id: ConnectionId,
    /// Remote address
    pub peer_addr: SocketAddr,
    /// Accept time
    pub accepted_at: Instant,
    /// Whether the connection is TLS-wrapped
    pub tls: bool,
    usage: AccountUsage,
    close: CancellationToken,
}

impl ConnectionRecord {
    /// Bytes this connection holds in pooled buffers
    pub fn buffered_bytes(&self) -> usize {
        self.usage.total()
    }

    /// Time since the connection was accepted
    pub fn age(&self) -> Duration {
        self.accepted_at.elapsed()
    }

    /// Ask the connection task to drop the socket immediately
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Whether a close was requested
    pub fn is_closing(&self) -> bool {
        self.close.is_cancelled()
    }
}

/// Concurrent map of live connections
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ConnectionRecord>,
    next_id: AtomicU64,
    total_accepted: AtomicU64,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a newly accepted connection
    pub fn register(
        self: &Arc<Self>,
        peer_addr: SocketAddr,
        usage: AccountUsage,
        tls: bool,
    ) -> Registration {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let close = CancellationToken::new();

        self.connections.insert(
            id,
            ConnectionRecord {
                id,
                peer_addr,
                accepted_at: Instant::now(),
                tls,
                usage,
                close: close.clone(),
            },
        );
        self.total_accepted.fetch_add(1, Ordering::Relaxed);

        tracing::trace!("Registered connection {} from {}", id, peer_addr);
        Registration {
            registry: Arc::clone(self),
            id,
            close,
        }
    }

    /// Get a connection record
    pub fn get(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.connections.get(&id).map(|r| r.clone())
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is live
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connections accepted since creation
    pub fn total_accepted(&self) -> u64 {
        self.total_accepted.load(Ordering::Relaxed)
    }

    /// Copy of every live record
    pub fn snapshot(&self) -> Vec<ConnectionRecord> {
        self.connections.iter().map(|r| r.clone()).collect()
    }

    /// Live records ordered by buffered bytes, largest first
    pub fn by_buffered_bytes(&self) -> Vec<ConnectionRecord> {
        let mut records = self.snapshot();
        records.sort_by(|a, b| {
            b.buffered_bytes()
                .cmp(&a.buffered_bytes())
                .then(a.id.cmp(&b.id))
        });
        records
    }

    /// Request close of every live connection, returning how many were signalled
    pub fn close_all(&self) -> usize {
        let mut closed = 0;
        for record in self.snapshot() {
            if !record.is_closing() {
                record.close();
                closed += 1;
            }
        }
        closed
    }

    fn deregister(&self, id: ConnectionId) {
        if self.connections.remove(&id).is_some() {
            tracing::trace!("Deregistered connection {}", id);
        }
    }
}

/// Ownership of one registry entry; dropping it deregisters the connection
#[derive(Debug)]
pub struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
    close: CancellationToken,
}

impl Registration {
    /// Get connection ID
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Token cancelled when the connection must close
    pub fn close_token(&self) -> &CancellationToken {
        &self.close
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryKind, PooledAllocator};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_register_and_drop() {
        let registry = ConnectionRegistry::new();
        let reg = registry.register(addr(1000), AccountUsage::default(), false);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(reg.id()).unwrap().peer_addr, addr(1000));

        drop(reg);
        assert!(registry.is_empty());
        assert_eq!(registry.total_accepted(), 1);
    }

    #[test]
    fn test_ids_never_reused() {
        let registry = ConnectionRegistry::new();
        let first = registry.register(addr(1), AccountUsage::default(), false);
        let first_id = first.id();
        drop(first);

        let second = registry.register(addr(1), AccountUsage::default(), false);
        assert_ne!(first_id, second.id());
    }

    #[test]
    fn test_order_by_buffered_bytes() {
        let allocator = PooledAllocator::with_defaults();
        let registry = ConnectionRegistry::new();

        let small = allocator.account(None);
        let large = allocator.account(None);
        small.grow(MemoryKind::Direct, 10).unwrap();
        large.grow(MemoryKind::Heap, 500).unwrap();

        let small_reg = registry.register(addr(1), small.usage(), false);
        let large_reg = registry.register(addr(2), large.usage(), true);

        let ordered = registry.by_buffered_bytes();
        assert_eq!(ordered[0].id, large_reg.id());
        assert_eq!(ordered[1].id, small_reg.id());
        assert!(ordered[0].tls);
    }

    #[test]
    fn test_close_all_signals_tokens() {
        let registry = ConnectionRegistry::new();
        let a = registry.register(addr(1), AccountUsage::default(), false);
        let b = registry.register(addr(2), AccountUsage::default(), false);

        assert_eq!(registry.close_all(), 2);
        assert!(a.close_token().is_cancelled());
        assert!(b.close_token().is_cancelled());

        // Already closing connections are not counted twice
        assert_eq!(registry.close_all(), 0);
    }

    #[test]
    fn test_concurrent_register_and_iterate() {
        let registry = ConnectionRegistry::new();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let reg =
                            registry.register(addr(t * 1000 + i), AccountUsage::default(), false);
                        let _ = registry.snapshot();
                        drop(reg);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
        assert_eq!(registry.total_accepted(), 800);
    }
}
