//! Process-wide pooled buffer accounting
//!
//! Network buffers are not allocated through a custom allocator; instead every
//! connection owns a [`BufferAccount`] that reports how many bytes its read
//! and write buffers currently hold. The shared [`PooledAllocator`] sums those
//! reports so the memory guardian can see the pressure created by all
//! concurrent queries in one worker.
//!
//! The allocator is created once at process start and handed to the server
//! and guardian explicitly; it is never reset.

use crate::error::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Pool a buffer is charged against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Socket-facing buffers (codec read and write buffers)
    Direct,
    /// Decoded frames waiting for the request handler
    Heap,
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryKind::Direct => write!(f, "direct"),
            MemoryKind::Heap => write!(f, "heap"),
        }
    }
}

/// Shape of the pool, reported through the gauges
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Number of direct arenas
    pub num_direct_arenas: usize,
    /// Number of heap arenas
    pub num_heap_arenas: usize,
    /// Chunk size in bytes; committed memory is rounded up to whole chunks
    pub chunk_size: usize,
    /// Cache size for small size classes
    pub small_cache_size: usize,
    /// Cache size for normal size classes
    pub normal_cache_size: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            num_direct_arenas: cores * 2,
            num_heap_arenas: cores * 2,
            chunk_size: 4 * 1024 * 1024, // 4 MB
            small_cache_size: 256,
            normal_cache_size: 64,
        }
    }
}

/// Read-only snapshot of the allocator gauges
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorMetrics {
    pub used_direct_memory: usize,
    pub used_heap_memory: usize,
    pub committed_direct_memory: usize,
    pub committed_heap_memory: usize,
    pub peak_direct_memory: usize,
    pub peak_heap_memory: usize,
    pub num_direct_arenas: usize,
    pub num_heap_arenas: usize,
    pub small_cache_size: usize,
    pub normal_cache_size: usize,
    pub active_accounts: usize,
    pub chunk_size: usize,
}

/// Shared usage counters for all connection buffers in the process
#[derive(Debug)]
pub struct PooledAllocator {
    config: AllocatorConfig,
    used_direct: AtomicUsize,
    used_heap: AtomicUsize,
    peak_direct: AtomicUsize,
    peak_heap: AtomicUsize,
    active_accounts: AtomicUsize,
}

impl PooledAllocator {
    /// Create a new allocator handle
    pub fn new(config: AllocatorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            used_direct: AtomicUsize::new(0),
            used_heap: AtomicUsize::new(0),
            peak_direct: AtomicUsize::new(0),
            peak_heap: AtomicUsize::new(0),
            active_accounts: AtomicUsize::new(0),
        })
    }

    /// Create with default configuration
    pub fn with_defaults() -> Arc<Self> {
        Self::new(AllocatorConfig::default())
    }

    /// Get allocator configuration
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Bytes currently charged to the given pool
    pub fn used(&self, kind: MemoryKind) -> usize {
        self.counter(kind).load(Ordering::Acquire)
    }

    /// Bytes currently charged to both pools
    pub fn used_total(&self) -> usize {
        self.used(MemoryKind::Direct) + self.used(MemoryKind::Heap)
    }

    /// Used bytes rounded up to whole chunks
    pub fn committed(&self, kind: MemoryKind) -> usize {
        let chunk = self.config.chunk_size.max(1);
        self.used(kind).div_ceil(chunk) * chunk
    }

    /// Number of live accounts
    pub fn active_accounts(&self) -> usize {
        self.active_accounts.load(Ordering::Relaxed)
    }

    /// Open a new account, optionally refusing growth past `limit` total bytes
    pub fn account(self: &Arc<Self>, limit: Option<usize>) -> BufferAccount {
        self.active_accounts.fetch_add(1, Ordering::Relaxed);
        BufferAccount {
            allocator: Arc::clone(self),
            usage: AccountUsage::default(),
            limit,
        }
    }

    /// Snapshot all gauges
    pub fn metrics(&self) -> AllocatorMetrics {
        AllocatorMetrics {
            used_direct_memory: self.used(MemoryKind::Direct),
            used_heap_memory: self.used(MemoryKind::Heap),
            committed_direct_memory: self.committed(MemoryKind::Direct),
            committed_heap_memory: self.committed(MemoryKind::Heap),
            peak_direct_memory: self.peak_direct.load(Ordering::Relaxed),
            peak_heap_memory: self.peak_heap.load(Ordering::Relaxed),
            num_direct_arenas: self.config.num_direct_arenas,
            num_heap_arenas: self.config.num_heap_arenas,
            small_cache_size: self.config.small_cache_size,
            normal_cache_size: self.config.normal_cache_size,
            active_accounts: self.active_accounts(),
            chunk_size: self.config.chunk_size,
        }
    }

    fn counter(&self, kind: MemoryKind) -> &AtomicUsize {
        match kind {
            MemoryKind::Direct => &self.used_direct,
            MemoryKind::Heap => &self.used_heap,
        }
    }

    fn charge(&self, kind: MemoryKind, bytes: usize) {
        let now = self.counter(kind).fetch_add(bytes, Ordering::AcqRel) + bytes;
        let peak = match kind {
            MemoryKind::Direct => &self.peak_direct,
            MemoryKind::Heap => &self.peak_heap,
        };
        peak.fetch_max(now, Ordering::Relaxed);
    }

    fn refund(&self, kind: MemoryKind, bytes: usize) {
        // Readers must never observe a wrapped value
        let _ = self
            .counter(kind)
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(bytes))
            });
    }
}

/// Per-account byte counters, shared with the connection registry
#[derive(Debug, Clone, Default)]
pub struct AccountUsage {
    direct: Arc<AtomicUsize>,
    heap: Arc<AtomicUsize>,
}

impl AccountUsage {
    /// Bytes held in the given pool
    pub fn get(&self, kind: MemoryKind) -> usize {
        match kind {
            MemoryKind::Direct => self.direct.load(Ordering::Acquire),
            MemoryKind::Heap => self.heap.load(Ordering::Acquire),
        }
    }

    /// Bytes held in both pools
    pub fn total(&self) -> usize {
        self.get(MemoryKind::Direct) + self.get(MemoryKind::Heap)
    }

    fn slot(&self, kind: MemoryKind) -> &AtomicUsize {
        match kind {
            MemoryKind::Direct => &self.direct,
            MemoryKind::Heap => &self.heap,
        }
    }
}

/// One connection's charge against the [`PooledAllocator`]
///
/// Dropping the account refunds everything it still holds.
#[derive(Debug)]
pub struct BufferAccount {
    allocator: Arc<PooledAllocator>,
    usage: AccountUsage,
    limit: Option<usize>,
}

impl BufferAccount {
    /// Shared view of this account's counters
    pub fn usage(&self) -> AccountUsage {
        self.usage.clone()
    }

    /// Bytes currently held in the given pool
    pub fn held(&self, kind: MemoryKind) -> usize {
        self.usage.get(kind)
    }

    /// Set the number of bytes held in `kind` to `bytes`
    ///
    /// Growing fails with [`TransportError::ResourceExhausted`] when the
    /// process-wide total would pass the account's limit; the held amount is
    /// left unchanged in that case.
    pub fn track(&self, kind: MemoryKind, bytes: usize) -> Result<()> {
        let held = self.usage.get(kind);
        if bytes > held {
            self.grow(kind, bytes - held)
        } else {
            self.shrink(kind, held - bytes);
            Ok(())
        }
    }

    /// Charge `bytes` more to `kind`
    pub fn grow(&self, kind: MemoryKind, bytes: usize) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        if let Some(limit) = self.limit {
            let used = self.allocator.used_total();
            if used.saturating_add(bytes) > limit {
                return Err(TransportError::ResourceExhausted {
                    requested: bytes,
                    used,
                    limit,
                });
            }
        }
        self.usage.slot(kind).fetch_add(bytes, Ordering::AcqRel);
        self.allocator.charge(kind, bytes);
        Ok(())
    }

    /// Refund up to `bytes` from `kind`
    pub fn shrink(&self, kind: MemoryKind, bytes: usize) {
        let slot = self.usage.slot(kind);
        let prev = slot
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(bytes))
            })
            .unwrap_or(0);
        let refunded = prev.min(bytes);
        if refunded > 0 {
            self.allocator.refund(kind, refunded);
        }
    }
}

impl Drop for BufferAccount {
    fn drop(&mut self) {
        for kind in [MemoryKind::Direct, MemoryKind::Heap] {
            let held = self.usage.slot(kind).swap(0, Ordering::AcqRel);
            if held > 0 {
                self.allocator.refund(kind, held);
            }
        }
        self.allocator.active_accounts.fetch_sub(1, Ordering::Relaxed);
    }
}
