//! Memory guardian for pooled network buffers
//!
//! The buffer pool is shared by every query running in the worker. The
//! guardian watches the pool and, once usage crosses the trip level, closes
//! the connections holding the most buffered data. It does not trip again
//! until usage has dropped below the reset level. If shedding every
//! connection still cannot bring usage down, the accept gate is closed until
//! usage recedes.
//!
//! Independently of the periodic check, every connection account carries the
//! hard limit: a connection whose buffer growth would pass it fails
//! immediately instead of allocating.

use crate::error::{Result, TransportError};
use crate::memory::{BufferAccount, PooledAllocator};
use crate::registry::{ConnectionId, ConnectionRegistry};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Thresholds for the memory guardian
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardianConfig {
    /// Whether shedding and hard limits are active
    pub enabled: bool,
    /// Usage above which connections are shed
    pub trip_bytes: usize,
    /// Usage below which the guardian re-arms
    pub reset_bytes: usize,
    /// Usage past which a single buffer growth is refused
    pub hard_limit_bytes: Option<usize>,
    /// Interval between periodic checks in milliseconds
    pub check_interval_ms: u64,
    /// Stop accepting while shedding cannot relieve pressure
    pub pause_accept_on_overload: bool,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trip_bytes: 512 * 1024 * 1024,              // 512 MB
            reset_bytes: 384 * 1024 * 1024,             // 384 MB
            hard_limit_bytes: Some(1024 * 1024 * 1024), // 1 GB
            check_interval_ms: 100,
            pause_accept_on_overload: true,
        }
    }
}

impl GuardianConfig {
    /// Create a configuration with the given trip and reset levels
    pub fn new(trip_bytes: usize, reset_bytes: usize) -> Self {
        Self {
            trip_bytes,
            reset_bytes,
            hard_limit_bytes: None,
            ..Default::default()
        }
    }

    /// Create a disabled configuration
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Set the hard limit
    pub fn with_hard_limit(mut self, hard_limit_bytes: usize) -> Self {
        self.hard_limit_bytes = Some(hard_limit_bytes);
        self
    }

    /// Set the check interval
    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Enable or disable accept pausing
    pub fn with_pause_accept(mut self, pause: bool) -> Self {
        self.pause_accept_on_overload = pause;
        self
    }

    /// Interval between periodic checks
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.max(1))
    }

    /// Reject inconsistent thresholds
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.trip_bytes == 0 {
            return Err(TransportError::Config(
                "guardian trip level must be positive".to_string(),
            ));
        }
        if self.reset_bytes > self.trip_bytes {
            return Err(TransportError::Config(format!(
                "guardian reset level {} exceeds trip level {}",
                self.reset_bytes, self.trip_bytes
            )));
        }
        if let Some(hard) = self.hard_limit_bytes {
            if hard < self.trip_bytes {
                return Err(TransportError::Config(format!(
                    "guardian hard limit {} is below trip level {}",
                    hard, self.trip_bytes
                )));
            }
        }
        Ok(())
    }
}

/// Gate the accept loop waits on while the guardian is overloaded
#[derive(Debug, Default)]
pub struct AcceptGate {
    paused: AtomicBool,
    notify: Notify,
}

impl AcceptGate {
    /// Create an open gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop new accepts
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    /// Allow accepts again
    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Whether accepts are paused
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Wait until the gate is open
    pub async fn wait_open(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.is_paused() {
                return;
            }
            notified.await;
        }
    }
}

/// Outcome of one guardian check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardianAction {
    /// Usage under the trip level
    Idle,
    /// Usage crossed the trip level; connections were shed
    Tripped {
        shed: Vec<ConnectionId>,
        accept_paused: bool,
    },
    /// Still tripped, waiting for usage to fall below the reset level
    Holding,
    /// Usage fell below the reset level; the guardian re-armed
    Reset,
}

/// Counters kept by the guardian
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GuardianStats {
    pub trips: u64,
    pub resets: u64,
    pub connections_shed: u64,
}

/// Watches pooled memory and sheds connections under pressure
#[derive(Debug)]
pub struct MemoryGuardian {
    config: GuardianConfig,
    allocator: Arc<PooledAllocator>,
    registry: Arc<ConnectionRegistry>,
    gate: Arc<AcceptGate>,
    tripped: Mutex<bool>,
    trips: AtomicU64,
    resets: AtomicU64,
    connections_shed: AtomicU64,
}

impl MemoryGuardian {
    /// Create a guardian over the given allocator and registry
    pub fn new(
        config: GuardianConfig,
        allocator: Arc<PooledAllocator>,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            allocator,
            registry,
            gate: Arc::new(AcceptGate::new()),
            tripped: Mutex::new(false),
            trips: AtomicU64::new(0),
            resets: AtomicU64::new(0),
            connections_shed: AtomicU64::new(0),
        }))
    }

    /// Get guardian configuration
    pub fn config(&self) -> &GuardianConfig {
        &self.config
    }

    /// Get the allocator being watched
    pub fn allocator(&self) -> &Arc<PooledAllocator> {
        &self.allocator
    }

    /// Get the accept gate
    pub fn gate(&self) -> Arc<AcceptGate> {
        Arc::clone(&self.gate)
    }

    /// Whether the guardian is currently tripped
    pub fn is_tripped(&self) -> bool {
        *self.tripped.lock()
    }

    /// Open a buffer account for a new connection, carrying the hard limit
    pub fn account(&self) -> BufferAccount {
        let limit = if self.config.enabled {
            self.config.hard_limit_bytes
        } else {
            None
        };
        self.allocator.account(limit)
    }

    /// Get guardian counters
    pub fn stats(&self) -> GuardianStats {
        GuardianStats {
            trips: self.trips.load(Ordering::Relaxed),
            resets: self.resets.load(Ordering::Relaxed),
            connections_shed: self.connections_shed.load(Ordering::Relaxed),
        }
    }

    /// Observe usage once and act on it
    pub fn check(&self) -> GuardianAction {
        if !self.config.enabled {
            return GuardianAction::Idle;
        }

        let used = self.allocator.used_total();
        let mut tripped = self.tripped.lock();

        if *tripped {
            if used < self.config.reset_bytes {
                *tripped = false;
                self.resets.fetch_add(1, Ordering::Relaxed);
                self.gate.resume();
                info!(
                    "Pooled memory back to {} bytes (reset level {}), guardian re-armed",
                    used, self.config.reset_bytes
                );
                return GuardianAction::Reset;
            }
            return GuardianAction::Holding;
        }

        if used <= self.config.trip_bytes {
            return GuardianAction::Idle;
        }

        *tripped = true;
        self.trips.fetch_add(1, Ordering::Relaxed);
        warn!(
            "Pooled memory at {} bytes exceeds trip level {}, shedding connections",
            used, self.config.trip_bytes
        );

        let mut projected = used;
        let mut shed = Vec::new();
        for record in self.registry.by_buffered_bytes() {
            if projected <= self.config.reset_bytes && !shed.is_empty() {
                break;
            }
            projected = projected.saturating_sub(record.buffered_bytes());
            if record.is_closing() {
                continue;
            }
            warn!(
                "Closing connection {} from {} holding {} bytes",
                record.id,
                record.peer_addr,
                record.buffered_bytes()
            );
            record.close();
            shed.push(record.id);
        }
        self.connections_shed
            .fetch_add(shed.len() as u64, Ordering::Relaxed);

        let accept_paused =
            projected > self.config.reset_bytes && self.config.pause_accept_on_overload;
        if accept_paused {
            warn!(
                "Shedding cannot relieve pressure ({} bytes projected), pausing accepts",
                projected
            );
            self.gate.pause();
        }

        GuardianAction::Tripped {
            shed,
            accept_paused,
        }
    }

    /// Check periodically until `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.config.enabled {
            debug!("Memory guardian disabled");
            return;
        }

        let mut interval = tokio::time::interval(self.config.check_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.check();
                }
            }
        }

        // Never leave the accept loop parked after shutdown
        self.gate.resume();
        debug!("Memory guardian stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKind;
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn setup(
        trip: usize,
        reset: usize,
    ) -> (
        Arc<PooledAllocator>,
        Arc<ConnectionRegistry>,
        Arc<MemoryGuardian>,
    ) {
        let allocator = PooledAllocator::with_defaults();
        let registry = ConnectionRegistry::new();
        let guardian = MemoryGuardian::new(
            GuardianConfig::new(trip, reset),
            Arc::clone(&allocator),
            Arc::clone(&registry),
        )
        .unwrap();
        (allocator, registry, guardian)
    }

    #[test]
    fn test_config_validation() {
        assert!(GuardianConfig::default().validate().is_ok());
        assert!(GuardianConfig::new(100, 200).validate().is_err());
        assert!(GuardianConfig::new(0, 0).validate().is_err());
        assert!(GuardianConfig::new(100, 50)
            .with_hard_limit(10)
            .validate()
            .is_err());
        assert!(GuardianConfig::new(0, 10).with_pause_accept(false).validate().is_err());

        let mut disabled = GuardianConfig::disabled();
        disabled.trip_bytes = 0;
        assert!(disabled.validate().is_ok());
    }

    #[test]
    fn test_idle_under_trip_level() {
        let (allocator, registry, guardian) = setup(1000, 500);
        let account = allocator.account(None);
        account.grow(MemoryKind::Direct, 1000).unwrap();
        let reg = registry.register(addr(1), account.usage(), false);

        assert_eq!(guardian.check(), GuardianAction::Idle);
        assert!(!reg.close_token().is_cancelled());
    }

    #[test]
    fn test_sheds_largest_connection_first() {
        let (allocator, registry, guardian) = setup(1000, 800);

        let small = allocator.account(None);
        let large = allocator.account(None);
        small.grow(MemoryKind::Direct, 300).unwrap();
        large.grow(MemoryKind::Direct, 900).unwrap();
        let small_reg = registry.register(addr(1), small.usage(), false);
        let large_reg = registry.register(addr(2), large.usage(), false);

        match guardian.check() {
            GuardianAction::Tripped { shed, accept_paused } => {
                assert_eq!(shed, vec![large_reg.id()]);
                assert!(!accept_paused);
            }
            other => panic!("expected trip, got {:?}", other),
        }
        assert!(large_reg.close_token().is_cancelled());
        assert!(!small_reg.close_token().is_cancelled());
        assert_eq!(guardian.stats().connections_shed, 1);
    }

    #[test]
    fn test_hysteresis() {
        let (allocator, registry, guardian) = setup(1000, 500);

        let account = allocator.account(None);
        account.grow(MemoryKind::Direct, 1200).unwrap();
        let _reg = registry.register(addr(1), account.usage(), false);

        assert!(matches!(guardian.check(), GuardianAction::Tripped { .. }));
        assert!(guardian.is_tripped());

        // Still above the reset level: no second trip
        account.track(MemoryKind::Direct, 1500).unwrap();
        assert_eq!(guardian.check(), GuardianAction::Holding);
        account.track(MemoryKind::Direct, 700).unwrap();
        assert_eq!(guardian.check(), GuardianAction::Holding);

        account.track(MemoryKind::Direct, 100).unwrap();
        assert_eq!(guardian.check(), GuardianAction::Reset);
        assert!(!guardian.is_tripped());

        account.track(MemoryKind::Direct, 1100).unwrap();
        assert!(matches!(guardian.check(), GuardianAction::Tripped { .. }));

        let stats = guardian.stats();
        assert_eq!(stats.trips, 2);
        assert_eq!(stats.resets, 1);
    }

    #[test]
    fn test_pauses_accept_when_shedding_is_not_enough() {
        let (allocator, _registry, guardian) = setup(1000, 500);

        // Usage not attributable to any registered connection
        let orphan = allocator.account(None);
        orphan.grow(MemoryKind::Heap, 2000).unwrap();

        match guardian.check() {
            GuardianAction::Tripped { shed, accept_paused } => {
                assert!(shed.is_empty());
                assert!(accept_paused);
            }
            other => panic!("expected trip, got {:?}", other),
        }
        assert!(guardian.gate().is_paused());

        drop(orphan);
        assert_eq!(guardian.check(), GuardianAction::Reset);
        assert!(!guardian.gate().is_paused());
    }

    #[test]
    fn test_account_carries_hard_limit() {
        let allocator = PooledAllocator::with_defaults();
        let guardian = MemoryGuardian::new(
            GuardianConfig::new(100, 50).with_hard_limit(200),
            Arc::clone(&allocator),
            ConnectionRegistry::new(),
        )
        .unwrap();

        let account = guardian.account();
        account.grow(MemoryKind::Direct, 200).unwrap();
        assert!(account.grow(MemoryKind::Direct, 1).is_err());
    }

    #[test]
    fn test_disabled_guardian_never_trips() {
        let allocator = PooledAllocator::with_defaults();
        let guardian = MemoryGuardian::new(
            GuardianConfig::disabled(),
            Arc::clone(&allocator),
            ConnectionRegistry::new(),
        )
        .unwrap();

        let account = guardian.account();
        account.grow(MemoryKind::Direct, usize::MAX / 4).unwrap();
        assert_eq!(guardian.check(), GuardianAction::Idle);
    }

    #[tokio::test]
    async fn test_gate_wait_open() {
        let gate = Arc::new(AcceptGate::new());
        gate.pause();

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait_open().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_allocator, _registry, guardian) = setup(1000, 500);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&guardian).run(shutdown.clone()));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
