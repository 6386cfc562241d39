#![forbid(unsafe_code)]

pub mod compress;
pub mod history;
pub mod reclaim;
pub mod registry;
pub mod txn;

pub use compress::{CompressionPass, EpochRemap};
pub use history::{Versioned, VersionedObject};
pub use reclaim::{DeferredReclaimer, ReclaimerStats};
pub use registry::{RegistryStats, SnapshotRegistry};
pub use txn::{CurrentTxnGuard, LocalTransaction, Transaction};
pub use verso_types::{Epoch, ObjectId, SnapshotId, SnapshotStatus};

use parking_lot::Mutex;
use reclaim::DeferredReclaimer as Reclaimer;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Unified error type for the MVCC runtime.
///
/// A write-write conflict is deliberately not represented here: it is the
/// `Ok(false)` result of [`Transaction::commit`], the only recoverable
/// failure the runtime reports.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MvccError {
    #[error("no active transaction on this thread")]
    NoTransaction,

    #[error("commit epoch out of order: expected {expected}, got {got}")]
    EpochOrder { expected: Epoch, got: Epoch },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("no history entry matches epoch {valid_from}")]
    NotFound { valid_from: Epoch },

    #[error("cleanup registered with no live snapshots")]
    NoSnapshots,
}

impl MvccError {
    pub(crate) fn invariant(detail: impl Into<String>) -> Self {
        Self::InvariantViolation(detail.into())
    }
}

/// Result alias using [`MvccError`].
pub type Result<T> = std::result::Result<T, MvccError>;

// ─── Epoch clock ────────────────────────────────────────────────────────────

/// Process-wide pair of epoch counters: `current` (last allocated) and
/// `earliest` (smallest epoch still referenced by any live snapshot).
///
/// `advance` must only be called while the commit lock is held; reads are
/// unsynchronized but observe monotone values (release stores, acquire
/// loads).
#[derive(Debug)]
pub(crate) struct EpochClock {
    current: AtomicU64,
    earliest: AtomicU64,
}

impl EpochClock {
    pub(crate) fn new(initial: Epoch) -> Self {
        Self {
            current: AtomicU64::new(initial.0),
            earliest: AtomicU64::new(initial.0),
        }
    }

    #[inline]
    pub(crate) fn current(&self) -> Epoch {
        Epoch(self.current.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn earliest(&self) -> Epoch {
        Epoch(self.earliest.load(Ordering::Acquire))
    }

    /// Allocate the next epoch. Commit-lock holders only.
    pub(crate) fn advance(&self) -> Epoch {
        let previous = self.current.fetch_add(1, Ordering::AcqRel);
        Epoch(previous + 1)
    }

    pub(crate) fn set_earliest(&self, epoch: Epoch) {
        self.earliest.store(epoch.0, Ordering::Release);
    }

    /// Overwrite `current`; used by the compressor and the forward-jump seam.
    pub(crate) fn store_current(&self, epoch: Epoch) {
        self.current.store(epoch.0, Ordering::Release);
    }
}

// ─── Configuration ──────────────────────────────────────────────────────────

/// When the epoch compressor runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressorPolicy {
    /// Only on explicit [`MvccRuntime::compress_epochs`] calls.
    #[default]
    Off,
    /// A background thread runs a pass at this interval.
    Periodic(Duration),
    /// A pass runs after any commit that leaves `current - earliest`
    /// above this delta.
    Threshold(u64),
}

type EpochHook = Arc<dyn Fn(Epoch) + Send + Sync>;
type CleanupHook = Arc<dyn Fn(ObjectId, Epoch) + Send + Sync>;
type CompressionHook = Arc<dyn Fn(&CompressionPass) + Send + Sync>;

/// Optional observability callbacks. All hooks run outside the commit and
/// registry locks.
#[derive(Clone, Default)]
pub struct RuntimeHooks {
    /// Fired with the new epoch after a successful commit.
    pub on_commit: Option<EpochHook>,
    /// Fired with the attempted epoch after a conflicted commit rolls back.
    pub on_rollback: Option<EpochHook>,
    /// Fired after a historical version is reclaimed.
    pub on_cleanup: Option<CleanupHook>,
    /// Fired after each compression pass.
    pub on_compression: Option<CompressionHook>,
}

impl fmt::Debug for RuntimeHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeHooks")
            .field("on_commit", &self.on_commit.is_some())
            .field("on_rollback", &self.on_rollback.is_some())
            .field("on_cleanup", &self.on_cleanup.is_some())
            .field("on_compression", &self.on_compression.is_some())
            .finish()
    }
}

/// Construction-time configuration for [`MvccRuntime`].
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// First epoch the clock hands out. Clamped to at least [`Epoch::ONE`].
    pub initial_epoch: Epoch,
    /// Initial capacity of each versioned object's history arena.
    pub history_capacity_hint: usize,
    pub compressor_policy: CompressorPolicy,
    pub hooks: RuntimeHooks,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            initial_epoch: Epoch::ONE,
            history_capacity_hint: 1,
            compressor_policy: CompressorPolicy::Off,
            hooks: RuntimeHooks::default(),
        }
    }
}

// ─── Runtime ────────────────────────────────────────────────────────────────

pub(crate) struct RuntimeInner {
    pub(crate) clock: Arc<EpochClock>,
    pub(crate) reclaimer: Arc<Reclaimer>,
    pub(crate) registry: SnapshotRegistry,
    /// Single writer across all objects for the whole of a commit.
    pub(crate) commit_lock: Mutex<()>,
    /// Odd while a compression pass is rewriting epochs; readers retry
    /// when the value moves underneath them.
    pub(crate) compression_gen: AtomicU64,
    pub(crate) hooks: RuntimeHooks,
    pub(crate) capacity_hint: usize,
    pub(crate) policy: CompressorPolicy,
    next_object_id: AtomicU64,
    next_snapshot_id: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_stop: Arc<AtomicBool>,
}

impl fmt::Debug for RuntimeInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeInner")
            .field("current", &self.clock.current())
            .field("earliest", &self.clock.earliest())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RuntimeInner {
    pub(crate) fn next_object_id(&self) -> ObjectId {
        ObjectId(self.next_object_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_snapshot_id(&self) -> SnapshotId {
        SnapshotId(self.next_snapshot_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Threshold-policy check, run after a successful commit with the
    /// commit lock released.
    pub(crate) fn maybe_compress_after_commit(&self) {
        let CompressorPolicy::Threshold(delta) = self.policy else {
            return;
        };
        let span = self
            .clock
            .current()
            .0
            .saturating_sub(self.clock.earliest().0);
        if span <= delta {
            return;
        }
        debug!(
            target: "verso::mvcc::compress",
            span,
            delta,
            "threshold_compression_triggered"
        );
        if let Err(err) = compress::run_compression(self) {
            warn!(target: "verso::mvcc::compress", %err, "threshold_compression_failed");
        }
    }

    fn stop_worker(&self) {
        self.worker_stop.store(true, Ordering::Release);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            handle.thread().unpark();
            if handle.join().is_err() {
                error!(target: "verso::mvcc::compress", "compressor_worker_panicked");
            }
        }
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        self.stop_worker();
        // No snapshot can exist here (transactions hold the runtime alive),
        // so every deferred destructor is safe to run.
        self.reclaimer.drain();
    }
}

/// Handle to one MVCC runtime instance.
///
/// Owns the four shared subsystems — epoch clock, snapshot registry, commit
/// lock, and deferred reclaimer — as instance state, so independent
/// runtimes never interfere. Cloning is cheap and shares the same runtime.
#[derive(Clone, Debug)]
pub struct MvccRuntime {
    inner: Arc<RuntimeInner>,
}

impl Default for MvccRuntime {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl MvccRuntime {
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let initial = if config.initial_epoch < Epoch::ONE {
            warn!(
                target: "verso::mvcc",
                requested = %config.initial_epoch,
                "initial_epoch_clamped"
            );
            Epoch::ONE
        } else {
            config.initial_epoch
        };
        let clock = Arc::new(EpochClock::new(initial));
        let reclaimer = Arc::new(Reclaimer::new(Arc::clone(&clock)));
        let registry = SnapshotRegistry::new(
            Arc::clone(&clock),
            Arc::clone(&reclaimer),
            config.hooks.clone(),
        );
        let inner = Arc::new(RuntimeInner {
            clock,
            reclaimer,
            registry,
            commit_lock: Mutex::new(()),
            compression_gen: AtomicU64::new(0),
            hooks: config.hooks,
            capacity_hint: config.history_capacity_hint.max(1),
            policy: config.compressor_policy,
            next_object_id: AtomicU64::new(0),
            next_snapshot_id: AtomicU64::new(0),
            worker: Mutex::new(None),
            worker_stop: Arc::new(AtomicBool::new(false)),
        });
        if let CompressorPolicy::Periodic(interval) = config.compressor_policy {
            Self::spawn_compressor(&inner, interval);
        }
        info!(
            target: "verso::mvcc",
            initial_epoch = %initial,
            policy = ?config.compressor_policy,
            "runtime_initialized"
        );
        Self { inner }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(RuntimeConfig::default())
    }

    fn spawn_compressor(inner: &Arc<RuntimeInner>, interval: Duration) {
        let weak = Arc::downgrade(inner);
        let stop = Arc::clone(&inner.worker_stop);
        let spawned = thread::Builder::new()
            .name("verso-compressor".to_owned())
            .spawn(move || loop {
                thread::park_timeout(interval);
                if stop.load(Ordering::Acquire) {
                    break;
                }
                let Some(inner) = weak.upgrade() else { break };
                if let Err(err) = compress::run_compression(&inner) {
                    warn!(target: "verso::mvcc::compress", %err, "periodic_compression_failed");
                }
            });
        match spawned {
            Ok(handle) => *inner.worker.lock() = Some(handle),
            Err(err) => error!(
                target: "verso::mvcc::compress",
                %err,
                "compressor_worker_spawn_failed"
            ),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<RuntimeInner> {
        &self.inner
    }

    /// Create a versioned object bound to this runtime.
    #[must_use]
    pub fn versioned<T>(&self, initial: T) -> Versioned<T>
    where
        T: Clone + fmt::Debug + Send + Sync + 'static,
    {
        Versioned::new(self, initial)
    }

    /// Begin a transaction reading at the current epoch.
    ///
    /// # Errors
    ///
    /// Propagates registry invariant violations.
    pub fn begin(&self) -> Result<Transaction> {
        Transaction::begin(self)
    }

    #[must_use]
    pub fn current_epoch(&self) -> Epoch {
        self.inner.clock.current()
    }

    #[must_use]
    pub fn earliest_epoch(&self) -> Epoch {
        self.inner.clock.earliest()
    }

    /// Rewrite live epochs into a dense range starting at 1.
    ///
    /// # Errors
    ///
    /// Propagates invariant violations from the registry or an object.
    pub fn compress_epochs(&self) -> Result<CompressionPass> {
        compress::run_compression(&self.inner)
    }

    /// Jump the clock forward to `epoch` (never backward).
    ///
    /// A seam for exercising widely separated epochs without minting one
    /// commit per step; takes the commit lock like any epoch change.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` if `epoch` is behind the current epoch.
    pub fn force_current_epoch(&self, epoch: Epoch) -> Result<()> {
        let _commit = self.inner.commit_lock.lock();
        let current = self.inner.clock.current();
        if epoch < current {
            return Err(MvccError::invariant(format!(
                "clock may only move forward (current {current}, requested {epoch})"
            )));
        }
        self.inner.clock.store_current(epoch);
        if self.inner.registry.epoch_count() == 0 {
            self.inner.clock.set_earliest(epoch);
        }
        debug!(target: "verso::mvcc", epoch = %epoch, "clock_forced_forward");
        Ok(())
    }

    /// Run any deferred destructors whose tag epoch has fallen below the
    /// earliest live snapshot.
    pub fn collect_garbage(&self) {
        self.inner.reclaimer.collect();
    }

    #[must_use]
    pub fn registry_stats(&self) -> RegistryStats {
        self.inner.registry.stats()
    }

    #[must_use]
    pub fn reclaimer_stats(&self) -> ReclaimerStats {
        self.inner.reclaimer.stats()
    }

    /// Human-readable registry listing, for diagnostics and tests.
    #[must_use]
    pub fn dump_registry(&self) -> String {
        self.inner.registry.dump()
    }

    /// Stop the periodic compressor (if any) and drain the reclaimer.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` while snapshots are still registered.
    pub fn shutdown(&self) -> Result<()> {
        let live = self.inner.registry.snapshot_count();
        if live != 0 {
            return Err(MvccError::invariant(format!(
                "shutdown with {live} live snapshots"
            )));
        }
        self.inner.stop_worker();
        self.inner.reclaimer.drain();
        info!(target: "verso::mvcc", "runtime_shut_down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_starts_at_initial_and_advances() {
        let clock = EpochClock::new(Epoch(600));
        assert_eq!(clock.current(), Epoch(600));
        assert_eq!(clock.earliest(), Epoch(600));
        assert_eq!(clock.advance(), Epoch(601));
        assert_eq!(clock.current(), Epoch(601));
    }

    #[test]
    fn config_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.initial_epoch, Epoch::ONE);
        assert_eq!(config.history_capacity_hint, 1);
        assert_eq!(config.compressor_policy, CompressorPolicy::Off);
    }

    #[test]
    fn initial_epoch_is_clamped_to_one() {
        let runtime = MvccRuntime::new(RuntimeConfig {
            initial_epoch: Epoch::SENTINEL,
            ..RuntimeConfig::default()
        });
        assert_eq!(runtime.current_epoch(), Epoch::ONE);
    }

    #[test]
    fn force_current_epoch_rejects_backward_jump() {
        let runtime = MvccRuntime::new(RuntimeConfig {
            initial_epoch: Epoch(100),
            ..RuntimeConfig::default()
        });
        let err = runtime.force_current_epoch(Epoch(50)).unwrap_err();
        assert!(matches!(err, MvccError::InvariantViolation(_)));
        runtime.force_current_epoch(Epoch(500)).expect("forward jump");
        assert_eq!(runtime.current_epoch(), Epoch(500));
        // Registry is empty, so the floor follows.
        assert_eq!(runtime.earliest_epoch(), Epoch(500));
    }

    #[test]
    fn shutdown_rejects_live_snapshots() {
        let runtime = MvccRuntime::with_defaults();
        let txn = runtime.begin().expect("begin");
        assert!(runtime.shutdown().is_err());
        drop(txn);
        runtime.shutdown().expect("idle shutdown");
    }

    #[test]
    fn periodic_worker_stops_with_runtime() {
        let runtime = MvccRuntime::new(RuntimeConfig {
            compressor_policy: CompressorPolicy::Periodic(Duration::from_millis(5)),
            ..RuntimeConfig::default()
        });
        std::thread::sleep(Duration::from_millis(20));
        runtime.shutdown().expect("shutdown joins the worker");
    }
}
