//! Snapshot registry: the epoch-keyed index of live snapshots and the
//! per-epoch lists of versions awaiting reclamation.
//!
//! Every superseded version sits on exactly one cleanup list — the list of
//! the latest epoch whose snapshots still observe it. When an entry loses
//! its last snapshot, each of its pending cleanups either **migrates** to
//! the predecessor entry (still observed there) or **executes** once the
//! registry lock is released. One failed cleanup never blocks the others.
//!
//! The registry lock is held for map mutations only; object cleanups run
//! outside it, under a shared pass on `exec_gate` so the epoch compressor
//! (which takes `exec_gate` exclusively) never races an in-flight cleanup
//! whose `valid_from` it would restamp.

use crate::history::VersionedObject;
use crate::reclaim::DeferredReclaimer;
use crate::{EpochClock, MvccError, Result, RuntimeHooks};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace, warn};
use verso_types::{Epoch, ObjectId, SnapshotId, SnapshotStatus};

// ─── Snapshot state ─────────────────────────────────────────────────────────

/// Shared state of one snapshot. The registry holds only a weak
/// back-reference; the owning transaction unregisters before dropping it.
pub(crate) struct SnapshotCore {
    id: SnapshotId,
    epoch: AtomicU64,
    status: Mutex<SnapshotStatus>,
}

impl SnapshotCore {
    pub(crate) fn new(id: SnapshotId) -> Self {
        Self {
            id,
            epoch: AtomicU64::new(Epoch::SENTINEL.0),
            status: Mutex::new(SnapshotStatus::Uninitialized),
        }
    }

    pub(crate) fn id(&self) -> SnapshotId {
        self.id
    }

    pub(crate) fn epoch(&self) -> Epoch {
        Epoch(self.epoch.load(Ordering::Acquire))
    }

    pub(crate) fn set_epoch(&self, epoch: Epoch) {
        self.epoch.store(epoch.0, Ordering::Release);
    }

    pub(crate) fn status(&self) -> SnapshotStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: SnapshotStatus) {
        *self.status.lock() = status;
    }
}

impl fmt::Debug for SnapshotCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotCore")
            .field("id", &self.id)
            .field("epoch", &self.epoch())
            .field("status", &self.status())
            .finish()
    }
}

pub(crate) struct PendingCleanup {
    pub(crate) object: Arc<dyn VersionedObject>,
    pub(crate) valid_from: Epoch,
}

impl fmt::Debug for PendingCleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCleanup")
            .field("object", &self.object.object_id())
            .field("valid_from", &self.valid_from)
            .finish()
    }
}

#[derive(Debug, Default)]
pub(crate) struct RegistryEntry {
    pub(crate) snapshots: BTreeMap<SnapshotId, Weak<SnapshotCore>>,
    pub(crate) cleanups: Vec<PendingCleanup>,
}

/// Registry counters and gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Distinct epochs with live snapshots.
    pub epochs: usize,
    /// Live snapshots across all epochs.
    pub snapshots: usize,
    /// Cleanups currently parked on some entry's list.
    pub pending_cleanups: usize,
    pub registered_total: u64,
    pub removed_total: u64,
    pub cleanups_migrated: u64,
    pub cleanups_executed: u64,
}

// ─── Registry ───────────────────────────────────────────────────────────────

pub struct SnapshotRegistry {
    clock: Arc<EpochClock>,
    reclaimer: Arc<DeferredReclaimer>,
    hooks: RuntimeHooks,
    pub(crate) entries: Mutex<BTreeMap<Epoch, RegistryEntry>>,
    /// Snapshot add/remove paths hold this shared for the whole
    /// extract-and-execute sequence; the compressor holds it exclusively.
    /// A cleanup extracted from the map therefore always executes under
    /// the same epoch numbering it was extracted in. Acquired before the
    /// `entries` lock, never the other way around.
    pub(crate) exec_gate: RwLock<()>,
    registered_total: AtomicU64,
    removed_total: AtomicU64,
    cleanups_migrated: AtomicU64,
    cleanups_executed: AtomicU64,
}

impl fmt::Debug for SnapshotRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("SnapshotRegistry")
            .field("epochs", &stats.epochs)
            .field("snapshots", &stats.snapshots)
            .field("pending_cleanups", &stats.pending_cleanups)
            .finish_non_exhaustive()
    }
}

impl SnapshotRegistry {
    pub(crate) fn new(
        clock: Arc<EpochClock>,
        reclaimer: Arc<DeferredReclaimer>,
        hooks: RuntimeHooks,
    ) -> Self {
        Self {
            clock,
            reclaimer,
            hooks,
            entries: Mutex::new(BTreeMap::new()),
            exec_gate: RwLock::new(()),
            registered_total: AtomicU64::new(0),
            removed_total: AtomicU64::new(0),
            cleanups_migrated: AtomicU64::new(0),
            cleanups_executed: AtomicU64::new(0),
        }
    }

    /// Bind `snapshot` to the current epoch and insert it.
    ///
    /// A fresh registration must land at the map's tail; anything else
    /// means the clock ran backwards.
    pub(crate) fn register_snapshot(&self, snapshot: &Arc<SnapshotCore>) -> Result<Epoch> {
        let gate = self.exec_gate.read();
        let (epoch, due, trigger, floor_moved) = {
            let mut entries = self.entries.lock();
            let epoch = self.clock.current();
            let previous_tail = entries.keys().next_back().copied();
            snapshot.set_epoch(epoch);
            entries
                .entry(epoch)
                .or_default()
                .snapshots
                .insert(snapshot.id(), Arc::downgrade(snapshot));

            if entries.keys().next_back() != Some(&epoch) {
                // Undo the insertion so the map stays coherent for the
                // dump below and for whoever inspects the wreckage.
                if let Some(entry) = entries.get_mut(&epoch) {
                    entry.snapshots.remove(&snapshot.id());
                    if entry.snapshots.is_empty() && entry.cleanups.is_empty() {
                        entries.remove(&epoch);
                    }
                }
                error!(
                    target: "verso::mvcc::registry",
                    snapshot = %snapshot.id(),
                    epoch = %epoch,
                    dump = %Self::dump_locked(&entries, &self.clock),
                    "stale_snapshot_registration"
                );
                return Err(MvccError::invariant(format!(
                    "snapshot {} registered at non-tail epoch {epoch}",
                    snapshot.id()
                )));
            }

            // The entry that was the tail can no longer gain snapshots; if
            // its last one already left (with cleanups still attached),
            // settle it now.
            match previous_tail {
                Some(prev)
                    if prev != epoch
                        && entries.get(&prev).is_some_and(|e| e.snapshots.is_empty()) =>
                {
                    let (due, floor_moved) = self.detach_entry(&mut entries, prev);
                    (epoch, due, prev, floor_moved)
                }
                _ => (epoch, Vec::new(), epoch, false),
            }
        };

        self.registered_total.fetch_add(1, Ordering::Relaxed);
        trace!(
            target: "verso::mvcc::registry",
            snapshot = %snapshot.id(),
            epoch = %epoch,
            "snapshot_registered"
        );
        let reclaimed = self.execute_cleanups(due, trigger);
        drop(gate);
        if floor_moved {
            self.reclaimer.collect();
        }
        self.fire_cleanup_hooks(reclaimed);
        Ok(epoch)
    }

    /// Remove `snapshot` from its entry; a drained entry settles its
    /// cleanup list.
    pub(crate) fn remove_snapshot(&self, snapshot: &Arc<SnapshotCore>) -> Result<()> {
        let gate = self.exec_gate.read();
        let (due, trigger, floor_moved) = {
            let mut entries = self.entries.lock();
            let epoch = snapshot.epoch();
            let Some(entry) = entries.get_mut(&epoch) else {
                return Err(MvccError::invariant(format!(
                    "snapshot {} not found at epoch {epoch}",
                    snapshot.id()
                )));
            };
            if entry.snapshots.remove(&snapshot.id()).is_none() {
                return Err(MvccError::invariant(format!(
                    "snapshot {} out of sync at epoch {epoch}",
                    snapshot.id()
                )));
            }
            if entry.snapshots.is_empty() {
                let (due, floor_moved) = self.detach_entry(&mut entries, epoch);
                (due, epoch, floor_moved)
            } else {
                (Vec::new(), epoch, false)
            }
        };

        self.removed_total.fetch_add(1, Ordering::Relaxed);
        trace!(
            target: "verso::mvcc::registry",
            snapshot = %snapshot.id(),
            "snapshot_removed"
        );
        let reclaimed = self.execute_cleanups(due, trigger);
        drop(gate);
        if floor_moved {
            self.reclaimer.collect();
        }
        self.fire_cleanup_hooks(reclaimed);
        Ok(())
    }

    /// Park a superseded version on the most recent entry's cleanup list.
    /// Called under the commit lock.
    ///
    /// # Errors
    ///
    /// `NoSnapshots` when the registry is empty.
    pub(crate) fn register_cleanup(
        &self,
        object: Arc<dyn VersionedObject>,
        valid_from: Epoch,
    ) -> Result<()> {
        let mut entries = self.entries.lock();
        let Some((tail_key, tail)) = entries.iter_mut().next_back() else {
            return Err(MvccError::NoSnapshots);
        };
        trace!(
            target: "verso::mvcc::registry",
            object = %object.object_id(),
            valid_from = %valid_from,
            listed_under = %tail_key,
            "cleanup_registered"
        );
        tail.cleanups.push(PendingCleanup { object, valid_from });
        Ok(())
    }

    /// Remove `key`'s (snapshot-free) entry, migrating each pending cleanup
    /// to the predecessor entry that still observes it and returning the
    /// rest for execution outside the lock. Maintains the earliest-epoch
    /// floor when the head entry disappears.
    fn detach_entry(
        &self,
        entries: &mut BTreeMap<Epoch, RegistryEntry>,
        key: Epoch,
    ) -> (Vec<PendingCleanup>, bool) {
        let Some(entry) = entries.remove(&key) else {
            return (Vec::new(), false);
        };
        debug_assert!(entry.snapshots.is_empty());

        let predecessor = entries.range(..key).next_back().map(|(k, _)| *k);
        let mut due = Vec::new();
        let mut migrated = 0_u64;
        for pending in entry.cleanups {
            match predecessor {
                Some(prev) if prev >= pending.valid_from => {
                    if let Some(prev_entry) = entries.get_mut(&prev) {
                        trace!(
                            target: "verso::mvcc::registry",
                            object = %pending.object.object_id(),
                            valid_from = %pending.valid_from,
                            from_epoch = %key,
                            to_epoch = %prev,
                            "cleanup_migrated"
                        );
                        prev_entry.cleanups.push(pending);
                        migrated += 1;
                    } else {
                        due.push(pending);
                    }
                }
                _ => due.push(pending),
            }
        }
        self.cleanups_migrated.fetch_add(migrated, Ordering::Relaxed);

        let floor_moved = match entries.keys().next() {
            Some(&head) if head > key => {
                self.clock.set_earliest(head);
                true
            }
            None => {
                self.clock.set_earliest(self.clock.current());
                true
            }
            _ => false,
        };
        (due, floor_moved)
    }

    /// Run cleanups collected by `detach_entry` and report the reclaimed
    /// pairs. The caller holds `exec_gate` (shared) and has released the
    /// registry lock; hooks fire later, outside the gate.
    fn execute_cleanups(
        &self,
        due: Vec<PendingCleanup>,
        trigger: Epoch,
    ) -> Vec<(ObjectId, Epoch)> {
        let mut reclaimed = Vec::new();
        for pending in due {
            let object_id = pending.object.object_id();
            match pending.object.cleanup(pending.valid_from, trigger) {
                Ok(()) => {
                    self.cleanups_executed.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        target: "verso::mvcc::registry",
                        object = %object_id,
                        valid_from = %pending.valid_from,
                        trigger = %trigger,
                        "cleanup_executed"
                    );
                    reclaimed.push((object_id, pending.valid_from));
                }
                Err(err) => {
                    warn!(
                        target: "verso::mvcc::registry",
                        object = %object_id,
                        valid_from = %pending.valid_from,
                        trigger = %trigger,
                        %err,
                        dump = %pending.object.dump(),
                        "cleanup_failed"
                    );
                }
            }
        }
        reclaimed
    }

    fn fire_cleanup_hooks(&self, reclaimed: Vec<(ObjectId, Epoch)>) {
        let Some(hook) = &self.hooks.on_cleanup else {
            return;
        };
        for (object_id, valid_from) in reclaimed {
            hook(object_id, valid_from);
        }
    }

    /// Distinct epochs with live snapshots.
    #[must_use]
    pub fn epoch_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Live snapshots across all epochs.
    #[must_use]
    pub fn snapshot_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .map(|e| e.snapshots.len())
            .sum()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let entries = self.entries.lock();
        RegistryStats {
            epochs: entries.len(),
            snapshots: entries.values().map(|e| e.snapshots.len()).sum(),
            pending_cleanups: entries.values().map(|e| e.cleanups.len()).sum(),
            registered_total: self.registered_total.load(Ordering::Relaxed),
            removed_total: self.removed_total.load(Ordering::Relaxed),
            cleanups_migrated: self.cleanups_migrated.load(Ordering::Relaxed),
            cleanups_executed: self.cleanups_executed.load(Ordering::Relaxed),
        }
    }

    /// Human-readable registry listing.
    #[must_use]
    pub fn dump(&self) -> String {
        Self::dump_locked(&self.entries.lock(), &self.clock)
    }

    fn dump_locked(entries: &BTreeMap<Epoch, RegistryEntry>, clock: &EpochClock) -> String {
        let mut out = format!(
            "registry: {} epochs, current={}, earliest={}\n",
            entries.len(),
            clock.current(),
            clock.earliest()
        );
        for (epoch, entry) in entries {
            let _ = writeln!(
                out,
                "  epoch {epoch}: {} snapshots, {} pending cleanups",
                entry.snapshots.len(),
                entry.cleanups.len()
            );
            for weak in entry.snapshots.values() {
                if let Some(snapshot) = weak.upgrade() {
                    let _ = writeln!(out, "    {} {}", snapshot.id(), snapshot.status());
                }
            }
            for pending in &entry.cleanups {
                let _ = writeln!(
                    out,
                    "    cleanup {} valid_from={}",
                    pending.object.object_id(),
                    pending.valid_from
                );
            }
        }
        out
    }

    /// Restamp every live snapshot in `entry` (compressor only; both the
    /// registry lock and the exclusive `exec_gate` are held).
    pub(crate) fn restamp_entry(entry: &RegistryEntry, epoch: Epoch) -> usize {
        let mut restamped = 0;
        for weak in entry.snapshots.values() {
            if let Some(snapshot) = weak.upgrade() {
                snapshot.set_epoch(epoch);
                restamped += 1;
            }
        }
        restamped
    }
}
