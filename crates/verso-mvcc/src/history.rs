//! Versioned objects and their epoch-stamped history arenas.
//!
//! A [`Versioned<T>`] owns a history of `{valid_to, value}` entries ordered
//! strictly by `valid_to`; the newest entry is "open" (`valid_to == open`)
//! and carries the current value. A reader at epoch `e` sees the entry whose
//! range `[prev.valid_to, this.valid_to)` covers `e`.
//!
//! # Publication
//!
//! The arena behind an object is published through [`arc_swap::ArcSwap`]:
//! readers load a guard and scan without locking or allocating; every
//! mutation (append, rollback, removal, restamp) builds a replacement arena
//! and installs it with compare-and-swap, retrying from a reload on loss.
//! Replaced arenas are handed to the deferred reclaimer tagged with the
//! current epoch, so they are retired once no snapshot can observe them.
//!
//! Consecutive arenas share their entry slab where possible: removing the
//! oldest entry only advances the `first` index over a shared slab, and the
//! skipped slot becomes garbage together with the old arena.
//!
//! # Logging
//!
//! - **TRACE** `verso::mvcc::history`: `version_appended`, `version_removed`,
//!   `rollback_applied`
//! - **WARN**  `verso::mvcc::history`: `rollback_target_missing`

use crate::compress::EpochRemap;
use crate::txn::Transaction;
use crate::{MvccError, MvccRuntime, Result, RuntimeInner};
use arc_swap::ArcSwap;
use std::any::Any;
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{trace, warn};
use verso_types::{Epoch, ObjectId};

// ─── History arena ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct HistoryEntry<T> {
    pub(crate) valid_to: Epoch,
    pub(crate) value: T,
}

/// One immutable-after-publish version of an object's history.
///
/// `entries[first..]` are the live entries; the slab may be shared with the
/// arena this one replaced.
#[derive(Debug)]
pub(crate) struct History<T> {
    first: usize,
    entries: Arc<Vec<HistoryEntry<T>>>,
}

impl<T: Clone> History<T> {
    pub(crate) fn seed(initial: T, capacity_hint: usize) -> Self {
        let mut entries = Vec::with_capacity(capacity_hint.max(1));
        entries.push(HistoryEntry {
            valid_to: Epoch::OPEN,
            value: initial,
        });
        Self {
            first: 0,
            entries: Arc::new(entries),
        }
    }

    fn from_entries(entries: Vec<HistoryEntry<T>>) -> Self {
        Self {
            first: 0,
            entries: Arc::new(entries),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len() - self.first
    }

    /// Entry at logical index `i` (0 = oldest).
    pub(crate) fn entry(&self, i: usize) -> &HistoryEntry<T> {
        &self.entries[self.first + i]
    }

    /// `valid_to` of the newest superseded entry, or the sentinel when only
    /// the open entry exists. This is the lower bound of the open entry's
    /// valid range.
    pub(crate) fn newest_concrete_valid_to(&self) -> Epoch {
        let n = self.len();
        if n >= 2 {
            self.entry(n - 2).valid_to
        } else {
            Epoch::SENTINEL
        }
    }

    /// Value visible at `epoch`: newest-to-oldest scan for the first entry
    /// whose predecessor closed at or before `epoch`.
    pub(crate) fn value_at(&self, epoch: Epoch) -> T {
        let n = self.len();
        for i in (1..n).rev() {
            if self.entry(i - 1).valid_to <= epoch {
                return self.entry(i).value.clone();
            }
        }
        self.entry(0).value.clone()
    }

    fn live_entries_cloned(&self, extra_capacity: usize) -> Vec<HistoryEntry<T>> {
        let n = self.len();
        let mut out = Vec::with_capacity(n + extra_capacity);
        for i in 0..n {
            out.push(self.entry(i).clone());
        }
        out
    }
}

// ─── Capability trait ───────────────────────────────────────────────────────

/// Type-erased surface of a versioned object, used by the transaction
/// engine (commit discipline), the snapshot registry (cleanups), and the
/// epoch compressor (restamping).
pub trait VersionedObject: Send + Sync {
    fn object_id(&self) -> ObjectId;

    /// Atomically prepare to append the boxed value as the version visible
    /// from `new_epoch`. Returns `Ok(false)` without mutating when a
    /// concurrent commit already closed a version past `old_epoch`.
    ///
    /// # Errors
    ///
    /// `EpochOrder` when `new_epoch` is not `current_epoch + 1`;
    /// `InvariantViolation` when the boxed value has the wrong type.
    fn setup(&self, old_epoch: Epoch, new_epoch: Epoch, value: Box<dyn Any + Send>)
        -> Result<bool>;

    /// Second commit phase: hand the entry superseded by `setup` to the
    /// registry for eventual reclamation.
    ///
    /// # Errors
    ///
    /// `NoSnapshots` when the registry is empty (a bug: the committing
    /// transaction itself holds a snapshot).
    fn commit_version(&self, new_epoch: Epoch) -> Result<()>;

    /// Undo a successful `setup` for `new_epoch`: drop the appended open
    /// entry and reopen its predecessor.
    fn rollback(&self, new_epoch: Epoch);

    /// Remove the unique historical entry whose `valid_from` equals
    /// `unused_valid_from`, stitching the surviving ranges back together.
    /// `trigger_epoch` is the registry epoch whose disappearance caused the
    /// call (diagnostics only).
    ///
    /// # Errors
    ///
    /// `InvariantViolation` when only the open entry exists; `NotFound`
    /// when no entry matches.
    fn cleanup(&self, unused_valid_from: Epoch, trigger_epoch: Epoch) -> Result<()>;

    /// Restamp exactly one entry's `valid_to` from `old_valid_to` to
    /// `new_valid_to`, preserving strict ordering.
    ///
    /// # Errors
    ///
    /// `NotFound` when no entry matches; `InvariantViolation` when the new
    /// stamp would break ordering or a reserved value is passed.
    fn rename_epoch(&self, old_valid_to: Epoch, new_valid_to: Epoch) -> Result<()>;

    /// Rewrite every concrete `valid_to` through the compressor's map in a
    /// single arena replacement, so readers never observe a partially
    /// renamed history. Returns the number of stamps that changed.
    fn remap_epochs(&self, remap: &EpochRemap) -> usize;

    /// Human-readable history listing.
    fn dump(&self) -> String;
}

// ─── Versioned<T> ───────────────────────────────────────────────────────────

pub(crate) struct VersionedCore<T> {
    id: ObjectId,
    runtime: Arc<RuntimeInner>,
    data: ArcSwap<History<T>>,
    /// `valid_from` of the entry superseded by the setup in flight, staged
    /// for `commit_version`. Only touched under the commit lock.
    staged_cleanup_from: AtomicU64,
    self_ref: Weak<VersionedCore<T>>,
}

/// A logical variable with an epoch-indexed history of values.
///
/// Handles are cheap to clone and share one history. Reads never block;
/// writes are staged in the current transaction and take effect on commit.
pub struct Versioned<T> {
    core: Arc<VersionedCore<T>>,
}

impl<T> Clone for Versioned<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Clone + fmt::Debug + Send + Sync + 'static> fmt::Debug for Versioned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Versioned")
            .field("id", &self.core.id)
            .field("history_size", &self.history_size())
            .finish()
    }
}

impl<T: Clone + fmt::Debug + Send + Sync + 'static> Versioned<T> {
    /// Create a versioned object holding `initial`, bound to `runtime`.
    ///
    /// The history starts with exactly one open entry; the registry is not
    /// involved until the first commit.
    #[must_use]
    pub fn new(runtime: &MvccRuntime, initial: T) -> Self {
        let inner = Arc::clone(runtime.inner());
        let id = inner.next_object_id();
        let history = History::seed(initial, inner.capacity_hint);
        let core = Arc::new_cyclic(|weak| VersionedCore {
            id,
            runtime: inner,
            data: ArcSwap::from_pointee(history),
            staged_cleanup_from: AtomicU64::new(Epoch::SENTINEL.0),
            self_ref: Weak::clone(weak),
        });
        Self { core }
    }

    #[must_use]
    pub fn object_id(&self) -> ObjectId {
        self.core.id
    }

    /// Read the value visible to the calling context: the transaction's
    /// speculative value if one is staged, else the committed value at the
    /// transaction's snapshot epoch, else (outside any transaction) the
    /// value at the current epoch.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` when the bound transaction belongs to a
    /// different runtime or a staged value has the wrong type.
    pub fn read(&self) -> Result<T> {
        if let Some(txn) = Transaction::current() {
            self.check_same_runtime(&txn)?;
            if let Some(local) = txn.local_value_of::<T>(self.core.id)? {
                return Ok(local);
            }
            return Ok(self.core.coherent_read(|| txn.epoch()));
        }
        let core = &self.core;
        Ok(core.coherent_read(|| core.runtime.clock.current()))
    }

    /// Apply `f` to the transaction-local speculative value, seeding it
    /// from the snapshot epoch if absent.
    ///
    /// # Errors
    ///
    /// `NoTransaction` without an active transaction on this thread.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let txn = Transaction::current().ok_or(MvccError::NoTransaction)?;
        self.check_same_runtime(&txn)?;
        let seed_core = Arc::clone(&self.core);
        let seed_txn = txn.clone();
        txn.with_local(
            Arc::clone(&self.core) as Arc<dyn VersionedObject>,
            move || seed_core.coherent_read(|| seed_txn.epoch()),
            f,
        )
    }

    /// Stage `value` as the speculative value, replacing any previous one.
    ///
    /// # Errors
    ///
    /// `NoTransaction` without an active transaction on this thread.
    pub fn write(&self, value: T) -> Result<()> {
        let txn = Transaction::current().ok_or(MvccError::NoTransaction)?;
        self.check_same_runtime(&txn)?;
        txn.insert_local(Arc::clone(&self.core) as Arc<dyn VersionedObject>, value);
        Ok(())
    }

    /// Number of superseded versions still held (history size minus the
    /// open entry).
    #[must_use]
    pub fn history_size(&self) -> usize {
        self.core.data.load().len() - 1
    }

    /// Human-readable history listing.
    #[must_use]
    pub fn dump(&self) -> String {
        self.core.dump()
    }

    pub(crate) fn core(&self) -> &Arc<VersionedCore<T>> {
        &self.core
    }

    fn check_same_runtime(&self, txn: &Transaction) -> Result<()> {
        if Arc::ptr_eq(&self.core.runtime, txn.runtime_inner()) {
            Ok(())
        } else {
            Err(MvccError::invariant(
                "object and transaction belong to different runtimes",
            ))
        }
    }
}

impl<T: Clone + fmt::Debug + Send + Sync + 'static> VersionedCore<T> {
    /// Read `value_at(epoch)` with a coherent (epoch, arena) pair: if a
    /// compression pass rewrote epochs underneath the read, retry.
    fn coherent_read(&self, epoch_of: impl Fn() -> Epoch) -> T {
        loop {
            let gen = self.runtime.compression_gen.load(Ordering::Acquire);
            if gen & 1 == 1 {
                std::thread::yield_now();
                continue;
            }
            let epoch = epoch_of();
            let value = self.data.load().value_at(epoch);
            if self.runtime.compression_gen.load(Ordering::Acquire) == gen {
                return value;
            }
        }
    }

    fn retire(&self, old: Arc<History<T>>) {
        let tag = self.runtime.clock.current();
        self.runtime
            .reclaimer
            .schedule(tag, Box::new(move || drop(old)));
    }
}

impl<T: Clone + fmt::Debug + Send + Sync + 'static> VersionedObject for VersionedCore<T> {
    fn object_id(&self) -> ObjectId {
        self.id
    }

    fn setup(
        &self,
        old_epoch: Epoch,
        new_epoch: Epoch,
        value: Box<dyn Any + Send>,
    ) -> Result<bool> {
        let expected = self.runtime.clock.current().next();
        if new_epoch != expected {
            return Err(MvccError::EpochOrder {
                expected,
                got: new_epoch,
            });
        }
        let value = *value
            .downcast::<T>()
            .map_err(|_| MvccError::invariant("staged value has the wrong type"))?;

        let mut current = self.data.load_full();
        loop {
            let superseded_from = current.newest_concrete_valid_to();
            if superseded_from > old_epoch {
                // A concurrent commit closed a version after our snapshot.
                return Ok(false);
            }

            let n = current.len();
            let mut entries = current.live_entries_cloned(1);
            entries[n - 1].valid_to = new_epoch;
            entries.push(HistoryEntry {
                valid_to: Epoch::OPEN,
                value: value.clone(),
            });
            let next = Arc::new(History::from_entries(entries));
            let prev = self.data.compare_and_swap(&current, next);
            if Arc::ptr_eq(&*prev, &current) {
                self.staged_cleanup_from
                    .store(superseded_from.0, Ordering::Release);
                trace!(
                    target: "verso::mvcc::history",
                    object = %self.id,
                    new_epoch = %new_epoch,
                    entries = n + 1,
                    "version_appended"
                );
                drop(prev);
                self.retire(current);
                return Ok(true);
            }
            current = Arc::clone(&*prev);
        }
    }

    fn commit_version(&self, _new_epoch: Epoch) -> Result<()> {
        let valid_from = Epoch(self.staged_cleanup_from.load(Ordering::Acquire));
        let Some(core) = self.self_ref.upgrade() else {
            return Err(MvccError::invariant("object dropped during commit"));
        };
        self.runtime
            .registry
            .register_cleanup(core as Arc<dyn VersionedObject>, valid_from)
    }

    fn rollback(&self, new_epoch: Epoch) {
        let mut current = self.data.load_full();
        loop {
            let n = current.len();
            if n < 2 || current.entry(n - 2).valid_to != new_epoch {
                warn!(
                    target: "verso::mvcc::history",
                    object = %self.id,
                    new_epoch = %new_epoch,
                    "rollback_target_missing"
                );
                return;
            }
            let mut entries = current.live_entries_cloned(0);
            entries.pop();
            entries[n - 2].valid_to = Epoch::OPEN;
            let next = Arc::new(History::from_entries(entries));
            let prev = self.data.compare_and_swap(&current, next);
            if Arc::ptr_eq(&*prev, &current) {
                trace!(
                    target: "verso::mvcc::history",
                    object = %self.id,
                    new_epoch = %new_epoch,
                    "rollback_applied"
                );
                drop(prev);
                self.retire(current);
                return;
            }
            current = Arc::clone(&*prev);
        }
    }

    fn cleanup(&self, unused_valid_from: Epoch, trigger_epoch: Epoch) -> Result<()> {
        let mut current = self.data.load_full();
        loop {
            let n = current.len();
            if n < 2 {
                return Err(MvccError::invariant(
                    "cleanup with no historical entries to remove",
                ));
            }

            let next = if unused_valid_from < current.entry(0).valid_to {
                // The target is the oldest entry: share the slab and step
                // over it; the slot is retired with the old arena.
                Arc::new(History {
                    first: current.first + 1,
                    entries: Arc::clone(&current.entries),
                })
            } else {
                let mut target = None;
                for i in 1..n {
                    if current.entry(i - 1).valid_to == unused_valid_from {
                        target = Some(i);
                        break;
                    }
                }
                let Some(target) = target else {
                    return Err(MvccError::NotFound {
                        valid_from: unused_valid_from,
                    });
                };
                if target == n - 1 {
                    return Err(MvccError::invariant(
                        "cleanup would remove the open entry",
                    ));
                }
                let mut entries = Vec::with_capacity(n - 1);
                for i in 0..n {
                    if i != target {
                        entries.push(current.entry(i).clone());
                    }
                }
                // The prior survivor absorbs the removed range.
                entries[target - 1].valid_to = current.entry(target).valid_to;
                Arc::new(History::from_entries(entries))
            };

            let prev = self.data.compare_and_swap(&current, next);
            if Arc::ptr_eq(&*prev, &current) {
                trace!(
                    target: "verso::mvcc::history",
                    object = %self.id,
                    valid_from = %unused_valid_from,
                    trigger = %trigger_epoch,
                    entries = n - 1,
                    "version_removed"
                );
                drop(prev);
                self.retire(current);
                return Ok(());
            }
            current = Arc::clone(&*prev);
        }
    }

    fn rename_epoch(&self, old_valid_to: Epoch, new_valid_to: Epoch) -> Result<()> {
        if old_valid_to.is_open() || new_valid_to.is_open() || new_valid_to.is_sentinel() {
            return Err(MvccError::invariant(
                "rename_epoch cannot involve reserved epoch values",
            ));
        }
        let mut current = self.data.load_full();
        loop {
            let n = current.len();
            let mut target = None;
            for i in 0..n {
                if current.entry(i).valid_to == old_valid_to {
                    target = Some(i);
                    break;
                }
            }
            let Some(target) = target else {
                return Err(MvccError::NotFound {
                    valid_from: old_valid_to,
                });
            };
            let below_ok = target == 0 || current.entry(target - 1).valid_to < new_valid_to;
            let above_ok = current.entry(target + 1).valid_to > new_valid_to;
            if !below_ok || !above_ok {
                return Err(MvccError::invariant(format!(
                    "rename_epoch {old_valid_to} -> {new_valid_to} breaks stamp ordering"
                )));
            }

            let mut entries = current.live_entries_cloned(0);
            entries[target].valid_to = new_valid_to;
            let next = Arc::new(History::from_entries(entries));
            let prev = self.data.compare_and_swap(&current, next);
            if Arc::ptr_eq(&*prev, &current) {
                drop(prev);
                self.retire(current);
                return Ok(());
            }
            current = Arc::clone(&*prev);
        }
    }

    fn remap_epochs(&self, remap: &EpochRemap) -> usize {
        let mut current = self.data.load_full();
        loop {
            let n = current.len();
            let mut changed = 0_usize;
            let mut entries = Vec::with_capacity(n);
            for i in 0..n {
                let entry = current.entry(i);
                let mapped = remap.map(entry.valid_to);
                changed += usize::from(mapped != entry.valid_to);
                entries.push(HistoryEntry {
                    valid_to: mapped,
                    value: entry.value.clone(),
                });
            }
            if changed == 0 {
                return 0;
            }
            let next = Arc::new(History::from_entries(entries));
            let prev = self.data.compare_and_swap(&current, next);
            if Arc::ptr_eq(&*prev, &current) {
                drop(prev);
                self.retire(current);
                return changed;
            }
            current = Arc::clone(&*prev);
        }
    }

    fn dump(&self) -> String {
        let history = self.data.load();
        let n = history.len();
        let mut out = format!("{}: {} entries\n", self.id, n);
        for i in 0..n {
            let entry = history.entry(i);
            let _ = writeln!(
                out,
                "  [{i}] valid_to={} value={:?}",
                entry.valid_to, entry.value
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MvccRuntime;

    fn raw_history(stamps: &[(u64, i32)]) -> History<i32> {
        let entries = stamps
            .iter()
            .map(|&(valid_to, value)| HistoryEntry {
                valid_to: if valid_to == u64::MAX {
                    Epoch::OPEN
                } else {
                    Epoch(valid_to)
                },
                value,
            })
            .collect();
        History::from_entries(entries)
    }

    #[test]
    fn visibility_scan_covers_ranges() {
        let history = raw_history(&[(5, 10), (9, 20), (u64::MAX, 30)]);
        assert_eq!(history.value_at(Epoch(1)), 10);
        assert_eq!(history.value_at(Epoch(4)), 10);
        assert_eq!(history.value_at(Epoch(5)), 20);
        assert_eq!(history.value_at(Epoch(8)), 20);
        assert_eq!(history.value_at(Epoch(9)), 30);
        assert_eq!(history.value_at(Epoch(1_000)), 30);
    }

    #[test]
    fn single_entry_reads_regardless_of_epoch() {
        let history = raw_history(&[(u64::MAX, 7)]);
        assert_eq!(history.value_at(Epoch::SENTINEL), 7);
        assert_eq!(history.value_at(Epoch(1_000_000)), 7);
    }

    #[test]
    fn setup_appends_and_closes_the_open_entry() {
        let runtime = MvccRuntime::with_defaults();
        let var = runtime.versioned(0_i32);
        let core = var.core();

        assert!(core.setup(Epoch(1), Epoch(2), Box::new(5_i32)).expect("setup"));
        assert_eq!(var.history_size(), 1);

        let history = core.data.load();
        assert_eq!(history.entry(0).valid_to, Epoch(2));
        assert_eq!(history.entry(1).valid_to, Epoch::OPEN);
        assert_eq!(history.entry(1).value, 5);
    }

    #[test]
    fn setup_rejects_out_of_order_epochs() {
        let runtime = MvccRuntime::with_defaults();
        let var = runtime.versioned(0_i32);
        let err = var
            .core()
            .setup(Epoch(1), Epoch(5), Box::new(1_i32))
            .unwrap_err();
        assert_eq!(
            err,
            MvccError::EpochOrder {
                expected: Epoch(2),
                got: Epoch(5)
            }
        );
    }

    #[test]
    fn setup_reports_conflict_without_mutating() {
        let runtime = MvccRuntime::with_defaults();
        let var = runtime.versioned(0_i32);
        let core = var.core();
        assert!(core.setup(Epoch(1), Epoch(2), Box::new(5_i32)).expect("first"));

        // A snapshot from epoch 1 lost the race: the newest concrete stamp
        // is already 2.
        assert!(!core.setup(Epoch(1), Epoch(2), Box::new(9_i32)).expect("second"));
        assert_eq!(var.history_size(), 1);
        assert_eq!(core.data.load().entry(1).value, 5);
    }

    #[test]
    fn setup_then_rollback_restores_the_history() {
        let runtime = MvccRuntime::with_defaults();
        let var = runtime.versioned(7_i32);
        let core = var.core();

        assert!(core.setup(Epoch(1), Epoch(2), Box::new(8_i32)).expect("setup"));
        core.rollback(Epoch(2));

        assert_eq!(var.history_size(), 0);
        let history = core.data.load();
        assert_eq!(history.entry(0).valid_to, Epoch::OPEN);
        assert_eq!(history.entry(0).value, 7);
    }

    /// Build `[v0 valid_to=2, v10 valid_to=3, v20 open]` via two commits.
    fn three_version_var(runtime: &MvccRuntime) -> Versioned<i32> {
        let var = runtime.versioned(0_i32);
        let core = var.core();
        let clock = &core.runtime.clock;
        assert!(core.setup(Epoch(1), Epoch(2), Box::new(10_i32)).expect("setup"));
        clock.advance();
        assert!(core.setup(Epoch(2), Epoch(3), Box::new(20_i32)).expect("setup"));
        clock.advance();
        var
    }

    #[test]
    fn cleanup_stitches_surviving_ranges() {
        let runtime = MvccRuntime::with_defaults();
        let var = three_version_var(&runtime);
        let core = var.core();

        // Remove the middle entry (valid_from = 2).
        core.cleanup(Epoch(2), Epoch(99)).expect("cleanup");
        assert_eq!(var.history_size(), 1);

        let history = core.data.load();
        assert_eq!(history.entry(0).valid_to, Epoch(3), "range absorbed");
        assert_eq!(history.value_at(Epoch(3)), 20);
        assert_eq!(history.value_at(Epoch(1)), 0);
    }

    #[test]
    fn cleanup_front_entry_takes_the_fast_path() {
        let runtime = MvccRuntime::with_defaults();
        let var = three_version_var(&runtime);
        let core = var.core();

        let slab_before = Arc::clone(&core.data.load().entries);
        core.cleanup(Epoch::SENTINEL, Epoch(99)).expect("cleanup");
        let after = core.data.load();
        assert!(
            Arc::ptr_eq(&after.entries, &slab_before),
            "front removal shares the slab"
        );
        assert_eq!(after.len(), 2);
        assert_eq!(after.value_at(Epoch(2)), 10);
    }

    #[test]
    fn cleanup_rejects_missing_and_degenerate_targets() {
        let runtime = MvccRuntime::with_defaults();
        let single = runtime.versioned(1_i32);
        assert!(matches!(
            single.core().cleanup(Epoch::SENTINEL, Epoch(9)),
            Err(MvccError::InvariantViolation(_))
        ));

        let var = three_version_var(&runtime);
        assert_eq!(
            var.core().cleanup(Epoch(7), Epoch(9)),
            Err(MvccError::NotFound {
                valid_from: Epoch(7)
            })
        );
    }

    #[test]
    fn rename_epoch_round_trips() {
        let runtime = MvccRuntime::with_defaults();
        let var = three_version_var(&runtime);
        let core = var.core();
        let before = var.dump();

        core.rename_epoch(Epoch(2), Epoch(1)).expect("rename down");
        assert_eq!(core.data.load().entry(0).valid_to, Epoch(1));
        core.rename_epoch(Epoch(1), Epoch(2)).expect("rename back");
        assert_eq!(var.dump(), before);
    }

    #[test]
    fn rename_epoch_preserves_ordering() {
        let runtime = MvccRuntime::with_defaults();
        let var = three_version_var(&runtime);
        // Moving stamp 2 above its successor stamp 3 must fail.
        assert!(matches!(
            var.core().rename_epoch(Epoch(2), Epoch(4)),
            Err(MvccError::InvariantViolation(_))
        ));
        assert_eq!(
            var.core().rename_epoch(Epoch(9), Epoch(8)),
            Err(MvccError::NotFound {
                valid_from: Epoch(9)
            })
        );
    }

    #[test]
    fn remap_rewrites_all_stamps_at_once() {
        let runtime = MvccRuntime::with_defaults();
        let var = three_version_var(&runtime);
        let core = var.core();

        // Live keys 2 and 3 collapse to 1 and 2.
        let remap = EpochRemap::build(vec![Epoch(2), Epoch(3)], Epoch(3));
        assert_eq!(core.remap_epochs(&remap), 2);
        let history = core.data.load();
        assert_eq!(history.entry(0).valid_to, Epoch(1));
        assert_eq!(history.entry(1).valid_to, Epoch(2));
        assert_eq!(history.entry(2).valid_to, Epoch::OPEN);

        // An identity map leaves the arena untouched.
        let identity = EpochRemap::build(vec![Epoch(1), Epoch(2)], Epoch(2));
        assert_eq!(core.remap_epochs(&identity), 0);
    }

    #[test]
    fn dump_lists_every_entry() {
        let runtime = MvccRuntime::with_defaults();
        let var = three_version_var(&runtime);
        let dump = var.dump();
        assert!(dump.contains("3 entries"));
        assert!(dump.contains("valid_to=open"));
        assert!(dump.contains("value=20"));
    }
}
