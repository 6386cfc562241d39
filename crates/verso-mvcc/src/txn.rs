//! Transactions: snapshot lifecycle, the speculative write buffer, and the
//! two-phase commit across the write set.
//!
//! A [`Transaction`] owns a registered snapshot and a map from object
//! identity to a boxed speculative value. `commit` serializes on the
//! runtime's commit lock: every touched object is `setup` for
//! `current + 1`; one refusal rolls the others back in reverse order and
//! the commit reports `false`. On success the clock advances and each
//! participant hands its superseded version to the registry.
//!
//! After either outcome the snapshot is re-registered at the new current
//! epoch, so the same transaction can immediately retry or continue
//! against fresh state.
//!
//! The "current transaction" is a thread-local binding installed with
//! [`Transaction::make_current`] (or kept for a whole scope by
//! [`LocalTransaction`]); versioned objects consult it implicitly.

use crate::history::{Versioned, VersionedObject};
use crate::registry::SnapshotCore;
use crate::{MvccError, MvccRuntime, Result, RuntimeInner};
use parking_lot::Mutex;
use std::any::Any;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;
use tracing::{debug, error, trace};
use verso_types::{Epoch, ObjectId, SnapshotId, SnapshotStatus};

thread_local! {
    static CURRENT_TXN: RefCell<Option<Transaction>> = const { RefCell::new(None) };
}

pub(crate) struct WriteEntry {
    pub(crate) object: Arc<dyn VersionedObject>,
    pub(crate) value: Box<dyn Any + Send>,
}

struct TxnInner {
    runtime: Arc<RuntimeInner>,
    snapshot: Arc<SnapshotCore>,
    locals: Mutex<BTreeMap<ObjectId, WriteEntry>>,
}

impl Drop for TxnInner {
    fn drop(&mut self) {
        if let Err(err) = self.runtime.registry.remove_snapshot(&self.snapshot) {
            error!(
                target: "verso::mvcc::txn",
                snapshot = %self.snapshot.id(),
                %err,
                "snapshot_unregister_failed"
            );
        }
    }
}

/// A transaction handle. Clones share the same snapshot and write buffer;
/// the snapshot is unregistered when the last clone drops.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TxnInner>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("snapshot", &self.inner.snapshot.id())
            .field("epoch", &self.epoch())
            .field("status", &self.status())
            .field("pending_writes", &self.pending_writes())
            .finish()
    }
}

impl Transaction {
    /// Begin a transaction reading at `runtime`'s current epoch.
    ///
    /// # Errors
    ///
    /// Propagates registry invariant violations.
    pub fn begin(runtime: &MvccRuntime) -> Result<Self> {
        let runtime = Arc::clone(runtime.inner());
        let snapshot = Arc::new(SnapshotCore::new(runtime.next_snapshot_id()));
        runtime.registry.register_snapshot(&snapshot)?;
        snapshot.set_status(SnapshotStatus::Initialized);
        trace!(
            target: "verso::mvcc::txn",
            snapshot = %snapshot.id(),
            epoch = %snapshot.epoch(),
            "transaction_started"
        );
        Ok(Self {
            inner: Arc::new(TxnInner {
                runtime,
                snapshot,
                locals: Mutex::new(BTreeMap::new()),
            }),
        })
    }

    /// The transaction bound to this thread, if any.
    #[must_use]
    pub fn current() -> Option<Self> {
        CURRENT_TXN.with(|cell| cell.borrow().clone())
    }

    /// Bind this transaction to the thread until the guard drops; the
    /// previous binding (if any) is restored.
    #[must_use]
    pub fn make_current(&self) -> CurrentTxnGuard {
        let previous = CURRENT_TXN.with(|cell| cell.replace(Some(self.clone())));
        CurrentTxnGuard {
            previous,
            _not_send: PhantomData,
        }
    }

    /// The snapshot epoch this transaction reads at.
    #[must_use]
    pub fn epoch(&self) -> Epoch {
        self.inner.snapshot.epoch()
    }

    #[must_use]
    pub fn snapshot_id(&self) -> SnapshotId {
        self.inner.snapshot.id()
    }

    #[must_use]
    pub fn status(&self) -> SnapshotStatus {
        self.inner.snapshot.status()
    }

    /// Objects with a staged speculative value.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.inner.locals.lock().len()
    }

    /// The staged speculative value for `object`, if any.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` when the staged value has the wrong type.
    pub fn local_value<T>(&self, object: &Versioned<T>) -> Result<Option<T>>
    where
        T: Clone + fmt::Debug + Send + Sync + 'static,
    {
        self.local_value_of::<T>(object.object_id())
    }

    /// Attempt to commit the staged writes.
    ///
    /// Returns `Ok(false)` on a write-write conflict (every already-set-up
    /// participant is rolled back, nothing is mutated); the snapshot then
    /// reads the latest committed state, so the caller can retry at once.
    /// An empty write set commits trivially.
    ///
    /// # Errors
    ///
    /// `EpochOrder`, `NoSnapshots`, and `InvariantViolation` indicate
    /// engine bugs and are propagated.
    pub fn commit(&self) -> Result<bool> {
        let inner = &self.inner;
        let runtime = &inner.runtime;
        inner.snapshot.set_status(SnapshotStatus::Committing);

        let staged = std::mem::take(&mut *inner.locals.lock());
        if staged.is_empty() {
            inner.snapshot.set_status(SnapshotStatus::Committed);
            trace!(
                target: "verso::mvcc::txn",
                snapshot = %inner.snapshot.id(),
                "empty_commit"
            );
            return Ok(true);
        }

        let guard = runtime.commit_lock.lock();
        let old_epoch = inner.snapshot.epoch();
        let new_epoch = runtime.clock.current().next();

        let mut installed: Vec<Arc<dyn VersionedObject>> = Vec::with_capacity(staged.len());
        let mut conflict = false;
        let mut failure: Option<MvccError> = None;
        for (_, entry) in staged {
            match entry.object.setup(old_epoch, new_epoch, entry.value) {
                Ok(true) => installed.push(entry.object),
                Ok(false) => {
                    conflict = true;
                    break;
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if conflict || failure.is_some() {
            for object in installed.iter().rev() {
                object.rollback(new_epoch);
            }
            drop(guard);
            self.migrate_snapshot()?;
            inner.snapshot.set_status(SnapshotStatus::Failed);
            if let Some(err) = failure {
                return Err(err);
            }
            debug!(
                target: "verso::mvcc::txn",
                snapshot = %inner.snapshot.id(),
                old_epoch = %old_epoch,
                attempted = %new_epoch,
                "commit_conflict"
            );
            if let Some(hook) = &runtime.hooks.on_rollback {
                hook(new_epoch);
            }
            return Ok(false);
        }

        let advanced = runtime.clock.advance();
        debug_assert_eq!(advanced, new_epoch);
        let mut commit_failure = None;
        for object in &installed {
            if let Err(err) = object.commit_version(new_epoch) {
                commit_failure = Some(err);
                break;
            }
        }
        drop(guard);

        if let Some(err) = commit_failure {
            inner.snapshot.set_status(SnapshotStatus::Failed);
            return Err(err);
        }
        self.migrate_snapshot()?;
        inner.snapshot.set_status(SnapshotStatus::Committed);
        debug!(
            target: "verso::mvcc::txn",
            snapshot = %inner.snapshot.id(),
            epoch = %new_epoch,
            participants = installed.len(),
            "transaction_committed"
        );
        if let Some(hook) = &runtime.hooks.on_commit {
            hook(new_epoch);
        }
        runtime.maybe_compress_after_commit();
        Ok(true)
    }

    /// Migrate the snapshot to the current epoch, keeping any staged
    /// writes. After a failed commit this makes the next read observe the
    /// latest committed state.
    ///
    /// # Errors
    ///
    /// Propagates registry invariant violations.
    pub fn restart(&self) -> Result<()> {
        self.migrate_snapshot()?;
        self.inner.snapshot.set_status(SnapshotStatus::Initialized);
        Ok(())
    }

    fn migrate_snapshot(&self) -> Result<()> {
        let inner = &self.inner;
        inner.snapshot.set_status(SnapshotStatus::Restarting);
        inner.runtime.registry.remove_snapshot(&inner.snapshot)?;
        inner.runtime.registry.register_snapshot(&inner.snapshot)?;
        Ok(())
    }

    pub(crate) fn runtime_inner(&self) -> &Arc<RuntimeInner> {
        &self.inner.runtime
    }

    /// Run `f` on the staged value for `object`, inserting `seed()` first
    /// when nothing is staged yet.
    pub(crate) fn with_local<T, R>(
        &self,
        object: Arc<dyn VersionedObject>,
        seed: impl FnOnce() -> T,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R>
    where
        T: Send + 'static,
    {
        let id = object.object_id();
        let mut locals = self.inner.locals.lock();
        let entry = locals.entry(id).or_insert_with(move || WriteEntry {
            object,
            value: Box::new(seed()),
        });
        let value = entry
            .value
            .downcast_mut::<T>()
            .ok_or_else(|| MvccError::invariant("staged value has the wrong type"))?;
        Ok(f(value))
    }

    pub(crate) fn insert_local<T: Send + 'static>(
        &self,
        object: Arc<dyn VersionedObject>,
        value: T,
    ) {
        let id = object.object_id();
        self.inner
            .locals
            .lock()
            .insert(id, WriteEntry {
                object,
                value: Box::new(value),
            });
        trace!(
            target: "verso::mvcc::txn",
            snapshot = %self.inner.snapshot.id(),
            object = %id,
            "local_value_staged"
        );
    }

    pub(crate) fn local_value_of<T: Clone + 'static>(&self, id: ObjectId) -> Result<Option<T>> {
        let locals = self.inner.locals.lock();
        match locals.get(&id) {
            None => Ok(None),
            Some(entry) => entry
                .value
                .downcast_ref::<T>()
                .map(|value| Some(value.clone()))
                .ok_or_else(|| MvccError::invariant("staged value has the wrong type")),
        }
    }
}

/// Restores the previous thread binding on drop. Not `Send`: the binding
/// belongs to the thread that created it.
pub struct CurrentTxnGuard {
    previous: Option<Transaction>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for CurrentTxnGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_TXN.with(|cell| *cell.borrow_mut() = previous);
    }
}

/// A transaction bound to the current thread for its whole lifetime.
///
/// Guarantees the thread binding is removed and the snapshot released on
/// every exit path, including panics.
pub struct LocalTransaction {
    // Declaration order matters: the binding is removed before the
    // transaction (and with it the snapshot) is dropped.
    _guard: CurrentTxnGuard,
    txn: Transaction,
}

impl LocalTransaction {
    /// Begin a transaction and bind it to this thread.
    ///
    /// # Errors
    ///
    /// Propagates registry invariant violations.
    pub fn begin(runtime: &MvccRuntime) -> Result<Self> {
        let txn = Transaction::begin(runtime)?;
        let guard = txn.make_current();
        Ok(Self { _guard: guard, txn })
    }
}

impl Deref for LocalTransaction {
    type Target = Transaction;

    fn deref(&self) -> &Transaction {
        &self.txn
    }
}

impl fmt::Debug for LocalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.txn.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_registers_and_drop_unregisters() {
        let runtime = MvccRuntime::with_defaults();
        let txn = runtime.begin().expect("begin");
        assert_eq!(txn.status(), SnapshotStatus::Initialized);
        assert_eq!(runtime.registry_stats().snapshots, 1);
        drop(txn);
        assert_eq!(runtime.registry_stats().snapshots, 0);
    }

    #[test]
    fn reads_and_writes_flow_through_the_local_buffer() {
        let runtime = MvccRuntime::with_defaults();
        let var = runtime.versioned(0_i32);

        let ltx = LocalTransaction::begin(&runtime).expect("begin");
        assert_eq!(var.read().expect("read"), 0);
        assert_eq!(ltx.local_value(&var).expect("local"), None);

        var.write(5).expect("write");
        assert_eq!(var.read().expect("read"), 5, "speculative value wins");
        assert_eq!(ltx.local_value(&var).expect("local"), Some(5));
        assert_eq!(ltx.pending_writes(), 1);

        assert!(ltx.commit().expect("commit"));
        assert_eq!(ltx.pending_writes(), 0, "commit consumes the buffer");
        assert_eq!(var.read().expect("read"), 5);
        drop(ltx);

        assert_eq!(runtime.registry_stats().snapshots, 0);
        assert_eq!(var.history_size(), 0, "superseded version reclaimed");
    }

    #[test]
    fn mutate_seeds_from_the_snapshot() {
        let runtime = MvccRuntime::with_defaults();
        let var = runtime.versioned(40_i32);
        let ltx = LocalTransaction::begin(&runtime).expect("begin");
        let seen = var.mutate(|v| {
            *v += 2;
            *v
        });
        assert_eq!(seen.expect("mutate"), 42);
        assert!(ltx.commit().expect("commit"));
        assert_eq!(var.read().expect("read"), 42);
    }

    #[test]
    fn operations_outside_a_transaction() {
        let runtime = MvccRuntime::with_defaults();
        let var = runtime.versioned(3_i32);
        assert_eq!(var.read().expect("external read"), 3);
        assert_eq!(var.mutate(|v| *v += 1), Err(MvccError::NoTransaction));
        assert_eq!(var.write(9), Err(MvccError::NoTransaction));
    }

    #[test]
    fn empty_commit_is_trivially_true_and_keeps_the_clock() {
        let runtime = MvccRuntime::with_defaults();
        let before = runtime.current_epoch();
        let ltx = LocalTransaction::begin(&runtime).expect("begin");
        assert!(ltx.commit().expect("commit"));
        assert_eq!(runtime.current_epoch(), before);
        assert_eq!(ltx.status(), SnapshotStatus::Committed);
    }

    #[test]
    fn conflicting_commit_returns_false_then_retries() {
        let runtime = MvccRuntime::with_defaults();
        let var = runtime.versioned(0_i32);
        let t1 = runtime.begin().expect("t1");
        let t2 = runtime.begin().expect("t2");

        {
            let _cur = t1.make_current();
            var.mutate(|v| *v += 1).expect("mutate");
            assert!(t1.commit().expect("t1 commit"));
        }

        {
            let _cur = t2.make_current();
            assert_eq!(var.read().expect("stale read"), 0);
            var.mutate(|v| *v += 1).expect("mutate");
            assert!(!t2.commit().expect("t2 conflicts"), "write-write conflict");
            assert_eq!(t2.status(), SnapshotStatus::Failed);

            // The failed commit migrated the snapshot: the retry sees the
            // winner's value and succeeds.
            assert_eq!(var.read().expect("fresh read"), 1);
            var.mutate(|v| *v += 1).expect("mutate");
            assert!(t2.commit().expect("t2 retry"));
            assert_eq!(var.read().expect("read"), 2);
        }
    }

    #[test]
    fn failed_commit_leaves_participant_histories_untouched() {
        let runtime = MvccRuntime::with_defaults();
        let a = runtime.versioned(0_i32);
        let b = runtime.versioned(0_i32);
        let winner = runtime.begin().expect("winner");
        let loser = runtime.begin().expect("loser");

        {
            let _cur = winner.make_current();
            b.mutate(|v| *v += 10).expect("mutate");
            assert!(winner.commit().expect("commit"));
        }

        let a_dump = a.dump();
        let b_dump = b.dump();
        {
            let _cur = loser.make_current();
            // Commit order follows object identity: a sets up cleanly,
            // then b conflicts and a must be rolled back.
            a.mutate(|v| *v += 1).expect("mutate");
            b.mutate(|v| *v += 1).expect("mutate");
            assert!(!loser.commit().expect("conflict"));
        }
        assert_eq!(a.dump(), a_dump, "setup on a was rolled back");
        assert_eq!(b.dump(), b_dump, "loser never mutated b");
    }

    #[test]
    fn nested_bindings_restore_the_outer_transaction() {
        let runtime = MvccRuntime::with_defaults();
        let outer = runtime.begin().expect("outer");
        let inner = runtime.begin().expect("inner");

        let _outer_guard = outer.make_current();
        assert_eq!(
            Transaction::current().expect("bound").snapshot_id(),
            outer.snapshot_id()
        );
        {
            let _inner_guard = inner.make_current();
            assert_eq!(
                Transaction::current().expect("bound").snapshot_id(),
                inner.snapshot_id()
            );
        }
        assert_eq!(
            Transaction::current().expect("restored").snapshot_id(),
            outer.snapshot_id()
        );
    }

    #[test]
    fn objects_reject_transactions_from_another_runtime() {
        let runtime_a = MvccRuntime::with_defaults();
        let runtime_b = MvccRuntime::with_defaults();
        let foreign = runtime_b.versioned(1_i32);

        let _ltx = LocalTransaction::begin(&runtime_a).expect("begin");
        assert!(matches!(
            foreign.read(),
            Err(MvccError::InvariantViolation(_))
        ));
        assert!(matches!(
            foreign.write(2),
            Err(MvccError::InvariantViolation(_))
        ));
    }

    #[test]
    fn explicit_restart_migrates_the_snapshot() {
        let runtime = MvccRuntime::with_defaults();
        let var = runtime.versioned(0_i32);
        let stale = runtime.begin().expect("stale");

        {
            let writer = LocalTransaction::begin(&runtime).expect("writer");
            var.write(7).expect("write");
            assert!(writer.commit().expect("commit"));
        }

        {
            let _cur = stale.make_current();
            assert_eq!(var.read().expect("old view"), 0);
        }
        stale.restart().expect("restart");
        {
            let _cur = stale.make_current();
            assert_eq!(var.read().expect("fresh view"), 7);
        }
    }
}
