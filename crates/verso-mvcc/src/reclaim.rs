//! Deferred reclamation of superseded history arenas.
//!
//! Every destructor is tagged with the epoch that was current when its
//! arena was replaced. It runs no earlier than the moment the earliest
//! live snapshot epoch passes that tag, exactly once, on whichever thread
//! triggers the sweep. Destructors are grouped into per-epoch buckets;
//! a sweep pops every bucket below the new floor and runs its contents
//! with the bucket lock released.
//!
//! A destructor that panics is caught, logged at `error!`, and swallowed —
//! one failure never blocks the remaining reclamations.

use crate::compress::EpochRemap;
use crate::EpochClock;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, trace};
use verso_types::Epoch;

pub(crate) type Destructor = Box<dyn FnOnce() + Send>;

/// Monotonic reclamation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimerStats {
    /// Destructors handed to the reclaimer since creation.
    pub scheduled_total: u64,
    /// Destructors that have run (including panicked ones).
    pub completed_total: u64,
}

impl ReclaimerStats {
    #[must_use]
    pub fn pending(self) -> u64 {
        self.scheduled_total.saturating_sub(self.completed_total)
    }
}

/// Epoch-bucketed destructor queue.
pub struct DeferredReclaimer {
    clock: Arc<EpochClock>,
    buckets: Mutex<BTreeMap<Epoch, Vec<Destructor>>>,
    scheduled_total: AtomicU64,
    completed_total: AtomicU64,
}

impl std::fmt::Debug for DeferredReclaimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("DeferredReclaimer")
            .field("scheduled_total", &stats.scheduled_total)
            .field("completed_total", &stats.completed_total)
            .field("pending", &stats.pending())
            .finish()
    }
}

impl DeferredReclaimer {
    pub(crate) fn new(clock: Arc<EpochClock>) -> Self {
        Self {
            clock,
            buckets: Mutex::new(BTreeMap::new()),
            scheduled_total: AtomicU64::new(0),
            completed_total: AtomicU64::new(0),
        }
    }

    /// Enqueue `destructor` to run once `earliest_epoch > tag`.
    pub(crate) fn schedule(&self, tag: Epoch, destructor: Destructor) {
        self.buckets.lock().entry(tag).or_default().push(destructor);
        self.scheduled_total.fetch_add(1, Ordering::Relaxed);
        trace!(target: "verso::mvcc::reclaim", tag = %tag, "destructor_scheduled");
    }

    /// Run every bucket that has fallen below the earliest live epoch.
    ///
    /// The floor is sampled while the bucket lock is held, so it is never
    /// paired with tags from a different epoch numbering (the compressor
    /// rewrites tags and floor inside the same critical section).
    pub(crate) fn collect(&self) {
        let due: Vec<Destructor> = {
            let mut buckets = self.buckets.lock();
            let floor = self.clock.earliest();
            let keep = buckets.split_off(&floor);
            let expired = std::mem::replace(&mut *buckets, keep);
            expired.into_values().flatten().collect()
        };
        if due.is_empty() {
            return;
        }
        trace!(
            target: "verso::mvcc::reclaim",
            count = due.len(),
            "sweep_started"
        );
        self.run_all(due);
    }

    /// Run everything regardless of tag. Shutdown path; callers must
    /// guarantee no snapshot can still observe the retired values.
    pub(crate) fn drain(&self) {
        let due: Vec<Destructor> = {
            let mut buckets = self.buckets.lock();
            std::mem::take(&mut *buckets).into_values().flatten().collect()
        };
        self.run_all(due);
    }

    /// Rewrite bucket tags through the compressor's epoch map and install
    /// the post-pass reclamation floor in the same critical section, so a
    /// concurrent `collect` sees tags and floor from one numbering.
    pub(crate) fn apply_compression(&self, remap: &EpochRemap, new_earliest: Epoch) {
        let mut buckets = self.buckets.lock();
        let old = std::mem::take(&mut *buckets);
        for (tag, destructors) in old {
            buckets
                .entry(remap.map(tag))
                .or_default()
                .extend(destructors);
        }
        self.clock.set_earliest(new_earliest);
    }

    fn run_all(&self, due: Vec<Destructor>) {
        for destructor in due {
            if catch_unwind(AssertUnwindSafe(destructor)).is_err() {
                error!(
                    target: "verso::mvcc::reclaim",
                    "destructor_panicked"
                );
            }
            self.completed_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn stats(&self) -> ReclaimerStats {
        ReclaimerStats {
            scheduled_total: self.scheduled_total.load(Ordering::Relaxed),
            completed_total: self.completed_total.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn reclaimer_at(epoch: Epoch) -> (DeferredReclaimer, Arc<EpochClock>) {
        let clock = Arc::new(EpochClock::new(epoch));
        (DeferredReclaimer::new(Arc::clone(&clock)), clock)
    }

    fn counting(ran: &Arc<AtomicUsize>) -> Destructor {
        let ran = Arc::clone(ran);
        Box::new(move || {
            ran.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn collect_runs_only_expired_buckets() {
        let (reclaimer, clock) = reclaimer_at(Epoch(10));
        let ran = Arc::new(AtomicUsize::new(0));
        for tag in [5_u64, 9, 10, 12] {
            reclaimer.schedule(Epoch(tag), counting(&ran));
        }

        reclaimer.collect();
        assert_eq!(ran.load(Ordering::SeqCst), 2, "tags 5 and 9 expire below 10");
        assert_eq!(reclaimer.stats().pending(), 2);

        clock.set_earliest(Epoch(13));
        reclaimer.collect();
        assert_eq!(ran.load(Ordering::SeqCst), 4);
        assert_eq!(reclaimer.stats().pending(), 0);
    }

    #[test]
    fn each_destructor_runs_exactly_once() {
        let (reclaimer, clock) = reclaimer_at(Epoch(1));
        let ran = Arc::new(AtomicUsize::new(0));
        reclaimer.schedule(Epoch(1), counting(&ran));

        clock.set_earliest(Epoch(2));
        reclaimer.collect();
        reclaimer.collect();
        reclaimer.drain();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_destructor_does_not_block_the_rest() {
        let (reclaimer, clock) = reclaimer_at(Epoch(1));
        let ran = Arc::new(AtomicUsize::new(0));
        reclaimer.schedule(Epoch(1), Box::new(|| panic!("boom")));
        reclaimer.schedule(Epoch(1), counting(&ran));

        clock.set_earliest(Epoch(2));
        reclaimer.collect();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(reclaimer.stats().completed_total, 2);
    }

    #[test]
    fn drain_runs_everything() {
        let (reclaimer, _clock) = reclaimer_at(Epoch(1));
        let ran = Arc::new(AtomicUsize::new(0));
        for tag in 1..=4_u64 {
            reclaimer.schedule(Epoch(tag * 100), counting(&ran));
        }
        reclaimer.drain();
        assert_eq!(ran.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn remapped_tags_expire_under_the_new_numbering() {
        let (reclaimer, clock) = reclaimer_at(Epoch(600));
        let ran = Arc::new(AtomicUsize::new(0));
        reclaimer.schedule(Epoch(600), counting(&ran));

        // 600 was the only live key: it becomes 1, and the floor lands
        // with it.
        let remap = EpochRemap::build(vec![Epoch(600)], Epoch(600));
        reclaimer.apply_compression(&remap, Epoch(1));
        reclaimer.collect();
        assert_eq!(ran.load(Ordering::SeqCst), 0, "still observable at floor 1");

        clock.set_earliest(Epoch(2));
        reclaimer.collect();
        assert_eq!(ran.load(Ordering::SeqCst), 1, "bucket now keyed at 1");
    }
}
