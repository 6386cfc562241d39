//! Epoch compression: rewriting live epochs into a dense range starting at
//! 1 so the counter never exhausts.
//!
//! A pass serializes with commits on the commit lock, quiesces in-flight
//! cleanup executions through the registry's exec gate, and then rewrites —
//! under the registry lock — every object history, every pending cleanup
//! stamp, every live snapshot epoch, the registry keys, the reclaimer's
//! bucket tags, and finally the clock itself.
//!
//! Visibility is purely order-based, so any order-preserving map is
//! correct. The map sends each live registry key to its rank (1-based) and
//! every other epoch to the image of the smallest live key at or above it
//! (or to the new current epoch when none exists): a commit stamp between
//! two adjacent live keys is indistinguishable, to every surviving
//! snapshot, from the upper key itself.
//!
//! Each object's stamps move in a single arena replacement, so a concurrent
//! reader sees either the old numbering or the new one, never a mix; the
//! runtime's compression generation counter (odd while a pass is in
//! flight) lets readers pair their snapshot epoch with a matching arena.

use crate::registry::SnapshotRegistry;
use crate::{Result, RuntimeInner};
use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use tracing::info;
use verso_types::{Epoch, ObjectId};

/// Order-preserving map from the pre-pass epoch numbering to the dense
/// post-pass numbering. Reserved values map to themselves.
#[derive(Debug, Clone)]
pub struct EpochRemap {
    /// Live registry keys, ascending.
    keys: Vec<Epoch>,
    new_current: Epoch,
}

impl EpochRemap {
    pub(crate) fn build(keys: Vec<Epoch>, current: Epoch) -> Self {
        debug_assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
        let n = u64::try_from(keys.len()).expect("live epoch count fits in u64");
        let new_current = if keys.last() == Some(&current) {
            Epoch(n)
        } else {
            Epoch(n + 1)
        };
        Self { keys, new_current }
    }

    /// Map one epoch into the dense numbering.
    #[must_use]
    pub fn map(&self, epoch: Epoch) -> Epoch {
        if epoch.is_sentinel() || epoch.is_open() {
            return epoch;
        }
        let rank = match self.keys.binary_search(&epoch) {
            Ok(i) | Err(i) if i < self.keys.len() => i,
            _ => return self.new_current,
        };
        Epoch(u64::try_from(rank).expect("epoch rank fits in u64") + 1)
    }

    /// The current epoch after the pass.
    #[must_use]
    pub fn new_current(&self) -> Epoch {
        self.new_current
    }

    /// Number of live keys the map was built from.
    #[must_use]
    pub fn live_epochs(&self) -> usize {
        self.keys.len()
    }
}

/// Report of one compression pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPass {
    /// Distinct live snapshot epochs at the start of the pass.
    pub live_epochs: usize,
    /// Objects whose histories were restamped.
    pub objects_remapped: usize,
    /// History stamps that changed value.
    pub stamps_renamed: usize,
    /// Live snapshots moved to a new epoch.
    pub snapshots_restamped: usize,
    pub current_before: Epoch,
    pub current_after: Epoch,
}

pub(crate) fn run_compression(inner: &RuntimeInner) -> Result<CompressionPass> {
    let commit_guard = inner.commit_lock.lock();
    let gate = inner.registry.exec_gate.write();

    let pass = {
        let mut entries = inner.registry.entries.lock();
        let current_before = inner.clock.current();
        let keys: Vec<Epoch> = entries.keys().copied().collect();
        let live_epochs = keys.len();
        let remap = EpochRemap::build(keys, current_before);

        // Readers pairing a snapshot epoch with an arena retry while the
        // generation is odd.
        inner.compression_gen.fetch_add(1, Ordering::AcqRel);

        // The cleanup lists index every object that still holds history:
        // each superseded version is parked on exactly one of them.
        let mut seen: BTreeSet<ObjectId> = BTreeSet::new();
        let mut objects_remapped = 0_usize;
        let mut stamps_renamed = 0_usize;
        for entry in entries.values() {
            for pending in &entry.cleanups {
                if seen.insert(pending.object.object_id()) {
                    stamps_renamed += pending.object.remap_epochs(&remap);
                    objects_remapped += 1;
                }
            }
        }

        let mut snapshots_restamped = 0_usize;
        let old = std::mem::take(&mut *entries);
        for (key, mut entry) in old {
            let new_key = remap.map(key);
            snapshots_restamped += SnapshotRegistry::restamp_entry(&entry, new_key);
            for pending in &mut entry.cleanups {
                pending.valid_from = remap.map(pending.valid_from);
            }
            let slot = entries.entry(new_key).or_default();
            slot.snapshots.append(&mut entry.snapshots);
            slot.cleanups.append(&mut entry.cleanups);
        }

        let current_after = remap.map(current_before);
        inner.clock.store_current(current_after);
        let earliest_after = entries.keys().next().copied().unwrap_or(current_after);
        inner.reclaimer.apply_compression(&remap, earliest_after);

        inner.compression_gen.fetch_add(1, Ordering::AcqRel);

        CompressionPass {
            live_epochs,
            objects_remapped,
            stamps_renamed,
            snapshots_restamped,
            current_before,
            current_after,
        }
    };

    drop(gate);
    drop(commit_guard);

    info!(
        target: "verso::mvcc::compress",
        live_epochs = pass.live_epochs,
        objects = pass.objects_remapped,
        stamps = pass.stamps_renamed,
        snapshots = pass.snapshots_restamped,
        from = %pass.current_before,
        to = %pass.current_after,
        "epochs_compressed"
    );
    if let Some(hook) = &inner.hooks.on_compression {
        hook(&pass);
    }
    Ok(pass)
}
