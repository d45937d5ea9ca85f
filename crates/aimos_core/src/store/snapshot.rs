//! Hash-chained snapshots (C3).
//!
//! # Responsibility
//! - Decide whether a snapshot request yields a new commit or an existing one.
//! - Replay a snapshot's atoms in stored order.
//!
//! # Invariants
//! - Re-snapshotting the current head's exact ids and note returns the head.
//! - A new snapshot's `previous_id` is the head at creation time.
//! - Replay fails with `SnapshotReplay` on the first member that no longer
//!   resolves; unknown snapshot ids fail with `SnapshotMissing`.
//!
//! Backends call [`plan_snapshot`] inside their own write critical section so
//! reading the head and appending the new commit is one atomic step.

use super::{AtomStore, StoreError, StoreResult};
use crate::model::atom::{Atom, AtomId};
use crate::model::snapshot::{snapshot_digest, Snapshot, SnapshotStats};
use chrono::Utc;
use serde_json::json;

/// Outcome of planning a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotPlan {
    /// Identical commit already exists; nothing to persist.
    Existing(Snapshot),
    New(Snapshot),
}

/// Builds the next snapshot relative to `latest`.
///
/// `find_existing` looks up a snapshot by id; `tag_keys` returns the tag keys
/// of a member atom (empty when the atom is unknown).
pub(crate) fn plan_snapshot<F, T>(
    latest: Option<&Snapshot>,
    atom_ids: Vec<AtomId>,
    note: Option<String>,
    find_existing: F,
    mut tag_keys: T,
) -> StoreResult<SnapshotPlan>
where
    F: FnOnce(&str) -> StoreResult<Option<Snapshot>>,
    T: FnMut(&AtomId) -> StoreResult<Vec<String>>,
{
    if let Some(head) = latest {
        if head.atom_ids == atom_ids && head.note == note {
            return Ok(SnapshotPlan::Existing(head.clone()));
        }
    }

    let previous_id = latest.map(|head| head.id.clone());
    let id = snapshot_digest(&atom_ids, previous_id.as_deref(), note.as_deref())?;
    if let Some(existing) = find_existing(&id)? {
        return Ok(SnapshotPlan::Existing(existing));
    }

    let mut stats = SnapshotStats {
        atom_count: atom_ids.len(),
        ..SnapshotStats::default()
    };
    for atom_id in &atom_ids {
        for key in tag_keys(atom_id)? {
            *stats.tag_counts.entry(key).or_insert(0) += 1;
        }
    }

    let witness = json!({
        "atom_count": atom_ids.len(),
        "previous_id": previous_id,
    });
    Ok(SnapshotPlan::New(Snapshot {
        id,
        created_at: Utc::now(),
        atom_ids,
        previous_id,
        note,
        stats,
        witness,
    }))
}

/// Starts a lazy replay of snapshot `id`.
pub fn replay_snapshot<'s>(store: &'s dyn AtomStore, id: &str) -> StoreResult<SnapshotReplay<'s>> {
    SnapshotReplay::start(store, id)
}

/// Iterator over the atoms of one snapshot, in stored order.
pub struct SnapshotReplay<'s> {
    store: &'s dyn AtomStore,
    snapshot: Snapshot,
    position: usize,
    failed: bool,
}

impl<'s> SnapshotReplay<'s> {
    pub fn start(store: &'s dyn AtomStore, id: &str) -> StoreResult<Self> {
        let snapshot = store
            .get_snapshot(id)?
            .ok_or_else(|| StoreError::SnapshotMissing(id.to_string()))?;
        Ok(Self {
            store,
            snapshot,
            position: 0,
            failed: false,
        })
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }
}

impl Iterator for SnapshotReplay<'_> {
    type Item = StoreResult<Atom>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let atom_id = *self.snapshot.atom_ids.get(self.position)?;
        self.position += 1;
        let result = match self.store.get_atom(atom_id) {
            Ok(Some(atom)) => Ok(atom),
            Ok(None) => Err(StoreError::SnapshotReplay {
                snapshot_id: self.snapshot.id.clone(),
                atom_id,
            }),
            Err(err) => Err(err),
        };
        if result.is_err() {
            self.failed = true;
        }
        Some(result)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.snapshot.atom_ids.len().saturating_sub(self.position);
        (0, Some(remaining))
    }
}
