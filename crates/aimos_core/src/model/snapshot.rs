//! Snapshot domain model.
//!
//! # Invariants
//! - `id = sha256(canonical_json({ids, previous_id, note}))`.
//! - `atom_ids` keeps caller order; it is never re-sorted.
//! - `previous_id` points at the chain head that existed at creation time.

use crate::canonical::canonical_digest;
use crate::model::atom::AtomId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Aggregates computed when the snapshot is taken.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub atom_count: usize,
    /// Number of member atoms carrying each tag.
    pub tag_counts: BTreeMap<String, u64>,
}

/// Immutable, hash-chained commit over an ordered atom set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub atom_ids: Vec<AtomId>,
    pub previous_id: Option<String>,
    pub note: Option<String>,
    pub stats: SnapshotStats,
    #[serde(default)]
    pub witness: Value,
}

#[derive(Serialize)]
struct SnapshotDigestInput<'a> {
    ids: Vec<String>,
    previous_id: Option<&'a str>,
    note: Option<&'a str>,
}

/// Computes the snapshot id for the given chain position.
pub fn snapshot_digest(
    atom_ids: &[AtomId],
    previous_id: Option<&str>,
    note: Option<&str>,
) -> serde_json::Result<String> {
    canonical_digest(&SnapshotDigestInput {
        ids: atom_ids.iter().map(ToString::to_string).collect(),
        previous_id,
        note,
    })
}

impl Snapshot {
    /// Recomputes the digest from stored fields.
    pub fn expected_id(&self) -> serde_json::Result<String> {
        snapshot_digest(
            &self.atom_ids,
            self.previous_id.as_deref(),
            self.note.as_deref(),
        )
    }

    /// Whether the stored id still matches the stored fields.
    pub fn verify(&self) -> bool {
        self.expected_id()
            .map(|expected| expected == self.id)
            .unwrap_or(false)
    }
}
