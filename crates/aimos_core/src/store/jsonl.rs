//! Journal-backed (JSONL) atom store backend.
//!
//! # Responsibility
//! - Persist atoms and snapshots as framed records in `atoms.log` and
//!   `snapshots.log` under the data root.
//! - Rebuild offsets, insertion order, the tag index and snapshot membership
//!   by replaying both journals at open.
//! - Mirror the tag index to `index/tags/<tag>.json` for external readers.
//!
//! # Invariants
//! - Journals are the source of truth; every in-memory structure is derived.
//! - A damaged journal is quarantined, counted as a write error and the
//!   operation fails. Nothing is silently skipped.
//! - All mutation happens under one state mutex, so snapshot planning sees a
//!   stable chain head.

use super::cache::{AtomCache, DEFAULT_CAPACITY};
use super::snapshot::{plan_snapshot, SnapshotPlan};
use super::{
    ensure_layout, prepare_atom, record_write_failure, AtomListQuery, AtomStore, PreparedAtom,
    StoreError, StoreResult, QUARANTINE_DIR, TAG_INDEX_DIR,
};
use crate::canonical::sha256_hex;
use crate::config::BackendKind;
use crate::journal::{quarantine_corruption, Journal, JournalError};
use crate::metrics::StoreMetrics;
use crate::model::atom::{Atom, AtomId, NewAtom, TagMap};
use crate::model::snapshot::Snapshot;
use log::{error, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

pub const ATOMS_LOG: &str = "atoms.log";
pub const SNAPSHOTS_LOG: &str = "snapshots.log";

/// Tunables for [`JsonlAtomStore::open_with`].
#[derive(Debug, Clone)]
pub struct JsonlOptions {
    /// Decoded atoms kept in the LRU cache.
    pub cache_capacity: usize,
    pub metrics: Arc<StoreMetrics>,
}

impl Default for JsonlOptions {
    fn default() -> Self {
        Self {
            cache_capacity: DEFAULT_CAPACITY,
            metrics: Arc::new(StoreMetrics::new()),
        }
    }
}

/// Per-atom facts kept in memory so filters never touch the journal.
#[derive(Debug, Clone)]
struct AtomEntry {
    offset: u64,
    modality: String,
    tags: TagMap,
}

struct JsonlState {
    atoms_log: Journal,
    snapshots_log: Journal,
    order: Vec<AtomId>,
    entries: HashMap<AtomId, AtomEntry>,
    tag_index: BTreeMap<String, Vec<AtomId>>,
    snapshots: Vec<Snapshot>,
    snapshot_positions: HashMap<String, usize>,
    memberships: HashMap<AtomId, Vec<String>>,
    cache: AtomCache,
}

impl JsonlState {
    fn index_atom(&mut self, offset: u64, atom: &Atom) {
        self.order.push(atom.id);
        for key in atom.tags.keys() {
            self.tag_index
                .entry(key.to_string())
                .or_default()
                .push(atom.id);
        }
        self.entries.insert(
            atom.id,
            AtomEntry {
                offset,
                modality: atom.modality.clone(),
                tags: atom.tags.clone(),
            },
        );
    }

    fn index_snapshot(&mut self, snapshot: Snapshot) {
        for atom_id in &snapshot.atom_ids {
            let memberships = self.memberships.entry(*atom_id).or_default();
            if !memberships.contains(&snapshot.id) {
                memberships.push(snapshot.id.clone());
            }
            self.cache.invalidate(atom_id);
        }
        self.snapshot_positions
            .insert(snapshot.id.clone(), self.snapshots.len());
        self.snapshots.push(snapshot);
    }

    fn with_memberships(&self, mut atom: Atom) -> Atom {
        atom.snapshot_ids = self.memberships.get(&atom.id).cloned().unwrap_or_default();
        atom
    }
}

/// Atom store persisted as append-only journals plus derived indexes.
pub struct JsonlAtomStore {
    root: PathBuf,
    metrics: Arc<StoreMetrics>,
    state: Mutex<JsonlState>,
}

impl JsonlAtomStore {
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with(root, JsonlOptions::default())
    }

    pub fn open_with(root: impl AsRef<Path>, options: JsonlOptions) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        let started_at = Instant::now();
        ensure_layout(&root)?;
        let metrics = options.metrics;

        let mut atoms_log = Journal::open(root.join(ATOMS_LOG))?;
        let mut snapshots_log = Journal::open(root.join(SNAPSHOTS_LOG))?;

        let atom_records = atoms_log
            .read_all::<Atom>()
            .map_err(|err| fail_on_journal(&root, &metrics, "replay_atoms", err))?;
        let snapshot_records = snapshots_log
            .read_all::<Snapshot>()
            .map_err(|err| fail_on_journal(&root, &metrics, "replay_snapshots", err))?;

        let mut state = JsonlState {
            atoms_log,
            snapshots_log,
            order: Vec::with_capacity(atom_records.len()),
            entries: HashMap::with_capacity(atom_records.len()),
            tag_index: BTreeMap::new(),
            snapshots: Vec::with_capacity(snapshot_records.len()),
            snapshot_positions: HashMap::new(),
            memberships: HashMap::new(),
            cache: AtomCache::new(options.cache_capacity),
        };
        for (offset, atom) in &atom_records {
            state.index_atom(*offset, atom);
        }
        for (_, snapshot) in snapshot_records {
            state.index_snapshot(snapshot);
        }

        info!(
            "event=store_open module=store status=ok backend=jsonl atoms={} snapshots={} duration_ms={}",
            state.order.len(),
            state.snapshots.len(),
            started_at.elapsed().as_millis()
        );
        Ok(Self {
            root,
            metrics,
            state: Mutex::new(state),
        })
    }

    fn persist_atom(&self, state: &mut JsonlState, prepared: &PreparedAtom) -> StoreResult<u64> {
        if let Some(plan) = &prepared.offloaded {
            plan.write()?;
        }
        Ok(state.atoms_log.append(&prepared.atom)?)
    }

    fn load_atom(&self, state: &mut JsonlState, id: AtomId) -> StoreResult<Option<Atom>> {
        if let Some(atom) = state.cache.get(&id) {
            return Ok(Some(state.with_memberships(atom)));
        }
        let Some(offset) = state.entries.get(&id).map(|entry| entry.offset) else {
            return Ok(None);
        };
        let atom: Atom = state
            .atoms_log
            .read_at(offset)
            .map_err(|err| fail_on_journal(&self.root, &self.metrics, "read_atom", err))?;
        state.cache.put(atom.clone());
        Ok(Some(state.with_memberships(atom)))
    }

    /// Rewrites `index/tags/<tag>.json` for every tag of a new atom.
    fn write_tag_index(&self, state: &JsonlState, tags: &TagMap) {
        for key in tags.keys() {
            let ids = state.tag_index.get(key).cloned().unwrap_or_default();
            if let Err(err) = write_tag_file(&self.root, key, &ids) {
                // The journal already holds the atom; the file is rebuilt on the next write.
                warn!(
                    "event=tag_index_write module=store status=warn backend=jsonl tag={} error={}",
                    key, err
                );
            }
        }
    }
}

impl AtomStore for JsonlAtomStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Jsonl
    }

    fn data_root(&self) -> &Path {
        &self.root
    }

    fn metrics(&self) -> &Arc<StoreMetrics> {
        &self.metrics
    }

    fn create_atom(&self, payload: NewAtom) -> StoreResult<Atom> {
        let prepared = prepare_atom(payload, &self.root)?;
        let mut state = self.state.lock();
        let offset = match self.persist_atom(&mut state, &prepared) {
            Ok(offset) => offset,
            Err(err) => {
                if let Some(plan) = &prepared.offloaded {
                    plan.discard();
                }
                return Err(record_write_failure(&self.metrics, "create_atom", err));
            }
        };

        let atom = prepared.atom;
        state.index_atom(offset, &atom);
        state.cache.put(atom.clone());
        self.write_tag_index(&state, &atom.tags);
        drop(state);

        self.metrics.record_atom_created(&atom.modality);
        info!(
            "event=create_atom module=store status=ok backend=jsonl atom_id={} modality={} offset={}",
            atom.id, atom.modality, offset
        );
        Ok(atom)
    }

    fn get_atom(&self, id: AtomId) -> StoreResult<Option<Atom>> {
        let mut state = self.state.lock();
        self.load_atom(&mut state, id)
    }

    fn list_atoms(&self, query: &AtomListQuery) -> StoreResult<Vec<Atom>> {
        let mut state = self.state.lock();
        let candidates: Vec<AtomId> = match &query.as_of_snapshot {
            Some(snapshot_id) => {
                let position = state
                    .snapshot_positions
                    .get(snapshot_id)
                    .copied()
                    .ok_or_else(|| StoreError::SnapshotMissing(snapshot_id.clone()))?;
                state.snapshots[position].atom_ids.clone()
            }
            None => state.order.clone(),
        };

        let selected: Vec<AtomId> = candidates
            .into_iter()
            .filter(|id| match state.entries.get(id) {
                Some(entry) => {
                    query.tag.as_deref().map_or(true, |tag| entry.tags.contains(tag))
                        && query
                            .modality
                            .as_deref()
                            .map_or(true, |modality| entry.modality == modality)
                }
                None => false,
            })
            .skip(query.offset as usize)
            .take(query.limit.map_or(usize::MAX, |limit| limit as usize))
            .collect();

        let mut atoms = Vec::with_capacity(selected.len());
        for id in selected {
            if let Some(atom) = self.load_atom(&mut state, id)? {
                atoms.push(atom);
            }
        }
        Ok(atoms)
    }

    fn count_atoms(&self) -> StoreResult<u64> {
        Ok(self.state.lock().order.len() as u64)
    }

    fn fetch_atom_tags(&self, id: AtomId) -> StoreResult<BTreeMap<String, f64>> {
        let state = self.state.lock();
        state
            .entries
            .get(&id)
            .map(|entry| entry.tags.as_map().clone())
            .ok_or(StoreError::NotFound(id))
    }

    fn atom_ids(&self) -> StoreResult<Vec<AtomId>> {
        Ok(self.state.lock().order.clone())
    }

    fn create_snapshot(
        &self,
        atom_ids: Option<Vec<AtomId>>,
        note: Option<String>,
    ) -> StoreResult<Snapshot> {
        let started_at = Instant::now();
        let mut state = self.state.lock();
        let atom_ids = atom_ids.unwrap_or_else(|| state.order.clone());

        let plan = plan_snapshot(
            state.snapshots.last(),
            atom_ids,
            note,
            |id| {
                Ok(state
                    .snapshot_positions
                    .get(id)
                    .map(|position| state.snapshots[*position].clone()))
            },
            |atom_id| {
                Ok(state
                    .entries
                    .get(atom_id)
                    .map(|entry| entry.tags.keys().map(str::to_string).collect())
                    .unwrap_or_default())
            },
        )?;
        let snapshot = match plan {
            SnapshotPlan::Existing(existing) => return Ok(existing),
            SnapshotPlan::New(snapshot) => snapshot,
        };

        if let Err(err) = state.snapshots_log.append(&snapshot) {
            return Err(record_write_failure(
                &self.metrics,
                "create_snapshot",
                err.into(),
            ));
        }
        state.index_snapshot(snapshot.clone());
        drop(state);

        self.metrics.record_snapshot_created(started_at.elapsed());
        info!(
            "event=create_snapshot module=snapshot status=ok backend=jsonl snapshot_id={} atom_count={} duration_ms={}",
            snapshot.id,
            snapshot.stats.atom_count,
            started_at.elapsed().as_millis()
        );
        Ok(snapshot)
    }

    fn get_snapshot(&self, id: &str) -> StoreResult<Option<Snapshot>> {
        let state = self.state.lock();
        Ok(state
            .snapshot_positions
            .get(id)
            .map(|position| state.snapshots[*position].clone()))
    }

    fn latest_snapshot(&self) -> StoreResult<Option<Snapshot>> {
        Ok(self.state.lock().snapshots.last().cloned())
    }

    fn list_snapshots(&self) -> StoreResult<Vec<Snapshot>> {
        Ok(self.state.lock().snapshots.clone())
    }
}

/// Quarantines a damaged journal, counts the failure and returns the error.
fn fail_on_journal(
    root: &Path,
    metrics: &StoreMetrics,
    operation: &'static str,
    err: JournalError,
) -> StoreError {
    if err.is_corruption() {
        let journal_path = match &err {
            JournalError::Corruption { path, .. } | JournalError::Decode { path, .. } => {
                path.clone()
            }
            _ => root.join(ATOMS_LOG),
        };
        if let Err(io_err) = quarantine_corruption(&root.join(QUARANTINE_DIR), &journal_path, &err)
        {
            error!(
                "event={} module=store status=error error_code=quarantine_failed error={}",
                operation, io_err
            );
        }
        metrics.record_write_error(operation);
        error!(
            "event={} module=store status=error backend=jsonl error_code=journal_corruption error={}",
            operation, err
        );
    }
    StoreError::Journal(err)
}

#[derive(Serialize)]
struct TagIndexFile<'a> {
    tag: &'a str,
    atom_ids: &'a [AtomId],
}

/// File name for a tag; non-portable keys get a hash suffix to stay unique.
pub fn tag_file_name(tag: &str) -> String {
    let sanitized: String = tag
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if sanitized == tag && !tag.starts_with('.') {
        format!("{sanitized}.json")
    } else {
        let digest = sha256_hex(tag.as_bytes());
        format!("{sanitized}-{}.json", &digest[..12])
    }
}

/// Atomically replaces one tag index file (write temp, then rename).
fn write_tag_file(root: &Path, tag: &str, atom_ids: &[AtomId]) -> StoreResult<()> {
    let dir = root.join(TAG_INDEX_DIR);
    let target = dir.join(tag_file_name(tag));
    let temp = dir.join(format!(".{}.tmp", tag_file_name(tag)));
    let encoded = serde_json::to_vec_pretty(&TagIndexFile { tag, atom_ids })?;
    std::fs::write(&temp, encoded).map_err(|source| StoreError::io(&temp, source))?;
    std::fs::rename(&temp, &target).map_err(|source| StoreError::io(&target, source))
}

#[cfg(test)]
mod tests {
    use super::tag_file_name;

    #[test]
    fn plain_tags_map_to_their_own_file_name() {
        assert_eq!(tag_file_name("decision"), "decision.json");
        assert_eq!(tag_file_name("team-a_1"), "team-a_1.json");
    }

    #[test]
    fn unsafe_tags_are_sanitized_and_disambiguated() {
        let slash = tag_file_name("a/b");
        let colon = tag_file_name("a:b");
        assert!(slash.starts_with("a_b-"));
        assert!(colon.starts_with("a_b-"));
        assert_ne!(slash, colon);
        assert!(tag_file_name("..").ends_with(".json"));
        assert_ne!(tag_file_name(".."), "...json");
    }
}
