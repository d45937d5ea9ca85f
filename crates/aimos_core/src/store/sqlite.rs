//! SQLite atom store backend.
//!
//! # Responsibility
//! - Persist atoms, tag weights and snapshots in the CMC schema.
//! - Serialize writers through one connection guarded by a mutex.
//!
//! # Invariants
//! - An atom row and its tag rows commit in one immediate transaction.
//! - A snapshot row and its ordered member rows commit in one immediate
//!   transaction that also reads the chain head.
//! - Read paths reject rows that fail to decode instead of masking them.

use super::snapshot::{plan_snapshot, SnapshotPlan};
use super::{
    ensure_layout, prepare_atom, record_write_failure, AtomListQuery, AtomStore, PreparedAtom,
    StoreError, StoreResult,
};
use crate::config::BackendKind;
use crate::db::{open_db, open_db_in_memory};
use crate::metrics::StoreMetrics;
use crate::model::atom::{Atom, AtomContent, AtomId, NewAtom, TagMap};
use crate::model::snapshot::{Snapshot, SnapshotStats};
use crate::model::time;
use log::info;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

const ATOM_SELECT_SQL: &str = "SELECT
    a.id,
    a.modality,
    a.content_json,
    a.metadata_json,
    a.embedding_json,
    a.policy_tags_json,
    a.hash,
    a.created_at,
    a.witness_json
FROM atoms a";

const SNAPSHOT_SELECT_SQL: &str = "SELECT
    id,
    created_at,
    previous_id,
    note,
    stats_json,
    witness_json
FROM snapshots";

/// Atom store over a single SQLite database.
pub struct SqliteAtomStore {
    conn: Mutex<Connection>,
    data_root: PathBuf,
    metrics: Arc<StoreMetrics>,
}

impl SqliteAtomStore {
    pub fn open(db_path: impl AsRef<Path>, data_root: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with_metrics(db_path, data_root, Arc::new(StoreMetrics::new()))
    }

    pub fn open_with_metrics(
        db_path: impl AsRef<Path>,
        data_root: impl AsRef<Path>,
        metrics: Arc<StoreMetrics>,
    ) -> StoreResult<Self> {
        let conn = open_db(db_path)?;
        Self::from_connection(conn, data_root.as_ref(), metrics)
    }

    /// In-memory database; payload files still land under `data_root`.
    pub fn open_in_memory(data_root: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = open_db_in_memory()?;
        Self::from_connection(conn, data_root.as_ref(), Arc::new(StoreMetrics::new()))
    }

    fn from_connection(
        conn: Connection,
        data_root: &Path,
        metrics: Arc<StoreMetrics>,
    ) -> StoreResult<Self> {
        ensure_layout(data_root)?;
        Ok(Self {
            conn: Mutex::new(conn),
            data_root: data_root.to_path_buf(),
            metrics,
        })
    }

    /// Runs `f` with exclusive access to the underlying connection.
    ///
    /// Used by components sharing the database (BTSM, temporal queries).
    pub fn with_connection<R>(&self, f: impl FnOnce(&mut Connection) -> R) -> R {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }

    fn persist_atom(&self, prepared: &PreparedAtom) -> StoreResult<()> {
        if let Some(plan) = &prepared.offloaded {
            plan.write()?;
        }
        let atom = &prepared.atom;
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO atoms (
                id,
                modality,
                content_json,
                metadata_json,
                embedding_json,
                policy_tags_json,
                hash,
                created_at,
                witness_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9);",
            params![
                atom.id.to_string(),
                atom.modality.as_str(),
                serde_json::to_string(&atom.content)?,
                serde_json::to_string(&atom.metadata)?,
                atom.embedding
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                serde_json::to_string(&atom.policy_tags)?,
                atom.hash.as_str(),
                time::to_storage(&atom.created_at),
                serde_json::to_string(&atom.witness)?,
            ],
        )?;
        for (key, weight) in atom.tags.iter() {
            tx.execute(
                "INSERT INTO tags (atom_id, tag_key, weight) VALUES (?1, ?2, ?3);",
                params![atom.id.to_string(), key, weight],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}

impl AtomStore for SqliteAtomStore {
    fn backend(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn data_root(&self) -> &Path {
        &self.data_root
    }

    fn metrics(&self) -> &Arc<StoreMetrics> {
        &self.metrics
    }

    fn create_atom(&self, payload: NewAtom) -> StoreResult<Atom> {
        let prepared = prepare_atom(payload, &self.data_root)?;
        if let Err(err) = self.persist_atom(&prepared) {
            if let Some(plan) = &prepared.offloaded {
                plan.discard();
            }
            return Err(record_write_failure(&self.metrics, "create_atom", err));
        }

        let atom = prepared.atom;
        self.metrics.record_atom_created(&atom.modality);
        info!(
            "event=create_atom module=store status=ok backend=sqlite atom_id={} modality={} offloaded={}",
            atom.id,
            atom.modality,
            atom.is_offloaded()
        );
        Ok(atom)
    }

    fn get_atom(&self, id: AtomId) -> StoreResult<Option<Atom>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{ATOM_SELECT_SQL} WHERE a.id = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(hydrate_atom(&conn, row)?)),
            None => Ok(None),
        }
    }

    fn list_atoms(&self, query: &AtomListQuery) -> StoreResult<Vec<Atom>> {
        let conn = self.conn.lock();
        let mut sql = ATOM_SELECT_SQL.to_string();
        let mut bind_values: Vec<SqlValue> = Vec::new();

        if let Some(snapshot_id) = &query.as_of_snapshot {
            let exists = conn
                .query_row(
                    "SELECT 1 FROM snapshots WHERE id = ?1;",
                    [snapshot_id],
                    |_| Ok(()),
                )
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::SnapshotMissing(snapshot_id.clone()));
            }
            sql.push_str(" JOIN snapshot_atoms sa ON sa.atom_id = a.id AND sa.snapshot_id = ?");
            bind_values.push(SqlValue::Text(snapshot_id.clone()));
        }
        sql.push_str(" WHERE 1 = 1");

        if let Some(tag) = &query.tag {
            sql.push_str(" AND EXISTS (SELECT 1 FROM tags t WHERE t.atom_id = a.id AND t.tag_key = ?)");
            bind_values.push(SqlValue::Text(tag.clone()));
        }
        if let Some(modality) = &query.modality {
            sql.push_str(" AND a.modality = ?");
            bind_values.push(SqlValue::Text(modality.clone()));
        }

        if query.as_of_snapshot.is_some() {
            sql.push_str(" ORDER BY sa.position ASC");
        } else {
            sql.push_str(" ORDER BY a.seq ASC");
        }

        if let Some(limit) = query.limit {
            sql.push_str(" LIMIT ?");
            bind_values.push(SqlValue::Integer(i64::from(limit)));
            if query.offset > 0 {
                sql.push_str(" OFFSET ?");
                bind_values.push(SqlValue::Integer(i64::from(query.offset)));
            }
        } else if query.offset > 0 {
            sql.push_str(" LIMIT -1 OFFSET ?");
            bind_values.push(SqlValue::Integer(i64::from(query.offset)));
        }

        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut atoms = Vec::new();
        while let Some(row) = rows.next()? {
            atoms.push(hydrate_atom(&conn, row)?);
        }
        Ok(atoms)
    }

    fn count_atoms(&self) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM atoms;", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    fn fetch_atom_tags(&self, id: AtomId) -> StoreResult<BTreeMap<String, f64>> {
        let conn = self.conn.lock();
        let exists = conn
            .query_row("SELECT 1 FROM atoms WHERE id = ?1;", [id.to_string()], |_| Ok(()))
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::NotFound(id));
        }
        Ok(load_tags(&conn, id)?.as_map().clone())
    }

    fn atom_ids(&self) -> StoreResult<Vec<AtomId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM atoms ORDER BY seq ASC;")?;
        let mut rows = stmt.query([])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            let text: String = row.get(0)?;
            ids.push(parse_uuid(&text, "atoms.id")?);
        }
        Ok(ids)
    }

    fn create_snapshot(
        &self,
        atom_ids: Option<Vec<AtomId>>,
        note: Option<String>,
    ) -> StoreResult<Snapshot> {
        let started_at = Instant::now();
        let atom_ids = match atom_ids {
            Some(ids) => ids,
            None => self.atom_ids()?,
        };

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let latest = latest_snapshot_in(&tx)?;
        let plan = plan_snapshot(
            latest.as_ref(),
            atom_ids,
            note,
            |id| load_snapshot(&tx, id),
            |atom_id| Ok(load_tags(&tx, *atom_id)?.keys().map(str::to_string).collect()),
        )?;

        let snapshot = match plan {
            SnapshotPlan::Existing(existing) => {
                tx.commit()?;
                return Ok(existing);
            }
            SnapshotPlan::New(snapshot) => snapshot,
        };

        let inserted = insert_snapshot(&tx, &snapshot).and_then(|()| Ok(tx.commit()?));
        drop(conn);
        if let Err(err) = inserted {
            return Err(record_write_failure(&self.metrics, "create_snapshot", err));
        }

        self.metrics.record_snapshot_created(started_at.elapsed());
        info!(
            "event=create_snapshot module=snapshot status=ok backend=sqlite snapshot_id={} atom_count={} duration_ms={}",
            snapshot.id,
            snapshot.stats.atom_count,
            started_at.elapsed().as_millis()
        );
        Ok(snapshot)
    }

    fn get_snapshot(&self, id: &str) -> StoreResult<Option<Snapshot>> {
        let conn = self.conn.lock();
        load_snapshot(&conn, id)
    }

    fn latest_snapshot(&self) -> StoreResult<Option<Snapshot>> {
        let conn = self.conn.lock();
        latest_snapshot_in(&conn)
    }

    fn list_snapshots(&self) -> StoreResult<Vec<Snapshot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("{SNAPSHOT_SELECT_SQL} ORDER BY seq ASC;"))?;
        let mut rows = stmt.query([])?;
        let mut snapshots = Vec::new();
        while let Some(row) = rows.next()? {
            snapshots.push(hydrate_snapshot(&conn, row)?);
        }
        Ok(snapshots)
    }
}

fn insert_snapshot(conn: &Connection, snapshot: &Snapshot) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO snapshots (
            id,
            created_at,
            previous_id,
            note,
            stats_json,
            witness_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
        params![
            snapshot.id.as_str(),
            time::to_storage(&snapshot.created_at),
            snapshot.previous_id.as_deref(),
            snapshot.note.as_deref(),
            serde_json::to_string(&snapshot.stats)?,
            serde_json::to_string(&snapshot.witness)?,
        ],
    )?;
    let mut stmt = conn.prepare(
        "INSERT INTO snapshot_atoms (snapshot_id, position, atom_id) VALUES (?1, ?2, ?3);",
    )?;
    for (position, atom_id) in snapshot.atom_ids.iter().enumerate() {
        stmt.execute(params![
            snapshot.id.as_str(),
            position as i64,
            atom_id.to_string()
        ])?;
    }
    Ok(())
}

fn latest_snapshot_in(conn: &Connection) -> StoreResult<Option<Snapshot>> {
    let mut stmt = conn.prepare(&format!("{SNAPSHOT_SELECT_SQL} ORDER BY seq DESC LIMIT 1;"))?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => Ok(Some(hydrate_snapshot(conn, row)?)),
        None => Ok(None),
    }
}

fn load_snapshot(conn: &Connection, id: &str) -> StoreResult<Option<Snapshot>> {
    let mut stmt = conn.prepare(&format!("{SNAPSHOT_SELECT_SQL} WHERE id = ?1;"))?;
    let mut rows = stmt.query([id])?;
    match rows.next()? {
        Some(row) => Ok(Some(hydrate_snapshot(conn, row)?)),
        None => Ok(None),
    }
}

fn hydrate_snapshot(conn: &Connection, row: &Row<'_>) -> StoreResult<Snapshot> {
    let id: String = row.get("id")?;
    let created_at: String = row.get("created_at")?;
    let stats: SnapshotStats = decode_column(row, "stats_json")?;

    let mut stmt = conn.prepare(
        "SELECT atom_id FROM snapshot_atoms WHERE snapshot_id = ?1 ORDER BY position ASC;",
    )?;
    let mut rows = stmt.query([id.as_str()])?;
    let mut atom_ids = Vec::new();
    while let Some(member) = rows.next()? {
        let text: String = member.get(0)?;
        atom_ids.push(parse_uuid(&text, "snapshot_atoms.atom_id")?);
    }

    Ok(Snapshot {
        created_at: time::parse(&created_at).map_err(StoreError::InvalidData)?,
        previous_id: row.get("previous_id")?,
        note: row.get("note")?,
        witness: decode_column(row, "witness_json")?,
        atom_ids,
        stats,
        id,
    })
}

fn hydrate_atom(conn: &Connection, row: &Row<'_>) -> StoreResult<Atom> {
    let id_text: String = row.get("id")?;
    let id = parse_uuid(&id_text, "atoms.id")?;
    let created_at: String = row.get("created_at")?;
    let embedding = match row.get::<_, Option<String>>("embedding_json")? {
        Some(text) => Some(serde_json::from_str(&text).map_err(|err| {
            StoreError::InvalidData(format!("invalid atoms.embedding_json for {id}: {err}"))
        })?),
        None => None,
    };
    let content: AtomContent = decode_column(row, "content_json")?;

    Ok(Atom {
        id,
        modality: row.get("modality")?,
        content,
        tags: load_tags(conn, id)?,
        metadata: decode_column(row, "metadata_json")?,
        embedding,
        policy_tags: decode_column(row, "policy_tags_json")?,
        hash: row.get("hash")?,
        created_at: time::parse(&created_at).map_err(StoreError::InvalidData)?,
        witness: decode_column(row, "witness_json")?,
        snapshot_ids: load_snapshot_ids(conn, id)?,
    })
}

fn load_tags(conn: &Connection, id: AtomId) -> StoreResult<TagMap> {
    let mut stmt = conn.prepare("SELECT tag_key, weight FROM tags WHERE atom_id = ?1;")?;
    let mut rows = stmt.query([id.to_string()])?;
    let mut pairs = Vec::new();
    while let Some(row) = rows.next()? {
        pairs.push((row.get::<_, String>(0)?, row.get::<_, f64>(1)?));
    }
    TagMap::try_from_pairs(pairs)
        .map_err(|err| StoreError::InvalidData(format!("invalid tags for atom {id}: {err}")))
}

fn load_snapshot_ids(conn: &Connection, id: AtomId) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT s.id
         FROM snapshots s
         WHERE EXISTS (
            SELECT 1 FROM snapshot_atoms sa WHERE sa.snapshot_id = s.id AND sa.atom_id = ?1
         )
         ORDER BY s.seq ASC;",
    )?;
    let mut rows = stmt.query([id.to_string()])?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next()? {
        ids.push(row.get(0)?);
    }
    Ok(ids)
}

fn decode_column<T: DeserializeOwned>(row: &Row<'_>, column: &str) -> StoreResult<T> {
    let text: String = row.get(column)?;
    serde_json::from_str(&text)
        .map_err(|err| StoreError::InvalidData(format!("invalid json in column {column}: {err}")))
}

fn parse_uuid(value: &str, column: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| StoreError::InvalidData(format!("invalid uuid value `{value}` in {column}")))
}

#[cfg(test)]
mod tests {
    use super::SqliteAtomStore;
    use crate::model::atom::NewAtom;
    use crate::store::AtomStore;

    #[test]
    fn atom_ids_follow_insertion_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteAtomStore::open_in_memory(dir.path()).unwrap();
        let first = store.create_atom(NewAtom::text("first")).unwrap();
        let second = store.create_atom(NewAtom::text("second")).unwrap();
        assert_eq!(store.atom_ids().unwrap(), vec![first.id, second.id]);
    }

    #[test]
    fn snapshot_membership_is_derived_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteAtomStore::open_in_memory(dir.path()).unwrap();
        let atom = store.create_atom(NewAtom::text("member")).unwrap();
        assert!(atom.snapshot_ids.is_empty());

        let snapshot = store.create_snapshot(None, None).unwrap();
        let reloaded = store.get_atom(atom.id).unwrap().unwrap();
        assert_eq!(reloaded.snapshot_ids, vec![snapshot.id]);
        assert_eq!(reloaded.hash, atom.hash);
    }
}
