use aimos_core::error::ErrorKind;
use aimos_core::model::snapshot::snapshot_digest;
use aimos_core::store::{replay_snapshot, JsonlAtomStore, SqliteAtomStore};
use aimos_core::{AtomListQuery, AtomStore, NewAtom, StoreError};

fn seed(store: &dyn AtomStore, count: usize) -> Vec<aimos_core::AtomId> {
    (0..count)
        .map(|index| {
            store
                .create_atom(
                    NewAtom::text(format!("Decision {index}: adopt pattern {index}"))
                        .with_tag("decision", 1.0)
                        .unwrap()
                        .with_tag("project_apollo", 1.0)
                        .unwrap()
                        .with_metadata("index", index as u64),
                )
                .unwrap()
                .id
        })
        .collect()
}

fn assert_snapshot_chain(store: &dyn AtomStore) {
    let ids = seed(store, 20);
    let note = Some("Project Apollo decisions".to_string());

    let first = store.create_snapshot(None, note.clone()).unwrap();
    assert_eq!(first.atom_ids, ids);
    assert_eq!(first.previous_id, None);
    assert_eq!(
        first.id,
        snapshot_digest(&ids, None, Some("Project Apollo decisions")).unwrap()
    );
    assert!(first.verify());
    assert_eq!(first.stats.atom_count, 20);
    assert_eq!(first.stats.tag_counts["project_apollo"], 20);

    let again = store.create_snapshot(Some(ids.clone()), note.clone()).unwrap();
    assert_eq!(again, first);
    assert_eq!(store.metrics().snapshots_created_total(), 1);

    let subset = ids[..5].to_vec();
    let second = store.create_snapshot(Some(subset.clone()), None).unwrap();
    assert_eq!(second.previous_id.as_deref(), Some(first.id.as_str()));
    assert_eq!(second.atom_ids, subset);

    assert_eq!(store.latest_snapshot().unwrap().unwrap().id, second.id);
    assert_eq!(
        store
            .list_snapshots()
            .unwrap()
            .iter()
            .map(|snapshot| snapshot.id.clone())
            .collect::<Vec<_>>(),
        vec![first.id.clone(), second.id.clone()]
    );

    let replayed: Vec<_> = replay_snapshot(store, &first.id)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(
        replayed.iter().map(|atom| atom.id).collect::<Vec<_>>(),
        ids
    );
    assert!(replayed[0].snapshot_ids.contains(&first.id));
    assert!(replayed[0].snapshot_ids.contains(&second.id));
    assert_eq!(replayed[19].snapshot_ids, vec![first.id.clone()]);

    let scoped = store
        .list_atoms(&AtomListQuery::default().in_snapshot(second.id.clone()))
        .unwrap();
    assert_eq!(scoped.len(), 5);
}

#[test]
fn sqlite_snapshots_are_deterministic_chained_and_replayable() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteAtomStore::open(dir.path().join("cmc.db"), dir.path()).unwrap();
    assert_snapshot_chain(&store);
}

#[test]
fn jsonl_snapshots_are_deterministic_chained_and_replayable() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonlAtomStore::open(dir.path()).unwrap();
    assert_snapshot_chain(&store);
}

#[test]
fn snapshot_chain_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let (first_id, ids) = {
        let store = JsonlAtomStore::open(dir.path()).unwrap();
        let ids = seed(&store, 3);
        let snapshot = store
            .create_snapshot(None, Some("Project Apollo decisions".to_string()))
            .unwrap();
        (snapshot.id, ids)
    };

    let store = JsonlAtomStore::open(dir.path()).unwrap();
    let head = store.latest_snapshot().unwrap().unwrap();
    assert_eq!(head.id, first_id);
    assert!(head.verify());
    let replayed: Vec<_> = replay_snapshot(&store, &first_id)
        .unwrap()
        .map(|atom| atom.unwrap().id)
        .collect();
    assert_eq!(replayed, ids);
}

#[test]
fn missing_snapshots_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteAtomStore::open_in_memory(dir.path()).unwrap();

    assert!(store.get_snapshot("deadbeef").unwrap().is_none());
    assert!(store.latest_snapshot().unwrap().is_none());

    let err = match replay_snapshot(&store, "deadbeef") {
        Ok(_) => panic!("unknown snapshot must not replay"),
        Err(err) => err,
    };
    assert!(matches!(err, StoreError::SnapshotMissing(_)));
    assert_eq!(err.kind(), ErrorKind::SnapshotMissing);

    let err = store
        .list_atoms(&AtomListQuery::default().in_snapshot("deadbeef"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SnapshotMissing);
}

#[test]
fn empty_store_snapshot_is_still_a_valid_commit() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteAtomStore::open_in_memory(dir.path()).unwrap();
    let snapshot = store.create_snapshot(None, None).unwrap();
    assert!(snapshot.atom_ids.is_empty());
    assert!(snapshot.verify());
    assert_eq!(replay_snapshot(&store, &snapshot.id).unwrap().count(), 0);
}
