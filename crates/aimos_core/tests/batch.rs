use aimos_core::cancel::CancellationToken;
use aimos_core::error::ErrorKind;
use aimos_core::store::{BatchIngestor, BatchProgress, JsonlAtomStore, SqliteAtomStore};
use aimos_core::{AtomListQuery, AtomStore, NewAtom};
use std::sync::Mutex;

fn note(index: usize) -> NewAtom {
    NewAtom::text(format!("Batch note {index}"))
        .with_tag("batch", 0.5)
        .unwrap()
        .with_metadata("index", index as u64)
}

fn assert_batch_in_input_order(store: &dyn AtomStore) {
    let payloads: Vec<NewAtom> = (0..32).map(note).collect();
    let report = BatchIngestor::new(4)
        .ingest(store, payloads, &CancellationToken::new())
        .unwrap();

    assert!(report.is_complete());
    assert!(!report.cancelled);
    let indexes: Vec<u64> = report
        .created
        .iter()
        .map(|atom| atom.metadata["index"].as_u64().unwrap())
        .collect();
    assert_eq!(indexes, (0..32).collect::<Vec<u64>>());
    assert_eq!(store.count_atoms().unwrap(), 32);
    assert_eq!(
        store
            .list_atoms(&AtomListQuery::with_tag("batch").limit(100))
            .unwrap()
            .len(),
        32
    );
}

#[test]
fn sqlite_batches_keep_input_order() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteAtomStore::open(dir.path().join("cmc.db"), dir.path()).unwrap();
    assert_batch_in_input_order(&store);
}

#[test]
fn jsonl_batches_keep_input_order() {
    let dir = tempfile::tempdir().unwrap();
    assert_batch_in_input_order(&JsonlAtomStore::open(dir.path()).unwrap());
}

#[test]
fn invalid_payloads_fail_individually() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonlAtomStore::open(dir.path()).unwrap();
    let payloads = vec![note(0), NewAtom::text(""), note(2)];
    let report = BatchIngestor::default()
        .ingest(&store, payloads, &CancellationToken::new())
        .unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.created.len(), 2);
    assert_eq!(report.failures.len(), 1);
    let (position, err) = &report.failures[0];
    assert_eq!(*position, 1);
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(store.count_atoms().unwrap(), 2);
    assert_eq!(store.metrics().write_errors_total(), 0);
}

#[test]
fn progress_is_reported_for_every_payload() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonlAtomStore::open(dir.path()).unwrap();
    let seen = Mutex::new(Vec::new());
    BatchIngestor::new(2)
        .ingest_with_progress(
            &store,
            (0..10).map(note).collect(),
            &CancellationToken::new(),
            |progress: BatchProgress| seen.lock().unwrap().push(progress),
        )
        .unwrap();

    let mut processed: Vec<usize> = seen
        .into_inner()
        .unwrap()
        .iter()
        .map(|progress| {
            assert_eq!(progress.total, 10);
            progress.processed
        })
        .collect();
    processed.sort_unstable();
    assert_eq!(processed, (1..=10).collect::<Vec<usize>>());
}

#[test]
fn cancelled_batches_skip_remaining_payloads() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonlAtomStore::open(dir.path()).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = BatchIngestor::default()
        .ingest(&store, (0..5).map(note).collect(), &cancel)
        .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.skipped, 5);
    assert!(report.created.is_empty());
    assert_eq!(store.count_atoms().unwrap(), 0);
}
