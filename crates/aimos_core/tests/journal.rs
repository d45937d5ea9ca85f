use aimos_core::error::ErrorKind;
use aimos_core::journal::{quarantine_corruption, CorruptionReason, Journal, JournalError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Entry {
    seq: u32,
    body: String,
}

fn entry(seq: u32) -> Entry {
    Entry {
        seq,
        body: format!("record-{seq}"),
    }
}

#[test]
fn records_replay_in_write_order_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("atoms.log");

    let offsets = {
        let mut journal = Journal::open(&path).unwrap();
        (0..3)
            .map(|seq| journal.append(&entry(seq)).unwrap())
            .collect::<Vec<_>>()
    };
    assert_eq!(offsets[0], 0);
    assert!(offsets.windows(2).all(|pair| pair[0] < pair[1]));

    let mut journal = Journal::open(&path).unwrap();
    let records = journal.read_all::<Entry>().unwrap();
    assert_eq!(
        records,
        offsets
            .iter()
            .zip(0..3)
            .map(|(offset, seq)| (*offset, entry(seq)))
            .collect::<Vec<_>>()
    );

    let second: Entry = journal.read_at(offsets[1]).unwrap();
    assert_eq!(second, entry(1));
}

#[test]
fn empty_journal_replays_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut journal = Journal::open(dir.path().join("nested/empty.log")).unwrap();
    assert!(journal.read_all::<Entry>().unwrap().is_empty());
}

#[test]
fn flipped_payload_byte_is_detected_as_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("atoms.log");
    let second_offset = {
        let mut journal = Journal::open(&path).unwrap();
        journal.append(&entry(0)).unwrap();
        journal.append(&entry(1)).unwrap()
    };

    let mut bytes = std::fs::read(&path).unwrap();
    let target = second_offset as usize + 8 + 2;
    bytes[target] ^= 0xff;
    std::fs::write(&path, &bytes).unwrap();

    let mut journal = Journal::open(&path).unwrap();
    let err = journal.read_all::<Entry>().unwrap_err();
    assert!(err.is_corruption());
    assert_eq!(err.kind(), ErrorKind::JournalCorruption);
    match &err {
        JournalError::Corruption { offset, reason, .. } => {
            assert_eq!(*offset, second_offset);
            assert!(matches!(reason, CorruptionReason::ChecksumMismatch { .. }));
        }
        other => panic!("unexpected error: {other}"),
    }

    let quarantine = quarantine_corruption(&dir.path().join("quarantine"), &path, &err).unwrap();
    assert!(quarantine.ends_with("atoms_corrupt.json"));
    let record: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&quarantine).unwrap()).unwrap();
    assert_eq!(record["offset"], second_offset);
    let dumped = hex::decode(record["corrupted_bytes_hex"].as_str().unwrap()).unwrap();
    assert!(!dumped.is_empty());
    assert!(bytes[second_offset as usize..].starts_with(&dumped));
}

#[test]
fn truncated_tail_is_detected_as_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("atoms.log");
    {
        let mut journal = Journal::open(&path).unwrap();
        journal.append(&entry(0)).unwrap();
    }
    let mut bytes = std::fs::read(&path).unwrap();
    bytes.extend_from_slice(&[0, 0, 0]);
    std::fs::write(&path, &bytes).unwrap();

    let mut journal = Journal::open(&path).unwrap();
    let mut iter = journal.iter_records().unwrap();
    assert!(iter.next().unwrap().is_ok());
    let err = iter.next().unwrap().unwrap_err();
    assert!(matches!(
        err,
        JournalError::Corruption {
            reason: CorruptionReason::TruncatedHeader { available: 3 },
            ..
        }
    ));
    assert!(iter.next().is_none());
}

#[test]
fn second_handle_on_same_file_is_rejected_until_first_drops() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("locked.log");

    let first = Journal::open(&path).unwrap();
    let err = Journal::open(&path).unwrap_err();
    assert!(matches!(err, JournalError::Locked { .. }));
    assert_eq!(err.kind(), ErrorKind::Write);

    drop(first);
    assert!(Journal::open(&path).is_ok());
}
