use chrono::{NaiveDate, TimeZone, Utc};
use rugfeed::domain::{Direction, DocType, EventEnvelope, SourceKind, TypedFields};
use rugfeed::error::StoreError;
use rugfeed::persistence::manifest::{part_file_name, partition_dir, TMP_SUFFIX};
use rugfeed::persistence::{list_manifests, EventStore, SessionManifest, SessionReader};
use std::fs;
use tempfile::TempDir;
use uuid::Uuid;

fn envelope(session_id: Uuid, sequence: u64) -> EventEnvelope {
    EventEnvelope {
        ts: Utc.with_ymd_and_hms(2024, 7, 4, 8, 30, 0).unwrap(),
        source: SourceKind::Direct,
        source_id: "direct".to_string(),
        doc_type: DocType::Tick,
        event_type: "game_state".to_string(),
        session_id,
        round_id: Some("g1".to_string()),
        sequence,
        direction: Direction::Received,
        raw_payload: format!("42[\"gameStateUpdate\",{{\"tickCount\":{sequence}}}]"),
        fields: TypedFields::Raw,
    }
}

/// A part renamed into place after the last manifest save (the process died
/// in between) is adopted on restart: nothing lost, nothing duplicated.
#[test]
fn part_renamed_before_manifest_update_survives_restart() {
    let tmp = TempDir::new().unwrap();
    let session = Uuid::new_v4();

    {
        let mut store = EventStore::open_session(tmp.path(), session, 100).unwrap();
        for seq in 1..=3 {
            store.write(envelope(session, seq)).unwrap();
        }
        store.flush().unwrap();
        // Dropped without close, as a killed writer would leave it
    }

    let date = NaiveDate::from_ymd_opt(2024, 7, 4).unwrap();
    let dir = partition_dir(tmp.path(), DocType::Tick, date);
    let mut lines = String::new();
    for seq in 4..=5 {
        lines.push_str(&serde_json::to_string(&envelope(session, seq)).unwrap());
        lines.push('\n');
    }
    fs::write(dir.join(part_file_name(session, 4, 5)), lines).unwrap();
    let torn = dir.join(format!("{}{}", part_file_name(session, 6, 6), TMP_SUFFIX));
    fs::write(&torn, "{\"ts\":").unwrap();

    let store = EventStore::open_session(tmp.path(), session, 100).unwrap();
    let report = store.recovery().clone();
    assert!(report.resumed);
    assert_eq!(report.adopted_parts, 1);
    assert_eq!(report.adopted_events, 2);
    assert_eq!(report.removed_tmp_files, 1);
    assert_eq!(store.last_flushed_sequence(), 5);
    assert!(!torn.exists());
    drop(store);

    let reader = SessionReader::open(tmp.path(), session).unwrap();
    let sequences: Vec<u64> = reader.read_all().unwrap().iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3, 4, 5]);
}

/// A confirmed part is never adopted twice and the manifest stays readable.
#[test]
fn reopening_clean_session_changes_nothing() {
    let tmp = TempDir::new().unwrap();
    let session = Uuid::new_v4();

    let mut store = EventStore::open_session(tmp.path(), session, 100).unwrap();
    for seq in 1..=4 {
        store.write(envelope(session, seq)).unwrap();
    }
    store.close().unwrap();

    let store = EventStore::open_session(tmp.path(), session, 100).unwrap();
    assert_eq!(store.recovery().adopted_parts, 0);
    assert_eq!(store.manifest().parts.len(), 1);
    assert_eq!(store.last_flushed_sequence(), 4);
    drop(store);

    let manifests = list_manifests(tmp.path()).unwrap();
    assert_eq!(manifests.len(), 1);
    assert_eq!(manifests[0].session_id, session);
}

/// Only one writer may hold a session at a time.
#[test]
fn concurrent_writer_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let session = Uuid::new_v4();
    let _holder = EventStore::open_session(tmp.path(), session, 100).unwrap();

    match EventStore::open_session(tmp.path(), session, 100) {
        Err(StoreError::WriterLocked { holder_pid, .. }) => {
            assert_eq!(holder_pid, std::process::id());
        }
        other => panic!("expected WriterLocked, got {:?}", other.map(|s| s.session_id())),
    }
}

/// A manifest that cannot be parsed is reported, never silently replaced.
#[test]
fn corrupt_manifest_is_reported() {
    let tmp = TempDir::new().unwrap();
    let session = Uuid::new_v4();
    let path = SessionManifest::path(tmp.path(), session);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, "not json").unwrap();

    assert!(matches!(
        EventStore::open_session(tmp.path(), session, 100),
        Err(StoreError::CorruptManifest { .. })
    ));
}
