//! Event Store
//!
//! Append-only, partitioned JSONL storage for one session. Exactly one
//! `EventStore` may hold a session: a lock file under `_locks/` enforces it.
//! Parts are written to a temp name and renamed into place; the manifest is
//! updated only after every part of a flush is in place.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::manifest::{
    parse_part_file_name, parse_partition_date, part_file_name, partition_dir, relative_path,
    write_atomic, PartEntry, SessionManifest, LOCK_DIR, TMP_SUFFIX,
};
use crate::config::StoreConfig;
use crate::domain::{DocType, EventEnvelope};
use crate::error::StoreError;

/// Exclusive claim on a session's output
#[derive(Debug)]
pub struct WriterLock {
    path: PathBuf,
    released: bool,
}

impl WriterLock {
    pub fn acquire(root: &Path, session_id: Uuid) -> Result<Self, StoreError> {
        let dir = root.join(LOCK_DIR);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{session_id}.lock"));

        // Second pass runs only after a stale lock was removed
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    return Ok(Self {
                        path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match holder {
                        Some(pid) if pid == std::process::id() || process_alive(pid) => {
                            return Err(StoreError::WriterLocked {
                                session_id: session_id.to_string(),
                                holder_pid: pid,
                            });
                        }
                        _ => {
                            warn!(%session_id, holder = ?holder, "Removing stale writer lock");
                            match fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                                Err(e) => return Err(e.into()),
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::WriterLocked {
            session_id: session_id.to_string(),
            holder_pid: 0,
        })
    }

    pub fn release(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.path);
            self.released = true;
        }
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    // Without a cheap liveness probe, assume the holder is alive
    true
}

/// What opening a session found on disk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// The session had a manifest before this open
    pub resumed: bool,
    pub removed_tmp_files: usize,
    /// Parts renamed into place but missing from the manifest
    pub adopted_parts: usize,
    pub adopted_events: usize,
    pub last_sequence: u64,
}

pub struct EventStore {
    root: PathBuf,
    session_id: Uuid,
    manifest: SessionManifest,
    manifest_path: PathBuf,
    buffer: Vec<EventEnvelope>,
    /// Parts in place but not yet recorded in the manifest
    pending: Vec<PartEntry>,
    last_buffered: u64,
    max_buffer_events: usize,
    lock: WriterLock,
    closed: bool,
    recovery: RecoveryReport,
}

impl EventStore {
    /// Open the configured session, or a fresh one when none is set
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let session_id = config.session_id.unwrap_or_else(Uuid::new_v4);
        Self::open_session(&config.root_dir, session_id, config.max_buffer_events)
    }

    pub fn open_session(
        root: &Path,
        session_id: Uuid,
        max_buffer_events: usize,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(root)?;
        let lock = WriterLock::acquire(root, session_id)?;

        let manifest_path = SessionManifest::path(root, session_id);
        let existing = SessionManifest::load(&manifest_path)?;
        let resumed = existing.is_some();
        let mut manifest = existing.unwrap_or_else(|| SessionManifest::new(session_id));
        manifest.closed = false;

        let mut recovery = recover_parts(root, &mut manifest)?;
        recovery.resumed = resumed;
        manifest.save(&manifest_path)?;

        info!(
            %session_id,
            root = %root.display(),
            resumed,
            last_sequence = recovery.last_sequence,
            adopted_parts = recovery.adopted_parts,
            removed_tmp_files = recovery.removed_tmp_files,
            "Event store opened"
        );

        Ok(Self {
            root: root.to_path_buf(),
            session_id,
            manifest,
            manifest_path,
            buffer: Vec::new(),
            pending: Vec::new(),
            last_buffered: 0,
            max_buffer_events: max_buffer_events.max(1),
            lock,
            closed: false,
            recovery,
        })
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &SessionManifest {
        &self.manifest
    }

    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn last_flushed_sequence(&self) -> u64 {
        self.manifest.last_flushed_sequence
    }

    /// Highest sequence accepted so far, flushed or not
    pub fn last_sequence(&self) -> u64 {
        self.last_buffered.max(self.manifest.last_flushed_sequence)
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn should_flush(&self) -> bool {
        self.buffer.len() >= self.max_buffer_events
    }

    /// Buffer one envelope. Sequences must strictly increase.
    pub fn write(&mut self, envelope: EventEnvelope) -> Result<(), StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }
        let last = self.last_sequence();
        if envelope.sequence <= last {
            return Err(StoreError::OutOfOrder {
                sequence: envelope.sequence,
                last,
            });
        }
        self.last_buffered = envelope.sequence;
        self.buffer.push(envelope);
        Ok(())
    }

    /// Durably write the buffer, then advance the manifest. Returns events written.
    pub fn flush(&mut self) -> Result<usize, StoreError> {
        if self.closed {
            return Err(StoreError::Closed);
        }

        let written = self.write_parts()?;
        if self.pending.is_empty() {
            return Ok(written);
        }

        let mut updated = self.manifest.clone();
        updated.record_parts(self.pending.iter().cloned());
        updated.save(&self.manifest_path)?;

        debug!(
            session_id = %self.session_id,
            parts = self.pending.len(),
            last_flushed = updated.last_flushed_sequence,
            "Manifest advanced"
        );
        self.manifest = updated;
        self.pending.clear();
        Ok(written)
    }

    /// Flush, mark the session closed and release the writer lock
    pub fn close(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        self.flush()?;
        self.manifest.closed = true;
        self.manifest.updated_at = chrono::Utc::now();
        self.manifest.save(&self.manifest_path)?;
        self.closed = true;
        self.lock.release();
        info!(
            session_id = %self.session_id,
            last_sequence = self.manifest.last_flushed_sequence,
            "Event store closed"
        );
        Ok(())
    }

    /// Write every buffered envelope into parts. On failure the envelopes
    /// whose parts are not in place go back into the buffer.
    fn write_parts(&mut self) -> Result<usize, StoreError> {
        if self.buffer.is_empty() {
            return Ok(0);
        }

        let mut groups: BTreeMap<(DocType, NaiveDate), Vec<EventEnvelope>> = BTreeMap::new();
        for envelope in self.buffer.drain(..) {
            groups
                .entry((envelope.doc_type, envelope.ts.date_naive()))
                .or_default()
                .push(envelope);
        }

        let mut written = 0;
        let mut groups = groups.into_iter();
        while let Some(((doc_type, date), events)) = groups.next() {
            match self.write_part(doc_type, date, &events) {
                Ok(entry) => {
                    written += events.len();
                    self.pending.push(entry);
                }
                Err(e) => {
                    let mut remaining = events;
                    for (_, rest) in groups.by_ref() {
                        remaining.extend(rest);
                    }
                    remaining.sort_by_key(|env| env.sequence);
                    warn!(
                        session_id = %self.session_id,
                        error = %e,
                        retained = remaining.len(),
                        "Part write failed, keeping events buffered"
                    );
                    self.buffer = remaining;
                    return Err(e);
                }
            }
        }
        Ok(written)
    }

    fn write_part(
        &self,
        doc_type: DocType,
        date: NaiveDate,
        events: &[EventEnvelope],
    ) -> Result<PartEntry, StoreError> {
        let first = events.first().map(|e| e.sequence).unwrap_or_default();
        let last = events.last().map(|e| e.sequence).unwrap_or_default();

        let dir = partition_dir(&self.root, doc_type, date);
        fs::create_dir_all(&dir)?;
        let path = dir.join(part_file_name(self.session_id, first, last));

        let mut bytes = Vec::with_capacity(events.len() * 256);
        for envelope in events {
            serde_json::to_writer(&mut bytes, envelope)?;
            bytes.push(b'\n');
        }
        write_atomic(&path, &bytes)?;

        debug!(
            doc_type = %doc_type,
            %date,
            first,
            last,
            events = events.len(),
            "Part written"
        );

        Ok(PartEntry {
            path: relative_path(&self.root, &path),
            doc_type,
            date,
            first_sequence: first,
            last_sequence: last,
            events: events.len(),
        })
    }

    /// Write parts without advancing the manifest, as a crash between the two would
    #[cfg(test)]
    pub(crate) fn flush_parts_only(&mut self) -> Result<usize, StoreError> {
        let written = self.write_parts()?;
        self.pending.clear();
        Ok(written)
    }
}

/// Remove leftover temp files of this session and adopt parts that were
/// renamed into place after the manifest was last saved.
fn recover_parts(
    root: &Path,
    manifest: &mut SessionManifest,
) -> Result<RecoveryReport, StoreError> {
    let session_prefix = format!("part-{}", manifest.session_id);
    let mut report = RecoveryReport::default();
    let mut adopted = Vec::new();

    for doc_type in DocType::ALL {
        let doc_dir = root.join(doc_type.as_str());
        let date_dirs = match fs::read_dir(&doc_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };

        for date_dir in date_dirs {
            let date_dir = date_dir?.path();
            let Some(date) = date_dir
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(parse_partition_date)
            else {
                continue;
            };

            for file in fs::read_dir(&date_dir)? {
                let path = file?.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !name.starts_with(&session_prefix) {
                    continue;
                }

                if name.ends_with(TMP_SUFFIX) {
                    fs::remove_file(&path)?;
                    report.removed_tmp_files += 1;
                    continue;
                }

                let Some((_, first, last)) = parse_part_file_name(name) else {
                    continue;
                };
                let rel = relative_path(root, &path);
                if manifest.contains_part(&rel) {
                    continue;
                }
                if first <= manifest.last_flushed_sequence {
                    warn!(part = %rel, "Unlisted part overlaps confirmed sequences, ignoring");
                    continue;
                }

                let events = count_lines(&path)?;
                info!(part = %rel, first, last, events, "Adopting part missing from manifest");
                report.adopted_events += events;
                adopted.push(PartEntry {
                    path: rel,
                    doc_type,
                    date,
                    first_sequence: first,
                    last_sequence: last,
                    events,
                });
            }
        }
    }

    report.adopted_parts = adopted.len();
    manifest.record_parts(adopted);
    report.last_sequence = manifest.last_flushed_sequence;
    Ok(report)
}

fn count_lines(path: &Path) -> Result<usize, StoreError> {
    let reader = BufReader::new(fs::File::open(path)?);
    let mut count = 0;
    for line in reader.lines() {
        if !line?.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Direction, SourceKind, TypedFields};
    use crate::persistence::reader::SessionReader;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn envelope(session_id: Uuid, sequence: u64, doc_type: DocType) -> EventEnvelope {
        EventEnvelope {
            ts: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            source: SourceKind::Direct,
            source_id: "direct".to_string(),
            doc_type,
            event_type: "raw".to_string(),
            session_id,
            round_id: None,
            sequence,
            direction: Direction::Received,
            raw_payload: format!("42[\"e\",{sequence}]"),
            fields: TypedFields::Raw,
        }
    }

    #[test]
    fn test_flush_partitions_by_doc_type_and_date() {
        let tmp = TempDir::new().unwrap();
        let session = Uuid::new_v4();
        let mut store = EventStore::open_session(tmp.path(), session, 100).unwrap();

        store.write(envelope(session, 1, DocType::Tick)).unwrap();
        store.write(envelope(session, 2, DocType::PlayerAction)).unwrap();
        let mut next_day = envelope(session, 3, DocType::Tick);
        next_day.ts = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 1).unwrap();
        store.write(next_day).unwrap();

        assert_eq!(store.flush().unwrap(), 3);
        assert_eq!(store.last_flushed_sequence(), 3);
        assert_eq!(store.manifest().parts.len(), 3);
        assert!(tmp.path().join("tick/date=2024-05-01").is_dir());
        assert!(tmp.path().join("tick/date=2024-05-02").is_dir());
        assert!(tmp.path().join("player_action/date=2024-05-01").is_dir());
    }

    #[test]
    fn test_rejects_out_of_order_and_closed_writes() {
        let tmp = TempDir::new().unwrap();
        let session = Uuid::new_v4();
        let mut store = EventStore::open_session(tmp.path(), session, 100).unwrap();

        store.write(envelope(session, 5, DocType::Tick)).unwrap();
        assert!(matches!(
            store.write(envelope(session, 5, DocType::Tick)),
            Err(StoreError::OutOfOrder { sequence: 5, last: 5 })
        ));

        store.close().unwrap();
        assert!(matches!(
            store.write(envelope(session, 6, DocType::Tick)),
            Err(StoreError::Closed)
        ));
        assert!(store.manifest().closed);
    }

    #[test]
    fn test_second_writer_for_session_is_refused() {
        let tmp = TempDir::new().unwrap();
        let session = Uuid::new_v4();
        let _first = EventStore::open_session(tmp.path(), session, 100).unwrap();

        assert!(matches!(
            EventStore::open_session(tmp.path(), session, 100),
            Err(StoreError::WriterLocked { .. })
        ));
    }

    #[test]
    fn test_lock_is_released_on_close() {
        let tmp = TempDir::new().unwrap();
        let session = Uuid::new_v4();
        let mut store = EventStore::open_session(tmp.path(), session, 100).unwrap();
        store.close().unwrap();

        let reopened = EventStore::open_session(tmp.path(), session, 100).unwrap();
        assert!(reopened.recovery().resumed);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_stale_lock_is_taken_over() {
        let tmp = TempDir::new().unwrap();
        let session = Uuid::new_v4();
        let lock_dir = tmp.path().join(LOCK_DIR);
        fs::create_dir_all(&lock_dir).unwrap();
        // Above the kernel's maximum pid, so never alive
        fs::write(lock_dir.join(format!("{session}.lock")), "4194400").unwrap();

        assert!(EventStore::open_session(tmp.path(), session, 100).is_ok());
    }

    #[test]
    fn test_crash_between_rename_and_manifest_is_recovered() {
        let tmp = TempDir::new().unwrap();
        let session = Uuid::new_v4();

        {
            let mut store = EventStore::open_session(tmp.path(), session, 100).unwrap();
            for seq in 1..=3 {
                store.write(envelope(session, seq, DocType::Tick)).unwrap();
            }
            store.flush().unwrap();
            assert_eq!(store.last_flushed_sequence(), 3);

            store.write(envelope(session, 4, DocType::Tick)).unwrap();
            store.write(envelope(session, 5, DocType::ServerState)).unwrap();
            store.write(envelope(session, 6, DocType::Tick)).unwrap();
            store.flush_parts_only().unwrap();

            // Torn temp file from an interrupted part write
            let torn = partition_dir(tmp.path(), DocType::Tick, NaiveDate::from_ymd_opt(2024, 5, 1).unwrap())
                .join(format!("{}{}", part_file_name(session, 7, 9), TMP_SUFFIX));
            fs::write(&torn, b"{\"partial").unwrap();

            let manifest = SessionManifest::load(&SessionManifest::path(tmp.path(), session))
                .unwrap()
                .unwrap();
            assert_eq!(manifest.last_flushed_sequence, 3);
        }

        let store = EventStore::open_session(tmp.path(), session, 100).unwrap();
        let report = store.recovery().clone();
        assert!(report.resumed);
        assert_eq!(report.adopted_parts, 2);
        assert_eq!(report.adopted_events, 3);
        assert_eq!(report.removed_tmp_files, 1);
        assert_eq!(store.last_flushed_sequence(), 6);
        drop(store);

        let reader = SessionReader::open(tmp.path(), session).unwrap();
        let sequences: Vec<u64> = reader.read_all().unwrap().iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_failed_part_write_keeps_events_buffered() {
        let tmp = TempDir::new().unwrap();
        let session = Uuid::new_v4();
        let mut store = EventStore::open_session(tmp.path(), session, 100).unwrap();
        store.write(envelope(session, 1, DocType::Tick)).unwrap();

        // A file where the partition directory should be makes the write fail
        fs::write(tmp.path().join("tick"), b"not a directory").unwrap();
        assert!(store.flush().is_err());
        assert_eq!(store.buffered_len(), 1);
        assert_eq!(store.last_flushed_sequence(), 0);

        fs::remove_file(tmp.path().join("tick")).unwrap();
        assert_eq!(store.flush().unwrap(), 1);
        assert_eq!(store.last_flushed_sequence(), 1);
    }
}
