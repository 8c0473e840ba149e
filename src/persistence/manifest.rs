//! Per-session manifest and on-disk layout
//!
//! Layout under the store root:
//!
//! ```text
//! {root}/{doc_type}/date=YYYY-MM-DD/part-{session}-{first:012}-{last:012}.jsonl
//! {root}/_manifest/{session}.json
//! {root}/_locks/{session}.lock
//! ```
//!
//! The manifest only ever lists parts that are already renamed into place,
//! so `last_flushed_sequence` lags the data on disk and never precedes it.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::domain::{DocType, SCHEMA_VERSION};
use crate::error::StoreError;

pub const MANIFEST_DIR: &str = "_manifest";
pub const LOCK_DIR: &str = "_locks";
pub const PART_EXTENSION: &str = "jsonl";
pub const TMP_SUFFIX: &str = ".tmp";

/// One immutable data file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartEntry {
    /// Path relative to the store root
    pub path: String,
    pub doc_type: DocType,
    pub date: NaiveDate,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub events: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub schema_version: u32,
    pub session_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Highest sequence whose part is durably in place
    pub last_flushed_sequence: u64,
    #[serde(default)]
    pub parts: Vec<PartEntry>,
    /// Set by a clean close
    #[serde(default)]
    pub closed: bool,
}

impl SessionManifest {
    pub fn new(session_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            session_id,
            created_at: now,
            updated_at: now,
            last_flushed_sequence: 0,
            parts: Vec::new(),
            closed: false,
        }
    }

    pub fn path(root: &Path, session_id: Uuid) -> PathBuf {
        root.join(MANIFEST_DIR).join(format!("{session_id}.json"))
    }

    /// Load a manifest; `None` when the session has never been flushed
    pub fn load(path: &Path) -> Result<Option<Self>, StoreError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let manifest: SessionManifest =
            serde_json::from_slice(&bytes).map_err(|e| StoreError::CorruptManifest {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;

        if manifest.schema_version > SCHEMA_VERSION {
            return Err(StoreError::CorruptManifest {
                path: path.display().to_string(),
                reason: format!(
                    "schema version {} is newer than supported {}",
                    manifest.schema_version, SCHEMA_VERSION
                ),
            });
        }
        Ok(Some(manifest))
    }

    /// Persist via temp file and rename so readers never see a torn manifest
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &bytes)
    }

    pub fn contains_part(&self, path: &str) -> bool {
        self.parts.iter().any(|p| p.path == path)
    }

    /// Record parts that are already in place and advance the flushed sequence
    pub fn record_parts(&mut self, parts: impl IntoIterator<Item = PartEntry>) {
        for part in parts {
            self.last_flushed_sequence = self.last_flushed_sequence.max(part.last_sequence);
            self.parts.push(part);
        }
        self.parts.sort_by_key(|p| p.first_sequence);
        self.updated_at = Utc::now();
    }
}

/// Write `bytes` to a sibling temp file, fsync, then rename over `path`
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = tmp_path(path);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    sync_dir(path.parent());
    Ok(())
}

pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(TMP_SUFFIX);
    path.with_file_name(name)
}

/// Best-effort directory fsync so the rename itself is durable
#[cfg(unix)]
pub fn sync_dir(dir: Option<&Path>) {
    if let Some(dir) = dir {
        if let Ok(handle) = fs::File::open(dir) {
            let _ = handle.sync_all();
        }
    }
}

#[cfg(not(unix))]
pub fn sync_dir(_dir: Option<&Path>) {}

/// Partition directory for one doc type and day
pub fn partition_dir(root: &Path, doc_type: DocType, date: NaiveDate) -> PathBuf {
    root.join(doc_type.as_str())
        .join(format!("date={}", date.format("%Y-%m-%d")))
}

pub fn part_file_name(session_id: Uuid, first: u64, last: u64) -> String {
    format!("part-{session_id}-{first:012}-{last:012}.{PART_EXTENSION}")
}

/// Parse `part-{session}-{first}-{last}.jsonl`
pub fn parse_part_file_name(name: &str) -> Option<(Uuid, u64, u64)> {
    let stem = name
        .strip_prefix("part-")?
        .strip_suffix(&format!(".{PART_EXTENSION}"))?;
    let mut tail = stem.rsplitn(3, '-');
    let last = tail.next()?.parse().ok()?;
    let first = tail.next()?.parse().ok()?;
    let session = Uuid::parse_str(tail.next()?).ok()?;
    Some((session, first, last))
}

/// Parse the `date=YYYY-MM-DD` partition directory name
pub fn parse_partition_date(name: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(name.strip_prefix("date=")?, "%Y-%m-%d").ok()
}

/// Path of `full` relative to `root`, with forward slashes
pub fn relative_path(root: &Path, full: &Path) -> String {
    let rel = full.strip_prefix(root).unwrap_or(full);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// All manifests under `root`, oldest session first
pub fn list_manifests(root: &Path) -> Result<Vec<SessionManifest>, StoreError> {
    let dir = root.join(MANIFEST_DIR);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut manifests = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(manifest) = SessionManifest::load(&path)? {
            manifests.push(manifest);
        }
    }
    manifests.sort_by_key(|m| m.created_at);
    Ok(manifests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_part_name_roundtrip() {
        let session = Uuid::new_v4();
        let name = part_file_name(session, 7, 1234);
        assert!(name.ends_with("-000000000007-000000001234.jsonl"));
        assert_eq!(parse_part_file_name(&name), Some((session, 7, 1234)));
        assert_eq!(parse_part_file_name("part-garbage.jsonl"), None);
        assert_eq!(parse_part_file_name(&format!("{name}.tmp")), None);
    }

    #[test]
    fn test_partition_layout() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let dir = partition_dir(Path::new("/data"), DocType::PlayerAction, date);
        assert_eq!(dir, PathBuf::from("/data/player_action/date=2024-03-09"));
        assert_eq!(parse_partition_date("date=2024-03-09"), Some(date));
    }

    #[test]
    fn test_manifest_save_load() {
        let tmp = TempDir::new().unwrap();
        let session = Uuid::new_v4();
        let path = SessionManifest::path(tmp.path(), session);

        assert!(SessionManifest::load(&path).unwrap().is_none());

        let mut manifest = SessionManifest::new(session);
        manifest.record_parts(vec![PartEntry {
            path: "tick/date=2024-01-01/part.jsonl".to_string(),
            doc_type: DocType::Tick,
            date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            first_sequence: 1,
            last_sequence: 9,
            events: 9,
        }]);
        manifest.save(&path).unwrap();

        let loaded = SessionManifest::load(&path).unwrap().unwrap();
        assert_eq!(loaded.last_flushed_sequence, 9);
        assert_eq!(loaded.parts.len(), 1);
        assert!(!tmp_path(&path).exists());
        assert_eq!(list_manifests(tmp.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_corrupt_manifest_is_reported() {
        let tmp = TempDir::new().unwrap();
        let path = SessionManifest::path(tmp.path(), Uuid::new_v4());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            SessionManifest::load(&path),
            Err(StoreError::CorruptManifest { .. })
        ));
    }
}
