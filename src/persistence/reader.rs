//! Read back a recorded session through its manifest.
//!
//! Only parts listed in the manifest are read, so a reader never observes a
//! part that a crashed writer had not yet confirmed.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

use super::manifest::SessionManifest;
use crate::domain::EventEnvelope;
use crate::error::StoreError;

pub struct SessionReader {
    root: PathBuf,
    manifest: SessionManifest,
}

impl SessionReader {
    pub fn open(root: &Path, session_id: Uuid) -> Result<Self, StoreError> {
        let path = SessionManifest::path(root, session_id);
        let manifest = SessionManifest::load(&path)?.ok_or_else(|| {
            StoreError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no manifest for session {session_id}"),
            ))
        })?;
        Ok(Self {
            root: root.to_path_buf(),
            manifest,
        })
    }

    pub fn manifest(&self) -> &SessionManifest {
        &self.manifest
    }

    /// Every confirmed envelope, ordered by sequence
    pub fn read_all(&self) -> Result<Vec<EventEnvelope>, StoreError> {
        self.read_after(0)
    }

    /// Confirmed envelopes with a sequence greater than `after`, one per sequence
    pub fn read_after(&self, after: u64) -> Result<Vec<EventEnvelope>, StoreError> {
        let mut events = Vec::new();
        for part in self
            .manifest
            .parts
            .iter()
            .filter(|p| p.last_sequence > after)
        {
            let path = self.root.join(&part.path);
            let reader = BufReader::new(fs::File::open(&path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<EventEnvelope>(&line) {
                    Ok(envelope) if envelope.sequence > after => events.push(envelope),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(part = %part.path, line = line_no + 1, error = %e, "Skipping unreadable record");
                    }
                }
            }
        }
        events.sort_by_key(|e| e.sequence);
        events.dedup_by_key(|e| e.sequence);
        Ok(events)
    }
}
