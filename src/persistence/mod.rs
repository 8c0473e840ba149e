//! Persistence Layer
//!
//! Durable, replayable storage of normalized envelopes:
//! - Event store with partitioned parts, session manifest and writer lock
//! - Background writer with retrying flushes
//! - Session reader for replay and inspection

pub mod event_store;
pub mod manifest;
pub mod reader;
pub mod writer;

pub use event_store::{EventStore, RecoveryReport, WriterLock};
pub use manifest::{list_manifests, PartEntry, SessionManifest};
pub use reader::SessionReader;
pub use writer::{spawn_writer, WriterHandle, WriterHealth};
