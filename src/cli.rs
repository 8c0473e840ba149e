use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::adapters::{CaptureSource, ReplaySource};
use crate::config::MonitorConfig;
use crate::coordination::PrimarySelection;
use crate::domain::SourceKind;
use crate::error::Result;
use crate::persistence::{list_manifests, SessionManifest, SessionReader};
use crate::services::{EventBus, EventNormalizer, FeedPipeline, WILDCARD};
use crate::supervisor::{IntegrityMonitor, SourceHealthTable};

const REPLAY_SOURCE_ID: &str = "replay";

#[derive(Parser)]
#[command(name = "rugfeed")]
#[command(version)]
#[command(about = "Capture, normalize and durably record a round-based game feed", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config directory (default.toml, {RUGFEED_ENV}.toml)
    #[arg(short, long, default_value = "config")]
    pub config: PathBuf,

    /// Store root, overriding the configured one
    #[arg(long, env = "RUGFEED_STORE_ROOT")]
    pub store_root: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Capture and record the live feed (default)
    Run,
    /// Print a recorded session as outbound JSON lines
    Replay {
        /// Session to read
        #[arg(short, long)]
        session: Uuid,
        /// Only envelopes after this sequence
        #[arg(long)]
        after: Option<u64>,
        /// Feed the recorded frames back through the normalizer instead of
        /// printing the stored envelopes
        #[arg(long)]
        renormalize: bool,
        /// Pacing factor when renormalizing; 1.0 reproduces original timing
        #[arg(long)]
        speed: Option<f64>,
    },
    /// List recorded sessions
    Manifest {
        /// Show the parts of one session
        #[arg(short, long)]
        session: Option<Uuid>,
    },
}

/// Print stored envelopes of `session` after `after`; returns the count
pub fn print_session(root: &Path, session: Uuid, after: Option<u64>) -> Result<usize> {
    let reader = SessionReader::open(root, session)?;
    let envelopes = reader.read_after(after.unwrap_or(0))?;
    for envelope in &envelopes {
        println!("{}", serde_json::to_string(&envelope.to_outbound())?);
    }
    Ok(envelopes.len())
}

pub fn list_sessions(root: &Path, session: Option<Uuid>) -> Result<()> {
    match session {
        Some(session_id) => {
            let path = SessionManifest::path(root, session_id);
            let Some(manifest) = SessionManifest::load(&path)? else {
                println!("No manifest for session {}", session_id);
                return Ok(());
            };
            print_manifest_row(&manifest);
            for part in &manifest.parts {
                println!(
                    "  {:>12} {:>12} {:>8}  {}",
                    part.first_sequence, part.last_sequence, part.events, part.path
                );
            }
        }
        None => {
            let manifests = list_manifests(root)?;
            if manifests.is_empty() {
                println!("No sessions under {}", root.display());
            }
            for manifest in &manifests {
                print_manifest_row(manifest);
            }
        }
    }
    Ok(())
}

fn print_manifest_row(manifest: &SessionManifest) {
    println!(
        "{}  created={}  last_seq={}  parts={}  {}",
        manifest.session_id,
        manifest.created_at.format("%Y-%m-%d %H:%M:%S"),
        manifest.last_flushed_sequence,
        manifest.parts.len(),
        if manifest.closed { "closed" } else { "open" }
    );
}

/// Re-run the recorded frames of `session` through a fresh normalizer and
/// print the resulting outbound events. Returns the number printed.
pub async fn renormalize_session(
    root: &Path,
    session: Uuid,
    after: Option<u64>,
    speed: Option<f64>,
) -> Result<u64> {
    let reader = SessionReader::open(root, session)?;
    let envelopes = reader.read_after(after.unwrap_or(0))?;

    let health = Arc::new(SourceHealthTable::new(MonitorConfig::default()));
    let source = ReplaySource::from_envelopes(REPLAY_SOURCE_ID, envelopes, speed, health.clone());
    let expected = source.len() as u64;

    let bus = EventBus::new();
    let printed = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let counter = printed.clone();
    let _printer = bus.subscribe(WILDCARD, move |envelope| {
        if let Ok(line) = serde_json::to_string(&envelope.to_outbound()) {
            println!("{}", line);
            counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    });

    let (_primary_tx, primary_rx) = watch::channel(Some(PrimarySelection {
        source_id: REPLAY_SOURCE_ID.to_string(),
        kind: SourceKind::Replay,
        previous: None,
        reason: "replay".to_string(),
    }));
    let normalizer = EventNormalizer::new(Uuid::new_v4(), Arc::new(IntegrityMonitor::default()));
    let mut pipeline = FeedPipeline::new(normalizer, bus, health, primary_rx);
    pipeline.add_source(&source);
    let counters = pipeline.counters();

    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(pipeline.run(stop_rx));
    source.connect().await?;

    let mut last_seen = 0;
    let mut poll = tokio::time::interval(Duration::from_millis(100));
    loop {
        poll.tick().await;
        let processed = counters.snapshot().frames_processed;
        if processed >= expected || (!source.is_connected() && processed == last_seen) {
            break;
        }
        last_seen = processed;
    }

    source.disconnect().await;
    let _ = stop_tx.send(true);
    if let Err(e) = task.await {
        tracing::error!("Replay pipeline failed: {}", e);
    }
    Ok(printed.load(std::sync::atomic::Ordering::Relaxed))
}
