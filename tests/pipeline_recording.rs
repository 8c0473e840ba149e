use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use rugfeed::adapters::{CaptureSource, ReplaySource};
use rugfeed::config::{MonitorConfig, StoreConfig};
use rugfeed::coordination::PrimarySelection;
use rugfeed::domain::{RawFrame, SourceKind, TypedFields};
use rugfeed::persistence::{spawn_writer, EventStore, SessionReader};
use rugfeed::services::{topics, EventBus, EventNormalizer, FeedPipeline, PipelineCounters, WILDCARD};
use rugfeed::supervisor::{IntegrityMonitor, SourceHealthTable};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use uuid::Uuid;

fn game_state(game: &str, tick: i64, active: bool, rugged: bool) -> String {
    format!(
        r#"42["gameStateUpdate",{{"gameId":"{game}","tickCount":{tick},"price":"1.25","active":{active},"rugged":{rugged},"cooldownTimer":0,"allowPreRoundBuys":false}}]"#
    )
}

fn recorded(payloads: Vec<String>) -> Vec<RawFrame> {
    let start = Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap();
    payloads
        .into_iter()
        .enumerate()
        .map(|(i, p)| {
            RawFrame::received("capture", p).with_received_at(start + ChronoDuration::milliseconds(250 * i as i64))
        })
        .collect()
}

fn replay_primary() -> watch::Receiver<Option<PrimarySelection>> {
    let (tx, rx) = watch::channel(Some(PrimarySelection {
        source_id: "replay".to_string(),
        kind: SourceKind::Replay,
        previous: None,
        reason: "initial selection".to_string(),
    }));
    // The receiver keeps the last value after the sender is gone
    drop(tx);
    rx
}

async fn wait_for_frames(counters: &PipelineCounters, expected: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while counters.snapshot().frames_processed < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pipeline processed every frame");
}

/// Run recorded frames through pipeline, bus and writer into `root`
async fn record(root: &std::path::Path, session: Option<Uuid>, frames: Vec<RawFrame>) -> (Uuid, PipelineCountersSnapshot) {
    let mut config = StoreConfig::with_root(root);
    config.session_id = session;
    config.flush_interval_ms = 50;

    let store = EventStore::open(&config).unwrap();
    let session_id = store.session_id();
    let resume_after = store.last_flushed_sequence();

    let bus = EventBus::new();
    let (writer_rx, _sub) = bus.subscribe_channel(WILDCARD, 1024);
    let writer = spawn_writer(store, &config, writer_rx);

    let health = Arc::new(SourceHealthTable::new(MonitorConfig::default()));
    let source = ReplaySource::new("replay", frames, None, health.clone());
    let expected = source.len() as u64;

    let mut normalizer = EventNormalizer::new(session_id, Arc::new(IntegrityMonitor::default()));
    normalizer.resume_after(resume_after);
    let mut pipeline = FeedPipeline::new(normalizer, bus.clone(), health, replay_primary());
    pipeline.add_source(&source);
    let counters = pipeline.counters();

    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(pipeline.run(stop_rx));
    source.connect().await.unwrap();
    wait_for_frames(&counters, expected).await;

    stop_tx.send(true).unwrap();
    task.await.unwrap();
    bus.drain_channels().await;
    writer.close().await.unwrap();

    let stats = counters.snapshot();
    (
        session_id,
        PipelineCountersSnapshot {
            malformed: stats.malformed_frames,
            published: stats.envelopes_published,
        },
    )
}

struct PipelineCountersSnapshot {
    malformed: u64,
    published: u64,
}

/// A malformed frame between valid frames is discarded and counted; the
/// frames around it are recorded.
#[tokio::test]
async fn malformed_frame_is_skipped_and_recording_continues() {
    let tmp = TempDir::new().unwrap();
    let frames = recorded(vec![
        game_state("g1", 1, true, false),
        "42[\"gameStateUpdate\",{\"gameId\":".to_string(),
        "x-not-a-frame".to_string(),
        game_state("g1", 2, true, false),
    ]);

    let (session, stats) = record(tmp.path(), None, frames).await;
    assert_eq!(stats.malformed, 2);

    let envelopes = SessionReader::open(tmp.path(), session).unwrap().read_all().unwrap();
    assert_eq!(envelopes.len() as u64, stats.published);
    let ticks: Vec<i64> = envelopes
        .iter()
        .filter_map(|e| e.tick_fields())
        .filter_map(|t| t.tick_count)
        .collect();
    assert_eq!(ticks, vec![1, 2]);
}

/// An explicit rug followed by the next round's first tick completes the
/// first round exactly once, and persisted sequences have no holes.
#[tokio::test]
async fn round_completes_once_and_sequences_are_contiguous() {
    let tmp = TempDir::new().unwrap();
    let frames = recorded(vec![
        game_state("g1", 1, true, false),
        game_state("g1", 2, true, false),
        game_state("g1", 3, false, true),
        // Late duplicate of the rug frame
        game_state("g1", 3, false, true),
        game_state("g2", 0, false, false),
        game_state("g2", 1, true, false),
        r#"42["newTrade",{"id":"t1","gameId":"g2","type":"buy","qty":2,"price":1.1}]"#.to_string(),
    ]);

    let (session, _) = record(tmp.path(), None, frames).await;
    let envelopes = SessionReader::open(tmp.path(), session).unwrap().read_all().unwrap();

    let sequences: Vec<u64> = envelopes.iter().map(|e| e.sequence).collect();
    let expected: Vec<u64> = (1..=envelopes.len() as u64).collect();
    assert_eq!(sequences, expected);

    let completed: Vec<&str> = envelopes
        .iter()
        .filter(|e| e.event_type == topics::ROUND_COMPLETE)
        .filter_map(|e| match &e.fields {
            TypedFields::RoundComplete(round) => Some(round.round_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec!["g1"]);

    let started = envelopes
        .iter()
        .filter(|e| e.event_type == topics::ROUND_STARTED)
        .count();
    assert_eq!(started, 2);
    assert!(envelopes.iter().any(|e| e.event_type == topics::TRADE));
}

/// Reopening a session continues numbering after the last stored sequence.
#[tokio::test]
async fn resumed_session_continues_sequence() {
    let tmp = TempDir::new().unwrap();
    let (session, first) = record(
        tmp.path(),
        None,
        recorded(vec![game_state("g1", 1, true, false), game_state("g1", 2, true, false)]),
    )
    .await;

    let (resumed, second) = record(
        tmp.path(),
        Some(session),
        recorded(vec![game_state("g1", 3, true, false)]),
    )
    .await;
    assert_eq!(resumed, session);

    let envelopes = SessionReader::open(tmp.path(), session).unwrap().read_all().unwrap();
    assert_eq!(envelopes.len() as u64, first.published + second.published);
    let sequences: Vec<u64> = envelopes.iter().map(|e| e.sequence).collect();
    let expected: Vec<u64> = (1..=envelopes.len() as u64).collect();
    assert_eq!(sequences, expected);
}
