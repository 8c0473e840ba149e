//! Ingestion loop
//!
//! Merges the frame streams of every capture source, decodes each frame once,
//! feeds source health, and normalizes and publishes frames of the current
//! primary source only. Primary switches are announced in-band so the
//! published sequence stays contiguous across a failover.

use chrono::Utc;
use futures::stream::{select_all, BoxStream};
use futures::{FutureExt, StreamExt};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::event_bus::EventBus;
use super::normalizer::{EventNormalizer, NormalizerStats, GAME_STATE_EVENT};
use crate::adapters::CaptureSource;
use crate::coordination::PrimarySelection;
use crate::domain::{Direction, RawFrame, SourceKind};
use crate::protocol::decode;
use crate::supervisor::SourceHealthTable;

/// Longest payload prefix included in malformed-frame logs
const LOG_PREVIEW_CHARS: usize = 120;

#[derive(Debug, Default)]
pub struct PipelineCounters {
    frames_processed: AtomicU64,
    malformed_frames: AtomicU64,
    control_frames: AtomicU64,
    non_primary_frames: AtomicU64,
    envelopes_published: AtomicU64,
    last_sequence: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub frames_processed: u64,
    pub malformed_frames: u64,
    pub control_frames: u64,
    pub non_primary_frames: u64,
    pub envelopes_published: u64,
    pub last_sequence: u64,
}

impl PipelineCounters {
    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            control_frames: self.control_frames.load(Ordering::Relaxed),
            non_primary_frames: self.non_primary_frames.load(Ordering::Relaxed),
            envelopes_published: self.envelopes_published.load(Ordering::Relaxed),
            last_sequence: self.last_sequence.load(Ordering::Relaxed),
        }
    }
}

pub struct FeedPipeline {
    streams: Vec<BoxStream<'static, RawFrame>>,
    kinds: Vec<(String, SourceKind)>,
    normalizer: EventNormalizer,
    bus: EventBus,
    health: Arc<SourceHealthTable>,
    primary: watch::Receiver<Option<PrimarySelection>>,
    current_primary: Option<String>,
    counters: Arc<PipelineCounters>,
}

impl FeedPipeline {
    pub fn new(
        normalizer: EventNormalizer,
        bus: EventBus,
        health: Arc<SourceHealthTable>,
        primary: watch::Receiver<Option<PrimarySelection>>,
    ) -> Self {
        Self {
            streams: Vec::new(),
            kinds: Vec::new(),
            normalizer,
            bus,
            health,
            primary,
            current_primary: None,
            counters: Arc::new(PipelineCounters::default()),
        }
    }

    /// Subscribe to a source's frames. Call before the source connects.
    pub fn add_source(&mut self, source: &dyn CaptureSource) {
        self.streams.push(source.frames());
        self.kinds
            .push((source.source_id().to_string(), source.kind()));
    }

    pub fn counters(&self) -> Arc<PipelineCounters> {
        Arc::clone(&self.counters)
    }

    pub fn current_primary(&self) -> Option<&str> {
        self.current_primary.as_deref()
    }

    /// Run until `stop` flips to true, then process every frame already
    /// queued and return the normalizer's final counters.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) -> NormalizerStats {
        let mut frames = select_all(std::mem::take(&mut self.streams));
        let mut primary_open = true;
        self.apply_primary().await;
        info!(sources = self.kinds.len(), "Ingestion pipeline started");

        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                changed = self.primary.changed(), if primary_open => {
                    if changed.is_err() {
                        primary_open = false;
                        continue;
                    }
                    self.apply_primary().await;
                }
                frame = frames.next() => match frame {
                    Some(frame) => self.process_frame(frame).await,
                    None => {
                        info!("All frame streams ended");
                        break;
                    }
                },
            }
        }

        let mut drained = 0usize;
        while let Some(Some(frame)) = frames.next().now_or_never() {
            self.process_frame(frame).await;
            drained += 1;
        }

        let stats = self.normalizer.stats();
        info!(
            drained,
            last_sequence = stats.last_sequence,
            rounds_completed = stats.rounds_completed,
            "Ingestion pipeline stopped"
        );
        stats
    }

    /// Adopt the latest primary selection, announcing a change on the bus
    async fn apply_primary(&mut self) {
        let Some(selection) = self.primary.borrow_and_update().clone() else {
            return;
        };
        if self.current_primary.as_deref() == Some(selection.source_id.as_str()) {
            return;
        }

        let previous = self.current_primary.replace(selection.source_id.clone());
        info!(
            from = ?previous,
            to = %selection.source_id,
            reason = %selection.reason,
            "Normalizing from new primary"
        );
        let envelope = self.normalizer.source_changed(
            Utc::now(),
            selection.kind,
            previous,
            &selection.source_id,
            &selection.reason,
        );
        self.publish(envelope).await;
    }

    /// Decode, account and, for the primary, normalize and publish one frame.
    /// A bad frame is logged and counted; it never stops the loop.
    pub async fn process_frame(&mut self, frame: RawFrame) {
        self.counters.frames_processed.fetch_add(1, Ordering::Relaxed);

        let event = match decode(&frame.payload) {
            Ok(event) => event,
            Err(e) if e.is_control() => {
                self.counters.control_frames.fetch_add(1, Ordering::Relaxed);
                debug!(source_id = %frame.source_id, error = %e, "Control frame");
                return;
            }
            Err(e) => {
                self.counters.malformed_frames.fetch_add(1, Ordering::Relaxed);
                let preview: String = frame.payload_lossy().chars().take(LOG_PREVIEW_CHARS).collect();
                warn!(
                    source_id = %frame.source_id,
                    kind = e.kind(),
                    error = %e,
                    payload = %preview,
                    "Discarding frame"
                );
                return;
            }
        };

        let primary_kind =
            frame.direction == Direction::Received && event.event_name == GAME_STATE_EVENT;
        self.health
            .record_event(&frame.source_id, frame.received_at, primary_kind);

        if self.current_primary.as_deref() != Some(frame.source_id.as_str()) {
            self.counters.non_primary_frames.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let kind = self
            .kinds
            .iter()
            .find(|(id, _)| *id == frame.source_id)
            .map(|(_, kind)| *kind)
            .unwrap_or(SourceKind::Direct);

        for envelope in self.normalizer.normalize(&event, &frame, kind) {
            self.publish(envelope).await;
        }
    }

    async fn publish(&mut self, envelope: crate::domain::EventEnvelope) {
        let sequence = envelope.sequence;
        let report = self.bus.publish(envelope).await;
        if report.failed > 0 {
            warn!(sequence, failed = report.failed, "Subscriber failures during publish");
        }
        self.counters.envelopes_published.fetch_add(1, Ordering::Relaxed);
        self.counters.last_sequence.store(sequence, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::domain::EventEnvelope;
    use crate::services::normalizer::topics;
    use crate::supervisor::IntegrityMonitor;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn pipeline() -> (
        FeedPipeline,
        watch::Sender<Option<PrimarySelection>>,
        Arc<Mutex<Vec<EventEnvelope>>>,
    ) {
        let health = Arc::new(SourceHealthTable::new(MonitorConfig::default()));
        health.register("a", SourceKind::Capture);
        health.register("b", SourceKind::Direct);
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        // Dropping the handle keeps the subscription
        let _ = bus.subscribe("*", move |e| sink.lock().unwrap().push(e.clone()));

        let (tx, rx) = watch::channel(None);
        let normalizer = EventNormalizer::new(Uuid::new_v4(), Arc::new(IntegrityMonitor::default()));
        let mut pipeline = FeedPipeline::new(normalizer, bus, health, rx);
        pipeline.kinds.push(("a".to_string(), SourceKind::Capture));
        pipeline.kinds.push(("b".to_string(), SourceKind::Direct));
        (pipeline, tx, seen)
    }

    fn select(tx: &watch::Sender<Option<PrimarySelection>>, id: &str, kind: SourceKind) {
        tx.send_replace(Some(PrimarySelection {
            source_id: id.to_string(),
            kind,
            previous: None,
            reason: "test".to_string(),
        }));
    }

    fn tick(source: &str, game: &str, tick: i64) -> RawFrame {
        let payload = format!(
            r#"42["gameStateUpdate",{{"gameId":"{game}","tickCount":{tick},"price":1.5,"active":true,"rugged":false,"cooldownTimer":0,"allowPreRoundBuys":false}}]"#
        );
        RawFrame::received(source, payload)
    }

    #[test]
    fn test_run_future_can_be_spawned() {
        fn assert_send<T: Send>(_: &T) {}
        let (pipeline, _tx, _seen) = pipeline();
        let (_stop_tx, stop_rx) = watch::channel(false);
        let run = pipeline.run(stop_rx);
        assert_send(&run);
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_stop_processing() {
        let (mut pipeline, tx, seen) = pipeline();
        select(&tx, "a", SourceKind::Capture);
        pipeline.apply_primary().await;

        pipeline.process_frame(tick("a", "g1", 1)).await;
        pipeline.process_frame(RawFrame::received("a", "42[\"broken\"")).await;
        pipeline.process_frame(RawFrame::received("a", "2")).await;
        pipeline.process_frame(tick("a", "g1", 2)).await;

        let stats = pipeline.counters().snapshot();
        assert_eq!(stats.frames_processed, 4);
        assert_eq!(stats.malformed_frames, 1);
        assert_eq!(stats.control_frames, 1);

        let ticks = seen
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.event_type == topics::GAME_STATE)
            .count();
        assert_eq!(ticks, 2);
    }

    #[tokio::test]
    async fn test_only_primary_frames_are_published() {
        let (mut pipeline, tx, seen) = pipeline();
        select(&tx, "a", SourceKind::Capture);
        pipeline.apply_primary().await;

        pipeline.process_frame(tick("b", "g1", 1)).await;
        assert_eq!(pipeline.counters().snapshot().non_primary_frames, 1);
        // Only the source_changed announcement so far
        assert_eq!(seen.lock().unwrap().len(), 1);
        // Secondary frames still feed health
        assert_eq!(pipeline.health.get("b").unwrap().events_received, 1);
    }

    #[tokio::test]
    async fn test_switch_keeps_sequence_contiguous() {
        let (mut pipeline, tx, seen) = pipeline();
        select(&tx, "a", SourceKind::Capture);
        pipeline.apply_primary().await;
        pipeline.process_frame(tick("a", "g1", 1)).await;
        pipeline.process_frame(tick("a", "g1", 2)).await;

        select(&tx, "b", SourceKind::Direct);
        pipeline.apply_primary().await;
        pipeline.process_frame(tick("a", "g1", 3)).await;
        pipeline.process_frame(tick("b", "g1", 3)).await;

        let seen = seen.lock().unwrap();
        let sequences: Vec<u64> = seen.iter().map(|e| e.sequence).collect();
        let expected: Vec<u64> = (1..=sequences.len() as u64).collect();
        assert_eq!(sequences, expected);

        let switches: Vec<&EventEnvelope> = seen
            .iter()
            .filter(|e| e.event_type == topics::SOURCE_CHANGED)
            .collect();
        assert_eq!(switches.len(), 2);
        assert_eq!(switches[1].source_id, "b");
        assert_eq!(
            seen.iter().filter(|e| e.event_type == topics::ROUND_STARTED).count(),
            1
        );
    }
}
