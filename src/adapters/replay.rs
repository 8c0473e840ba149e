//! Replay source: re-feeds recorded frames through the live pipeline
//!
//! Frames keep their original timestamps. With a speed factor the original
//! inter-arrival gaps are reproduced (scaled); without one frames are
//! emitted as fast as the consumer keeps up.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use super::link::{SessionEnd, SourceLink, Transport, FRAME_CHANNEL_CAPACITY};
use super::CaptureSource;
use crate::config::ReconnectConfig;
use crate::domain::{DocType, EventEnvelope, RawFrame, SourceKind};
use crate::error::Result;
use crate::supervisor::SourceHealthTable;

/// Upper bound on the replay broadcast buffer
const MAX_REPLAY_BUFFER: usize = 1 << 20;

pub struct ReplayTransport {
    frames: Arc<Vec<RawFrame>>,
    speed: Option<f64>,
}

#[async_trait]
impl Transport for ReplayTransport {
    type Conn = Arc<Vec<RawFrame>>;

    async fn open(&self, link: &SourceLink) -> Result<Self::Conn> {
        link.mark_connected(None);
        info!(source_id = %link.source_id(), frames = self.frames.len(), "Replay started");
        Ok(Arc::clone(&self.frames))
    }

    async fn pump(
        &self,
        frames: Self::Conn,
        link: &SourceLink,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd> {
        let mut previous: Option<&RawFrame> = None;

        for frame in frames.iter() {
            if *stop.borrow() {
                return Ok(SessionEnd::Stopped);
            }

            let gap = match (self.speed, previous) {
                (Some(speed), Some(prev)) if speed > 0.0 => {
                    let ms = (frame.received_at - prev.received_at).num_milliseconds().max(0);
                    Duration::from_millis((ms as f64 / speed) as u64)
                }
                _ => Duration::ZERO,
            };

            if gap.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(gap) => {}
                    _ = stop.changed() => return Ok(SessionEnd::Stopped),
                }
            }

            link.emit(RawFrame {
                source_id: link.source_id().to_string(),
                ..frame.clone()
            });
            previous = Some(frame);
        }

        Ok(SessionEnd::Exhausted)
    }
}

pub struct ReplaySource {
    link: Arc<SourceLink>,
    transport: Arc<ReplayTransport>,
}

impl ReplaySource {
    /// Replay `frames` in order; `speed` of 1.0 reproduces original pacing
    pub fn new(
        source_id: &str,
        frames: Vec<RawFrame>,
        speed: Option<f64>,
        health: Arc<SourceHealthTable>,
    ) -> Self {
        let capacity = frames.len().clamp(FRAME_CHANNEL_CAPACITY, MAX_REPLAY_BUFFER);
        Self {
            link: Arc::new(SourceLink::with_capacity(
                source_id,
                SourceKind::Replay,
                health,
                capacity,
            )),
            transport: Arc::new(ReplayTransport {
                frames: Arc::new(frames),
                speed,
            }),
        }
    }

    /// Rebuild the observed frames of a stored session.
    /// Derived system envelopes carry no payload and are skipped.
    pub fn from_envelopes(
        source_id: &str,
        envelopes: impl IntoIterator<Item = EventEnvelope>,
        speed: Option<f64>,
        health: Arc<SourceHealthTable>,
    ) -> Self {
        let frames = envelopes
            .into_iter()
            .filter(|e| !(e.doc_type == DocType::System && e.raw_payload.is_empty()))
            .map(|e| RawFrame {
                received_at: e.ts,
                source_id: e.source_id,
                direction: e.direction,
                payload: e.raw_payload.into_bytes(),
            })
            .collect();
        Self::new(source_id, frames, speed, health)
    }

    pub fn len(&self) -> usize {
        self.transport.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transport.frames.is_empty()
    }
}

#[async_trait]
impl CaptureSource for ReplaySource {
    fn source_id(&self) -> &str {
        self.link.source_id()
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Replay
    }

    async fn connect(&self) -> Result<()> {
        self.link
            .connect(Arc::clone(&self.transport), ReconnectConfig::default())
            .await
    }

    fn frames(&self) -> BoxStream<'static, RawFrame> {
        self.link.frames()
    }

    async fn disconnect(&self) {
        self.link.disconnect().await
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }
}
