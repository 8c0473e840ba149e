//! Capture sources
//!
//! Each source owns one upstream connection and publishes `RawFrame`s on a
//! broadcast stream. Connecting is idempotent: a second `connect` on a live
//! source is a no-op, so frames are never delivered twice.

pub mod cdp;
pub mod direct;
pub mod link;
pub mod replay;

use async_trait::async_trait;
use futures::stream::BoxStream;
use rand::Rng;
use std::time::Duration;

use crate::config::ReconnectConfig;
use crate::domain::{RawFrame, SourceKind};
use crate::error::Result;

pub use cdp::CdpSource;
pub use direct::DirectSource;
pub use link::{SourceLink, Transport};
pub use replay::ReplaySource;

#[async_trait]
pub trait CaptureSource: Send + Sync {
    fn source_id(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Establish the upstream connection and start delivering frames.
    /// Calling this on a connected source does nothing.
    async fn connect(&self) -> Result<()>;

    /// Frames produced from now on. Subscribe before `connect` to see the first frame.
    fn frames(&self) -> BoxStream<'static, RawFrame>;

    /// Stop delivering and release the connection
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

/// Exponential reconnect backoff with optional ±25% jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let base = self.config.delay_for(self.attempt);
        if !self.config.jitter {
            return base;
        }

        let base_ms = base.as_millis() as f64;
        let factor = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_millis((base_ms * factor) as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
