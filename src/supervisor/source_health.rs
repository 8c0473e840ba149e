//! Per-source health table
//!
//! Capture sources report connection lifecycle, the ingestion loop reports
//! frame arrivals. The source manager reads snapshots to rank sources.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::latency::{LatencyClass, LatencyMonitor};
use super::rate_limiter::RateLimiter;
use crate::config::MonitorConfig;
use crate::domain::SourceKind;

/// Health of one capture source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceHealth {
    pub source_id: String,
    pub kind: SourceKind,
    pub connected: bool,
    pub last_event_at: Option<DateTime<Utc>>,
    pub latency_ms_p50: Option<f64>,
    pub latency_ms_p95: Option<f64>,
    pub latency_class: LatencyClass,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub events_received: u64,
    pub within_rate_budget: bool,
    /// Frames a slow consumer missed on this source's stream
    pub frames_lagged: u64,
    pub last_error: Option<String>,
}

impl SourceHealth {
    fn new(source_id: &str, kind: SourceKind) -> Self {
        Self {
            source_id: source_id.to_string(),
            kind,
            connected: false,
            last_event_at: None,
            latency_ms_p50: None,
            latency_ms_p95: None,
            latency_class: LatencyClass::Normal,
            consecutive_failures: 0,
            total_failures: 0,
            events_received: 0,
            within_rate_budget: true,
            frames_lagged: 0,
            last_error: None,
        }
    }

    pub fn last_event_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_event_at
            .map(|at| (now - at).to_std().unwrap_or(Duration::ZERO))
    }
}

#[derive(Debug)]
struct SourceEntry {
    health: SourceHealth,
    latency: LatencyMonitor,
    rate: RateLimiter,
    last_primary_frame_at: Option<DateTime<Utc>>,
}

/// Shared, lock-guarded health table for all capture sources
#[derive(Debug)]
pub struct SourceHealthTable {
    config: MonitorConfig,
    entries: DashMap<String, SourceEntry>,
    degraded: Notify,
}

impl SourceHealthTable {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            degraded: Notify::new(),
        }
    }

    /// Register a source. Re-registering keeps the existing entry.
    pub fn register(&self, source_id: &str, kind: SourceKind) {
        self.entries
            .entry(source_id.to_string())
            .or_insert_with(|| SourceEntry {
                health: SourceHealth::new(source_id, kind),
                latency: LatencyMonitor::new(&self.config),
                rate: RateLimiter::new(
                    Duration::from_millis(self.config.rate_window_ms),
                    self.config.rate_max_events,
                ),
                last_primary_frame_at: None,
            });
        debug!(source_id, %kind, "Registered source for health tracking");
    }

    pub fn record_connected(&self, source_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(source_id) {
            entry.health.connected = true;
            entry.health.consecutive_failures = 0;
            entry.health.last_error = None;
            entry.last_primary_frame_at = None;
        }
    }

    pub fn record_disconnected(&self, source_id: &str) {
        let changed = match self.entries.get_mut(source_id) {
            Some(mut entry) => {
                let was_connected = entry.health.connected;
                entry.health.connected = false;
                was_connected
            }
            None => false,
        };
        if changed {
            self.degraded.notify_one();
        }
    }

    pub fn record_failure(&self, source_id: &str, error: &str) {
        if let Some(mut entry) = self.entries.get_mut(source_id) {
            entry.health.connected = false;
            entry.health.consecutive_failures += 1;
            entry.health.total_failures += 1;
            entry.health.last_error = Some(error.to_string());
        }
        self.degraded.notify_one();
    }

    /// Record one frame arrival. `primary_kind` marks the round update event,
    /// whose inter-arrival time is the latency sample.
    pub fn record_event(
        &self,
        source_id: &str,
        received_at: DateTime<Utc>,
        primary_kind: bool,
    ) -> Option<LatencyClass> {
        let class = {
            let mut entry = self.entries.get_mut(source_id)?;
            let entry = &mut *entry;
            entry.health.events_received += 1;
            entry.health.last_event_at = Some(received_at);
            entry.rate.record();
            entry.health.within_rate_budget = entry.rate.is_within_budget();

            if !primary_kind {
                return None;
            }

            let previous = entry.last_primary_frame_at.replace(received_at);
            let sample = previous.map(|prev| (received_at - prev).num_milliseconds().max(0) as f64);
            let class = match sample {
                Some(latency_ms) => entry.latency.record(source_id, latency_ms),
                None => LatencyClass::Normal,
            };
            entry.health.latency_class = class;
            entry.health.latency_ms_p50 = entry.latency.p50();
            entry.health.latency_ms_p95 = entry.latency.p95();
            class
        };

        if class == LatencyClass::Critical {
            self.degraded.notify_one();
        }
        Some(class)
    }

    pub fn record_lag(&self, source_id: &str, skipped: u64) {
        if let Some(mut entry) = self.entries.get_mut(source_id) {
            entry.health.frames_lagged += skipped;
        }
        warn!(source_id, skipped, "Frame consumer lagged behind source");
        self.degraded.notify_one();
    }

    pub fn get(&self, source_id: &str) -> Option<SourceHealth> {
        self.entries.get(source_id).map(|e| e.health.clone())
    }

    /// Snapshot of every source, ordered by id
    pub fn snapshot(&self) -> Vec<SourceHealth> {
        let mut all: Vec<SourceHealth> = self.entries.iter().map(|e| e.health.clone()).collect();
        all.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        all
    }

    /// Resolves when some source reported a degradation
    pub async fn degraded(&self) {
        self.degraded.notified().await
    }
}
