//! Health and status HTTP server
//!
//! Answers "is the feed alive and is it being recorded" for process
//! supervision, and exposes the full status report for inspection.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use super::event_bus::{BusStats, EventBus};
use super::live_state::{LiveSnapshot, LiveStateProvider};
use super::pipeline::{PipelineCounters, PipelineStats};
use crate::coordination::PrimarySelection;
use crate::persistence::WriterHealth;
use crate::supervisor::{IntegrityLedger, IntegrityMonitor, SourceHealth, SourceHealthTable};

/// Queued envelopes a channel subscriber may trail by before the feed is degraded
const BACKLOG_DEGRADED: u64 = 50_000;

/// Overall feed status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Recovering: a source is down, reconnecting or stale, or the writer is retrying
    Degraded,
    /// The writer exhausted its retries; nothing further is recorded
    Fatal,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub overall: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub connected: bool,
    pub primary_source: Option<String>,
    pub last_event_age_ms: Option<u64>,
    pub integrity: IntegrityLedger,
    pub sources: Vec<SourceHealth>,
    pub writer: WriterHealth,
    pub pipeline: PipelineStats,
    pub bus: BusStats,
    pub live: LiveSnapshot,
}

/// Everything the status query reads
pub struct FeedStatus {
    started_at: DateTime<Utc>,
    stale_after_ms: u64,
    live: LiveStateProvider,
    sources: Arc<SourceHealthTable>,
    integrity: Arc<IntegrityMonitor>,
    writer: watch::Receiver<WriterHealth>,
    primary: watch::Receiver<Option<PrimarySelection>>,
    pipeline: Arc<PipelineCounters>,
    bus: EventBus,
}

impl FeedStatus {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stale_after_ms: u64,
        live: LiveStateProvider,
        sources: Arc<SourceHealthTable>,
        integrity: Arc<IntegrityMonitor>,
        writer: watch::Receiver<WriterHealth>,
        primary: watch::Receiver<Option<PrimarySelection>>,
        pipeline: Arc<PipelineCounters>,
        bus: EventBus,
    ) -> Self {
        Self {
            started_at: Utc::now(),
            stale_after_ms,
            live,
            sources,
            integrity,
            writer,
            primary,
            pipeline,
            bus,
        }
    }

    pub fn report(&self) -> StatusReport {
        let now = Utc::now();
        let sources = self.sources.snapshot();
        let writer = self.writer.borrow().clone();
        let primary_source = self.primary.borrow().as_ref().map(|p| p.source_id.clone());
        let bus = self.bus.stats();

        let connected = sources.iter().any(|s| s.connected);
        let last_event_age_ms = primary_source
            .as_ref()
            .and_then(|id| sources.iter().find(|s| &s.source_id == id))
            .and_then(|s| s.last_event_age(now))
            .map(|age| age.as_millis() as u64);

        let overall = if writer.is_fatal() {
            HealthStatus::Fatal
        } else if matches!(writer, WriterHealth::Retrying { .. })
            || !connected
            || sources.iter().any(|s| !s.connected)
            || bus.channel_backlog >= BACKLOG_DEGRADED
            || last_event_age_ms.map_or(true, |age| age > self.stale_after_ms)
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        StatusReport {
            overall,
            timestamp: now,
            uptime_seconds: (now - self.started_at).num_seconds().max(0) as u64,
            connected,
            primary_source,
            last_event_age_ms,
            integrity: self.integrity.ledger(),
            sources,
            writer,
            pipeline: self.pipeline.snapshot(),
            bus,
            live: self.live.snapshot(),
        }
    }
}

pub struct HealthServer {
    state: Arc<FeedStatus>,
    port: u16,
}

impl HealthServer {
    pub fn new(state: Arc<FeedStatus>, port: u16) -> Self {
        Self { state, port }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/status", get(status_handler))
            .with_state(Arc::clone(&self.state))
    }

    /// Serve until `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> crate::Result<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting health server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await
            .map_err(|e| crate::FeedError::Internal(format!("Health server error: {}", e)))?;

        Ok(())
    }
}

/// Compact liveness answer; 503 only once the writer is fatal
async fn health_handler(State(state): State<Arc<FeedStatus>>) -> impl IntoResponse {
    let report = state.report();
    let status_code = match report.overall {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Fatal => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        status_code,
        Json(serde_json::json!({
            "status": report.overall,
            "connected": report.connected,
            "primary_source": report.primary_source,
            "last_event_age_ms": report.last_event_age_ms,
            "integrity": report.integrity,
        })),
    )
}

async fn status_handler(State(state): State<Arc<FeedStatus>>) -> impl IntoResponse {
    Json(state.report())
}
