//! Graceful Shutdown Handler
//!
//! Cooperative shutdown for the feed recorder: stop sources, let the
//! ingestion loop drain what it already received, then flush the store.
//! Only a forced kill mid-flush may lose the last unflushed buffer.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Normal graceful shutdown (SIGTERM, SIGINT)
    Graceful,
    /// Urgent shutdown - reduce timeouts
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

/// Configuration for graceful shutdown
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Total timeout for graceful shutdown (default: 30s)
    pub total_timeout_secs: u64,
    /// Time to wait for sources to close (default: 5s)
    pub source_close_timeout_secs: u64,
    /// Time to wait for the ingestion loop to drain (default: 10s)
    pub drain_timeout_secs: u64,
    /// Time to wait for the final store flush (default: 15s)
    pub flush_timeout_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            total_timeout_secs: 30,
            source_close_timeout_secs: 5,
            drain_timeout_secs: 10,
            flush_timeout_secs: 15,
        }
    }
}

impl ShutdownConfig {
    /// Shorter budget used after an urgent signal
    pub fn urgent() -> Self {
        Self {
            total_timeout_secs: 8,
            source_close_timeout_secs: 1,
            drain_timeout_secs: 2,
            flush_timeout_secs: 5,
        }
    }
}

/// Shutdown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    StoppingSources,
    DrainingPipeline,
    FlushingStore,
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::StoppingSources => write!(f, "stopping_sources"),
            ShutdownPhase::DrainingPipeline => write!(f, "draining_pipeline"),
            ShutdownPhase::FlushingStore => write!(f, "flushing_store"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

pub type PhaseFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    config: ShutdownConfig,
    shutdown_requested: AtomicBool,
    signal_tx: watch::Sender<Option<ShutdownSignal>>,
    phase_tx: watch::Sender<ShutdownPhase>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (signal_tx, _) = watch::channel(None);
        let (phase_tx, _) = watch::channel(ShutdownPhase::Running);
        Self {
            config,
            shutdown_requested: AtomicBool::new(false),
            signal_tx,
            phase_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn signal(&self) -> Option<ShutdownSignal> {
        *self.signal_tx.borrow()
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_tx.borrow()
    }

    /// Request shutdown; repeated requests are ignored
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }
        info!("Shutdown requested: {}", signal);
        self.signal_tx.send_replace(Some(signal));
    }

    /// Receiver that flips to true once shutdown is requested, for task loops
    pub fn token(&self) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(self.is_shutdown_requested());
        let mut signal_rx = self.signal_tx.subscribe();
        if !self.is_shutdown_requested() {
            tokio::spawn(async move {
                while signal_rx.borrow_and_update().is_none() {
                    if signal_rx.changed().await.is_err() {
                        return;
                    }
                }
                let _ = tx.send(true);
            });
        }
        rx
    }

    /// Resolves once shutdown is requested
    pub async fn wait_for_request(&self) -> ShutdownSignal {
        let mut rx = self.signal_tx.subscribe();
        loop {
            if let Some(signal) = *rx.borrow_and_update() {
                return signal;
            }
            if rx.changed().await.is_err() {
                return ShutdownSignal::Urgent;
            }
        }
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase_tx.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Run the shutdown sequence. Each phase is bounded by its own timeout;
    /// the flush runs even when earlier phases time out.
    pub async fn execute<F1, F2, F3>(
        &self,
        stop_sources: F1,
        drain_pipeline: F2,
        flush_store: F3,
    ) -> Result<(), ShutdownError>
    where
        F1: FnOnce() -> PhaseFuture<()>,
        F2: FnOnce() -> PhaseFuture<()>,
        F3: FnOnce() -> PhaseFuture<Result<(), String>>,
    {
        let config = match self.signal() {
            Some(ShutdownSignal::Urgent) => ShutdownConfig::urgent(),
            _ => self.config.clone(),
        };
        let start = std::time::Instant::now();
        let total_timeout = Duration::from_secs(config.total_timeout_secs);

        info!("Starting graceful shutdown (timeout: {}s)", config.total_timeout_secs);

        self.set_phase(ShutdownPhase::StoppingSources);
        let timeout = Duration::from_secs(config.source_close_timeout_secs);
        match tokio::time::timeout(timeout, stop_sources()).await {
            Ok(()) => debug!("Sources stopped"),
            Err(_) => warn!("Source close timeout after {}s", config.source_close_timeout_secs),
        }

        self.set_phase(ShutdownPhase::DrainingPipeline);
        let timeout = Duration::from_secs(config.drain_timeout_secs);
        match tokio::time::timeout(timeout, drain_pipeline()).await {
            Ok(()) => debug!("Ingestion loop drained"),
            Err(_) => warn!("Pipeline drain timeout after {}s", config.drain_timeout_secs),
        }

        self.set_phase(ShutdownPhase::FlushingStore);
        let remaining = total_timeout.saturating_sub(start.elapsed());
        let timeout = Duration::from_secs(config.flush_timeout_secs).max(remaining);
        let flushed = match tokio::time::timeout(timeout, flush_store()).await {
            Ok(Ok(())) => {
                debug!("Store flushed");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("Final flush failed: {}", e);
                Err(ShutdownError::ComponentFailed(format!("store: {e}")))
            }
            Err(_) => {
                error!("Final flush timeout after {:?}", timeout);
                Err(ShutdownError::Timeout)
            }
        };

        self.set_phase(ShutdownPhase::Complete);
        info!("Graceful shutdown completed in {:?}", start.elapsed());
        flushed
    }
}

/// Shutdown errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
    Timeout,
    ComponentFailed(String),
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownError::Timeout => write!(f, "shutdown timed out"),
            ShutdownError::ComponentFailed(c) => write!(f, "component {} failed during shutdown", c),
        }
    }
}

impl std::error::Error for ShutdownError {}

/// Install OS signal handlers that request shutdown
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    tokio::spawn(async move {
        wait_for_os_signal(&shutdown).await;
    });
}

#[cfg(unix)]
async fn wait_for_os_signal(shutdown: &GracefulShutdown) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut term, mut quit) = match (signal(SignalKind::terminate()), signal(SignalKind::quit())) {
        (Ok(term), Ok(quit)) => (term, quit),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to install signal handlers: {}", e);
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.request_shutdown(ShutdownSignal::Graceful);
            }
            return;
        }
    };

    tokio::select! {
        _ = term.recv() => {
            info!("Received SIGTERM");
            shutdown.request_shutdown(ShutdownSignal::Graceful);
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT");
            shutdown.request_shutdown(ShutdownSignal::Graceful);
        }
        _ = quit.recv() => {
            warn!("Received SIGQUIT - urgent shutdown");
            shutdown.request_shutdown(ShutdownSignal::Urgent);
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_os_signal(shutdown: &GracefulShutdown) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Received Ctrl+C");
        shutdown.request_shutdown(ShutdownSignal::Graceful);
    }
}
