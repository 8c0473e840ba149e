//! Background store writer
//!
//! Consumes envelopes from a bus channel, buffers them in the `EventStore`
//! and flushes on size, on interval, on request and on close. Flush failures
//! are retried with exponential backoff; the buffer is kept across failures
//! and a later successful flush returns the writer to healthy.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::event_store::EventStore;
use crate::config::StoreConfig;
use crate::domain::EventEnvelope;
use crate::error::{FeedError, Result, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WriterHealth {
    Healthy,
    Retrying { attempt: u32, error: String },
    /// Retries exhausted; buffered events are kept for the next flush
    Fatal { reason: String },
}

impl WriterHealth {
    pub fn is_fatal(&self) -> bool {
        matches!(self, WriterHealth::Fatal { .. })
    }
}

enum WriterCommand {
    Flush(oneshot::Sender<std::result::Result<usize, String>>),
    Close(oneshot::Sender<std::result::Result<(), String>>),
}

pub struct WriterHandle {
    session_id: Uuid,
    commands: mpsc::Sender<WriterCommand>,
    health: watch::Receiver<WriterHealth>,
    last_flushed: Arc<AtomicU64>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WriterHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn health(&self) -> watch::Receiver<WriterHealth> {
        self.health.clone()
    }

    pub fn current_health(&self) -> WriterHealth {
        self.health.borrow().clone()
    }

    pub fn last_flushed_sequence(&self) -> u64 {
        self.last_flushed.load(Ordering::SeqCst)
    }

    /// Write everything received so far
    pub async fn flush(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(WriterCommand::Flush(tx))
            .await
            .map_err(|_| FeedError::Store(StoreError::Closed))?;
        rx.await
            .map_err(|_| FeedError::Store(StoreError::Closed))?
            .map_err(FeedError::WriterFatal)
    }

    /// Drain queued envelopes, flush, mark the session closed and stop the task
    pub async fn close(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let sent = self.commands.send(WriterCommand::Close(tx)).await.is_ok();
        let outcome = if sent {
            rx.await
                .map_err(|_| FeedError::Store(StoreError::Closed))?
                .map_err(FeedError::WriterFatal)
        } else {
            Ok(())
        };

        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!("Store writer task failed: {}", e);
            }
        }
        outcome
    }
}

struct WriterTask {
    store: Arc<Mutex<EventStore>>,
    health_tx: watch::Sender<WriterHealth>,
    last_flushed: Arc<AtomicU64>,
    max_retries: u32,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

/// `base * 2^(attempt-1)`, capped at `max`
fn retry_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(max)
}

fn lock(store: &Mutex<EventStore>) -> MutexGuard<'_, EventStore> {
    match store.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Start the writer task over an opened store
pub fn spawn_writer(
    store: EventStore,
    config: &StoreConfig,
    events: mpsc::Receiver<Arc<EventEnvelope>>,
) -> WriterHandle {
    let session_id = store.session_id();
    let last_flushed = Arc::new(AtomicU64::new(store.last_flushed_sequence()));
    let (health_tx, health_rx) = watch::channel(WriterHealth::Healthy);
    let (cmd_tx, cmd_rx) = mpsc::channel(16);

    let task = WriterTask {
        store: Arc::new(Mutex::new(store)),
        health_tx,
        last_flushed: last_flushed.clone(),
        max_retries: config.max_write_retries,
        retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        retry_max_delay: Duration::from_millis(config.retry_max_delay_ms),
    };
    let flush_interval = Duration::from_millis(config.flush_interval_ms.max(1));
    let handle = tokio::spawn(task.run(events, cmd_rx, flush_interval));

    WriterHandle {
        session_id,
        commands: cmd_tx,
        health: health_rx,
        last_flushed,
        task: tokio::sync::Mutex::new(Some(handle)),
    }
}

impl WriterTask {
    async fn run(
        self,
        mut events: mpsc::Receiver<Arc<EventEnvelope>>,
        mut commands: mpsc::Receiver<WriterCommand>,
        flush_interval: Duration,
    ) {
        // First tick one full period after start
        let mut interval =
            tokio::time::interval_at(tokio::time::Instant::now() + flush_interval, flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(session_id = %lock(&self.store).session_id(), "Store writer started");

        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(envelope) => {
                        if self.buffer(&envelope) {
                            let _ = self.flush_with_retry().await;
                        }
                    }
                    None => {
                        debug!("Event channel closed, closing store");
                        if let Err(e) = self.close_store().await {
                            error!("Store close failed: {}", e);
                        }
                        break;
                    }
                },
                _ = interval.tick() => {
                    if lock(&self.store).buffered_len() > 0 {
                        let _ = self.flush_with_retry().await;
                    }
                }
                cmd = commands.recv() => match cmd {
                    Some(WriterCommand::Flush(reply)) => {
                        self.drain(&mut events);
                        let _ = reply.send(self.flush_with_retry().await);
                    }
                    Some(WriterCommand::Close(reply)) => {
                        self.drain(&mut events);
                        let _ = reply.send(self.close_store().await);
                        break;
                    }
                    None => {
                        self.drain(&mut events);
                        if let Err(e) = self.close_store().await {
                            error!("Store close failed: {}", e);
                        }
                        break;
                    }
                },
            }
        }
        info!("Store writer stopped");
    }

    /// Returns true when the buffer reached its flush threshold
    fn buffer(&self, envelope: &EventEnvelope) -> bool {
        let mut store = lock(&self.store);
        match store.write(envelope.clone()) {
            Ok(()) => store.should_flush(),
            Err(e) => {
                warn!(sequence = envelope.sequence, error = %e, "Envelope rejected by store");
                false
            }
        }
    }

    fn drain(&self, events: &mut mpsc::Receiver<Arc<EventEnvelope>>) {
        while let Ok(envelope) = events.try_recv() {
            self.buffer(&envelope);
        }
    }

    async fn flush_once(&self) -> std::result::Result<(usize, u64), String> {
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || {
            let mut store = lock(&store);
            store.flush().map(|n| (n, store.last_flushed_sequence()))
        })
        .await
        {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(e) => Err(format!("flush task failed: {e}")),
        }
    }

    async fn flush_with_retry(&self) -> std::result::Result<usize, String> {
        let mut attempt = 0u32;
        loop {
            match self.flush_once().await {
                Ok((written, last)) => {
                    self.last_flushed.store(last, Ordering::SeqCst);
                    if *self.health_tx.borrow() != WriterHealth::Healthy {
                        info!(last_flushed = last, "Store writer recovered");
                        self.health_tx.send_replace(WriterHealth::Healthy);
                    }
                    if written > 0 {
                        debug!(written, last_flushed = last, "Flushed");
                    }
                    return Ok(written);
                }
                Err(error) if attempt < self.max_retries => {
                    attempt += 1;
                    let delay = retry_delay(self.retry_base_delay, self.retry_max_delay, attempt);
                    warn!(attempt, ?delay, %error, "Flush failed, retrying");
                    self.health_tx.send_replace(WriterHealth::Retrying {
                        attempt,
                        error,
                    });
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    error!(attempts = attempt + 1, %error, "Flush retries exhausted");
                    self.health_tx.send_replace(WriterHealth::Fatal {
                        reason: error.clone(),
                    });
                    return Err(error);
                }
            }
        }
    }

    async fn close_store(&self) -> std::result::Result<(), String> {
        self.flush_with_retry().await?;
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut store = lock(&store);
            store.close().map(|()| store.last_flushed_sequence())
        })
        .await;
        match result {
            Ok(Ok(last)) => {
                self.last_flushed.store(last, Ordering::SeqCst);
                Ok(())
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(format!("close task failed: {e}")),
        }
    }
}
