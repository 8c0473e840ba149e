//! Connection lifecycle shared by every capture source
//!
//! `SourceLink` owns the frame broadcast, the connected flag and socket id, and
//! the background session task. A `Transport` supplies the protocol: how to
//! open a session and how to pump it until it ends. The link handles
//! idempotent connect, reconnect with backoff and orderly disconnect.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Backoff;
use crate::config::ReconnectConfig;
use crate::domain::{RawFrame, SourceKind};
use crate::error::{FeedError, Result};
use crate::supervisor::SourceHealthTable;

/// Frames buffered per subscriber before it starts lagging
pub const FRAME_CHANNEL_CAPACITY: usize = 4096;

const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// How a pumped session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Upstream closed; reconnect
    Closed,
    /// Finite source ran out of frames; do not reconnect
    Exhausted,
    /// Local stop requested
    Stopped,
}

/// Upstream protocol driven by a `SourceLink`
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Conn: Send + 'static;

    /// Open one session. Transports call `link.mark_connected` once the
    /// upstream is actually delivering.
    async fn open(&self, link: &SourceLink) -> Result<Self::Conn>;

    /// Read from an open session until it ends or `stop` flips to true
    async fn pump(
        &self,
        conn: Self::Conn,
        link: &SourceLink,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd>;
}

#[derive(Default)]
struct LinkState {
    connected: bool,
    socket_id: Option<String>,
    task: Option<JoinHandle<()>>,
}

pub struct SourceLink {
    source_id: String,
    kind: SourceKind,
    frames_tx: broadcast::Sender<RawFrame>,
    state: Mutex<LinkState>,
    gate: AsyncMutex<()>,
    stop_tx: watch::Sender<bool>,
    health: Arc<SourceHealthTable>,
}

impl SourceLink {
    pub fn new(source_id: &str, kind: SourceKind, health: Arc<SourceHealthTable>) -> Self {
        Self::with_capacity(source_id, kind, health, FRAME_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(
        source_id: &str,
        kind: SourceKind,
        health: Arc<SourceHealthTable>,
        capacity: usize,
    ) -> Self {
        health.register(source_id, kind);
        let (frames_tx, _) = broadcast::channel(capacity.max(1));
        let (stop_tx, _) = watch::channel(false);
        Self {
            source_id: source_id.to_string(),
            kind,
            frames_tx,
            state: Mutex::new(LinkState::default()),
            gate: AsyncMutex::new(()),
            stop_tx,
            health,
        }
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    pub fn emit(&self, frame: RawFrame) {
        // No receivers just means nobody is listening yet
        let _ = self.frames_tx.send(frame);
    }

    pub fn mark_connected(&self, socket_id: Option<String>) {
        {
            let mut state = self.state();
            state.connected = true;
            state.socket_id = socket_id.clone();
        }
        self.health.record_connected(&self.source_id);
        info!(source_id = %self.source_id, socket_id = ?socket_id, "Source connected");
    }

    /// Clear the connected flag and socket id together
    pub fn mark_disconnected(&self) {
        let was_connected = {
            let mut state = self.state();
            let was = state.connected;
            state.connected = false;
            state.socket_id = None;
            was
        };
        if was_connected {
            self.health.record_disconnected(&self.source_id);
            info!(source_id = %self.source_id, "Source disconnected");
        }
    }

    pub fn record_failure(&self, error: &FeedError) {
        self.health.record_failure(&self.source_id, &error.to_string());
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn socket_id(&self) -> Option<String> {
        self.state().socket_id.clone()
    }

    fn is_running(&self) -> bool {
        self.state()
            .task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stream of frames emitted from now on. Lag is reported to the health table.
    pub fn frames(&self) -> BoxStream<'static, RawFrame> {
        let rx = self.frames_tx.subscribe();
        let health = Arc::clone(&self.health);
        let source_id = self.source_id.clone();

        stream::unfold(rx, move |mut rx| {
            let health = Arc::clone(&health);
            let source_id = source_id.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(frame) => return Some((frame, rx)),
                        Err(RecvError::Lagged(skipped)) => health.record_lag(&source_id, skipped),
                        Err(RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed()
    }

    /// Open the first session and hand it to a background task that keeps
    /// the source alive. A second call while that task runs does nothing.
    pub async fn connect<T: Transport>(
        self: &Arc<Self>,
        transport: Arc<T>,
        reconnect: ReconnectConfig,
    ) -> Result<()> {
        let _gate = self.gate.lock().await;
        if self.is_running() {
            debug!(source_id = %self.source_id, "Already connected, ignoring connect");
            return Ok(());
        }

        let _ = self.stop_tx.send(false);
        let conn = open_with_timeout(self, transport.as_ref(), &reconnect).await?;

        let stop = self.stop_tx.subscribe();
        let handle = tokio::spawn(supervise(
            Arc::clone(self),
            transport,
            reconnect,
            conn,
            stop,
        ));
        self.state().task = Some(handle);
        Ok(())
    }

    pub async fn disconnect(&self) {
        let _gate = self.gate.lock().await;
        let _ = self.stop_tx.send(true);

        let task = self.state().task.take();
        if let Some(mut task) = task {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                warn!(source_id = %self.source_id, "Session task did not stop in time, aborting");
                task.abort();
            }
        }
        self.mark_disconnected();
    }
}

async fn open_with_timeout<T: Transport>(
    link: &SourceLink,
    transport: &T,
    reconnect: &ReconnectConfig,
) -> Result<T::Conn> {
    let result = match tokio::time::timeout(reconnect.connect_timeout(), transport.open(link)).await
    {
        Ok(result) => result,
        Err(_) => Err(FeedError::ConnectTimeout {
            source_id: link.source_id().to_string(),
            timeout_ms: reconnect.connect_timeout_ms,
        }),
    };

    if let Err(e) = &result {
        warn!(source_id = %link.source_id(), error = %e, "Connect attempt failed");
        link.record_failure(e);
    }
    result
}

async fn supervise<T: Transport>(
    link: Arc<SourceLink>,
    transport: Arc<T>,
    reconnect: ReconnectConfig,
    conn: T::Conn,
    mut stop: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(reconnect.clone());
    let mut conn = Some(conn);

    loop {
        if let Some(session) = conn.take() {
            let outcome = transport.pump(session, &link, &mut stop).await;
            link.mark_disconnected();
            match outcome {
                Ok(SessionEnd::Exhausted) => {
                    info!(source_id = %link.source_id(), "Source exhausted");
                    return;
                }
                Ok(SessionEnd::Stopped) => return,
                Ok(SessionEnd::Closed) => {
                    info!(source_id = %link.source_id(), "Upstream closed the session");
                }
                Err(e) => {
                    warn!(source_id = %link.source_id(), error = %e, "Session failed");
                    link.record_failure(&e);
                }
            }
        }

        if *stop.borrow() {
            return;
        }

        let delay = backoff.next_delay();
        info!(
            source_id = %link.source_id(),
            attempt = backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            "Reconnecting"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => return,
        }

        if let Ok(session) = open_with_timeout(&link, transport.as_ref(), &reconnect).await {
            backoff.reset();
            conn = Some(session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedTransport {
        opens: AtomicUsize,
        frames: Vec<&'static str>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        type Conn = Vec<&'static str>;

        async fn open(&self, link: &SourceLink) -> Result<Self::Conn> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            link.mark_connected(Some("sid-1".to_string()));
            Ok(self.frames.clone())
        }

        async fn pump(
            &self,
            conn: Self::Conn,
            link: &SourceLink,
            stop: &mut watch::Receiver<bool>,
        ) -> Result<SessionEnd> {
            for payload in conn {
                link.emit(RawFrame::received(link.source_id(), payload));
            }
            let _ = stop.changed().await;
            Ok(SessionEnd::Stopped)
        }
    }

    fn reconnect() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay_ms: 10,
            max_delay_ms: 50,
            multiplier: 2.0,
            connect_timeout_ms: 500,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_connect_twice_opens_once() {
        let health = Arc::new(SourceHealthTable::new(MonitorConfig::default()));
        let link = Arc::new(SourceLink::new("scripted", SourceKind::Direct, health.clone()));
        let transport = Arc::new(ScriptedTransport {
            opens: AtomicUsize::new(0),
            frames: vec!["42[\"a\",1]"],
        });
        let mut frames = link.frames();

        link.connect(transport.clone(), reconnect()).await.unwrap();
        link.connect(transport.clone(), reconnect()).await.unwrap();

        assert_eq!(transport.opens.load(Ordering::SeqCst), 1);
        let first = frames.next().await.unwrap();
        assert_eq!(first.payload, b"42[\"a\",1]".to_vec());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), frames.next())
                .await
                .is_err(),
            "frame delivered twice"
        );
        assert_eq!(link.socket_id().as_deref(), Some("sid-1"));
        assert!(health.get("scripted").unwrap().connected);

        link.disconnect().await;
        assert!(!link.is_connected());
        assert!(link.socket_id().is_none());
    }

    #[tokio::test]
    async fn test_failed_open_is_reported() {
        struct Refusing;

        #[async_trait]
        impl Transport for Refusing {
            type Conn = ();

            async fn open(&self, _link: &SourceLink) -> Result<()> {
                Err(FeedError::Connection("refused".to_string()))
            }

            async fn pump(
                &self,
                _conn: (),
                _link: &SourceLink,
                _stop: &mut watch::Receiver<bool>,
            ) -> Result<SessionEnd> {
                Ok(SessionEnd::Closed)
            }
        }

        let health = Arc::new(SourceHealthTable::new(MonitorConfig::default()));
        let link = Arc::new(SourceLink::new("refusing", SourceKind::Direct, health.clone()));

        assert!(link.connect(Arc::new(Refusing), reconnect()).await.is_err());
        let entry = health.get("refusing").unwrap();
        assert_eq!(entry.consecutive_failures, 1);
        assert!(!entry.connected);
    }
}
