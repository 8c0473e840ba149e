//! Browser DevTools capture
//!
//! Attaches to a running browser's remote debugging endpoint, enables the
//! Network domain on the game tab and mirrors the game socket's frames in
//! both directions.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use super::link::{SessionEnd, SourceLink, Transport};
use super::CaptureSource;
use crate::config::{CdpSourceConfig, ReconnectConfig};
use crate::domain::{Direction, RawFrame, SourceKind};
use crate::error::{FeedError, Result};
use crate::protocol::decode_str;
use crate::supervisor::SourceHealthTable;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Entry of the DevTools `/json` target list
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdpTarget {
    pub id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    pub url: String,
    #[serde(default)]
    pub web_socket_debugger_url: Option<String>,
}

/// Pick the page tab whose URL contains `needle`
pub fn select_target(targets: Vec<CdpTarget>, needle: &str) -> Option<CdpTarget> {
    targets.into_iter().find(|t| {
        t.target_type == "page" && t.url.contains(needle) && t.web_socket_debugger_url.is_some()
    })
}

/// What a DevTools message means for the capture
#[derive(Debug, Clone, PartialEq)]
pub enum CdpAction {
    /// The game socket was opened (or adopted mid-stream)
    Tracked { request_id: String },
    Frame { direction: Direction, payload: String },
    /// Tracking started on the same message that carried the first frame
    AdoptedFrame {
        request_id: String,
        direction: Direction,
        payload: String,
    },
    Closed { request_id: String },
    Ignore,
}

/// Follows the Network domain events of one tab and tracks the game socket
#[derive(Debug, Clone)]
pub struct CdpTracker {
    socket_url_contains: String,
    request_id: Option<String>,
}

impl CdpTracker {
    pub fn new(socket_url_contains: &str) -> Self {
        Self {
            socket_url_contains: socket_url_contains.to_string(),
            request_id: None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    pub fn handle(&mut self, message: &Value) -> CdpAction {
        let Some(method) = message.get("method").and_then(Value::as_str) else {
            return CdpAction::Ignore;
        };
        let params = message.get("params").unwrap_or(&Value::Null);
        let Some(request_id) = params.get("requestId").and_then(Value::as_str) else {
            return CdpAction::Ignore;
        };

        match method {
            "Network.webSocketCreated" => {
                let url = params.get("url").and_then(Value::as_str).unwrap_or_default();
                if !url.contains(&self.socket_url_contains) {
                    return CdpAction::Ignore;
                }
                self.request_id = Some(request_id.to_string());
                CdpAction::Tracked {
                    request_id: request_id.to_string(),
                }
            }
            "Network.webSocketFrameReceived" => self.frame(request_id, params, Direction::Received),
            "Network.webSocketFrameSent" => self.frame(request_id, params, Direction::Sent),
            "Network.webSocketClosed" if self.request_id.as_deref() == Some(request_id) => {
                self.request_id = None;
                CdpAction::Closed {
                    request_id: request_id.to_string(),
                }
            }
            _ => CdpAction::Ignore,
        }
    }

    fn frame(&mut self, request_id: &str, params: &Value, direction: Direction) -> CdpAction {
        let response = params.get("response").unwrap_or(&Value::Null);
        // Only text frames carry Socket.IO packets
        if response.get("opcode").and_then(Value::as_i64).unwrap_or(1) != 1 {
            return CdpAction::Ignore;
        }
        let Some(payload) = response.get("payloadData").and_then(Value::as_str) else {
            return CdpAction::Ignore;
        };

        match self.request_id.as_deref() {
            Some(tracked) if tracked == request_id => CdpAction::Frame {
                direction,
                payload: payload.to_string(),
            },
            Some(_) => CdpAction::Ignore,
            // Socket opened before we attached: adopt it on the first frame that decodes
            None if decode_str(payload).is_ok() => {
                self.request_id = Some(request_id.to_string());
                CdpAction::AdoptedFrame {
                    request_id: request_id.to_string(),
                    direction,
                    payload: payload.to_string(),
                }
            }
            None => CdpAction::Ignore,
        }
    }
}

pub struct CdpTransport {
    http: reqwest::Client,
    config: CdpSourceConfig,
}

impl CdpTransport {
    pub fn new(config: &CdpSourceConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DISCOVERY_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            config: config.clone(),
        })
    }

    async fn discover(&self) -> Result<CdpTarget> {
        let url = format!("{}/json", self.config.debug_url.trim_end_matches('/'));
        let targets: Vec<CdpTarget> = self.http.get(&url).send().await?.json().await?;
        debug!(count = targets.len(), "DevTools targets listed");

        select_target(targets, &self.config.target_url_contains).ok_or_else(|| {
            FeedError::Connection(format!(
                "no page matching '{}' at {}",
                self.config.target_url_contains, self.config.debug_url
            ))
        })
    }
}

fn frame_from(link: &SourceLink, direction: Direction, payload: String) -> RawFrame {
    match direction {
        Direction::Received => RawFrame::received(link.source_id(), payload),
        Direction::Sent => RawFrame::sent(link.source_id(), payload),
    }
}

#[async_trait]
impl Transport for CdpTransport {
    type Conn = WsStream;

    async fn open(&self, link: &SourceLink) -> Result<WsStream> {
        let target = self.discover().await?;
        let debugger_url = target.web_socket_debugger_url.unwrap_or_default();
        info!(
            source_id = %link.source_id(),
            target = %target.id,
            page = %target.url,
            "Attaching to browser tab"
        );

        let (mut ws, _) = connect_async(debugger_url.as_str()).await?;
        let enable = json!({"id": 1, "method": "Network.enable", "params": {}});
        ws.send(Message::Text(enable.to_string())).await?;
        Ok(ws)
    }

    async fn pump(
        &self,
        ws: WsStream,
        link: &SourceLink,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd> {
        let (mut write, mut read) = ws.split();
        let mut tracker = CdpTracker::new(&self.config.socket_url_contains);

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let message: Value = match serde_json::from_str(&text) {
                            Ok(message) => message,
                            Err(e) => {
                                debug!(error = %e, "Unparseable DevTools message");
                                continue;
                            }
                        };
                        match tracker.handle(&message) {
                            CdpAction::Tracked { request_id } => {
                                link.mark_connected(Some(request_id));
                            }
                            CdpAction::AdoptedFrame { request_id, direction, payload } => {
                                info!(source_id = %link.source_id(), %request_id, "Adopted open game socket");
                                link.mark_connected(Some(request_id));
                                link.emit(frame_from(link, direction, payload));
                            }
                            CdpAction::Frame { direction, payload } => {
                                link.emit(frame_from(link, direction, payload));
                            }
                            CdpAction::Closed { request_id } => {
                                info!(source_id = %link.source_id(), %request_id, "Game socket closed in browser");
                                link.mark_disconnected();
                            }
                            CdpAction::Ignore => {}
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(SessionEnd::Stopped);
                    }
                }
            }
        }
    }
}

pub struct CdpSource {
    link: Arc<SourceLink>,
    transport: Arc<CdpTransport>,
    reconnect: ReconnectConfig,
}

impl CdpSource {
    pub fn new(
        source_id: &str,
        config: &CdpSourceConfig,
        reconnect: ReconnectConfig,
        health: Arc<SourceHealthTable>,
    ) -> Result<Self> {
        Ok(Self {
            link: Arc::new(SourceLink::new(source_id, SourceKind::Capture, health)),
            transport: Arc::new(CdpTransport::new(config)?),
            reconnect,
        })
    }
}

#[async_trait]
impl CaptureSource for CdpSource {
    fn source_id(&self) -> &str {
        self.link.source_id()
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Capture
    }

    async fn connect(&self) -> Result<()> {
        self.link
            .connect(Arc::clone(&self.transport), self.reconnect.clone())
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
