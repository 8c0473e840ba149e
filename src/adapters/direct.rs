//! Direct Socket.IO connection to the public game endpoint
//!
//! Performs the Engine.IO open / namespace connect handshake itself, answers
//! transport pings, and forwards every message frame untouched.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use super::link::{SessionEnd, SourceLink, Transport};
use super::CaptureSource;
use crate::config::{DirectSourceConfig, ReconnectConfig};
use crate::domain::{RawFrame, SourceKind};
use crate::error::{FeedError, Result};
use crate::protocol::decoder::{connect_packet, PONG};
use crate::supervisor::SourceHealthTable;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Engine.IO protocol revision spoken by the endpoint
const EIO_VERSION: &str = "4";

pub struct DirectTransport {
    endpoint: Url,
    auth: Option<Value>,
}

impl DirectTransport {
    pub fn new(config: &DirectSourceConfig) -> Result<Self> {
        Ok(Self {
            endpoint: endpoint_url(&config.url)?,
            auth: config.auth.clone(),
        })
    }
}

/// Add the Engine.IO query parameters when the configured URL lacks them
pub fn endpoint_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw)
        .map_err(|e| FeedError::InvalidConfig(format!("invalid socket url '{raw}': {e}")))?;

    let has_eio = url.query_pairs().any(|(k, _)| k == "EIO");
    let has_transport = url.query_pairs().any(|(k, _)| k == "transport");
    {
        let mut query = url.query_pairs_mut();
        if !has_eio {
            query.append_pair("EIO", EIO_VERSION);
        }
        if !has_transport {
            query.append_pair("transport", "websocket");
        }
    }
    Ok(url)
}

/// Socket id from a namespace connect ack body (`{"sid":"..."}`)
fn parse_sid(body: &str) -> Option<String> {
    let json = match body.find('{') {
        Some(start) => &body[start..],
        None => return None,
    };
    serde_json::from_str::<Value>(json)
        .ok()?
        .get("sid")?
        .as_str()
        .map(str::to_string)
}

#[async_trait]
impl Transport for DirectTransport {
    type Conn = WsStream;

    async fn open(&self, link: &SourceLink) -> Result<WsStream> {
        info!(source_id = %link.source_id(), url = %self.endpoint, "Connecting to socket endpoint");
        let (mut ws, _) = connect_async(self.endpoint.as_str()).await?;

        let sid = loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    if text.starts_with("40") {
                        break parse_sid(&text[2..]);
                    } else if text.starts_with("44") {
                        return Err(FeedError::Connection(format!(
                            "namespace connect rejected: {}",
                            &text[2..]
                        )));
                    } else if text.starts_with('0') {
                        ws.send(Message::Text(connect_packet(self.auth.as_ref())))
                            .await?;
                    } else if text == "2" {
                        ws.send(Message::Text(PONG.to_string())).await?;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(FeedError::Connection(
                        "socket closed during handshake".to_string(),
                    ));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        };

        link.mark_connected(sid);
        Ok(ws)
    }

    async fn pump(
        &self,
        ws: WsStream,
        link: &SourceLink,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd> {
        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text == "2" {
                            write.send(Message::Text(PONG.to_string())).await?;
                        } else if text.starts_with("41") || text.starts_with('1') {
                            debug!(source_id = %link.source_id(), "Server closed the namespace");
                            return Ok(SessionEnd::Closed);
                        } else {
                            link.emit(RawFrame::received(link.source_id(), text));
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        debug!(source_id = %link.source_id(), len = data.len(), "Ignoring binary frame");
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

pub struct DirectSource {
    link: Arc<SourceLink>,
    transport: Arc<DirectTransport>,
    reconnect: ReconnectConfig,
}

impl DirectSource {
    pub fn new(
        source_id: &str,
        config: &DirectSourceConfig,
        reconnect: ReconnectConfig,
        health: Arc<SourceHealthTable>,
    ) -> Result<Self> {
        Ok(Self {
            link: Arc::new(SourceLink::new(source_id, SourceKind::Direct, health)),
            transport: Arc::new(DirectTransport::new(config)?),
            reconnect,
        })
    }

    pub fn socket_id(&self) -> Option<String> {
        self.link.socket_id()
    }
}

#[async_trait]
impl CaptureSource for DirectSource {
    fn source_id(&self) -> &str {
        self.link.source_id()
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Direct
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_adds_engine_params() {
        let url = endpoint_url("wss://backend.example/socket.io/").unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("EIO".to_string(), "4".to_string())));
        assert!(pairs.contains(&("transport".to_string(), "websocket".to_string())));
    }

    #[test]
    fn test_endpoint_keeps_existing_params() {
        let url = endpoint_url("wss://backend.example/socket.io/?EIO=4&transport=websocket").unwrap();
        assert_eq!(url.query_pairs().count(), 2);
    }

    #[test]
    fn test_endpoint_rejects_garbage() {
        assert!(matches!(
            endpoint_url("not a url"),
            Err(FeedError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_parse_sid() {
        assert_eq!(parse_sid(r#"{"sid":"abc123"}"#).as_deref(), Some("abc123"));
        assert_eq!(parse_sid(r#"/game,{"sid":"x"}"#).as_deref(), Some("x"));
        assert_eq!(parse_sid(""), None);
    }
}
