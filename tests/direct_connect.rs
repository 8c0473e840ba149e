use futures_util::{SinkExt, StreamExt};
use rugfeed::adapters::{CaptureSource, DirectSource};
use rugfeed::config::{DirectSourceConfig, MonitorConfig, ReconnectConfig};
use rugfeed::supervisor::SourceHealthTable;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

/// Minimal Socket.IO endpoint: open, namespace ack, then the given frames.
async fn spawn_endpoint(accepts: Arc<AtomicUsize>, frames: Vec<String>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            accepts.fetch_add(1, Ordering::SeqCst);
            let frames = frames.clone();
            tokio::spawn(async move {
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let open = r#"0{"sid":"eio-1","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#;
                if ws.send(Message::Text(open.to_string())).await.is_err() {
                    return;
                }
                while let Some(Ok(msg)) = ws.next().await {
                    if let Message::Text(text) = msg {
                        if text.starts_with("40") {
                            break;
                        }
                    }
                }
                let _ = ws.send(Message::Text(r#"40{"sid":"sock-1"}"#.to_string())).await;
                for frame in frames {
                    let _ = ws.send(Message::Text(frame)).await;
                }
                // Hold the session until the client leaves
                while let Some(Ok(_)) = ws.next().await {}
            });
        }
    });
    addr
}

fn reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay_ms: 50,
        max_delay_ms: 200,
        multiplier: 2.0,
        connect_timeout_ms: 2_000,
        jitter: false,
    }
}

/// A second `connect` on a live source opens no second session and
/// delivers no frame twice.
#[tokio::test]
async fn connect_twice_opens_one_session() {
    let accepts = Arc::new(AtomicUsize::new(0));
    let frames = vec![
        r#"42["gameStateUpdate",{"gameId":"g1","tickCount":1,"active":true}]"#.to_string(),
        r#"42["gameStateUpdate",{"gameId":"g1","tickCount":2,"active":true}]"#.to_string(),
        r#"42["newTrade",{"id":"t1","type":"buy","qty":1}]"#.to_string(),
    ];
    let addr = spawn_endpoint(accepts.clone(), frames).await;

    let health = Arc::new(SourceHealthTable::new(MonitorConfig::default()));
    let config = DirectSourceConfig {
        enabled: true,
        url: format!("ws://{addr}/socket.io/"),
        auth: None,
    };
    let source = DirectSource::new("direct", &config, reconnect(), health.clone()).unwrap();
    let mut stream = source.frames();

    source.connect().await.unwrap();
    source.connect().await.unwrap();
    assert!(source.is_connected());
    assert_eq!(source.socket_id().as_deref(), Some("sock-1"));

    let mut received = Vec::new();
    while received.len() < 3 {
        let frame = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("frame within timeout")
            .expect("stream open");
        received.push(frame.payload_lossy());
    }

    // Nothing further arrives: no duplicated handler
    let extra = tokio::time::timeout(Duration::from_millis(300), stream.next()).await;
    assert!(extra.is_err(), "unexpected extra frame: {:?}", extra);

    assert_eq!(accepts.load(Ordering::SeqCst), 1, "exactly one upstream session");
    assert!(received[0].contains("\"tickCount\":1"));
    assert!(received[2].contains("newTrade"));
    assert!(health.get("direct").unwrap().connected);

    source.disconnect().await;
    assert!(!source.is_connected());
    assert!(source.socket_id().is_none());
    assert!(!health.get("direct").unwrap().connected);
}

/// An unreachable endpoint fails the first connect and is recorded as a failure.
#[tokio::test]
async fn unreachable_endpoint_reports_failure() {
    // Bind then drop to get a port with nothing listening
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let health = Arc::new(SourceHealthTable::new(MonitorConfig::default()));
    let config = DirectSourceConfig {
        enabled: true,
        url: format!("ws://{addr}/socket.io/"),
        auth: None,
    };
    let source = DirectSource::new("direct", &config, reconnect(), health.clone()).unwrap();

    assert!(source.connect().await.is_err());
    assert!(!source.is_connected());
    let state = health.get("direct").unwrap();
    assert_eq!(state.consecutive_failures, 1);
    assert!(state.last_error.is_some());
}
