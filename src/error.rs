use thiserror::Error;

/// Main error type for the feed recorder
#[derive(Error, Debug)]
pub enum FeedError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connect timeout for source {source_id} after {timeout_ms}ms")]
    ConnectTimeout { source_id: String, timeout_ms: u64 },

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Protocol errors
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    // Storage errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Writer fatal: {0}")]
    WriterFatal(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for FeedError
pub type Result<T> = std::result::Result<T, FeedError>;

/// Frame decoding failures.
///
/// Every variant is contained at the frame boundary: callers log and move on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },

    /// Transport-level packet (open, ping, pong, namespace connect) with no event body
    #[error("control frame: {packet}")]
    ControlFrame { packet: &'static str },
}

impl DecodeError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        DecodeError::MalformedFrame {
            reason: reason.into(),
        }
    }

    /// Stable classification string used in logs and counters
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::MalformedFrame { .. } => "malformed_frame",
            DecodeError::ControlFrame { .. } => "control_frame",
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, DecodeError::ControlFrame { .. })
    }
}

/// Durable storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session {session_id} is already held by writer pid {holder_pid}")]
    WriterLocked { session_id: String, holder_pid: u32 },

    #[error("Corrupt manifest {path}: {reason}")]
    CorruptManifest { path: String, reason: String },

    #[error("Sequence {sequence} is not after last buffered {last}")]
    OutOfOrder { sequence: u64, last: u64 },

    #[error("Store is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_kind() {
        assert_eq!(DecodeError::malformed("bad").kind(), "malformed_frame");
        assert_eq!(
            DecodeError::ControlFrame { packet: "ping" }.kind(),
            "control_frame"
        );
        assert!(DecodeError::ControlFrame { packet: "pong" }.is_control());
    }

    #[test]
    fn test_store_error_converts() {
        let err: FeedError = StoreError::Closed.into();
        assert!(matches!(err, FeedError::Store(StoreError::Closed)));
    }
}
