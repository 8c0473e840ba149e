use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which way a frame travelled on the observed socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Received,
    Sent,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Received => "received",
            Direction::Sent => "sent",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One raw transport frame as produced by a capture source
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub received_at: DateTime<Utc>,
    pub source_id: String,
    pub direction: Direction,
    pub payload: Vec<u8>,
}

impl RawFrame {
    pub fn received(source_id: &str, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            received_at: Utc::now(),
            source_id: source_id.to_string(),
            direction: Direction::Received,
            payload: payload.into(),
        }
    }

    pub fn sent(source_id: &str, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            direction: Direction::Sent,
            ..Self::received(source_id, payload)
        }
    }

    pub fn with_received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = received_at;
        self
    }

    /// Payload as text, replacing invalid UTF-8
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// A decoded application event
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEvent {
    pub event_name: String,
    pub data: serde_json::Value,
    pub ack_id: Option<u64>,
    pub namespace: Option<String>,
}
