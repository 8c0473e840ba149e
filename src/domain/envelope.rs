//! Canonical persisted/published event shape
//!
//! `EventEnvelope` is the unit written by the event store and delivered on the
//! event bus. `OutboundEvent` is the compact shape handed to collaborators;
//! its fields are additive-only within one `SCHEMA_VERSION`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::frame::Direction;
use super::round::{Phase, RoundState};
use crate::supervisor::integrity::IntegrityStatus;

/// Bumped on field removals or type changes in persisted/outbound shapes
pub const SCHEMA_VERSION: u32 = 1;

/// Kind of producer that delivered the underlying frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Browser DevTools instrumentation
    Capture,
    /// Direct transport connection
    Direct,
    /// Re-fed from persisted data
    Replay,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Capture => "capture",
            SourceKind::Direct => "direct",
            SourceKind::Replay => "replay",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Partition key of persisted envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocType {
    Tick,
    PlayerAction,
    ServerState,
    System,
    Raw,
}

impl DocType {
    pub const ALL: [DocType; 5] = [
        DocType::Tick,
        DocType::PlayerAction,
        DocType::ServerState,
        DocType::System,
        DocType::Raw,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Tick => "tick",
            DocType::PlayerAction => "player_action",
            DocType::ServerState => "server_state",
            DocType::System => "system",
            DocType::Raw => "raw",
        }
    }
}

impl fmt::Display for DocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Columns of a round update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickFields {
    pub tick_count: Option<i64>,
    pub price: Option<Decimal>,
    pub peak_price: Option<Decimal>,
    pub phase: Phase,
    pub active: bool,
    pub rugged: bool,
    pub cooldown_timer: i64,
    pub allow_pre_round_buys: bool,
    pub trade_count: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<IntegrityStatus>,
}

/// Trade broadcast or client-originated order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradeFields {
    pub player_id: Option<String>,
    pub username: Option<String>,
    /// "buy" / "sell" as reported by the feed
    pub side: Option<String>,
    pub qty: Option<Decimal>,
    pub price: Option<Decimal>,
    pub tick_index: Option<i64>,
}

/// Side bet placement or settlement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SideBetFields {
    pub player_id: Option<String>,
    pub bet_amount: Option<Decimal>,
    pub start_tick: Option<i64>,
    pub end_tick: Option<i64>,
    pub won: Option<bool>,
    pub payout: Option<Decimal>,
}

/// Player balance and position
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerFields {
    pub player_id: Option<String>,
    pub cash: Option<Decimal>,
    pub position_qty: Option<Decimal>,
    pub avg_cost: Option<Decimal>,
    pub cumulative_pnl: Option<Decimal>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardFields {
    pub entries: usize,
    pub top_player: Option<String>,
    pub top_pnl: Option<Decimal>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthFields {
    pub player_id: Option<String>,
    pub username: Option<String>,
    pub authenticated: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseChangeFields {
    pub from: Phase,
    pub to: Phase,
    pub tick_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceChangeFields {
    pub from: Option<String>,
    pub to: String,
    pub reason: String,
}

/// doc_type-specific columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TypedFields {
    Tick(TickFields),
    Trade(TradeFields),
    SideBet(SideBetFields),
    Player(PlayerFields),
    Leaderboard(LeaderboardFields),
    Auth(AuthFields),
    RoundStarted(RoundState),
    RoundComplete(RoundState),
    PhaseChanged(PhaseChangeFields),
    SourceChanged(SourceChangeFields),
    Raw,
}

/// The canonical persisted and published unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub ts: DateTime<Utc>,
    pub source: SourceKind,
    pub source_id: String,
    pub doc_type: DocType,
    /// Bus topic, e.g. "game_state" or "round_complete"
    pub event_type: String,
    pub session_id: Uuid,
    pub round_id: Option<String>,
    pub sequence: u64,
    pub direction: Direction,
    pub raw_payload: String,
    pub fields: TypedFields,
}

/// Envelope as handed to collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEvent {
    pub schema_version: u32,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Milliseconds since the Unix epoch
    pub ts: i64,
    pub game_id: Option<String>,
    pub seq: u64,
    pub data: serde_json::Value,
}

impl EventEnvelope {
    pub fn to_outbound(&self) -> OutboundEvent {
        let data = match &self.fields {
            TypedFields::Raw => serde_json::from_str(&self.raw_payload)
                .unwrap_or_else(|_| serde_json::Value::String(self.raw_payload.clone())),
            fields => serde_json::to_value(fields).unwrap_or(serde_json::Value::Null),
        };

        OutboundEvent {
            schema_version: SCHEMA_VERSION,
            event_type: self.event_type.clone(),
            ts: self.ts.timestamp_millis(),
            game_id: self.round_id.clone(),
            seq: self.sequence,
            data,
        }
    }

    pub fn tick_fields(&self) -> Option<&TickFields> {
        match &self.fields {
            TypedFields::Tick(tick) => Some(tick),
            _ => None,
        }
    }
}
