//! Event normalizer and round-phase state machine
//!
//! Turns decoded events into sequenced `EventEnvelope`s. The normalizer is the
//! only place sequences are assigned; it is owned by the ingestion loop so
//! envelopes leave it in sequence order.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::round::parse_decimal;
use crate::domain::{
    AuthFields, DecodedEvent, Direction, DocType, EventEnvelope, GameStateUpdate,
    LeaderboardFields, Phase, PhaseChangeFields, PhaseOutcome, PlayerFields, RawFrame,
    RoundEndReason, RoundState, SideBetFields, SourceChangeFields, SourceKind, TickFields,
    TradeFields, TypedFields,
};
use crate::supervisor::IntegrityMonitor;

/// Bus topics produced by the normalizer
pub mod topics {
    pub const GAME_STATE: &str = "game_state";
    pub const TRADE: &str = "trade";
    pub const SIDE_BET: &str = "side_bet";
    pub const SIDE_BET_RESULT: &str = "side_bet_result";
    pub const PLAYER_UPDATE: &str = "player_update";
    pub const LEADERBOARD: &str = "leaderboard";
    pub const AUTH: &str = "auth";
    pub const CLIENT_ACTION: &str = "client_action";
    pub const RAW: &str = "raw";
    pub const ROUND_STARTED: &str = "round_started";
    pub const PHASE_CHANGED: &str = "phase_changed";
    pub const ROUND_COMPLETE: &str = "round_complete";
    pub const SOURCE_CHANGED: &str = "source_changed";
}

/// Wire event name of the primary round update
pub const GAME_STATE_EVENT: &str = "gameStateUpdate";

/// Finalized round ids remembered to reject late frames
const FINALIZED_MEMORY: usize = 16;

/// Per-session sequence counter. Never rewinds.
#[derive(Debug, Clone, Default)]
pub struct Sequencer {
    last: u64,
}

impl Sequencer {
    pub fn next(&mut self) -> u64 {
        self.last += 1;
        self.last
    }

    pub fn last(&self) -> u64 {
        self.last
    }

    /// Continue after a durably recorded sequence
    pub fn resume_after(&mut self, last: u64) {
        if last > self.last {
            self.last = last;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    GameState,
    Trade,
    SideBet,
    SideBetResult,
    Player,
    Leaderboard,
    Auth,
    ClientAction,
    Raw,
}

impl Route {
    fn for_event(name: &str, direction: Direction) -> Route {
        if direction == Direction::Sent {
            return Route::ClientAction;
        }
        match name {
            GAME_STATE_EVENT => Route::GameState,
            "standard/newTrade" | "newTrade" => Route::Trade,
            "newSideBet" | "sideBet" => Route::SideBet,
            "sideBetResult" => Route::SideBetResult,
            "playerUpdate" => Route::Player,
            "leaderboardUpdate" | "leaderboard" => Route::Leaderboard,
            "usernameStatus" | "authenticated" => Route::Auth,
            _ => Route::Raw,
        }
    }

    fn doc_type(&self) -> DocType {
        match self {
            Route::GameState => DocType::Tick,
            Route::Trade | Route::SideBet | Route::ClientAction => DocType::PlayerAction,
            Route::SideBetResult | Route::Player | Route::Leaderboard => DocType::ServerState,
            Route::Auth => DocType::System,
            Route::Raw => DocType::Raw,
        }
    }

    fn topic(&self) -> &'static str {
        match self {
            Route::GameState => topics::GAME_STATE,
            Route::Trade => topics::TRADE,
            Route::SideBet => topics::SIDE_BET,
            Route::SideBetResult => topics::SIDE_BET_RESULT,
            Route::Player => topics::PLAYER_UPDATE,
            Route::Leaderboard => topics::LEADERBOARD,
            Route::Auth => topics::AUTH,
            Route::ClientAction => topics::CLIENT_ACTION,
            Route::Raw => topics::RAW,
        }
    }
}

/// Counters exposed for status reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizerStats {
    pub rounds_started: u64,
    pub rounds_completed: u64,
    pub last_sequence: u64,
}

pub struct EventNormalizer {
    session_id: Uuid,
    sequencer: Sequencer,
    integrity: Arc<IntegrityMonitor>,
    current: Option<RoundState>,
    finalized: VecDeque<RoundState>,
    rounds_started: u64,
    rounds_completed: u64,
}

impl EventNormalizer {
    pub fn new(session_id: Uuid, integrity: Arc<IntegrityMonitor>) -> Self {
        Self {
            session_id,
            sequencer: Sequencer::default(),
            integrity,
            current: None,
            finalized: VecDeque::with_capacity(FINALIZED_MEMORY),
            rounds_started: 0,
            rounds_completed: 0,
        }
    }

    /// Continue numbering after the last durably stored sequence
    pub fn resume_after(&mut self, last_sequence: u64) {
        self.sequencer.resume_after(last_sequence);
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn current_round(&self) -> Option<&RoundState> {
        self.current.as_ref()
    }

    /// Most recently finalized round
    pub fn last_finalized(&self) -> Option<&RoundState> {
        self.finalized.back()
    }

    pub fn stats(&self) -> NormalizerStats {
        NormalizerStats {
            rounds_started: self.rounds_started,
            rounds_completed: self.rounds_completed,
            last_sequence: self.sequencer.last(),
        }
    }

    /// Normalize one decoded event into zero or more envelopes, in sequence order
    pub fn normalize(
        &mut self,
        event: &DecodedEvent,
        frame: &RawFrame,
        source: SourceKind,
    ) -> Vec<EventEnvelope> {
        let route = Route::for_event(&event.event_name, frame.direction);
        if route == Route::GameState {
            return self.on_game_state(event, frame, source);
        }

        let fields = match route {
            Route::Trade => TypedFields::Trade(parse_trade(&event.data, None)),
            Route::ClientAction => {
                TypedFields::Trade(parse_trade(&event.data, side_from_name(&event.event_name)))
            }
            Route::SideBet => TypedFields::SideBet(parse_side_bet(&event.data)),
            Route::SideBetResult => TypedFields::SideBet(parse_side_bet(&event.data)),
            Route::Player => TypedFields::Player(parse_player(&event.data)),
            Route::Leaderboard => TypedFields::Leaderboard(parse_leaderboard(&event.data)),
            Route::Auth => TypedFields::Auth(parse_auth(&event.data)),
            Route::GameState | Route::Raw => TypedFields::Raw,
        };

        let round_id = self.current.as_ref().map(|r| r.round_id.clone());
        vec![self.frame_envelope(frame, source, route.doc_type(), route.topic(), round_id, fields)]
    }

    /// System envelope announcing a primary source switch
    pub fn source_changed(
        &mut self,
        at: DateTime<Utc>,
        source: SourceKind,
        from: Option<String>,
        to: &str,
        reason: &str,
    ) -> EventEnvelope {
        let round_id = self.current.as_ref().map(|r| r.round_id.clone());
        self.derived_envelope(
            at,
            source,
            to,
            topics::SOURCE_CHANGED,
            round_id,
            TypedFields::SourceChanged(SourceChangeFields {
                from,
                to: to.to_string(),
                reason: reason.to_string(),
            }),
        )
    }

    fn on_game_state(
        &mut self,
        event: &DecodedEvent,
        frame: &RawFrame,
        source: SourceKind,
    ) -> Vec<EventEnvelope> {
        let update = match GameStateUpdate::from_value(&event.data) {
            Ok(update) => update,
            Err(e) => {
                warn!(error = %e, "Unparseable round update, recording as raw");
                let round_id = self.current.as_ref().map(|r| r.round_id.clone());
                return vec![self.frame_envelope(
                    frame,
                    source,
                    DocType::Raw,
                    topics::RAW,
                    round_id,
                    TypedFields::Raw,
                )];
            }
        };

        let at = frame.received_at;
        let observed = Phase::classify(&update);
        let mut out = Vec::new();

        let round_id = update
            .game_id
            .clone()
            .or_else(|| self.current.as_ref().map(|r| r.round_id.clone()));

        if let Some(id) = update.game_id.as_deref() {
            if !self.is_current(id) && !self.is_finalized(id) {
                if let Some(previous) = self.current.take() {
                    out.extend(self.finalize(previous, at, RoundEndReason::Rollover, frame, source));
                }
                self.rounds_started += 1;
                let round = RoundState::new(id, at);
                info!(round_id = id, "Round started");
                out.push(self.derived_envelope(
                    at,
                    source,
                    &frame.source_id,
                    topics::ROUND_STARTED,
                    Some(id.to_string()),
                    TypedFields::RoundStarted(round.clone()),
                ));
                self.current = Some(round);
            }
        }

        // Only ticks applied to the live round feed the state machine and ledger
        let live = match (&round_id, &self.current) {
            (Some(id), Some(round)) => round.round_id == *id,
            _ => false,
        };

        let mut phase_change = None;
        let mut integrity = None;
        let mut peak_price = None;

        if live {
            let target = if update.rugged { Phase::Rugged } else { observed };
            if let Some(round) = self.current.as_mut() {
                match round.apply_tick(&update, target) {
                    PhaseOutcome::Advanced { from, to } => {
                        debug!(round_id = %round.round_id, %from, %to, "Phase advanced");
                        phase_change = Some(PhaseChangeFields {
                            from,
                            to,
                            tick_count: round.tick_count,
                        });
                    }
                    PhaseOutcome::Rejected { current, observed } => {
                        debug!(
                            round_id = %round.round_id,
                            %current,
                            %observed,
                            "Ignoring backward phase transition"
                        );
                    }
                    PhaseOutcome::Unchanged => {}
                }
                peak_price = Some(round.peak_price);
                if let Some(tick) = update.tick_count {
                    integrity = Some(self.integrity.observe(&round.round_id, tick));
                }
            }
        }

        let tick_fields = TickFields {
            tick_count: update.tick_count,
            price: update.price_decimal(),
            peak_price,
            phase: observed,
            active: update.active,
            rugged: update.rugged,
            cooldown_timer: update.cooldown_timer,
            allow_pre_round_buys: update.allow_pre_round_buys,
            trade_count: update.trade_count,
            integrity,
        };
        out.push(self.frame_envelope(
            frame,
            source,
            DocType::Tick,
            topics::GAME_STATE,
            round_id.clone(),
            TypedFields::Tick(tick_fields),
        ));

        if let Some(change) = phase_change {
            out.push(self.derived_envelope(
                at,
                source,
                &frame.source_id,
                topics::PHASE_CHANGED,
                round_id.clone(),
                TypedFields::PhaseChanged(change),
            ));
        }

        if live && update.rugged {
            if let Some(round) = self.current.take() {
                out.extend(self.finalize(round, at, RoundEndReason::Rugged, frame, source));
            }
        }

        out
    }

    fn is_current(&self, round_id: &str) -> bool {
        self.current
            .as_ref()
            .is_some_and(|r| r.round_id == round_id)
    }

    fn is_finalized(&self, round_id: &str) -> bool {
        self.finalized.iter().any(|r| r.round_id == round_id)
    }

    /// Finalize `round` once; a second finalization of the same round is a no-op
    fn finalize(
        &mut self,
        mut round: RoundState,
        at: DateTime<Utc>,
        reason: RoundEndReason,
        frame: &RawFrame,
        source: SourceKind,
    ) -> Option<EventEnvelope> {
        if self.is_finalized(&round.round_id) || !round.finalize(at, reason) {
            debug!(round_id = %round.round_id, "Round already finalized");
            return None;
        }

        self.rounds_completed += 1;
        info!(
            round_id = %round.round_id,
            reason = ?reason,
            ticks = round.tick_count,
            peak = %round.peak_price,
            "Round complete"
        );

        if self.finalized.len() >= FINALIZED_MEMORY {
            self.finalized.pop_front();
        }
        self.finalized.push_back(round.clone());

        let round_id = Some(round.round_id.clone());
        Some(self.derived_envelope(
            at,
            source,
            &frame.source_id,
            topics::ROUND_COMPLETE,
            round_id,
            TypedFields::RoundComplete(round),
        ))
    }

    fn frame_envelope(
        &mut self,
        frame: &RawFrame,
        source: SourceKind,
        doc_type: DocType,
        topic: &str,
        round_id: Option<String>,
        fields: TypedFields,
    ) -> EventEnvelope {
        EventEnvelope {
            ts: frame.received_at,
            source,
            source_id: frame.source_id.clone(),
            doc_type,
            event_type: topic.to_string(),
            session_id: self.session_id,
            round_id,
            sequence: self.sequencer.next(),
            direction: frame.direction,
            raw_payload: frame.payload_lossy(),
            fields,
        }
    }

    fn derived_envelope(
        &mut self,
        at: DateTime<Utc>,
        source: SourceKind,
        source_id: &str,
        topic: &str,
        round_id: Option<String>,
        fields: TypedFields,
    ) -> EventEnvelope {
        EventEnvelope {
            ts: at,
            source,
            source_id: source_id.to_string(),
            doc_type: DocType::System,
            event_type: topic.to_string(),
            session_id: self.session_id,
            round_id,
            sequence: self.sequencer.next(),
            direction: Direction::Received,
            raw_payload: String::new(),
            fields,
        }
    }
}

fn str_field(data: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match data.get(*k)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn dec_field(data: &Value, keys: &[&str]) -> Option<Decimal> {
    keys.iter().find_map(|k| data.get(*k).and_then(parse_decimal))
}

fn int_field(data: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| data.get(*k)?.as_i64())
}

fn side_from_name(event_name: &str) -> Option<String> {
    let lower = event_name.to_lowercase();
    if lower.contains("buy") {
        Some("buy".to_string())
    } else if lower.contains("sell") {
        Some("sell".to_string())
    } else {
        None
    }
}

fn parse_trade(data: &Value, side_hint: Option<String>) -> TradeFields {
    TradeFields {
        player_id: str_field(data, &["playerId", "userId"]),
        username: str_field(data, &["username"]),
        side: str_field(data, &["type", "side"]).or(side_hint),
        qty: dec_field(data, &["qty", "amount"]),
        price: dec_field(data, &["price"]),
        tick_index: int_field(data, &["tickIndex", "tick"]),
    }
}

fn parse_side_bet(data: &Value) -> SideBetFields {
    SideBetFields {
        player_id: str_field(data, &["playerId", "userId"]),
        bet_amount: dec_field(data, &["betAmount", "amount"]),
        start_tick: int_field(data, &["startTick", "startTickIndex"]),
        end_tick: int_field(data, &["endTick", "endTickIndex"]),
        won: data.get("won").and_then(Value::as_bool),
        payout: dec_field(data, &["payout"]),
    }
}

fn parse_player(data: &Value) -> PlayerFields {
    PlayerFields {
        player_id: str_field(data, &["playerId", "id"]),
        cash: dec_field(data, &["cash", "balance"]),
        position_qty: dec_field(data, &["positionQty"]),
        avg_cost: dec_field(data, &["avgCost"]),
        cumulative_pnl: dec_field(data, &["cumulativePnL", "pnl"]),
    }
}

fn parse_leaderboard(data: &Value) -> LeaderboardFields {
    let entries = match data {
        Value::Array(items) => items.as_slice(),
        other => other
            .get("leaderboard")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]),
    };

    let top = entries.first();
    LeaderboardFields {
        entries: entries.len(),
        top_player: top.and_then(|e| str_field(e, &["username", "playerId", "id"])),
        top_pnl: top.and_then(|e| dec_field(e, &["pnl", "cumulativePnL"])),
    }
}

fn parse_auth(data: &Value) -> AuthFields {
    let player_id = str_field(data, &["id", "playerId"]);
    let username = str_field(data, &["username"]);
    let authenticated = data
        .get("hasUsername")
        .or_else(|| data.get("authenticated"))
        .and_then(Value::as_bool)
        .unwrap_or(player_id.is_some());
    AuthFields {
        player_id,
        username,
        authenticated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_str;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn normalizer() -> EventNormalizer {
        EventNormalizer::new(Uuid::new_v4(), Arc::new(IntegrityMonitor::default()))
    }

    fn feed(n: &mut EventNormalizer, data: Value) -> Vec<EventEnvelope> {
        let raw = format!("42{}", json!([GAME_STATE_EVENT, data]));
        let frame = RawFrame::received("direct", raw.clone());
        let event = decode_str(&raw).unwrap();
        n.normalize(&event, &frame, SourceKind::Direct)
    }

    fn topics_of(envelopes: &[EventEnvelope]) -> Vec<&str> {
        envelopes.iter().map(|e| e.event_type.as_str()).collect()
    }

    #[test]
    fn test_first_tick_starts_round() {
        let mut n = normalizer();
        let out = feed(&mut n, json!({"gameId": "g1", "active": true, "tickCount": 0, "price": 1}));
        assert_eq!(topics_of(&out), vec!["round_started", "game_state", "phase_changed"]);
        assert_eq!(n.current_round().unwrap().phase, Phase::Active);
        assert!(out.iter().all(|e| e.round_id.as_deref() == Some("g1")));
    }

    #[test]
    fn test_cooldown_precedence_on_envelope() {
        let mut n = normalizer();
        let out = feed(&mut n, json!({"gameId": "g1", "cooldownTimer": 5, "active": true}));
        let tick = out.iter().find_map(|e| e.tick_fields()).unwrap();
        assert_eq!(tick.phase, Phase::Cooldown);
    }

    #[test]
    fn test_sequences_strictly_increase() {
        let mut n = normalizer();
        let mut all = Vec::new();
        for tick in 0..5 {
            all.extend(feed(&mut n, json!({"gameId": "g1", "active": true, "tickCount": tick})));
        }
        all.extend(feed(&mut n, json!({"gameId": "g1", "rugged": true, "tickCount": 5})));
        all.extend(feed(&mut n, json!({"gameId": "g2", "cooldownTimer": 10})));

        let seqs: Vec<u64> = all.iter().map(|e| e.sequence).collect();
        assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1), "{seqs:?}");
        assert_eq!(seqs[0], 1);
    }

    #[test]
    fn test_explicit_end_then_next_round_finalizes_once() {
        let mut n = normalizer();
        let mut all = Vec::new();
        all.extend(feed(&mut n, json!({"gameId": "g1", "active": true, "tickCount": 1, "price": 2.5})));
        all.extend(feed(&mut n, json!({"gameId": "g1", "rugged": true, "tickCount": 2, "price": 0.01})));
        all.extend(feed(&mut n, json!({"gameId": "g1", "rugged": true, "cooldownTimer": 14000})));
        all.extend(feed(&mut n, json!({"gameId": "g2", "cooldownTimer": 9000})));

        let completes: Vec<_> = all
            .iter()
            .filter(|e| e.event_type == topics::ROUND_COMPLETE)
            .collect();
        assert_eq!(completes.len(), 1);
        match &completes[0].fields {
            TypedFields::RoundComplete(round) => {
                assert_eq!(round.round_id, "g1");
                assert_eq!(round.end_reason, Some(RoundEndReason::Rugged));
                assert_eq!(round.phase, Phase::Rugged);
                assert_eq!(round.peak_price, dec!(2.5));
            }
            other => panic!("unexpected fields {other:?}"),
        }
        assert_eq!(n.current_round().unwrap().round_id, "g2");
        assert_eq!(n.stats().rounds_completed, 1);
    }

    #[test]
    fn test_implicit_rollover_finalizes_previous_round() {
        let mut n = normalizer();
        feed(&mut n, json!({"gameId": "g1", "active": true, "tickCount": 1}));
        let out = feed(&mut n, json!({"gameId": "g2", "cooldownTimer": 3}));

        assert_eq!(topics_of(&out)[..2], ["round_complete", "round_started"]);
        assert_eq!(n.last_finalized().unwrap().end_reason, Some(RoundEndReason::Rollover));
    }

    #[test]
    fn test_late_frame_for_finalized_round_does_not_restart_it() {
        let mut n = normalizer();
        feed(&mut n, json!({"gameId": "g1", "active": true, "tickCount": 1}));
        feed(&mut n, json!({"gameId": "g1", "rugged": true, "tickCount": 2}));
        let out = feed(&mut n, json!({"gameId": "g1", "rugged": true, "cooldownTimer": 100}));

        assert_eq!(topics_of(&out), vec!["game_state"]);
        assert!(n.current_round().is_none());
        assert_eq!(n.stats().rounds_started, 1);
    }

    #[test]
    fn test_integrity_annotation_on_ticks() {
        let mut n = normalizer();
        feed(&mut n, json!({"gameId": "g1", "active": true, "tickCount": 1}));
        let out = feed(&mut n, json!({"gameId": "g1", "active": true, "tickCount": 3}));
        let tick = out.iter().find_map(|e| e.tick_fields()).unwrap();
        assert_eq!(
            tick.integrity,
            Some(crate::supervisor::IntegrityStatus::Gap { missing: 1 })
        );
    }

    #[test]
    fn test_secondary_events_do_not_touch_round() {
        let mut n = normalizer();
        feed(&mut n, json!({"gameId": "g1", "active": true, "tickCount": 7}));
        let before = n.current_round().cloned();

        let raw = r#"42["standard/newTrade",{"playerId":"p1","type":"buy","qty":10,"price":1.2,"tickIndex":7}]"#;
        let frame = RawFrame::received("direct", raw);
        let out = n.normalize(&decode_str(raw).unwrap(), &frame, SourceKind::Direct);

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].doc_type, DocType::PlayerAction);
        assert_eq!(out[0].round_id.as_deref(), Some("g1"));
        match &out[0].fields {
            TypedFields::Trade(trade) => {
                assert_eq!(trade.side.as_deref(), Some("buy"));
                assert_eq!(trade.qty, Some(dec!(10)));
            }
            other => panic!("unexpected fields {other:?}"),
        }
        assert_eq!(n.current_round().cloned(), before);
    }

    #[test]
    fn test_sent_frames_are_client_actions() {
        let mut n = normalizer();
        let raw = r#"42["sellOrder",{"qty":"0.5"}]"#;
        let frame = RawFrame::sent("cdp", raw);
        let out = n.normalize(&decode_str(raw).unwrap(), &frame, SourceKind::Capture);

        assert_eq!(out[0].event_type, topics::CLIENT_ACTION);
        assert_eq!(out[0].direction, Direction::Sent);
        assert!(out[0].round_id.is_none());
    }

    #[test]
    fn test_unknown_event_is_raw() {
        let mut n = normalizer();
        let raw = r#"42["somethingNew",{"x":1}]"#;
        let frame = RawFrame::received("direct", raw);
        let out = n.normalize(&decode_str(raw).unwrap(), &frame, SourceKind::Direct);
        assert_eq!(out[0].doc_type, DocType::Raw);
        assert_eq!(out[0].raw_payload, raw);
    }

    #[test]
    fn test_resume_after_never_rewinds() {
        let mut n = normalizer();
        n.resume_after(100);
        n.resume_after(10);
        let out = feed(&mut n, json!({"gameId": "g1", "cooldownTimer": 1}));
        assert_eq!(out[0].sequence, 101);
    }
}
