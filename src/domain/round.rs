use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Externally observable lifecycle stage of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Cooldown,
    Presale,
    Active,
    Rugged,
    Unknown,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Cooldown => "COOLDOWN",
            Phase::Presale => "PRESALE",
            Phase::Active => "ACTIVE",
            Phase::Rugged => "RUGGED",
            Phase::Unknown => "UNKNOWN",
        }
    }

    /// Position in the forward lifecycle; `Unknown` has none
    fn rank(&self) -> Option<u8> {
        match self {
            Phase::Cooldown => Some(0),
            Phase::Presale => Some(1),
            Phase::Active => Some(2),
            Phase::Rugged => Some(3),
            Phase::Unknown => None,
        }
    }

    /// Check if a round in this phase may move to `target`.
    ///
    /// Phases only move forward. `Unknown` may move anywhere, nothing moves
    /// back into `Unknown`, and nothing leaves `Rugged`.
    pub fn can_transition_to(&self, target: Phase) -> bool {
        match (self.rank(), target.rank()) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(from), Some(to)) => from != 3 && to > from,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Rugged)
    }

    /// Classify a state update. First matching rule wins.
    pub fn classify(update: &GameStateUpdate) -> Phase {
        if update.cooldown_timer > 0 {
            Phase::Cooldown
        } else if update.rugged {
            Phase::Rugged
        } else if update.allow_pre_round_buys && !update.active {
            Phase::Presale
        } else if update.active && !update.rugged {
            Phase::Active
        } else {
            Phase::Unknown
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for Phase {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "COOLDOWN" => Ok(Phase::Cooldown),
            "PRESALE" => Ok(Phase::Presale),
            "ACTIVE" => Ok(Phase::Active),
            "RUGGED" => Ok(Phase::Rugged),
            "UNKNOWN" => Ok(Phase::Unknown),
            _ => Err(format!("Unknown phase: {}", s)),
        }
    }
}

/// Payload of the primary round update event
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStateUpdate {
    #[serde(default)]
    pub game_id: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub rugged: bool,
    #[serde(default)]
    pub price: Option<serde_json::Value>,
    #[serde(default)]
    pub tick_count: Option<i64>,
    #[serde(default)]
    pub cooldown_timer: i64,
    #[serde(default)]
    pub allow_pre_round_buys: bool,
    #[serde(default)]
    pub trade_count: Option<i64>,
}

impl GameStateUpdate {
    pub fn from_value(data: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(data.clone())
    }

    pub fn price_decimal(&self) -> Option<Decimal> {
        self.price.as_ref().and_then(parse_decimal)
    }
}

/// Parse a JSON number or numeric string into a decimal
pub fn parse_decimal(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::Number(n) => n
            .to_string()
            .parse::<Decimal>()
            .ok()
            .or_else(|| n.as_f64().and_then(Decimal::from_f64)),
        serde_json::Value::String(s) => s.parse::<Decimal>().ok(),
        _ => None,
    }
}

/// Why a round was finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundEndReason {
    /// The feed reported the round as rugged
    Rugged,
    /// The next round's first tick arrived before any end signal
    Rollover,
}

/// Result of applying a classified tick to a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    Unchanged,
    Advanced { from: Phase, to: Phase },
    /// Backward or post-terminal transition ignored
    Rejected { current: Phase, observed: Phase },
}

/// State of one round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundState {
    pub round_id: String,
    pub phase: Phase,
    pub tick_count: i64,
    pub price: Decimal,
    pub peak_price: Decimal,
    pub ticks_observed: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<RoundEndReason>,
    pub finalized: bool,
}

impl RoundState {
    pub fn new(round_id: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            round_id: round_id.to_string(),
            phase: Phase::Unknown,
            tick_count: 0,
            price: Decimal::ONE,
            peak_price: Decimal::ONE,
            ticks_observed: 0,
            started_at,
            ended_at: None,
            end_reason: None,
            finalized: false,
        }
    }

    /// Apply one tick. Frozen rounds are never mutated.
    pub fn apply_tick(&mut self, update: &GameStateUpdate, observed: Phase) -> PhaseOutcome {
        if self.finalized {
            return PhaseOutcome::Rejected {
                current: self.phase,
                observed,
            };
        }

        self.ticks_observed += 1;
        if let Some(tick) = update.tick_count {
            self.tick_count = tick;
        }
        if let Some(price) = update.price_decimal() {
            self.price = price;
            if price > self.peak_price {
                self.peak_price = price;
            }
        }

        if observed == self.phase {
            PhaseOutcome::Unchanged
        } else if self.phase.can_transition_to(observed) {
            let from = self.phase;
            self.phase = observed;
            PhaseOutcome::Advanced { from, to: observed }
        } else {
            PhaseOutcome::Rejected {
                current: self.phase,
                observed,
            }
        }
    }

    /// Finalize the round. Returns false when it was already finalized.
    pub fn finalize(&mut self, at: DateTime<Utc>, reason: RoundEndReason) -> bool {
        if self.finalized {
            return false;
        }
        self.finalized = true;
        self.ended_at = Some(at);
        self.end_reason = Some(reason);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn update(value: serde_json::Value) -> GameStateUpdate {
        GameStateUpdate::from_value(&value).unwrap()
    }

    #[test]
    fn test_cooldown_takes_precedence_over_active() {
        let u = update(json!({"gameId": "g1", "cooldownTimer": 5, "active": true}));
        assert_eq!(Phase::classify(&u), Phase::Cooldown);
    }

    #[test]
    fn test_classification_order() {
        assert_eq!(
            Phase::classify(&update(json!({"rugged": true, "active": true}))),
            Phase::Rugged
        );
        assert_eq!(
            Phase::classify(&update(json!({"allowPreRoundBuys": true, "active": false}))),
            Phase::Presale
        );
        assert_eq!(
            Phase::classify(&update(json!({"allowPreRoundBuys": true, "active": true}))),
            Phase::Active
        );
        assert_eq!(Phase::classify(&update(json!({}))), Phase::Unknown);
    }

    #[test]
    fn test_transitions_only_move_forward() {
        assert!(Phase::Cooldown.can_transition_to(Phase::Presale));
        assert!(Phase::Presale.can_transition_to(Phase::Rugged));
        assert!(Phase::Unknown.can_transition_to(Phase::Cooldown));
        assert!(!Phase::Active.can_transition_to(Phase::Presale));
        assert!(!Phase::Active.can_transition_to(Phase::Unknown));
        assert!(!Phase::Rugged.can_transition_to(Phase::Cooldown));
        assert!(!Phase::Rugged.can_transition_to(Phase::Rugged));
    }

    #[test]
    fn test_apply_tick_tracks_peak_and_rejects_backward() {
        let mut round = RoundState::new("g1", Utc::now());
        let active = update(json!({"active": true, "tickCount": 1, "price": 1.5}));
        assert_eq!(
            round.apply_tick(&active, Phase::Active),
            PhaseOutcome::Advanced {
                from: Phase::Unknown,
                to: Phase::Active
            }
        );

        let lower = update(json!({"active": true, "tickCount": 2, "price": "1.2"}));
        round.apply_tick(&lower, Phase::Active);
        assert_eq!(round.price, dec!(1.2));
        assert_eq!(round.peak_price, dec!(1.5));
        assert_eq!(round.tick_count, 2);

        let presale = update(json!({"allowPreRoundBuys": true}));
        assert!(matches!(
            round.apply_tick(&presale, Phase::Presale),
            PhaseOutcome::Rejected { .. }
        ));
        assert_eq!(round.phase, Phase::Active);
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let mut round = RoundState::new("g1", Utc::now());
        assert!(round.finalize(Utc::now(), RoundEndReason::Rugged));
        assert!(!round.finalize(Utc::now(), RoundEndReason::Rollover));
        assert_eq!(round.end_reason, Some(RoundEndReason::Rugged));
    }

    #[test]
    fn test_parse_decimal_variants() {
        assert_eq!(parse_decimal(&json!(1.25)), Some(dec!(1.25)));
        assert_eq!(parse_decimal(&json!("0.5")), Some(dec!(0.5)));
        assert_eq!(parse_decimal(&json!(3)), Some(dec!(3)));
        assert_eq!(parse_decimal(&json!(null)), None);
    }
}
