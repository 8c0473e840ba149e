//! Tick continuity tracking
//!
//! Annotates ticks with their continuity status. Never drops or rewrites an
//! event; anomalies are counted in the session ledger and logged.

use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use tracing::{debug, warn};

/// Continuity of one observed tick relative to the previous one in its round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IntegrityStatus {
    /// First tick seen for this round, nothing to compare against
    First,
    Ok,
    Gap { missing: u64 },
    Duplicate { tick: i64 },
    Regression { last: i64, received: i64 },
}

impl IntegrityStatus {
    pub fn is_anomaly(&self) -> bool {
        matches!(
            self,
            IntegrityStatus::Gap { .. }
                | IntegrityStatus::Duplicate { .. }
                | IntegrityStatus::Regression { .. }
        )
    }
}

/// What to do when a tick arrives below the last one seen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegressionPolicy {
    /// Move the expectation down to the new tick. A regression usually means a
    /// new round began without a clean boundary signal.
    #[default]
    Reset,
    /// Keep the previous expectation
    Ignore,
}

/// Per-session continuity counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityLedger {
    pub round_id: Option<String>,
    pub last_tick_seen: Option<i64>,
    pub ticks_observed: u64,
    pub gap_count: u64,
    pub missing_ticks: u64,
    pub duplicate_count: u64,
    pub regression_count: u64,
}

impl IntegrityLedger {
    pub fn anomaly_count(&self) -> u64 {
        self.gap_count + self.duplicate_count + self.regression_count
    }
}

/// Data integrity monitor for one session
#[derive(Debug, Default)]
pub struct IntegrityMonitor {
    policy: RegressionPolicy,
    ledger: RwLock<IntegrityLedger>,
}

impl IntegrityMonitor {
    pub fn new(policy: RegressionPolicy) -> Self {
        Self {
            policy,
            ledger: RwLock::new(IntegrityLedger::default()),
        }
    }

    /// Record a tick for `round_id` and classify it
    pub fn observe(&self, round_id: &str, tick: i64) -> IntegrityStatus {
        let mut ledger = match self.ledger.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ledger.ticks_observed += 1;

        let same_round = ledger.round_id.as_deref() == Some(round_id);
        let last = match (same_round, ledger.last_tick_seen) {
            (true, Some(last)) => last,
            _ => {
                ledger.round_id = Some(round_id.to_string());
                ledger.last_tick_seen = Some(tick);
                return IntegrityStatus::First;
            }
        };

        // Widened: wire ticks may sit anywhere in i64
        let delta = i128::from(tick) - i128::from(last);
        if delta == 1 {
            ledger.last_tick_seen = Some(tick);
            IntegrityStatus::Ok
        } else if delta > 1 {
            let missing = u64::try_from(delta - 1).unwrap_or(u64::MAX);
            ledger.gap_count += 1;
            ledger.missing_ticks = ledger.missing_ticks.saturating_add(missing);
            ledger.last_tick_seen = Some(tick);
            warn!(
                round_id,
                last_tick = last,
                tick,
                missing,
                "Tick gap detected"
            );
            IntegrityStatus::Gap { missing }
        } else if delta == 0 {
            ledger.duplicate_count += 1;
            debug!(round_id, tick, "Duplicate tick");
            IntegrityStatus::Duplicate { tick }
        } else {
            ledger.regression_count += 1;
            if self.policy == RegressionPolicy::Reset {
                ledger.last_tick_seen = Some(tick);
            }
            warn!(
                round_id,
                last_tick = last,
                tick,
                policy = ?self.policy,
                "Tick regression detected"
            );
            IntegrityStatus::Regression {
                last,
                received: tick,
            }
        }
    }

    /// Snapshot of the ledger
    pub fn ledger(&self) -> IntegrityLedger {
        match self.ledger.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
