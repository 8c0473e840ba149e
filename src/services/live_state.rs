//! Latest authoritative snapshot of the feed, readable synchronously
//!
//! Updated by a wildcard bus subscription. Readers get a clone and never
//! observe a half-applied envelope.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use super::event_bus::{EventBus, Unsubscribe, WILDCARD};
use super::normalizer::topics;
use crate::domain::{DocType, EventEnvelope, Phase, TypedFields};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LiveSnapshot {
    pub session_id: Option<Uuid>,
    pub round_id: Option<String>,
    pub phase: Option<Phase>,
    pub tick_count: Option<i64>,
    pub price: Option<Decimal>,
    pub peak_price: Option<Decimal>,
    pub primary_source: Option<String>,
    pub last_sequence: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub events_seen: u64,
    pub ticks_seen: u64,
    pub trades_seen: u64,
    pub rounds_started: u64,
    pub rounds_completed: u64,
    /// Most recently finalized round id
    pub last_completed_round: Option<String>,
}

impl LiveSnapshot {
    fn apply(&mut self, envelope: &EventEnvelope) {
        self.session_id = Some(envelope.session_id);
        self.last_sequence = self.last_sequence.max(envelope.sequence);
        self.last_event_at = Some(envelope.ts);
        self.events_seen += 1;

        if envelope.doc_type == DocType::PlayerAction {
            self.trades_seen += 1;
        }

        match &envelope.fields {
            TypedFields::Tick(tick) => {
                self.ticks_seen += 1;
                // Ticks of already finalized rounds keep the snapshot on the last live round
                if envelope.round_id.is_some()
                    && envelope.round_id == self.last_completed_round
                    && self.round_id.is_none()
                {
                    return;
                }
                if envelope.round_id.is_some() {
                    self.round_id = envelope.round_id.clone();
                }
                self.phase = Some(tick.phase);
                if tick.tick_count.is_some() {
                    self.tick_count = tick.tick_count;
                }
                if tick.price.is_some() {
                    self.price = tick.price;
                }
                if tick.peak_price.is_some() {
                    self.peak_price = tick.peak_price;
                }
            }
            TypedFields::RoundStarted(round) => {
                self.rounds_started += 1;
                self.round_id = Some(round.round_id.clone());
                self.phase = Some(round.phase);
                self.tick_count = Some(round.tick_count);
                self.price = Some(round.price);
                self.peak_price = Some(round.peak_price);
            }
            TypedFields::RoundComplete(round) => {
                self.rounds_completed += 1;
                self.last_completed_round = Some(round.round_id.clone());
                if self.round_id.as_deref() == Some(round.round_id.as_str()) {
                    self.round_id = None;
                    self.phase = Some(round.phase);
                }
            }
            TypedFields::PhaseChanged(change) => {
                self.phase = Some(change.to);
            }
            TypedFields::SourceChanged(change) => {
                self.primary_source = Some(change.to.clone());
            }
            _ => {}
        }

        if envelope.event_type != topics::SOURCE_CHANGED && self.primary_source.is_none() {
            self.primary_source = Some(envelope.source_id.clone());
        }
    }
}

/// Lock-guarded live snapshot fed from the event bus
#[derive(Debug, Clone, Default)]
pub struct LiveStateProvider {
    state: Arc<RwLock<LiveSnapshot>>,
}

impl LiveStateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start following every event published on `bus`
    pub fn attach(&self, bus: &EventBus) -> Unsubscribe {
        let state = Arc::clone(&self.state);
        bus.subscribe(WILDCARD, move |envelope| {
            let mut snapshot = match state.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            snapshot.apply(envelope);
        })
    }

    pub fn snapshot(&self) -> LiveSnapshot {
        match self.state.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn current_round(&self) -> Option<String> {
        self.snapshot().round_id
    }
}
