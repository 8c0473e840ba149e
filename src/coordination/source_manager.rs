//! Primary source selection
//!
//! Ranks capture sources from the health table and redirects the ingestion
//! loop when a better source is available. The decision is made under the
//! manager's lock; the watch update and callbacks run after it is released,
//! so a callback may call back into the manager.

use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::MonitorConfig;
use crate::domain::SourceKind;
use crate::supervisor::{LatencyClass, SourceHealth, SourceHealthTable};

/// The source the ingestion loop should normalize
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrimarySelection {
    pub source_id: String,
    pub kind: SourceKind,
    pub previous: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSwitchResult {
    Switched {
        from: Option<String>,
        to: String,
        reason: String,
    },
    Unchanged {
        current: String,
    },
    /// No connected source; the current primary (if any) is kept
    NoHealthySource,
}

impl SourceSwitchResult {
    pub fn switched(&self) -> bool {
        matches!(self, SourceSwitchResult::Switched { .. })
    }
}

pub type SwitchCallback = Arc<dyn Fn(&SourceSwitchResult) + Send + Sync>;

/// Ordering key, smaller is better
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct RankKey {
    disconnected: bool,
    stale: bool,
    critical_latency: bool,
    consecutive_failures: u32,
    /// Whole seconds, so sub-second jitter does not flip the primary
    last_event_age_secs: u64,
}

fn rank_key(health: &SourceHealth, stale_after: Duration) -> RankKey {
    let age = health.last_event_age(Utc::now());
    RankKey {
        disconnected: !health.connected,
        stale: age.map_or(true, |a| a > stale_after),
        critical_latency: health.latency_class == LatencyClass::Critical,
        consecutive_failures: health.consecutive_failures,
        last_event_age_secs: age.map_or(u64::MAX, |a| a.as_secs()),
    }
}

fn switch_reason(current: Option<&SourceHealth>, stale_after: Duration) -> String {
    let Some(current) = current else {
        return "initial selection".to_string();
    };
    let key = rank_key(current, stale_after);
    if key.disconnected {
        "primary disconnected"
    } else if key.stale {
        "primary stale"
    } else if key.critical_latency {
        "primary latency critical"
    } else {
        "better source available"
    }
    .to_string()
}

#[derive(Default)]
struct ManagerState {
    primary: Option<String>,
    sources: Vec<(String, SourceKind)>,
    callbacks: Vec<SwitchCallback>,
}

pub struct SourceManager {
    health: Arc<SourceHealthTable>,
    config: MonitorConfig,
    state: Mutex<ManagerState>,
    primary_tx: watch::Sender<Option<PrimarySelection>>,
}

impl SourceManager {
    pub fn new(health: Arc<SourceHealthTable>, config: MonitorConfig) -> Self {
        let (primary_tx, _) = watch::channel(None);
        Self {
            health,
            config,
            state: Mutex::new(ManagerState::default()),
            primary_tx,
        }
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make a source eligible for selection. Registration order breaks ties.
    pub fn register(&self, source_id: &str, kind: SourceKind) {
        let mut state = self.state();
        if !state.sources.iter().any(|(id, _)| id == source_id) {
            state.sources.push((source_id.to_string(), kind));
        }
    }

    pub fn on_switch<F>(&self, callback: F)
    where
        F: Fn(&SourceSwitchResult) + Send + Sync + 'static,
    {
        self.state().callbacks.push(Arc::new(callback));
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PrimarySelection>> {
        self.primary_tx.subscribe()
    }

    pub fn current_primary(&self) -> Option<String> {
        self.state().primary.clone()
    }

    /// Re-rank all sources and switch the primary if a better one exists
    pub fn switch_to_best_source(&self) -> SourceSwitchResult {
        let stale_after = Duration::from_millis(self.config.stale_after_ms);

        let (result, selection, callbacks) = {
            let mut state = self.state();

            let ranked: Vec<(SourceHealth, SourceKind)> = state
                .sources
                .iter()
                .filter_map(|(id, kind)| self.health.get(id).map(|h| (h, *kind)))
                .collect();

            let best = ranked
                .iter()
                .filter(|(h, _)| h.connected)
                .min_by_key(|(h, _)| rank_key(h, stale_after));

            let current = state
                .primary
                .as_ref()
                .and_then(|id| ranked.iter().find(|(h, _)| &h.source_id == id));

            match (best, current) {
                (None, _) => (SourceSwitchResult::NoHealthySource, None, Vec::new()),
                (Some((best, _)), Some((cur, _)))
                    if best.source_id == cur.source_id
                        || rank_key(cur, stale_after) <= rank_key(best, stale_after) =>
                {
                    let result = SourceSwitchResult::Unchanged {
                        current: cur.source_id.clone(),
                    };
                    (result, None, Vec::new())
                }
                (Some((best, kind)), current) => {
                    let reason = switch_reason(current.map(|(h, _)| h), stale_after);
                    let from = state.primary.replace(best.source_id.clone());
                    let selection = PrimarySelection {
                        source_id: best.source_id.clone(),
                        kind: *kind,
                        previous: from.clone(),
                        reason: reason.clone(),
                    };
                    let result = SourceSwitchResult::Switched {
                        from,
                        to: best.source_id.clone(),
                        reason,
                    };
                    (result, Some(selection), state.callbacks.clone())
                }
            }
        };

        if let Some(selection) = selection {
            info!(
                from = ?selection.previous,
                to = %selection.source_id,
                reason = %selection.reason,
                "Primary source switched"
            );
            self.primary_tx.send_replace(Some(selection));
        } else if result == SourceSwitchResult::NoHealthySource {
            debug!("No connected source to select");
        }

        for callback in callbacks {
            callback(&result);
        }
        result
    }

    /// Re-evaluate on a fixed interval and whenever a source reports degradation
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.evaluate_interval_ms.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.health.degraded() => {
                    debug!("Degradation signalled, re-ranking sources");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let SourceSwitchResult::NoHealthySource = self.switch_to_best_source() {
                if self.current_primary().is_some() {
                    warn!("All sources unhealthy, keeping last primary");
                }
            }
        }
        debug!("Source manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn setup() -> (Arc<SourceHealthTable>, Arc<SourceManager>) {
        let health = Arc::new(SourceHealthTable::new(MonitorConfig::default()));
        health.register("a", SourceKind::Capture);
        health.register("b", SourceKind::Direct);
        let manager = Arc::new(SourceManager::new(health.clone(), MonitorConfig::default()));
        manager.register("a", SourceKind::Capture);
        manager.register("b", SourceKind::Direct);
        (health, manager)
    }

    fn live(health: &SourceHealthTable, id: &str) {
        health.record_connected(id);
        health.record_event(id, Utc::now(), false);
    }

    #[test]
    fn test_no_connected_source() {
        let (_health, manager) = setup();
        assert_eq!(manager.switch_to_best_source(), SourceSwitchResult::NoHealthySource);
        assert!(manager.current_primary().is_none());
    }

    #[test]
    fn test_initial_selection_and_stickiness() {
        let (health, manager) = setup();
        live(&health, "a");
        live(&health, "b");

        let first = manager.switch_to_best_source();
        assert!(first.switched());
        let primary = manager.current_primary().unwrap();

        // Equal health keeps the current primary
        assert_eq!(
            manager.switch_to_best_source(),
            SourceSwitchResult::Unchanged { current: primary }
        );
    }

    #[test]
    fn test_fails_over_when_primary_disconnects() {
        let (health, manager) = setup();
        live(&health, "a");
        manager.switch_to_best_source();
        assert_eq!(manager.current_primary().as_deref(), Some("a"));

        live(&health, "b");
        health.record_disconnected("a");

        let result = manager.switch_to_best_source();
        assert_eq!(
            result,
            SourceSwitchResult::Switched {
                from: Some("a".to_string()),
                to: "b".to_string(),
                reason: "primary disconnected".to_string(),
            }
        );
        let selection = manager.subscribe().borrow().clone().unwrap();
        assert_eq!(selection.source_id, "b");
        assert_eq!(selection.kind, SourceKind::Direct);
    }

    #[test]
    fn test_failures_rank_below_clean_source() {
        let (health, manager) = setup();
        live(&health, "a");
        manager.switch_to_best_source();

        live(&health, "b");
        health.record_failure("a", "timeout");

        assert!(manager.switch_to_best_source().switched());
        assert_eq!(manager.current_primary().as_deref(), Some("b"));
    }

    #[test]
    fn test_callback_may_reenter_manager() {
        let (health, manager) = setup();
        live(&health, "a");

        let calls = Arc::new(AtomicUsize::new(0));
        let weak = Arc::downgrade(&manager);
        let counter = calls.clone();
        manager.on_switch(move |result| {
            if let Some(manager) = weak.upgrade() {
                // Would deadlock if the lock were still held
                assert_eq!(manager.current_primary().as_deref(), Some("a"));
            }
            assert!(result.switched());
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        });

        manager.switch_to_best_source();
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }
}
