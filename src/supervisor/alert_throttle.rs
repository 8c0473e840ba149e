//! Alert rate limiting
//!
//! Keeps a sustained condition from flooding the logs: an alert key may fire
//! once per cooldown, and the number of suppressed repeats is reported with
//! the next one that gets through.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Rate limiter state for an alert key
#[derive(Debug)]
struct RateLimitState {
    last_sent: Instant,
    suppressed_count: u32,
}

/// Decision for one alert attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDecision {
    /// Emit now; `suppressed` repeats were swallowed since the last emission
    Emit { suppressed: u32 },
    Suppress,
}

#[derive(Debug)]
pub struct AlertThrottle {
    cooldown: Duration,
    limits: HashMap<String, RateLimitState>,
}

impl AlertThrottle {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            limits: HashMap::new(),
        }
    }

    pub fn check(&mut self, key: &str) -> AlertDecision {
        self.check_at(key, Instant::now())
    }

    pub fn check_at(&mut self, key: &str, now: Instant) -> AlertDecision {
        if let Some(state) = self.limits.get_mut(key) {
            if now.saturating_duration_since(state.last_sent) < self.cooldown {
                state.suppressed_count += 1;
                debug!(
                    "Rate limiting alert '{}' ({} suppressed)",
                    key, state.suppressed_count
                );
                return AlertDecision::Suppress;
            }

            let suppressed = state.suppressed_count;
            state.last_sent = now;
            state.suppressed_count = 0;
            return AlertDecision::Emit { suppressed };
        }

        self.limits.insert(
            key.to_string(),
            RateLimitState {
                last_sent: now,
                suppressed_count: 0,
            },
        );
        AlertDecision::Emit { suppressed: 0 }
    }
}
