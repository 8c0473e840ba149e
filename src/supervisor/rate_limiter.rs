//! Inbound event rate tracking.
//!
//! A health signal only: being over budget never causes an event to be dropped.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RateLimiter {
    window: Duration,
    max_events: usize,
    events: VecDeque<Instant>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_events: usize) -> Self {
        Self {
            window,
            max_events,
            events: VecDeque::new(),
        }
    }

    pub fn record(&mut self) {
        self.record_at(Instant::now());
    }

    pub fn record_at(&mut self, now: Instant) {
        self.events.push_back(now);
        self.evict(now);
    }

    pub fn is_within_budget(&mut self) -> bool {
        self.is_within_budget_at(Instant::now())
    }

    pub fn is_within_budget_at(&mut self, now: Instant) -> bool {
        self.evict(now);
        self.events.len() <= self.max_events
    }

    /// Events counted in the window ending at `now`
    pub fn count_at(&mut self, now: Instant) -> usize {
        self.evict(now);
        self.events.len()
    }

    fn evict(&mut self, now: Instant) {
        while let Some(front) = self.events.front() {
            if now.saturating_duration_since(*front) >= self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }
}
