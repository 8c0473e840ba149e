//! Latency spike detection
//!
//! Classification runs on every sample against a rolling baseline
//! (trailing mean + k·stddev). Alerting is a separate, throttled step so a
//! sustained spike produces one log line per cooldown instead of one per tick.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use tracing::{error, warn};

use super::alert_throttle::{AlertDecision, AlertThrottle};
use crate::config::MonitorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyClass {
    Normal,
    Warn,
    Critical,
}

impl LatencyClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            LatencyClass::Normal => "normal",
            LatencyClass::Warn => "warn",
            LatencyClass::Critical => "critical",
        }
    }
}

impl fmt::Display for LatencyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Rolling-baseline spike classifier
#[derive(Debug, Clone)]
pub struct LatencySpikeDetector {
    samples: VecDeque<f64>,
    capacity: usize,
    min_samples: usize,
    warn_sigma: f64,
    critical_sigma: f64,
    min_stddev_ms: f64,
}

impl LatencySpikeDetector {
    pub fn new(config: &MonitorConfig) -> Self {
        let capacity = config.latency_window.max(2);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            min_samples: config.latency_min_samples.clamp(2, capacity),
            warn_sigma: config.latency_warn_sigma,
            critical_sigma: config.latency_critical_sigma,
            min_stddev_ms: config.latency_min_stddev_ms,
        }
    }

    /// Classify a sample, then fold it into the baseline
    pub fn record(&mut self, latency_ms: f64) -> LatencyClass {
        let class = self.classify(latency_ms);
        self.samples.push_back(latency_ms);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
        class
    }

    /// Classify without mutating the baseline
    pub fn classify(&self, latency_ms: f64) -> LatencyClass {
        if self.samples.len() < self.min_samples {
            return LatencyClass::Normal;
        }

        let (mean, stddev) = self.mean_stddev();
        let spread = stddev.max(self.min_stddev_ms);

        if latency_ms > mean + self.critical_sigma * spread {
            LatencyClass::Critical
        } else if latency_ms > mean + self.warn_sigma * spread {
            LatencyClass::Warn
        } else {
            LatencyClass::Normal
        }
    }

    fn mean_stddev(&self) -> (f64, f64) {
        let n = self.samples.len() as f64;
        if n == 0.0 {
            return (0.0, 0.0);
        }
        let mean = self.samples.iter().sum::<f64>() / n;
        let variance = self.samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;
        (mean, variance.sqrt())
    }

    /// Nearest-rank percentile over the current window
    pub fn percentile(&self, p: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let idx = rank.saturating_sub(1).min(sorted.len() - 1);
        Some(sorted[idx])
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

/// Detector plus throttled alert emission for one source
#[derive(Debug)]
pub struct LatencyMonitor {
    detector: LatencySpikeDetector,
    throttle: AlertThrottle,
}

impl LatencyMonitor {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            detector: LatencySpikeDetector::new(config),
            throttle: AlertThrottle::new(Duration::from_secs(config.alert_cooldown_secs)),
        }
    }

    pub fn record(&mut self, source_id: &str, latency_ms: f64) -> LatencyClass {
        let class = self.detector.record(latency_ms);
        if class == LatencyClass::Normal {
            return class;
        }

        let key = format!("{}:{}", source_id, class);
        if let AlertDecision::Emit { suppressed } = self.throttle.check(&key) {
            let p95 = self.detector.percentile(95.0).unwrap_or_default();
            match class {
                LatencyClass::Critical => error!(
                    source_id,
                    latency_ms, p95, suppressed, "Critical feed latency spike"
                ),
                _ => warn!(source_id, latency_ms, p95, suppressed, "Feed latency spike"),
            }
        }
        class
    }

    pub fn p50(&self) -> Option<f64> {
        self.detector.percentile(50.0)
    }

    pub fn p95(&self) -> Option<f64> {
        self.detector.percentile(95.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warmed_detector() -> LatencySpikeDetector {
        let mut detector = LatencySpikeDetector::new(&MonitorConfig::default());
        for i in 0..50 {
            detector.record(if i % 2 == 0 { 240.0 } else { 260.0 });
        }
        detector
    }

    #[test]
    fn test_no_classification_before_baseline() {
        let mut detector = LatencySpikeDetector::new(&MonitorConfig::default());
        assert_eq!(detector.record(250.0), LatencyClass::Normal);
        assert_eq!(detector.record(90_000.0), LatencyClass::Normal);
    }

    #[test]
    fn test_thresholds_use_floor_spread() {
        // mean 250, stddev 10 floored to 25: warn above 325, critical above 400
        let detector = warmed_detector();
        assert_eq!(detector.classify(300.0), LatencyClass::Normal);
        assert_eq!(detector.classify(340.0), LatencyClass::Warn);
        assert_eq!(detector.classify(500.0), LatencyClass::Critical);
    }

    #[test]
    fn test_record_classifies_before_absorbing() {
        let mut detector = warmed_detector();
        assert_eq!(detector.record(1_000.0), LatencyClass::Critical);
        assert_eq!(detector.sample_count(), 51);
    }

    #[test]
    fn test_percentiles() {
        let mut detector = LatencySpikeDetector::new(&MonitorConfig::default());
        for i in 1..=100 {
            detector.record(i as f64);
        }
        assert_eq!(detector.percentile(50.0), Some(50.0));
        assert_eq!(detector.percentile(95.0), Some(95.0));
    }

    #[test]
    fn test_sustained_spike_still_classified_every_sample() {
        let mut monitor = LatencyMonitor::new(&MonitorConfig::default());
        for i in 0..50 {
            monitor.record("direct", if i % 2 == 0 { 240.0 } else { 260.0 });
        }
        let classes: Vec<_> = (0..3).map(|_| monitor.record("direct", 2_000.0)).collect();
        assert!(classes.iter().all(|c| *c != LatencyClass::Normal));
    }
}
