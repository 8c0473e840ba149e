//! Feed health supervision
//!
//! - Tick continuity ledger per session
//! - Latency spike detection with throttled alerting
//! - Inbound rate budget per source
//! - Shared source health table read by the source manager

pub mod alert_throttle;
pub mod integrity;
pub mod latency;
pub mod rate_limiter;
pub mod source_health;

pub use alert_throttle::{AlertDecision, AlertThrottle};
pub use integrity::{IntegrityLedger, IntegrityMonitor, IntegrityStatus, RegressionPolicy};
pub use latency::{LatencyClass, LatencyMonitor, LatencySpikeDetector};
pub use rate_limiter::RateLimiter;
pub use source_health::{SourceHealth, SourceHealthTable};
