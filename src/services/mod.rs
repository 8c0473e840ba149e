pub mod event_bus;
pub mod health;
pub mod live_state;
pub mod normalizer;
pub mod pipeline;

pub use event_bus::{BusStats, EventBus, PublishReport, Unsubscribe, WILDCARD};
pub use health::{FeedStatus, HealthServer, HealthStatus, StatusReport};
pub use live_state::{LiveSnapshot, LiveStateProvider};
pub use normalizer::{topics, EventNormalizer, NormalizerStats};
pub use pipeline::{FeedPipeline, PipelineCounters, PipelineStats};
