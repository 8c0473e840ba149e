pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod protocol;
pub mod services;
pub mod supervisor;

pub use config::AppConfig;
pub use coordination::{GracefulShutdown, ShutdownSignal, SourceManager};
pub use error::{FeedError, Result};
pub use persistence::{EventStore, SessionReader};
pub use services::{EventBus, EventNormalizer, FeedPipeline, LiveStateProvider};
