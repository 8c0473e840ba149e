//! Coordination layer
//!
//! - Primary source selection and failover
//! - Graceful shutdown sequencing

pub mod shutdown;
pub mod source_manager;

pub use shutdown::{GracefulShutdown, ShutdownConfig, ShutdownPhase, ShutdownSignal};
pub use source_manager::{PrimarySelection, SourceManager, SourceSwitchResult};
