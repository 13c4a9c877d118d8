//! scrimmage-runner: distributed executor for queued scrimmage matches.
//!
//! Worker processes race for queued matches in a shared PostgreSQL store,
//! run each through an external simulator, publish the replay to durable
//! blob storage and commit the winner.

pub mod cli;
pub mod config;
pub mod error;
pub mod execution;
pub mod scheduler;
pub mod storage;

// Re-export commonly used error types
pub use error::{ConfigError, PoolError, QueueError, SimulationError, StorageError};
