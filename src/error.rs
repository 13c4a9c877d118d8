//! Error types for scrimmage-runner operations.
//!
//! Defines the error taxonomy for every stage of the match pipeline:
//! - Queue claims and commits against the match store
//! - Simulation runs
//! - Replay publication
//! - Worker process supervision
//! - Configuration and startup

use std::time::Duration;

use thiserror::Error;

/// Errors returned by the match queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No claimable record exists. Expected, not a failure.
    #[error("Queue is empty")]
    Empty,

    /// Connectivity or contention failure; safe to retry after a backoff.
    #[error("Transient queue failure: {0}")]
    Transient(#[from] sqlx::Error),

    /// The record is not held by this claim. Unreachable while claims are exclusive.
    #[error("Match {id} not found in running state for this claim")]
    RecordNotFound { id: i64 },

    /// Failed to connect to the match store.
    #[error("Queue connection failed: {0}")]
    ConnectionFailed(String),

    /// A row came back with a value outside the known domain.
    #[error("Corrupt match record {id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

impl QueueError {
    /// Returns whether the claim loop should back off and try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            QueueError::Empty | QueueError::Transient(_) | QueueError::ConnectionFailed(_)
        )
    }
}

/// Errors raised while running a simulation. Terminal for the match.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("Failed to spawn simulator '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Simulator IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Simulation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Simulator exited with code {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },

    #[error("Malformed replay: {0}")]
    MalformedReplay(String),

    #[error("Replay exceeds {limit} bytes")]
    ReplayTooLarge { limit: usize },

    #[error("Failed to encode simulation request: {0}")]
    Request(#[from] serde_json::Error),
}

/// Errors raised while publishing a replay. Terminal for the match.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Object store rejected write of '{name}' with status {status}: {body}")]
    Rejected {
        name: String,
        status: u16,
        body: String,
    },

    #[error("Object '{0}' already exists")]
    AlreadyExists(String),

    #[error("Missing object store credentials: {0}")]
    MissingCredentials(String),

    #[error("Invalid object name '{0}'")]
    InvalidName(String),

    #[error("Replay write not acknowledged within {0:?}")]
    Timeout(Duration),
}

/// Errors raised by the worker pool manager.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Failed to launch worker {index}: {source}")]
    LaunchFailed {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot resolve current executable: {0}")]
    CurrentExe(std::io::Error),

    #[error("Failed to encode worker configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Pool configured with zero workers")]
    NoWorkers,
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid backoff bounds: min {min:?} must be <= max {max:?}")]
    InvalidBackoff { min: Duration, max: Duration },

    #[error("Heartbeat interval {heartbeat:?} must be shorter than lease timeout {lease:?}")]
    InvalidLease { heartbeat: Duration, lease: Duration },

    #[error("Missing required setting: {0}")]
    Missing(String),

    #[error("Invalid setting '{name}': {reason}")]
    Invalid { name: String, reason: String },

    #[error("Failed to decode worker configuration: {0}")]
    Decode(#[from] serde_json::Error),
}
