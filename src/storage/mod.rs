//! Persistent storage: the match store and replay blobs.
//!
//! # Overview
//!
//! The storage system consists of:
//! - **Database**: PostgreSQL pool and record lookups for the `scrimmages` and `programs` tables
//! - **Replays**: Write-once blob storage with durable acknowledgment (filesystem or HTTP)
//! - **Schema**: Bootstrap DDL for development and integration tests
//!
//! # Usage
//!
//! ```rust,ignore
//! use scrimmage_runner::storage::{blob_store_from_config, Database, ReplayPublisher};
//!
//! // Connect to database
//! let db = Database::connect(&config.database).await?;
//!
//! // Create the tables if they are missing
//! db.bootstrap_schema().await?;
//!
//! // Publish a replay
//! let store = blob_store_from_config(&config.replay_store, config.publish_timeout)?;
//! let publisher = ReplayPublisher::new(store).with_timeout(config.publish_timeout);
//! let published = publisher.publish(&artifact).await?;
//! println!("replay at {}", published.url);
//! ```

pub mod database;
pub mod replays;
pub mod schema;

// Re-export main types for convenience
pub use database::{Database, DatabaseError};
pub use replays::{
    blob_store_from_config, compute_checksum, BlobStore, FsBlobStore, HttpBlobStore,
    PublishedReplay, ReplayPublisher, DEFAULT_PUBLISH_TIMEOUT, REPLAY_PREFIX,
};
