//! Match scheduling: claiming queued scrimmages and driving them to a result.
//!
//! This module provides the coordination layer between worker processes:
//!
//! - **MatchQueue**: PostgreSQL-backed queue with exclusive claims via `FOR UPDATE SKIP LOCKED`
//! - **MatchLoop**: Per-worker claim → execute → publish → commit cycle
//! - **WorkerPool**: Manager that keeps one worker process per core alive
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Manager    │
//!                      │ (WorkerPool) │
//!                      └──────┬───────┘
//!                             │ spawns
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 0│         │ Worker 1│         │ Worker N│
//!    │MatchLoop│         │MatchLoop│         │MatchLoop│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         │                   │                   │
//!         └───────────────────┼───────────────────┘
//!                             │ claim / heartbeat / commit
//!                      ┌──────▼───────┐
//!                      │  PostgreSQL  │
//!                      │  scrimmages  │
//!                      └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use scrimmage_runner::scheduler::{Backoff, MatchLoop, PgMatchQueue};
//! use std::sync::Arc;
//!
//! let queue = Arc::new(PgMatchQueue::new(pool, config.lease.timeout));
//! let worker = MatchLoop::new("worker-0", queue, executor, publisher, Backoff::from_config(&config.backoff)?)
//!     .with_heartbeat_interval(config.lease.heartbeat_interval);
//!
//! let stats = worker.run(shutdown_rx).await;
//! ```
//!
//! # Reliability Features
//!
//! - **Exclusive claims**: Row locks with `SKIP LOCKED` so racing workers never share a record
//! - **Leases**: A crashed worker's record becomes claimable again once its lease expires
//! - **Fenced commits**: Commits carry the claim token and cannot touch a reclaimed record
//! - **Durable replays**: The result is committed only after the replay write is acknowledged

pub mod backoff;
pub mod match_loop;
pub mod memory;
pub mod queue;
pub mod record;
pub mod worker_pool;

// Re-export main types for convenience
pub use backoff::Backoff;
pub use match_loop::{Iteration, LoopStats, MatchLoop, Stage, WorkerState, COMMIT_ATTEMPTS};
pub use memory::InMemoryQueue;
pub use queue::{MatchQueue, PgMatchQueue};
pub use record::{ClaimedMatch, MatchOutcome, MatchRecord, MatchStatus, Program};
pub use worker_pool::{
    PoolStats, SelfExecLauncher, WorkerLauncher, WorkerPool, WorkerPoolConfig,
};
