//! Match execution layer.
//!
//! This module drives the external rules engine for one match at a time.
//!
//! # Architecture
//!
//! ```text
//! MatchExecutor ──(seed, red, blue, params)──▶ Simulator ──▶ engine process
//!       ▲                                                         │
//!       └──────────────── ReplayArtifact ◀──── replay JSON ◀──────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use scrimmage_runner::execution::{MatchExecutor, SimulationSeed};
//!
//! let executor = MatchExecutor::from_config(&config.simulator);
//! let replay = executor
//!     .run(SimulationSeed::generate(), &claim.red, &claim.blue, &config.simulator.params)
//!     .await?;
//! println!("winner: {:?}", replay.winner());
//! ```

pub mod executor;
pub mod simulator;

pub use executor::{MatchExecutor, ReplayArtifact, SimulationSeed, Winner};
pub use simulator::{resolve_program, ProcessSimulator, SimulationRequest, Simulator};
