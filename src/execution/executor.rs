//! Match executor: runs one simulation to completion.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{MatchParameters, SimulatorConfig};
use crate::error::SimulationError;
use crate::scheduler::Program;

use super::simulator::{ProcessSimulator, SimulationRequest, Simulator};

/// Exclusive upper bound for generated seeds.
const SEED_RANGE: u32 = 1 << 31;

/// Pseudorandom seed for one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SimulationSeed(pub u32);

impl SimulationSeed {
    /// Draws a fresh seed. Every attempt gets its own.
    pub fn generate() -> Self {
        Self(rand::rng().random_range(0..SEED_RANGE))
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Side that won a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Winner {
    Red,
    Blue,
}

impl Winner {
    /// Decodes the replay's `winner` field: 0 is red, 1 is blue.
    fn from_replay_field(value: &serde_json::Value) -> Option<Self> {
        match value.as_u64()? {
            0 => Some(Winner::Red),
            1 => Some(Winner::Blue),
            _ => None,
        }
    }
}

/// Serialized replay of a completed match.
///
/// The bytes are fixed at construction, so what is published is exactly
/// what the simulation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayArtifact {
    winner: Winner,
    bytes: Vec<u8>,
}

impl ReplayArtifact {
    /// Validates a replay document and serializes it.
    ///
    /// # Errors
    ///
    /// Returns `SimulationError::MalformedReplay` if the document is not an
    /// object with a `winner` of 0 or 1.
    pub fn from_document(document: serde_json::Value) -> Result<Self, SimulationError> {
        let winner_field = document
            .get("winner")
            .ok_or_else(|| SimulationError::MalformedReplay("missing 'winner' field".to_string()))?;
        let winner = Winner::from_replay_field(winner_field).ok_or_else(|| {
            SimulationError::MalformedReplay(format!("invalid winner {}", winner_field))
        })?;
        let bytes = serde_json::to_vec(&document)
            .map_err(|e| SimulationError::MalformedReplay(e.to_string()))?;

        Ok(Self { winner, bytes })
    }

    pub fn winner(&self) -> Winner {
        self.winner
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Drives a [`Simulator`] for one match at a time.
///
/// The caller awaits `run` to completion; the worker claims nothing else
/// meanwhile.
#[derive(Clone)]
pub struct MatchExecutor {
    simulator: Arc<dyn Simulator>,
    match_timeout: Duration,
}

impl MatchExecutor {
    pub fn new(simulator: Arc<dyn Simulator>, match_timeout: Duration) -> Self {
        Self {
            simulator,
            match_timeout,
        }
    }

    /// Creates an executor that launches the configured engine process.
    pub fn from_config(config: &SimulatorConfig) -> Self {
        Self::new(
            Arc::new(ProcessSimulator::from_config(config)),
            config.match_timeout,
        )
    }

    /// Plays red against blue.
    ///
    /// # Errors
    ///
    /// Returns `SimulationError` if the engine fails, times out, or produces
    /// an unusable replay. Failed attempts must not be retried.
    pub async fn run(
        &self,
        seed: SimulationSeed,
        red: &Program,
        blue: &Program,
        params: &MatchParameters,
    ) -> Result<ReplayArtifact, SimulationError> {
        let request = SimulationRequest {
            seed: seed.value(),
            red: &red.source,
            blue: &blue.source,
            params: *params,
        };

        let start = Instant::now();
        let document = tokio::time::timeout(self.match_timeout, self.simulator.simulate(&request))
            .await
            .map_err(|_| SimulationError::Timeout(self.match_timeout))??;

        let artifact = ReplayArtifact::from_document(document)?;
        debug!(bytes = artifact.len(), "Replay decoded");
        info!(
            seed = seed.value(),
            red_program = red.id,
            blue_program = blue.id,
            winner = ?artifact.winner(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Simulation finished"
        );

        Ok(artifact)
    }
}
