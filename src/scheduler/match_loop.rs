//! The per-worker claim → execute → publish → commit loop.
//!
//! One `MatchLoop` runs inside each worker process and holds at most one
//! claim at a time:
//!
//! ```text
//!            ┌──── Empty / Transient ───▶ sleep(backoff) ───┐
//!            │                                              │
//!   ┌──▶ claim_next ──▶ execute ──▶ publish ──▶ commit ─────┤
//!   │                      │           │                    │
//!   │                      └─ error ───┴──▶ commit(error) ──┤
//!   └───────────────────────────────────────────────────────┘
//! ```
//!
//! Only a failed claim is followed by a delay. After any commit the next
//! claim is immediate. The lease is heartbeated while the match is executing
//! and while its replay is being published. A heartbeat that finds the claim
//! gone drops the in-flight work, killing the engine, and abandons the match.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{LeaseConfig, MatchParameters};
use crate::error::QueueError;
use crate::execution::{MatchExecutor, SimulationSeed, Winner};
use crate::storage::ReplayPublisher;

use super::backoff::Backoff;
use super::queue::MatchQueue;
use super::record::{ClaimedMatch, MatchOutcome};

/// Tries per commit before giving the record up to lease expiry.
pub const COMMIT_ATTEMPTS: u32 = 3;

/// Lifecycle of a worker's loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Idle,
    Executing,
    Exited,
}

/// Stage at which a claimed match failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Execute,
    Publish,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Execute => f.write_str("execute"),
            Stage::Publish => f.write_str("publish"),
        }
    }
}

/// Result of one loop iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum Iteration {
    /// A winner was committed along with its replay.
    Committed {
        id: i64,
        outcome: MatchOutcome,
        replay_url: String,
    },
    /// The match failed and `error` was committed.
    Failed {
        id: i64,
        stage: Stage,
        error: String,
    },
    /// The claim was lost or the commit could not be recorded. The lease
    /// releases the record, or already has.
    Abandoned { id: i64 },
    /// Nothing was claimed. The caller should wait `delay` before claiming again.
    Idle { delay: Duration },
}

/// Counters kept by one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    pub red_wins: u64,
    pub blue_wins: u64,
    pub errors: u64,
    pub abandoned: u64,
    pub idle_polls: u64,
    pub transient_failures: u64,
}

impl LoopStats {
    /// Matches that reached a terminal commit.
    pub fn completed(&self) -> u64 {
        self.red_wins + self.blue_wins + self.errors
    }
}

/// The claim no longer holds its record.
#[derive(Debug)]
struct LeaseLost;

/// Drives matches for a single worker.
pub struct MatchLoop {
    worker_id: String,
    queue: Arc<dyn MatchQueue>,
    executor: MatchExecutor,
    publisher: ReplayPublisher,
    params: MatchParameters,
    backoff: Backoff,
    heartbeat_interval: Duration,
    state: WorkerState,
    stats: LoopStats,
}

impl MatchLoop {
    pub fn new(
        worker_id: impl Into<String>,
        queue: Arc<dyn MatchQueue>,
        executor: MatchExecutor,
        publisher: ReplayPublisher,
        backoff: Backoff,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            queue,
            executor,
            publisher,
            params: MatchParameters::default(),
            backoff,
            heartbeat_interval: LeaseConfig::default().heartbeat_interval,
            state: WorkerState::Starting,
            stats: LoopStats::default(),
        }
    }

    pub fn with_params(mut self, params: MatchParameters) -> Self {
        self.params = params;
        self
    }

    /// Sets how often the lease is extended while a match is held.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn stats(&self) -> LoopStats {
        self.stats
    }

    /// Runs until `shutdown` fires and returns the worker's counters.
    ///
    /// The signal is observed only between matches and during backoff
    /// sleeps. A match in progress always runs to its commit.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> LoopStats {
        info!(worker_id = %self.worker_id, "Match loop started");

        // Desynchronize workers started at the same instant.
        let jitter = self.backoff.next_delay();
        debug!(worker_id = %self.worker_id, delay_ms = jitter.as_millis() as u64, "Initial jitter");
        let mut stopping = sleep_or_shutdown(jitter, &mut shutdown).await;

        while !stopping {
            if shutdown_requested(&mut shutdown) {
                break;
            }
            if let Iteration::Idle { delay } = self.run_once().await {
                stopping = sleep_or_shutdown(delay, &mut shutdown).await;
            }
        }

        self.state = WorkerState::Exited;
        info!(
            worker_id = %self.worker_id,
            red_wins = self.stats.red_wins,
            blue_wins = self.stats.blue_wins,
            errors = self.stats.errors,
            abandoned = self.stats.abandoned,
            idle_polls = self.stats.idle_polls,
            transient_failures = self.stats.transient_failures,
            "Match loop stopped"
        );
        self.stats
    }

    /// Performs one claim and, if something was claimed, carries it to a commit.
    pub async fn run_once(&mut self) -> Iteration {
        let claim = match self.queue.claim_next(&self.worker_id).await {
            Ok(claim) => claim,
            Err(QueueError::Empty) => {
                self.stats.idle_polls += 1;
                return self.idle();
            }
            Err(e) if e.is_retryable() => {
                self.stats.transient_failures += 1;
                warn!(worker_id = %self.worker_id, error = %e, "Claim failed, backing off");
                return self.idle();
            }
            Err(e) => {
                self.stats.transient_failures += 1;
                error!(worker_id = %self.worker_id, error = %e, "Claim returned an unexpected error");
                return self.idle();
            }
        };

        self.state = WorkerState::Executing;
        let seed = SimulationSeed::generate();
        info!(
            worker_id = %self.worker_id,
            match_id = claim.id,
            attempt = claim.attempt,
            reclaimed = claim.reclaimed,
            seed = seed.value(),
            "Match claimed"
        );

        let executed = self
            .with_heartbeat(
                &claim,
                self.executor
                    .run(seed, &claim.red, &claim.blue, &self.params),
            )
            .await;
        let artifact = match executed {
            Err(LeaseLost) => return self.lease_lost(&claim, Stage::Execute),
            Ok(Ok(artifact)) => artifact,
            Ok(Err(e)) => {
                warn!(worker_id = %self.worker_id, match_id = claim.id, seed = seed.value(), error = %e, "Simulation failed");
                return self.fail(&claim, Stage::Execute, e.to_string()).await;
            }
        };

        let published = match self
            .with_heartbeat(&claim, self.publisher.publish(&artifact))
            .await
        {
            Err(LeaseLost) => return self.lease_lost(&claim, Stage::Publish),
            Ok(Ok(published)) => published,
            Ok(Err(e)) => {
                warn!(worker_id = %self.worker_id, match_id = claim.id, error = %e, "Replay publication failed");
                return self.fail(&claim, Stage::Publish, e.to_string()).await;
            }
        };

        let outcome = match artifact.winner() {
            Winner::Red => MatchOutcome::RedWon,
            Winner::Blue => MatchOutcome::BlueWon,
        };

        if !self.commit(&claim, outcome, Some(published.url.as_str())).await {
            return self.abandon(&claim);
        }

        match outcome {
            MatchOutcome::RedWon => self.stats.red_wins += 1,
            MatchOutcome::BlueWon => self.stats.blue_wins += 1,
            MatchOutcome::Error => self.stats.errors += 1,
        }
        self.state = WorkerState::Idle;

        Iteration::Committed {
            id: claim.id,
            outcome,
            replay_url: published.url,
        }
    }

    fn idle(&mut self) -> Iteration {
        self.state = WorkerState::Idle;
        Iteration::Idle {
            delay: self.backoff.next_delay(),
        }
    }

    async fn fail(&mut self, claim: &ClaimedMatch, stage: Stage, error: String) -> Iteration {
        if !self.commit(claim, MatchOutcome::Error, None).await {
            return self.abandon(claim);
        }
        self.stats.errors += 1;
        self.state = WorkerState::Idle;
        Iteration::Failed {
            id: claim.id,
            stage,
            error,
        }
    }

    fn lease_lost(&mut self, claim: &ClaimedMatch, stage: Stage) -> Iteration {
        warn!(
            worker_id = %self.worker_id,
            match_id = claim.id,
            stage = %stage,
            "Lease lost to another claim; dropping the match"
        );
        self.abandon(claim)
    }

    fn abandon(&mut self, claim: &ClaimedMatch) -> Iteration {
        self.stats.abandoned += 1;
        self.state = WorkerState::Idle;
        Iteration::Abandoned { id: claim.id }
    }

    /// Records the terminal status, retrying transient failures.
    ///
    /// Returns whether the commit was accepted.
    async fn commit(
        &mut self,
        claim: &ClaimedMatch,
        outcome: MatchOutcome,
        replay_url: Option<&str>,
    ) -> bool {
        for attempt in 1..=COMMIT_ATTEMPTS {
            match self.queue.commit_result(claim, outcome, replay_url).await {
                Ok(()) => {
                    info!(
                        worker_id = %self.worker_id,
                        match_id = claim.id,
                        status = %outcome,
                        replay = replay_url.unwrap_or(""),
                        "Match committed"
                    );
                    return true;
                }
                Err(QueueError::RecordNotFound { id }) => {
                    error!(
                        worker_id = %self.worker_id,
                        match_id = id,
                        "Commit matched no running record for this claim; exclusivity was violated"
                    );
                    return false;
                }
                Err(e) if e.is_retryable() && attempt < COMMIT_ATTEMPTS => {
                    self.stats.transient_failures += 1;
                    let delay = self.backoff.next_delay();
                    warn!(
                        worker_id = %self.worker_id,
                        match_id = claim.id,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Commit failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.stats.transient_failures += 1;
                    error!(
                        worker_id = %self.worker_id,
                        match_id = claim.id,
                        attempt = attempt,
                        error = %e,
                        "Commit failed; record left to lease expiry"
                    );
                    return false;
                }
            }
        }
        false
    }

    /// Polls `work` to completion while extending the claim's lease.
    ///
    /// Drops `work` unfinished if a heartbeat reports the claim gone. Other
    /// heartbeat failures are logged and the work continues.
    async fn with_heartbeat<F, T>(&self, claim: &ClaimedMatch, work: F) -> Result<T, LeaseLost>
    where
        F: Future<Output = T>,
    {
        tokio::pin!(work);
        let period = self.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut work => return Ok(result),
                _ = ticker.tick() => {
                    match self.queue.heartbeat(claim).await {
                        Ok(()) => debug!(worker_id = %self.worker_id, match_id = claim.id, "Lease extended"),
                        Err(QueueError::RecordNotFound { .. }) => return Err(LeaseLost),
                        Err(e) => warn!(worker_id = %self.worker_id, match_id = claim.id, error = %e, "Heartbeat failed"),
                    }
                }
            }
        }
    }
}

/// Non-blocking check for a shutdown signal.
fn shutdown_requested(shutdown: &mut broadcast::Receiver<()>) -> bool {
    match shutdown.try_recv() {
        Ok(()) => true,
        Err(broadcast::error::TryRecvError::Closed) => true,
        Err(broadcast::error::TryRecvError::Lagged(_)) => true,
        Err(broadcast::error::TryRecvError::Empty) => false,
    }
}

/// Sleeps for `delay`; returns true if shutdown fired first.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut broadcast::Receiver<()>) -> bool {
    if delay.is_zero() {
        return shutdown_requested(shutdown);
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.recv() => true,
    }
}
