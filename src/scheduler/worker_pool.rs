//! Worker pool manager: one OS process per worker.
//!
//! The manager re-executes its own binary once per slot as
//! `<exe> --log-level <level> worker --index <i>`, handing each child the
//! full configuration in [`WORKER_CONFIG_ENV`]. It then supervises the
//! children until shutdown.
//!
//! # Features
//!
//! - Worker count defaults to the number of logical CPUs
//! - Every exit is logged with slot index, pid and exit status
//! - Dead workers are respawned after a delay, up to a per-slot limit that
//!   resets once a worker has stayed up for `stable_uptime`
//! - Graceful shutdown with broadcast channel, then kill after a timeout

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{RunnerConfig, WORKER_CONFIG_ENV};
use crate::error::PoolError;

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of worker processes to keep alive.
    pub num_workers: usize,
    /// Whether dead workers are started again.
    pub respawn: bool,
    /// Consecutive restarts allowed per slot before it is left down.
    pub max_restarts: u32,
    /// Uptime after which a worker counts as healthy and its slot's restart
    /// count is cleared.
    pub stable_uptime: Duration,
    /// Wait between a worker's exit and its replacement.
    pub restart_delay: Duration,
    /// How long workers get to exit after shutdown before being killed.
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get().max(1),
            respawn: true,
            max_restarts: 10,
            stable_uptime: Duration::from_secs(300),
            restart_delay: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    pub fn with_respawn(mut self, respawn: bool) -> Self {
        self.respawn = respawn;
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_stable_uptime(mut self, uptime: Duration) -> Self {
        self.stable_uptime = uptime;
        self
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Configured number of slots.
    pub num_workers: usize,
    /// Processes started, including restarts.
    pub launched: u64,
    /// Processes observed exiting on their own.
    pub exits: u64,
    pub restarts: u64,
    /// Slots left down after exhausting their restarts.
    pub dead_slots: u64,
}

/// Shared state for tracking pool statistics.
#[derive(Default)]
struct SharedPoolStats {
    launched: AtomicU64,
    exits: AtomicU64,
    restarts: AtomicU64,
    dead_slots: AtomicU64,
}

impl SharedPoolStats {
    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        PoolStats {
            num_workers,
            launched: self.launched.load(Ordering::SeqCst),
            exits: self.exits.load(Ordering::SeqCst),
            restarts: self.restarts.load(Ordering::SeqCst),
            dead_slots: self.dead_slots.load(Ordering::SeqCst),
        }
    }
}

/// Starts one worker process for a slot.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, index: usize) -> std::io::Result<Child>;
}

/// Launches workers by re-executing the current binary.
#[derive(Debug, Clone)]
pub struct SelfExecLauncher {
    program: PathBuf,
    log_level: String,
    config_json: String,
}

impl SelfExecLauncher {
    /// Creates a launcher for the running executable.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` if the executable path cannot be resolved or the
    /// configuration cannot be serialized.
    pub fn new(config: &RunnerConfig, log_level: impl Into<String>) -> Result<Self, PoolError> {
        let program = std::env::current_exe().map_err(PoolError::CurrentExe)?;
        Ok(Self {
            program,
            log_level: log_level.into(),
            config_json: config.to_json()?,
        })
    }

    /// Overrides the executable that is launched.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn command(&self, index: usize) -> Command {
        let mut command = Command::new(&self.program);
        command
            .arg("--log-level")
            .arg(&self.log_level)
            .arg("worker")
            .arg("--index")
            .arg(index.to_string())
            .env(WORKER_CONFIG_ENV, &self.config_json)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        command
    }
}

impl WorkerLauncher for SelfExecLauncher {
    fn launch(&self, index: usize) -> std::io::Result<Child> {
        self.command(index).spawn()
    }
}

/// Supervises a fixed number of worker processes.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    launcher: Arc<dyn WorkerLauncher>,
    shutdown_tx: broadcast::Sender<()>,
    stats: Arc<SharedPoolStats>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            launcher,
            shutdown_tx,
            stats: Arc::new(SharedPoolStats::default()),
        }
    }

    /// Returns a sender that stops the pool when signalled.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }

    /// Launches every worker and supervises them until all slots are done.
    ///
    /// A slot is done when shutdown was signalled and its worker exited, or
    /// when its worker died and may not be restarted.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::LaunchFailed` if any initial launch fails. Workers
    /// already launched are killed.
    pub async fn run(&self) -> Result<PoolStats, PoolError> {
        if self.config.num_workers == 0 {
            return Err(PoolError::NoWorkers);
        }

        let mut children = Vec::with_capacity(self.config.num_workers);
        for index in 0..self.config.num_workers {
            let child = self
                .launcher
                .launch(index)
                .map_err(|source| PoolError::LaunchFailed { index, source })?;
            info!(index = index, pid = ?child.id(), "Worker launched");
            self.stats.launched.fetch_add(1, Ordering::SeqCst);
            children.push(child);
        }
        info!(num_workers = self.config.num_workers, "Worker pool started");

        let mut slots = JoinSet::new();
        for (index, child) in children.into_iter().enumerate() {
            let slot = Slot {
                index,
                launcher: Arc::clone(&self.launcher),
                config: self.config.clone(),
                stats: Arc::clone(&self.stats),
            };
            slots.spawn(slot.supervise(child, self.shutdown_tx.subscribe()));
        }

        while let Some(joined) = slots.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Worker supervisor task panicked");
            }
        }

        let stats = self.stats();
        info!(
            launched = stats.launched,
            exits = stats.exits,
            restarts = stats.restarts,
            dead_slots = stats.dead_slots,
            "Worker pool stopped"
        );
        Ok(stats)
    }
}

enum SlotEvent {
    Exited(std::io::Result<ExitStatus>),
    Shutdown,
}

/// Supervision state for one worker slot.
struct Slot {
    index: usize,
    launcher: Arc<dyn WorkerLauncher>,
    config: WorkerPoolConfig,
    stats: Arc<SharedPoolStats>,
}

impl Slot {
    async fn supervise(self, mut child: Child, mut shutdown: broadcast::Receiver<()>) {
        let mut restarts = 0u32;
        let mut started = Instant::now();

        loop {
            let pid = child.id();
            let event = tokio::select! {
                status = child.wait() => SlotEvent::Exited(status),
                _ = shutdown.recv() => SlotEvent::Shutdown,
            };

            match event {
                SlotEvent::Shutdown => {
                    self.stop(&mut child).await;
                    return;
                }
                SlotEvent::Exited(status) => {
                    self.stats.exits.fetch_add(1, Ordering::SeqCst);
                    let uptime = started.elapsed();
                    if restarts > 0 && uptime >= self.config.stable_uptime {
                        debug!(
                            index = self.index,
                            uptime_ms = uptime.as_millis() as u64,
                            "Worker ran stably; restart count cleared"
                        );
                        restarts = 0;
                    }
                    match status {
                        Ok(status) if status.success() => {
                            info!(index = self.index, pid = ?pid, status = %status, "Worker exited")
                        }
                        Ok(status) => {
                            warn!(index = self.index, pid = ?pid, status = %status, "Worker exited")
                        }
                        Err(e) => {
                            error!(index = self.index, pid = ?pid, error = %e, "Failed to wait on worker")
                        }
                    }
                }
            }

            if !self.config.respawn {
                debug!(index = self.index, "Respawn disabled; slot stays down");
                return;
            }

            match self.relaunch(&mut restarts, &mut shutdown).await {
                Some(replacement) => {
                    child = replacement;
                    started = Instant::now();
                }
                None => return,
            }
        }
    }

    /// Starts a replacement after the restart delay.
    ///
    /// Returns `None` on shutdown or once the slot has used all its restarts.
    async fn relaunch(
        &self,
        restarts: &mut u32,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Option<Child> {
        loop {
            if *restarts >= self.config.max_restarts {
                self.stats.dead_slots.fetch_add(1, Ordering::SeqCst);
                error!(
                    index = self.index,
                    restarts = *restarts,
                    "Worker slot exhausted its restarts; leaving it down"
                );
                return None;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.restart_delay) => {}
                _ = shutdown.recv() => return None,
            }

            *restarts += 1;
            match self.launcher.launch(self.index) {
                Ok(child) => {
                    self.stats.launched.fetch_add(1, Ordering::SeqCst);
                    self.stats.restarts.fetch_add(1, Ordering::SeqCst);
                    info!(
                        index = self.index,
                        pid = ?child.id(),
                        restart = *restarts,
                        "Worker restarted"
                    );
                    return Some(child);
                }
                Err(e) => {
                    error!(index = self.index, restart = *restarts, error = %e, "Failed to restart worker");
                }
            }
        }
    }

    /// Waits for the worker to finish its match, killing it after the timeout.
    async fn stop(&self, child: &mut Child) {
        let pid = child.id();
        match tokio::time::timeout(self.config.shutdown_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                info!(index = self.index, pid = ?pid, status = %status, "Worker stopped")
            }
            Ok(Err(e)) => {
                warn!(index = self.index, pid = ?pid, error = %e, "Failed to wait on worker")
            }
            Err(_) => {
                warn!(
                    index = self.index,
                    pid = ?pid,
                    timeout = ?self.config.shutdown_timeout,
                    "Worker did not stop in time; killing"
                );
                if let Err(e) = child.kill().await {
                    error!(index = self.index, pid = ?pid, error = %e, "Failed to kill worker");
                }
            }
        }
    }
}
