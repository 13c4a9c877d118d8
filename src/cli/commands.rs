//! CLI command definitions for scrimmage-runner.
//!
//! `run` starts the manager, which re-executes this binary once per worker
//! with the hidden `worker` subcommand. `migrate` applies the bootstrap
//! schema to a development database.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::{
    BackoffConfig, DatabaseConfig, LeaseConfig, MatchParameters, ReplayStoreConfig, RunnerConfig,
    SimulatorConfig,
};
use crate::execution::{resolve_program, MatchExecutor};
use crate::scheduler::{
    Backoff, MatchLoop, PgMatchQueue, SelfExecLauncher, WorkerPool, WorkerPoolConfig,
};
use crate::storage::{blob_store_from_config, Database, ReplayPublisher};

/// Default simulator executable.
const DEFAULT_SIMULATOR: &str = "coldbrew-sim";

/// Scrimmage match runner.
#[derive(Parser)]
#[command(name = "scrimmage-runner")]
#[command(about = "Claim queued scrimmages, simulate them, publish replays and record results")]
#[command(version)]
#[command(
    long_about = "scrimmage-runner executes queued scrimmages between submitted programs.\n\nThe manager keeps one worker process per core. Each worker claims the oldest queued match, runs the simulator, publishes the replay and commits the winner.\n\nExample usage:\n  scrimmage-runner run --database-url postgres://localhost/battlehack --replay-dir /srv/replays --replay-public-url https://replays.example.org"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start the worker pool manager.
    Run(Box<RunArgs>),

    /// Run one match loop. Launched by the manager.
    #[command(hide = true)]
    Worker(WorkerArgs),

    /// Apply the bootstrap schema to the match store.
    Migrate(MigrateArgs),
}

/// Settings shared by the manager and, through it, every worker.
#[derive(Parser, Debug)]
pub struct RunnerArgs {
    /// PostgreSQL connection string for the match store.
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    /// Connection pool size per worker.
    #[arg(long, default_value = "2")]
    pub db_max_connections: u32,

    /// Directory replays are written to.
    #[arg(long, env = "REPLAY_DIR", conflicts_with = "replay_upload_url")]
    pub replay_dir: Option<PathBuf>,

    /// Base URL of an HTTP object store accepting PUT uploads.
    #[arg(long, env = "REPLAY_UPLOAD_URL")]
    pub replay_upload_url: Option<String>,

    /// Base URL replays are served from.
    #[arg(long, env = "REPLAY_PUBLIC_URL")]
    pub replay_public_url: String,

    /// Bearer token for the HTTP object store.
    #[arg(long, env = "REPLAY_STORE_TOKEN", hide_env_values = true)]
    pub replay_store_token: Option<String>,

    /// Simulator executable.
    #[arg(long, env = "SIMULATOR_PROGRAM", default_value = DEFAULT_SIMULATOR)]
    pub simulator: PathBuf,

    /// Extra argument for the simulator (repeatable).
    #[arg(long = "simulator-arg", allow_hyphen_values = true)]
    pub simulator_args: Vec<String>,

    /// Wall-clock limit per match in seconds.
    #[arg(long, default_value = "600")]
    pub match_timeout_secs: u64,

    /// Largest replay accepted from the simulator, in MiB.
    #[arg(long, default_value = "64")]
    pub max_replay_mib: usize,

    /// Seconds one replay upload may take before the match fails.
    #[arg(long, default_value = "120")]
    pub publish_timeout_secs: u64,

    /// Initial chess-clock budget per robot.
    #[arg(long, default_value = "100")]
    pub chess_initial: u32,

    /// Chess-clock time added per turn.
    #[arg(long, default_value = "20")]
    pub chess_extra: u32,

    /// Lower bound of the claim backoff in milliseconds.
    #[arg(long, default_value = "0")]
    pub backoff_min_ms: u64,

    /// Upper bound of the claim backoff in milliseconds.
    #[arg(long, default_value = "5000")]
    pub backoff_max_ms: u64,

    /// Seconds a claim survives without a heartbeat.
    #[arg(long, default_value = "900")]
    pub lease_timeout_secs: u64,

    /// Seconds between lease heartbeats.
    #[arg(long, default_value = "60")]
    pub heartbeat_interval_secs: u64,
}

impl RunnerArgs {
    /// Builds the runner configuration with default pool settings.
    pub fn to_config(&self) -> anyhow::Result<RunnerConfig> {
        let replay_store = match (&self.replay_upload_url, &self.replay_dir) {
            (Some(upload), _) => ReplayStoreConfig::Http {
                upload_base_url: upload.clone(),
                public_base_url: self.replay_public_url.clone(),
                bearer_token: self.replay_store_token.clone(),
            },
            (None, Some(dir)) => ReplayStoreConfig::Filesystem {
                root: dir.clone(),
                public_base_url: self.replay_public_url.clone(),
            },
            (None, None) => anyhow::bail!(
                "No replay store configured.\n\
                 Provide --replay-dir <DIR> (REPLAY_DIR) or --replay-upload-url <URL> (REPLAY_UPLOAD_URL)."
            ),
        };

        let mut config = RunnerConfig::new(self.database_url.clone(), replay_store);
        config.database =
            DatabaseConfig::new(self.database_url.clone()).with_max_connections(self.db_max_connections);
        config.simulator = SimulatorConfig::new(self.simulator.clone())
            .with_args(self.simulator_args.clone())
            .with_match_timeout(Duration::from_secs(self.match_timeout_secs))
            .with_max_replay_bytes(self.max_replay_mib.saturating_mul(1024 * 1024))
            .with_params(MatchParameters {
                chess_initial: self.chess_initial,
                chess_extra: self.chess_extra,
            });
        config.publish_timeout = Duration::from_secs(self.publish_timeout_secs);
        config.backoff = BackoffConfig::new(
            Duration::from_millis(self.backoff_min_ms),
            Duration::from_millis(self.backoff_max_ms),
        );
        config.lease = LeaseConfig::new(
            Duration::from_secs(self.lease_timeout_secs),
            Duration::from_secs(self.heartbeat_interval_secs),
        );

        Ok(config)
    }
}

/// Manager arguments.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub runner: RunnerArgs,

    /// Number of worker processes (defaults to the number of logical CPUs).
    #[arg(short = 'w', long, env = "SCRIMMAGE_WORKERS")]
    pub workers: Option<usize>,

    /// Leave dead workers down instead of restarting them.
    #[arg(long)]
    pub no_respawn: bool,

    /// Consecutive restarts allowed per worker slot.
    #[arg(long, default_value = "10")]
    pub max_restarts: u32,

    /// Seconds a worker must stay up before its slot's restart count clears.
    #[arg(long, default_value = "300")]
    pub stable_uptime_secs: u64,

    /// Seconds to wait before restarting a dead worker.
    #[arg(long, default_value = "5")]
    pub restart_delay_secs: u64,

    /// Seconds workers get to finish their match after shutdown.
    #[arg(long, default_value = "60")]
    pub shutdown_timeout_secs: u64,
}

impl RunArgs {
    /// Builds the full configuration, including the pool.
    pub fn to_config(&self) -> anyhow::Result<RunnerConfig> {
        let mut config = self.runner.to_config()?;
        let mut pool = WorkerPoolConfig::default()
            .with_respawn(!self.no_respawn)
            .with_max_restarts(self.max_restarts)
            .with_stable_uptime(Duration::from_secs(self.stable_uptime_secs))
            .with_restart_delay(Duration::from_secs(self.restart_delay_secs))
            .with_shutdown_timeout(Duration::from_secs(self.shutdown_timeout_secs));
        if let Some(workers) = self.workers {
            pool.num_workers = workers;
        }
        config.pool = pool;
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

/// Worker arguments. The configuration arrives through the environment.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Slot index assigned by the manager.
    #[arg(long)]
    pub index: usize,
}

/// Migration arguments.
#[derive(Parser, Debug)]
pub struct MigrateArgs {
    /// PostgreSQL connection string for the match store.
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    /// Drop the runner's tables before migrating. Destroys all data.
    #[arg(long)]
    pub reset: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_manager_command(*args, &cli.log_level).await,
        Commands::Worker(args) => run_worker_command(args).await,
        Commands::Migrate(args) => run_migrate_command(args).await,
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Sends on `tx` when ctrl-c arrives.
fn forward_ctrl_c(tx: broadcast::Sender<()>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            let _ = tx.send(());
        }
    });
}

async fn run_manager_command(args: RunArgs, log_level: &str) -> anyhow::Result<()> {
    let config = args.to_config()?;

    // Everything a worker needs at startup is checked once here; failures are fatal.
    if resolve_program(&config.simulator.program).is_none() {
        anyhow::bail!(
            "Simulator program not found: {}\n\
             Install it or point --simulator (SIMULATOR_PROGRAM) at the engine executable.",
            config.simulator.program.display()
        );
    }
    blob_store_from_config(&config.replay_store, config.publish_timeout)
        .context("Replay store unavailable")?;

    let db = Database::connect(&config.database)
        .await
        .context("Match store unreachable")?;
    match db.status_counts().await {
        Ok(counts) => {
            for (status, count) in counts {
                info!(status = %status, count = count, "Match store status");
            }
        }
        Err(e) => warn!(error = %e, "Could not read match store status"),
    }
    drop(db);

    let launcher = SelfExecLauncher::new(&config, log_level)?;
    let pool = WorkerPool::new(config.pool.clone(), Arc::new(launcher));
    info!(
        num_workers = pool.num_workers(),
        simulator = %config.simulator.program.display(),
        "Starting worker pool"
    );

    forward_ctrl_c(pool.shutdown_handle());
    let stats = pool.run().await?;

    if stats.dead_slots > 0 {
        warn!(dead_slots = stats.dead_slots, "Some worker slots ended down");
    }
    Ok(())
}

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    let config = RunnerConfig::from_worker_env().context("Worker configuration unavailable")?;
    let worker_id = format!("worker-{}-{}", args.index, std::process::id());

    let queue = Arc::new(
        PgMatchQueue::connect(&config.database, config.lease.timeout)
            .await
            .context("Match store unreachable")?,
    );
    let publisher = ReplayPublisher::new(
        blob_store_from_config(&config.replay_store, config.publish_timeout)
            .context("Replay store unavailable")?,
    )
    .with_timeout(config.publish_timeout);
    let backoff = Backoff::from_config(&config.backoff)?;

    let match_loop = MatchLoop::new(
        worker_id.clone(),
        queue.clone(),
        MatchExecutor::from_config(&config.simulator),
        publisher,
        backoff,
    )
    .with_params(config.simulator.params)
    .with_heartbeat_interval(config.lease.heartbeat_interval);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    forward_ctrl_c(shutdown_tx);

    info!(worker_id = %worker_id, index = args.index, "Worker starting");
    let stats = match_loop.run(shutdown_rx).await;
    info!(worker_id = %worker_id, completed = stats.completed(), "Worker exiting");

    queue.pool().close().await;
    Ok(())
}

async fn run_migrate_command(args: MigrateArgs) -> anyhow::Result<()> {
    let db = Database::connect(&DatabaseConfig::new(args.database_url.clone()))
        .await
        .context("Match store unreachable")?;

    if args.reset {
        db.drop_schema().await?;
    }

    let executed = db.bootstrap_schema().await?;
    println!("Schema ready ({} statements)", executed);
    for (status, count) in db.status_counts().await? {
        println!("  {:<8} {}", status, count);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    const BASE: [&str; 6] = [
        "--database-url",
        "postgres://localhost/battlehack",
        "--replay-public-url",
        "https://replays.example.org",
        "--simulator",
        "/usr/local/bin/engine",
    ];

    fn parse(extra: &[&str]) -> Cli {
        let mut args = vec!["scrimmage-runner", "run"];
        args.extend_from_slice(&BASE);
        args.extend_from_slice(extra);
        Cli::try_parse_from(args).expect("should parse")
    }

    fn run_args(cli: Cli) -> RunArgs {
        match cli.command {
            Commands::Run(args) => *args,
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_parses() {
        // Verify CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command_defaults() {
        let cli = parse(&["--replay-dir", "/srv/replays"]);
        assert_eq!(cli.log_level, "info");
        let args = run_args(cli);

        assert_eq!(args.runner.backoff_min_ms, 0);
        assert_eq!(args.runner.backoff_max_ms, 5000);
        assert_eq!(args.runner.chess_initial, 100);
        assert_eq!(args.runner.chess_extra, 20);
        assert!(!args.no_respawn);

        let config = args.to_config().expect("config");
        assert!(config.pool.num_workers >= 1);
        assert!(matches!(
            config.replay_store,
            ReplayStoreConfig::Filesystem { .. }
        ));
        assert_eq!(config.backoff.max, Duration::from_secs(5));
        assert_eq!(config.lease.timeout, Duration::from_secs(900));
        assert_eq!(config.publish_timeout, Duration::from_secs(120));
        assert_eq!(config.simulator.max_replay_bytes, 64 * 1024 * 1024);
        assert_eq!(config.pool.stable_uptime, Duration::from_secs(300));
    }

    #[test]
    fn test_run_command_with_options() {
        let cli = parse(&[
            "--replay-upload-url",
            "https://storage.example.org/upload",
            "--replay-store-token",
            "secret",
            "-w",
            "3",
            "--no-respawn",
            "--backoff-min-ms",
            "100",
            "--backoff-max-ms",
            "900",
            "--simulator-arg",
            "--headless",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.log_level, "debug");
        let config = run_args(cli).to_config().expect("config");

        assert_eq!(config.pool.num_workers, 3);
        assert!(!config.pool.respawn);
        assert_eq!(config.backoff.min, Duration::from_millis(100));
        assert_eq!(config.simulator.args, vec!["--headless".to_string()]);
        match config.replay_store {
            ReplayStoreConfig::Http { bearer_token, .. } => {
                assert_eq!(bearer_token.as_deref(), Some("secret"))
            }
            other => panic!("unexpected store: {:?}", other),
        }
    }

    #[test]
    fn test_inverted_backoff_rejected() {
        let args = run_args(parse(&[
            "--replay-dir",
            "/srv/replays",
            "--backoff-min-ms",
            "900",
            "--backoff-max-ms",
            "100",
        ]));
        assert!(args.to_config().is_err());
    }

    #[test]
    fn test_http_store_without_token_rejected() {
        let args = run_args(parse(&[
            "--replay-upload-url",
            "https://storage.example.org/upload",
        ]));
        assert!(args.to_config().is_err());
    }

    #[test]
    fn test_replay_dir_conflicts_with_upload_url() {
        let mut args = vec!["scrimmage-runner", "run"];
        args.extend_from_slice(&BASE);
        args.extend_from_slice(&["--replay-dir", "/srv", "--replay-upload-url", "https://up"]);
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn test_worker_command_is_hidden() {
        let cli = Cli::try_parse_from(["scrimmage-runner", "--log-level", "warn", "worker", "--index", "4"])
            .expect("should parse");
        assert_eq!(cli.log_level, "warn");
        match cli.command {
            Commands::Worker(args) => assert_eq!(args.index, 4),
            _ => panic!("Expected Worker command"),
        }

        let help = Cli::command().render_help().to_string();
        let listed: Vec<&str> = help
            .lines()
            .filter_map(|l| l.split_whitespace().next())
            .collect();
        assert!(!listed.contains(&"worker"));
        assert!(listed.contains(&"migrate"));
    }

    #[test]
    fn test_migrate_command() {
        let cli = Cli::try_parse_from([
            "scrimmage-runner",
            "migrate",
            "--database-url",
            "postgres://localhost/dev",
            "--reset",
        ])
        .expect("should parse");
        match cli.command {
            Commands::Migrate(args) => {
                assert_eq!(args.database_url, "postgres://localhost/dev");
                assert!(args.reset);
            }
            _ => panic!("Expected Migrate command"),
        }
    }
}
