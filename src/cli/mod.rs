//! Command-line interface for scrimmage-runner.
//!
//! Provides the manager (`run`), the internal per-process match loop
//! (`worker`) and schema bootstrap (`migrate`).

mod commands;

pub use commands::{
    parse_cli, run, run_with_cli, Cli, Commands, MigrateArgs, RunArgs, RunnerArgs, WorkerArgs,
};
