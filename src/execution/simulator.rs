//! Boundary to the external game simulator.
//!
//! The rules engine is opaque. It is invoked as a child process that reads
//! one JSON request on stdin and writes one JSON replay on stdout:
//!
//! ```text
//! stdin:  {"seed": 4821, "red": "...", "blue": "...", "chess_initial": 100, "chess_extra": 20}
//! stdout: {"winner": 0, ...}
//! ```
//!
//! A non-zero exit status means the engine rejected the match, for example
//! because a competitor program failed to load. Stdout is read up to the
//! configured replay limit; an engine that writes more is killed.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use crate::config::{MatchParameters, SimulatorConfig, DEFAULT_MAX_REPLAY_BYTES};
use crate::error::SimulationError;

/// Longest stderr excerpt kept in an error.
const STDERR_EXCERPT_BYTES: usize = 2048;

/// Input handed to the simulator for one match.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationRequest<'a> {
    pub seed: u32,
    pub red: &'a str,
    pub blue: &'a str,
    #[serde(flatten)]
    pub params: MatchParameters,
}

/// A game engine that plays one match to completion.
#[async_trait]
pub trait Simulator: Send + Sync {
    /// Plays the match and returns the raw replay document.
    async fn simulate(
        &self,
        request: &SimulationRequest<'_>,
    ) -> Result<serde_json::Value, SimulationError>;
}

/// Runs the engine as a child process per match.
#[derive(Debug, Clone)]
pub struct ProcessSimulator {
    program: PathBuf,
    args: Vec<String>,
    max_replay_bytes: usize,
}

impl ProcessSimulator {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            max_replay_bytes: DEFAULT_MAX_REPLAY_BYTES,
        }
    }

    pub fn from_config(config: &SimulatorConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
            .with_max_replay_bytes(config.max_replay_bytes)
    }

    /// Sets the most stdout bytes accepted from the engine.
    pub fn with_max_replay_bytes(mut self, limit: usize) -> Self {
        self.max_replay_bytes = limit;
        self
    }
}

#[async_trait]
impl Simulator for ProcessSimulator {
    async fn simulate(
        &self,
        request: &SimulationRequest<'_>,
    ) -> Result<serde_json::Value, SimulationError> {
        let payload = serde_json::to_vec(request)?;

        // Dropping the future (on timeout) kills the engine.
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SimulationError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;

        debug!(pid = ?child.id(), seed = request.seed, "Simulator started");

        let mut stdin = child.stdin.take().ok_or_else(|| pipe_unavailable("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| pipe_unavailable("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| pipe_unavailable("stderr"))?;

        // Feed stdin while draining both outputs so large programs or replays cannot deadlock.
        let feed = async move {
            let fed = async {
                stdin.write_all(&payload).await?;
                stdin.shutdown().await
            };
            // The engine may exit before reading all of stdin; its exit status decides.
            if let Err(e) = fed.await {
                debug!(error = %e, "Simulator closed stdin early");
            }
            Ok::<(), SimulationError>(())
        };
        let read_stdout = read_capped(stdout, self.max_replay_bytes);
        let read_stderr = async {
            Ok::<_, SimulationError>(read_tail(stderr, STDERR_EXCERPT_BYTES * 2).await?)
        };

        // An oversized replay returns early here and drops the child, killing it.
        let ((), replay, stderr) = tokio::try_join!(feed, read_stdout, read_stderr)?;
        let status = child.wait().await?;

        if !status.success() {
            return Err(SimulationError::Exited {
                code: status.code(),
                stderr: stderr_excerpt(&stderr),
            });
        }

        serde_json::from_slice(&replay)
            .map_err(|e| SimulationError::MalformedReplay(format!("invalid JSON on stdout: {}", e)))
    }
}

/// Locates the engine executable, searching `PATH` for bare names.
pub fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.is_absolute() || program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

fn pipe_unavailable(name: &str) -> SimulationError {
    SimulationError::Io(std::io::Error::other(format!("simulator {} unavailable", name)))
}

/// Reads to EOF, failing once more than `limit` bytes arrive.
async fn read_capped<R>(reader: R, limit: usize) -> Result<Vec<u8>, SimulationError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    reader
        .take(limit as u64 + 1)
        .read_to_end(&mut buf)
        .await?;
    if buf.len() > limit {
        return Err(SimulationError::ReplayTooLarge { limit });
    }
    Ok(buf)
}

/// Reads to EOF, keeping only the last `keep` bytes.
async fn read_tail<R>(mut reader: R, keep: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut tail = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(tail);
        }
        tail.extend_from_slice(&chunk[..n]);
        if tail.len() > keep {
            let excess = tail.len() - keep;
            tail.drain(..excess);
        }
    }
}

fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_EXCERPT_BYTES {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_EXCERPT_BYTES;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
