//! Runtime configuration for the manager and its workers.
//!
//! The manager builds a [`RunnerConfig`] from CLI arguments (each with an
//! environment fallback), validates it once, and hands it to every worker
//! process as JSON in [`WORKER_CONFIG_ENV`].

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::scheduler::WorkerPoolConfig;

/// Environment variable carrying the serialized config to worker processes.
pub const WORKER_CONFIG_ENV: &str = "SCRIMMAGE_RUNNER_CONFIG";

/// Largest replay accepted from the engine by default.
pub const DEFAULT_MAX_REPLAY_BYTES: usize = 64 * 1024 * 1024;

/// Complete configuration shared by the manager and every worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub database: DatabaseConfig,
    pub replay_store: ReplayStoreConfig,
    /// Upper bound on one replay upload, including the durable acknowledgment.
    pub publish_timeout: Duration,
    pub simulator: SimulatorConfig,
    pub backoff: BackoffConfig,
    pub lease: LeaseConfig,
    pub pool: WorkerPoolConfig,
}

impl RunnerConfig {
    /// Creates a configuration with defaults for everything but the required endpoints.
    pub fn new(database_url: impl Into<String>, replay_store: ReplayStoreConfig) -> Self {
        Self {
            database: DatabaseConfig::new(database_url),
            replay_store,
            publish_timeout: Duration::from_secs(120),
            simulator: SimulatorConfig::default(),
            backoff: BackoffConfig::default(),
            lease: LeaseConfig::default(),
            pool: WorkerPoolConfig::default(),
        }
    }

    /// Checks cross-field constraints. Called once at startup; failures are fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Missing("database url".to_string()));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid {
                name: "database.max_connections".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        self.backoff.validate()?;
        self.lease.validate()?;
        self.replay_store.validate()?;
        if self.publish_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                name: "publish_timeout".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        self.simulator.validate()?;
        if self.pool.num_workers == 0 {
            return Err(ConfigError::Invalid {
                name: "pool.num_workers".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Serializes the config for a worker process.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Restores a config passed by the manager and re-validates it.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the config a manager placed in [`WORKER_CONFIG_ENV`].
    pub fn from_worker_env() -> Result<Self, ConfigError> {
        let json = std::env::var(WORKER_CONFIG_ENV)
            .map_err(|_| ConfigError::Missing(WORKER_CONFIG_ENV.to_string()))?;
        Self::from_json(&json)
    }
}

/// Connection settings for the match store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection string.
    pub url: String,
    /// Pool size per process. A worker holds one match at a time, so this stays small.
    pub max_connections: u32,
    /// How long to wait for a pooled connection.
    pub acquire_timeout: Duration,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 2,
            acquire_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }
}

/// Where replays are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayStoreConfig {
    /// Local or mounted directory served at `public_base_url`.
    Filesystem {
        root: PathBuf,
        public_base_url: String,
    },
    /// HTTP object store accepting authenticated PUT uploads.
    Http {
        upload_base_url: String,
        public_base_url: String,
        bearer_token: Option<String>,
    },
}

impl ReplayStoreConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match self {
            ReplayStoreConfig::Filesystem {
                root,
                public_base_url,
            } => {
                if root.as_os_str().is_empty() {
                    return Err(ConfigError::Missing("replay directory".to_string()));
                }
                if public_base_url.is_empty() {
                    return Err(ConfigError::Missing("replay public base url".to_string()));
                }
            }
            ReplayStoreConfig::Http {
                upload_base_url,
                public_base_url,
                bearer_token,
            } => {
                if upload_base_url.is_empty() {
                    return Err(ConfigError::Missing("replay upload url".to_string()));
                }
                if public_base_url.is_empty() {
                    return Err(ConfigError::Missing("replay public base url".to_string()));
                }
                if bearer_token.as_deref().map_or(true, str::is_empty) {
                    return Err(ConfigError::Missing("replay store token".to_string()));
                }
            }
        }
        Ok(())
    }
}

/// Tunable match parameters passed through to the simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchParameters {
    /// Initial chess-clock budget per robot.
    pub chess_initial: u32,
    /// Chess-clock time added per turn.
    pub chess_extra: u32,
}

impl Default for MatchParameters {
    fn default() -> Self {
        Self {
            chess_initial: 100,
            chess_extra: 20,
        }
    }
}

/// How the simulator engine is launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Engine executable.
    pub program: PathBuf,
    /// Extra arguments passed before any request data.
    pub args: Vec<String>,
    /// Wall-clock limit for one match.
    pub match_timeout: Duration,
    /// Replays larger than this fail the match.
    pub max_replay_bytes: usize,
    pub params: MatchParameters,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("coldbrew-sim"),
            args: Vec::new(),
            match_timeout: Duration::from_secs(600),
            max_replay_bytes: DEFAULT_MAX_REPLAY_BYTES,
            params: MatchParameters::default(),
        }
    }
}

impl SimulatorConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_match_timeout(mut self, timeout: Duration) -> Self {
        self.match_timeout = timeout;
        self
    }

    pub fn with_max_replay_bytes(mut self, limit: usize) -> Self {
        self.max_replay_bytes = limit;
        self
    }

    pub fn with_params(mut self, params: MatchParameters) -> Self {
        self.params = params;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.program.as_os_str().is_empty() {
            return Err(ConfigError::Missing("simulator program".to_string()));
        }
        if self.match_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                name: "simulator.match_timeout".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        if self.max_replay_bytes == 0 {
            return Err(ConfigError::Invalid {
                name: "simulator.max_replay_bytes".to_string(),
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Bounds for the randomized delay between unsuccessful claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub min: Duration,
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::from_secs(5),
        }
    }
}

impl BackoffConfig {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min > self.max {
            return Err(ConfigError::InvalidBackoff {
                min: self.min,
                max: self.max,
            });
        }
        Ok(())
    }
}

/// Lease settings that make claims of crashed workers reclaimable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// How long a claim stays valid without a heartbeat.
    pub timeout: Duration,
    /// How often a busy worker extends its lease.
    pub heartbeat_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(900),
            heartbeat_interval: Duration::from_secs(60),
        }
    }
}

impl LeaseConfig {
    pub fn new(timeout: Duration, heartbeat_interval: Duration) -> Self {
        Self {
            timeout,
            heartbeat_interval,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.timeout {
            return Err(ConfigError::InvalidLease {
                heartbeat: self.heartbeat_interval,
                lease: self.timeout,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_store() -> ReplayStoreConfig {
        ReplayStoreConfig::Filesystem {
            root: PathBuf::from("/var/replays"),
            public_base_url: "https://replays.example.org".to_string(),
        }
    }

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::new("postgres://localhost/battlecode", fs_store());

        assert_eq!(config.database.max_connections, 2);
        assert_eq!(config.backoff.min, Duration::ZERO);
        assert_eq!(config.backoff.max, Duration::from_secs(5));
        assert_eq!(config.simulator.params.chess_initial, 100);
        assert_eq!(config.simulator.params.chess_extra, 20);
        assert_eq!(config.simulator.max_replay_bytes, DEFAULT_MAX_REPLAY_BYTES);
        assert_eq!(config.publish_timeout, Duration::from_secs(120));
        assert!(config.pool.num_workers >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let mut config = RunnerConfig::new("postgres://localhost/battlecode", fs_store());
        config.backoff = BackoffConfig::new(Duration::from_secs(3), Duration::from_secs(1));

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBackoff { .. })
        ));
    }

    #[test]
    fn test_invalid_lease_rejected() {
        let lease = LeaseConfig::new(Duration::from_secs(10), Duration::from_secs(10));
        assert!(matches!(
            lease.validate(),
            Err(ConfigError::InvalidLease { .. })
        ));

        let lease = LeaseConfig::new(Duration::from_secs(10), Duration::ZERO);
        assert!(lease.validate().is_err());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = RunnerConfig::new("postgres://localhost/battlecode", fs_store());
        config.publish_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));

        let mut config = RunnerConfig::new("postgres://localhost/battlecode", fs_store());
        config.simulator = SimulatorConfig::new("engine").with_max_replay_bytes(0);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_http_store_requires_token() {
        let store = ReplayStoreConfig::Http {
            upload_base_url: "https://storage.example.org/upload".to_string(),
            public_base_url: "https://storage.example.org".to_string(),
            bearer_token: None,
        };
        let config = RunnerConfig::new("postgres://localhost/battlecode", store);

        assert!(matches!(config.validate(), Err(ConfigError::Missing(_))));
    }

    #[test]
    fn test_json_roundtrip_for_workers() {
        let mut config = RunnerConfig::new("postgres://localhost/battlecode", fs_store());
        config.simulator = SimulatorConfig::new("/usr/local/bin/engine")
            .with_args(vec!["--headless".to_string()])
            .with_match_timeout(Duration::from_secs(120));

        let json = config.to_json().expect("serialize");
        let restored = RunnerConfig::from_json(&json).expect("deserialize");

        assert_eq!(restored.simulator.program, PathBuf::from("/usr/local/bin/engine"));
        assert_eq!(restored.simulator.args, vec!["--headless".to_string()]);
        assert_eq!(restored.simulator.match_timeout, Duration::from_secs(120));
        assert_eq!(restored.backoff, config.backoff);
    }

    #[test]
    fn test_from_json_validates() {
        let mut config = RunnerConfig::new("postgres://localhost/battlecode", fs_store());
        config.backoff = BackoffConfig::new(Duration::from_secs(9), Duration::from_secs(1));
        let json = config.to_json().expect("serialize");

        assert!(RunnerConfig::from_json(&json).is_err());
    }
}
