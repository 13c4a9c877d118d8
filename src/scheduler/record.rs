//! Match record definitions for the scheduler.
//!
//! This module defines the core types that flow through the match queue:
//!
//! - `MatchStatus`: Lifecycle status of a scrimmage row
//! - `MatchOutcome`: Terminal status a worker commits
//! - `Program`: A competitor program payload
//! - `ClaimedMatch`: A record exclusively held by one worker
//! - `MatchRecord`: The full stored row

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a match record.
///
/// `Queued → Running → {RedWon, BlueWon, Error}`. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Queued,
    Running,
    RedWon,
    BlueWon,
    Error,
}

impl MatchStatus {
    /// Returns the value stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Queued => "queued",
            MatchStatus::Running => "running",
            MatchStatus::RedWon => "redwon",
            MatchStatus::BlueWon => "bluewon",
            MatchStatus::Error => "error",
        }
    }

    /// Returns whether no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MatchStatus::RedWon | MatchStatus::BlueWon | MatchStatus::Error
        )
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(MatchStatus::Queued),
            "running" => Ok(MatchStatus::Running),
            "redwon" => Ok(MatchStatus::RedWon),
            "bluewon" => Ok(MatchStatus::BlueWon),
            "error" => Ok(MatchStatus::Error),
            other => Err(format!("unknown match status '{}'", other)),
        }
    }
}

/// Terminal status committed by a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchOutcome {
    RedWon,
    BlueWon,
    Error,
}

impl MatchOutcome {
    /// Returns the terminal status this outcome writes.
    pub fn status(&self) -> MatchStatus {
        match self {
            MatchOutcome::RedWon => MatchStatus::RedWon,
            MatchOutcome::BlueWon => MatchStatus::BlueWon,
            MatchOutcome::Error => MatchStatus::Error,
        }
    }
}

impl fmt::Display for MatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.status().as_str())
    }
}

/// A submitted competitor program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    /// Row id in the `programs` table.
    pub id: i64,
    /// Program source handed to the simulator.
    pub source: String,
}

impl Program {
    pub fn new(id: i64, source: impl Into<String>) -> Self {
        Self {
            id,
            source: source.into(),
        }
    }
}

/// A match record held in `running` by exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedMatch {
    /// Match record id.
    pub id: i64,
    /// Red competitor program.
    pub red: Program,
    /// Blue competitor program.
    pub blue: Program,
    /// Fence for heartbeats and the final commit.
    pub claim_token: Uuid,
    /// Number of times this record has been claimed, including this one.
    pub attempt: i32,
    /// Whether this claim took over an expired lease.
    pub reclaimed: bool,
}

/// A stored match record.
#[derive(Debug, Clone)]
pub struct MatchRecord {
    pub id: i64,
    pub red_program_id: i64,
    pub blue_program_id: i64,
    pub status: MatchStatus,
    /// Replay URL, set on commit.
    pub replay: Option<String>,
    pub claimed_by: Option<String>,
    pub claim_token: Option<Uuid>,
    pub attempts: i32,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_parse_and_display() {
        for status in [
            MatchStatus::Queued,
            MatchStatus::Running,
            MatchStatus::RedWon,
            MatchStatus::BlueWon,
            MatchStatus::Error,
        ] {
            let parsed: MatchStatus = status.as_str().parse().expect("should parse");
            assert_eq!(parsed, status);
            assert_eq!(status.to_string(), status.as_str());
        }

        assert!("failed".parse::<MatchStatus>().is_err());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!MatchStatus::Queued.is_terminal());
        assert!(!MatchStatus::Running.is_terminal());
        assert!(MatchStatus::RedWon.is_terminal());
        assert!(MatchStatus::BlueWon.is_terminal());
        assert!(MatchStatus::Error.is_terminal());
    }

    #[test]
    fn test_outcome_maps_to_terminal_status() {
        assert_eq!(MatchOutcome::RedWon.status(), MatchStatus::RedWon);
        assert_eq!(MatchOutcome::BlueWon.status(), MatchStatus::BlueWon);
        assert_eq!(MatchOutcome::Error.to_string(), "error");
        assert!(MatchOutcome::BlueWon.status().is_terminal());
    }

    #[test]
    fn test_status_serde_uses_column_values() {
        let json = serde_json::to_string(&MatchStatus::RedWon).expect("serialize");
        assert_eq!(json, "\"redwon\"");
    }
}
