//! Match queue backed by the shared PostgreSQL match store.
//!
//! This module provides the claim/commit client every worker uses:
//!
//! - Exclusive claim of the oldest claimable record using row-level locks
//! - Lease heartbeats so a crashed worker's record becomes reclaimable
//! - Token-fenced terminal commits
//!
//! # Claim protocol
//!
//! A claim is a single transaction:
//!
//! ```text
//! BEGIN
//!   SELECT ... ORDER BY id LIMIT 1 FOR UPDATE OF s SKIP LOCKED
//!   UPDATE scrimmages SET status = 'running', claim_token = $new ...
//! COMMIT
//! ```
//!
//! `SKIP LOCKED` makes racing workers pass over a candidate another worker
//! has already locked, so two workers can never both observe and transition
//! the same record. A plain `UPDATE ... WHERE id = (SELECT ...)` offers no
//! such guarantee under concurrency.
//!
//! A `running` record whose lease expired is claimable again under a new
//! token. Commits and heartbeats match on the token, so the previous holder
//! can never write to it afterwards.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::QueueError;
use crate::storage::Database;

use super::record::{ClaimedMatch, MatchOutcome, Program};

const CLAIM_CANDIDATE_SQL: &str = r#"
SELECT s.id, s.status,
       s.red_program_id, r.source AS red_source,
       s.blue_program_id, b.source AS blue_source
FROM scrimmages s
INNER JOIN programs r ON r.id = s.red_program_id
INNER JOIN programs b ON b.id = s.blue_program_id
WHERE s.status = 'queued'
   OR (s.status = 'running' AND s.lease_expires_at < NOW())
ORDER BY s.id
LIMIT 1
FOR UPDATE OF s SKIP LOCKED
"#;

const CLAIM_UPDATE_SQL: &str = r#"
UPDATE scrimmages
SET status = 'running',
    claimed_by = $2,
    claim_token = $3,
    attempts = attempts + 1,
    started_at = NOW(),
    lease_expires_at = NOW() + make_interval(secs => $4),
    updated_at = NOW()
WHERE id = $1
RETURNING attempts
"#;

const COMMIT_SQL: &str = r#"
UPDATE scrimmages
SET status = $3,
    replay = $4,
    lease_expires_at = NULL,
    finished_at = NOW(),
    updated_at = NOW()
WHERE id = $1 AND claim_token = $2 AND status = 'running'
"#;

const HEARTBEAT_SQL: &str = r#"
UPDATE scrimmages
SET lease_expires_at = NOW() + make_interval(secs => $3),
    updated_at = NOW()
WHERE id = $1 AND claim_token = $2 AND status = 'running'
"#;

/// Claim/commit operations against the shared match store.
///
/// This is the only way workers coordinate with one another.
#[async_trait]
pub trait MatchQueue: Send + Sync {
    /// Atomically moves the oldest claimable record to `running` for `worker_id`.
    ///
    /// # Errors
    ///
    /// - `QueueError::Empty` if nothing is claimable
    /// - `QueueError::Transient` on connectivity or contention failure
    async fn claim_next(&self, worker_id: &str) -> Result<ClaimedMatch, QueueError>;

    /// Moves a claimed record to its terminal status in one update.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::RecordNotFound` if the record is missing, not
    /// `running`, or held under a different claim token.
    async fn commit_result(
        &self,
        claim: &ClaimedMatch,
        outcome: MatchOutcome,
        replay_url: Option<&str>,
    ) -> Result<(), QueueError>;

    /// Extends the lease on a claimed record.
    async fn heartbeat(&self, claim: &ClaimedMatch) -> Result<(), QueueError>;
}

/// PostgreSQL implementation of [`MatchQueue`].
#[derive(Clone)]
pub struct PgMatchQueue {
    pool: PgPool,
    lease_timeout: Duration,
}

impl PgMatchQueue {
    /// Creates a queue client over an existing pool.
    ///
    /// # Arguments
    ///
    /// * `pool` - Connection pool for the match store
    /// * `lease_timeout` - How long a claim survives without a heartbeat
    pub fn new(pool: PgPool, lease_timeout: Duration) -> Self {
        Self {
            pool,
            lease_timeout,
        }
    }

    /// Opens a pool from configuration.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the store is unreachable.
    pub async fn connect(config: &DatabaseConfig, lease_timeout: Duration) -> Result<Self, QueueError> {
        let db = Database::connect(config)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        Ok(Self::new(db.pool().clone(), lease_timeout))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl MatchQueue for PgMatchQueue {
    async fn claim_next(&self, worker_id: &str) -> Result<ClaimedMatch, QueueError> {
        let mut tx = self.pool.begin().await?;

        let candidate = sqlx::query(CLAIM_CANDIDATE_SQL)
            .fetch_optional(&mut *tx)
            .await?;

        let row = match candidate {
            Some(row) => row,
            None => {
                tx.rollback().await?;
                return Err(QueueError::Empty);
            }
        };

        let id: i64 = row.try_get("id")?;
        let previous_status: String = row.try_get("status")?;
        let reclaimed = match previous_status.as_str() {
            "queued" => false,
            "running" => true,
            other => {
                return Err(QueueError::Corrupt {
                    id,
                    reason: format!("claim candidate in status '{}'", other),
                })
            }
        };
        let red = Program::new(
            row.try_get("red_program_id")?,
            row.try_get::<String, _>("red_source")?,
        );
        let blue = Program::new(
            row.try_get("blue_program_id")?,
            row.try_get::<String, _>("blue_source")?,
        );

        let claim_token = Uuid::new_v4();
        let updated = sqlx::query(CLAIM_UPDATE_SQL)
            .bind(id)
            .bind(worker_id)
            .bind(claim_token)
            .bind(self.lease_timeout.as_secs_f64())
            .fetch_one(&mut *tx)
            .await?;
        let attempt: i32 = updated.try_get("attempts")?;

        tx.commit().await?;

        debug!(match_id = id, attempt = attempt, worker_id = worker_id, "Claimed match");

        Ok(ClaimedMatch {
            id,
            red,
            blue,
            claim_token,
            attempt,
            reclaimed,
        })
    }

    async fn commit_result(
        &self,
        claim: &ClaimedMatch,
        outcome: MatchOutcome,
        replay_url: Option<&str>,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(COMMIT_SQL)
            .bind(claim.id)
            .bind(claim.claim_token)
            .bind(outcome.status().as_str())
            .bind(replay_url)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::RecordNotFound { id: claim.id });
        }

        Ok(())
    }

    async fn heartbeat(&self, claim: &ClaimedMatch) -> Result<(), QueueError> {
        let result = sqlx::query(HEARTBEAT_SQL)
            .bind(claim.id)
            .bind(claim.claim_token)
            .bind(self.lease_timeout.as_secs_f64())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::RecordNotFound { id: claim.id });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_uses_skip_locked_row_lock() {
        assert!(CLAIM_CANDIDATE_SQL.contains("FOR UPDATE OF s SKIP LOCKED"));
        assert!(CLAIM_CANDIDATE_SQL.contains("ORDER BY s.id"));
        assert!(CLAIM_CANDIDATE_SQL.contains("LIMIT 1"));
    }

    #[test]
    fn test_terminal_records_never_claimable() {
        // Only queued rows and running rows with an expired lease qualify.
        assert!(CLAIM_CANDIDATE_SQL.contains("s.status = 'queued'"));
        assert!(CLAIM_CANDIDATE_SQL.contains("s.status = 'running' AND s.lease_expires_at < NOW()"));
        for terminal in ["redwon", "bluewon", "error"] {
            assert!(!CLAIM_CANDIDATE_SQL.contains(terminal));
        }
    }

    #[test]
    fn test_commit_and_heartbeat_are_fenced() {
        for sql in [COMMIT_SQL, HEARTBEAT_SQL] {
            assert!(sql.contains("claim_token = $2"));
            assert!(sql.contains("status = 'running'"));
        }
    }
}
