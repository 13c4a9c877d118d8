//! PostgreSQL database client for the match store.
//!
//! Owns the connection pool shared by the queue client, plus the schema
//! bootstrap and the record lookups and inserts used by the manager, the
//! `migrate` command and the integration tests. Claiming and committing live
//! in [`crate::scheduler::PgMatchQueue`].

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, postgres::PgRow, PgPool, Row};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::scheduler::{MatchRecord, MatchStatus};

use super::schema;

/// Errors that can occur during database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// A stored row holds a value outside the known domain.
    #[error("Invalid record {id}: {reason}")]
    InvalidRecord { id: i64, reason: String },

    /// A bootstrap statement was rejected; nothing from the batch was applied.
    #[error("Schema statement {index} failed: {source}")]
    Schema {
        index: usize,
        #[source]
        source: sqlx::Error,
    },
}

const SELECT_SCRIMMAGE_SQL: &str = r#"
SELECT id, red_program_id, blue_program_id, status, replay,
       claimed_by, claim_token, attempts,
       requested_at, started_at, finished_at, lease_expires_at
FROM scrimmages
WHERE id = $1
"#;

/// PostgreSQL database client.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connects to the database and returns a new client.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::ConnectionFailed` if no connection can be made.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(1)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(e.to_string()))?;

        Ok(Self { pool })
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the runner's tables and indexes in one transaction.
    ///
    /// Every statement is `IF NOT EXISTS`, so running it against an existing
    /// store changes nothing. Returns the number of statements executed.
    pub async fn bootstrap_schema(&self) -> Result<usize, DatabaseError> {
        let statements = schema::all_schema_statements();
        let mut tx = self.pool.begin().await?;
        for (index, statement) in statements.iter().enumerate() {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|source| DatabaseError::Schema { index, source })?;
        }
        tx.commit().await?;

        info!(statements = statements.len(), "Schema bootstrapped");
        Ok(statements.len())
    }

    /// Drops the runner's tables.
    ///
    /// **WARNING**: This will destroy all data! Use only in development/testing.
    pub async fn drop_schema(&self) -> Result<(), DatabaseError> {
        warn!("Dropping runner tables");
        let mut tx = self.pool.begin().await?;
        for (index, statement) in schema::DROP_STATEMENTS.iter().enumerate() {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(|source| DatabaseError::Schema { index, source })?;
        }
        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Program Operations
    // =========================================================================

    /// Inserts a program and returns its id.
    pub async fn insert_program(&self, team: &str, source: &str) -> Result<i64, DatabaseError> {
        let row = sqlx::query("INSERT INTO programs (team, source) VALUES ($1, $2) RETURNING id")
            .bind(team)
            .bind(source)
            .fetch_one(&self.pool)
            .await?;

        Ok(row.try_get("id")?)
    }

    // =========================================================================
    // Scrimmage Operations
    // =========================================================================

    /// Queues a scrimmage between two programs and returns its id.
    pub async fn enqueue_scrimmage(
        &self,
        red_program_id: i64,
        blue_program_id: i64,
    ) -> Result<i64, DatabaseError> {
        let row = sqlx::query(
            r#"
            INSERT INTO scrimmages (red_program_id, blue_program_id, status)
            VALUES ($1, $2, 'queued')
            RETURNING id
            "#,
        )
        .bind(red_program_id)
        .bind(blue_program_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    /// Retrieves a scrimmage by its ID.
    ///
    /// Returns `None` if the scrimmage doesn't exist.
    pub async fn get_scrimmage(&self, id: i64) -> Result<Option<MatchRecord>, DatabaseError> {
        let row = sqlx::query(SELECT_SCRIMMAGE_SQL)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| record_from_row(&r)).transpose()
    }

    /// Counts scrimmages per status, for startup reporting.
    pub async fn status_counts(&self) -> Result<Vec<(MatchStatus, i64)>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM scrimmages GROUP BY status ORDER BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            let status = status
                .parse::<MatchStatus>()
                .map_err(|reason| DatabaseError::InvalidRecord { id: 0, reason })?;
            counts.push((status, count));
        }
        Ok(counts)
    }
}

fn record_from_row(row: &PgRow) -> Result<MatchRecord, DatabaseError> {
    let id: i64 = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<MatchStatus>()
        .map_err(|reason| DatabaseError::InvalidRecord { id, reason })?;

    Ok(MatchRecord {
        id,
        red_program_id: row.try_get("red_program_id")?,
        blue_program_id: row.try_get("blue_program_id")?,
        status,
        replay: row.try_get("replay")?,
        claimed_by: row.try_get("claimed_by")?,
        claim_token: row.try_get::<Option<Uuid>, _>("claim_token")?,
        attempts: row.try_get("attempts")?,
        requested_at: row.try_get::<DateTime<Utc>, _>("requested_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
    })
}
