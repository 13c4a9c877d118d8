//! Database schema constants for the match store.
//!
//! The production schema is owned elsewhere. These statements create the
//! subset the runner depends on, for development and integration tests.

/// SQL schema for creating the programs table.
pub const CREATE_PROGRAMS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS programs (
    id BIGSERIAL PRIMARY KEY,
    team VARCHAR(255) NOT NULL,
    source TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for creating the scrimmages table.
pub const CREATE_SCRIMMAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS scrimmages (
    id BIGSERIAL PRIMARY KEY,
    red_program_id BIGINT NOT NULL REFERENCES programs(id),
    blue_program_id BIGINT NOT NULL REFERENCES programs(id),
    status VARCHAR(16) NOT NULL DEFAULT 'queued'
        CHECK (status IN ('queued', 'running', 'redwon', 'bluewon', 'error')),
    replay VARCHAR(1024),
    claimed_by VARCHAR(255),
    claim_token UUID,
    attempts INTEGER NOT NULL DEFAULT 0,
    requested_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    finished_at TIMESTAMPTZ,
    lease_expires_at TIMESTAMPTZ,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Partial index over claimable queued records.
pub const CREATE_QUEUED_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_scrimmages_queued ON scrimmages(id) WHERE status = 'queued'
"#;

/// Partial index for finding expired leases.
pub const CREATE_LEASE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_scrimmages_running_lease ON scrimmages(lease_expires_at) WHERE status = 'running'
"#;

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_PROGRAMS_TABLE,
        CREATE_SCRIMMAGES_TABLE,
        CREATE_QUEUED_INDEX,
        CREATE_LEASE_INDEX,
    ]
}

/// Drops the runner's tables, dependents first. Destroys all data.
pub const DROP_STATEMENTS: [&str; 2] = [
    "DROP TABLE IF EXISTS scrimmages CASCADE",
    "DROP TABLE IF EXISTS programs CASCADE",
];

/// Table names in the schema.
pub mod tables {
    pub const PROGRAMS: &str = "programs";
    pub const SCRIMMAGES: &str = "scrimmages";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_schema_statements_order() {
        let statements = all_schema_statements();
        assert_eq!(statements.len(), 4);
        // Programs must come first (scrimmages reference it)
        assert!(statements[0].contains(tables::PROGRAMS));
        assert!(statements[1].contains(tables::SCRIMMAGES));
        assert!(statements[2..].iter().all(|s| s.contains("CREATE INDEX")));
    }

    #[test]
    fn test_status_domain_matches_record_values() {
        use crate::scheduler::MatchStatus;

        for status in [
            MatchStatus::Queued,
            MatchStatus::Running,
            MatchStatus::RedWon,
            MatchStatus::BlueWon,
            MatchStatus::Error,
        ] {
            assert!(CREATE_SCRIMMAGES_TABLE.contains(&format!("'{}'", status.as_str())));
        }
    }

    #[test]
    fn test_drop_order_reverses_creation() {
        assert!(DROP_STATEMENTS[0].contains(tables::SCRIMMAGES));
        assert!(DROP_STATEMENTS[1].contains(tables::PROGRAMS));
    }

    #[test]
    fn test_one_statement_per_constant() {
        for statement in all_schema_statements() {
            assert!(!statement.trim().trim_end_matches(';').contains(';'));
        }
    }
}
