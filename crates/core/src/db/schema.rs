//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The `user_version`
//! pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            username        TEXT NOT NULL UNIQUE,
            display_name    TEXT NOT NULL,
            email           TEXT NOT NULL,
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS proposals (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            owner_id            INTEGER NOT NULL REFERENCES users (id),
            title               TEXT NOT NULL,
            content             TEXT NOT NULL,
            version             TEXT NOT NULL DEFAULT '0.0.0',
            status              TEXT NOT NULL DEFAULT 'DRAFT'
                                CHECK (status IN ('DRAFT', 'PUBLISHED')),
            working_branch      TEXT NOT NULL DEFAULT '',
            last_commit_id      TEXT NOT NULL DEFAULT '',
            published_commit_id TEXT,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_proposals_owner ON proposals (owner_id);

        CREATE TABLE IF NOT EXISTS contributors (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            proposal_id     INTEGER NOT NULL REFERENCES proposals (id),
            user_id         INTEGER NOT NULL REFERENCES users (id),
            role            TEXT NOT NULL CHECK (role IN ('EDITOR', 'REVIEWER')),
            status          TEXT NOT NULL DEFAULT 'ACTIVE'
                            CHECK (status IN ('ACTIVE', 'SUSPENDED')),
            branch          TEXT NOT NULL DEFAULT '',
            created_at      TEXT NOT NULL,
            UNIQUE (proposal_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS pull_requests (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            proposal_id     INTEGER NOT NULL REFERENCES proposals (id),
            contributor_id  INTEGER NOT NULL REFERENCES contributors (id),
            source_branch   TEXT NOT NULL,
            target_branch   TEXT NOT NULL,
            description     TEXT NOT NULL DEFAULT '',
            status          TEXT NOT NULL DEFAULT 'OPEN'
                            CHECK (status IN ('OPEN', 'MERGED')),
            merge_commit_id TEXT,
            created_at      TEXT NOT NULL,
            merged_at       TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_pull_requests_proposal ON pull_requests (proposal_id, status);

        CREATE TABLE IF NOT EXISTS audit_log (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            action      TEXT NOT NULL,
            proposal_id INTEGER,
            actor_id    INTEGER,
            commit_id   TEXT,
            details     TEXT,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_proposal ON audit_log (proposal_id);
        CREATE INDEX IF NOT EXISTS idx_audit_log_action ON audit_log (action);
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };

        for table in ["users", "proposals", "contributors", "pull_requests", "audit_log"] {
            assert!(tables.contains(&table.to_string()), "missing {table}");
        }
    }

    #[test]
    fn test_status_check_constraint() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO users (username, display_name, email, created_at)
             VALUES ('ana', 'Ana', 'ana@example.org', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        let bad = conn.execute(
            "INSERT INTO proposals (owner_id, title, content, status, created_at, updated_at)
             VALUES (1, 't', 'c', 'archived', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(bad.is_err());
    }
}
