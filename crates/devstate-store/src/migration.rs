//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use devstate_core::now_millis;
use rusqlite::Connection;
use tracing::info;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema version {} is newer than supported version {}",
            current, CURRENT_VERSION
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
        info!(from = current, to = CURRENT_VERSION, "migrated database schema");
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- The singleton state document
        CREATE TABLE state_current (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            json TEXT NOT NULL,               -- the document body
            checksum TEXT NOT NULL,           -- sha256 of canonical json
            updated_at INTEGER NOT NULL       -- Unix ms
        );

        -- Live ledger
        CREATE TABLE history_entries (
            id INTEGER PRIMARY KEY,           -- assigned by the store, never reused
            ts INTEGER NOT NULL,              -- Unix ms
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            cp_from TEXT,
            cp_to TEXT,
            state_checksum TEXT,
            hmac_prev TEXT,                   -- NULL only for the genesis entry
            hmac TEXT NOT NULL,
            key_id TEXT,                      -- key that sealed the entry
            metadata TEXT NOT NULL            -- JSON object
        );

        -- Cold storage: same shape as the live ledger
        CREATE TABLE history_archive (
            id INTEGER PRIMARY KEY,
            ts INTEGER NOT NULL,
            actor TEXT NOT NULL,
            action TEXT NOT NULL,
            cp_from TEXT,
            cp_to TEXT,
            state_checksum TEXT,
            hmac_prev TEXT,
            hmac TEXT NOT NULL,
            key_id TEXT,
            metadata TEXT NOT NULL,
            archived_at INTEGER NOT NULL
        );

        -- Signing keys
        CREATE TABLE hmac_keys (
            id TEXT PRIMARY KEY,
            secret TEXT NOT NULL,             -- hex
            active INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );

        -- Advisory leases
        CREATE TABLE leases (
            lock_id TEXT PRIMARY KEY,
            scope TEXT NOT NULL,
            actor TEXT NOT NULL,
            expires_at INTEGER NOT NULL       -- Unix ms
        );

        -- Indexes for common queries
        CREATE INDEX idx_history_actor ON history_entries(actor);
        CREATE INDEX idx_history_action ON history_entries(action);
        CREATE INDEX idx_history_ts ON history_entries(ts);
        CREATE UNIQUE INDEX idx_hmac_keys_active ON hmac_keys(active) WHERE active = 1;
        CREATE INDEX idx_leases_scope ON leases(scope);
        CREATE INDEX idx_leases_expires ON leases(expires_at);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "state_current",
            "history_entries",
            "history_archive",
            "hmac_keys",
            "leases",
            "schema_migrations",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_state_is_a_singleton() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let result = conn.execute(
            "INSERT INTO state_current (id, json, checksum, updated_at) VALUES (2, '{}', 'x', 0)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (99, 0)",
            [],
        )
        .unwrap();

        assert!(matches!(migrate(&mut conn), Err(StoreError::Migration(_))));
    }
}
