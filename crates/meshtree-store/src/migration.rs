//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use crate::error::{Result, StoreError};
use crate::traits::now_millis;

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    // Create migrations table if it doesn't exist
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    // Get current version
    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    // Apply pending migrations in one transaction
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
    // Local messages, fetched nodes and per-peer roots
    conn.execute_batch(
        r#"
        -- Local messages, the leaves of our own tree
        CREATE TABLE messages (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            hash BLOB NOT NULL UNIQUE,        -- 32 bytes, SHA-256 of the leaf payload
            payload BLOB NOT NULL,            -- encoded leaf payload
            created_at INTEGER NOT NULL
        );

        -- Verified nodes fetched from peers
        CREATE TABLE nodes (
            hash BLOB PRIMARY KEY,            -- 32 bytes, SHA-256 of payload
            node_type INTEGER NOT NULL,       -- 0 = leaf, 1 = internal
            payload BLOB NOT NULL,
            source TEXT NOT NULL,             -- peer address
            fetched_at INTEGER NOT NULL
        );

        -- Last announced root per peer
        CREATE TABLE remote_roots (
            peer TEXT PRIMARY KEY,
            root BLOB NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Lookups by originating peer
        CREATE INDEX idx_nodes_source ON nodes(source);
        "#,
    )?;

    Ok(())
}
