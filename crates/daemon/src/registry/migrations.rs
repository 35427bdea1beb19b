//! Versioned schema migrations for the share registry.
//!
//! Migrations are applied in order at startup. Each one runs in its own
//! transaction and bumps `PRAGMA user_version`, so a database is never left
//! between two versions. Statements are written to be re-runnable.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{ShareError, ShareResult};

/// A single schema migration.
pub(crate) struct Migration {
    /// Schema version after this migration has been applied.
    pub version: i32,
    /// Short description for logs.
    pub description: &'static str,
    /// SQL batch to execute.
    pub sql: &'static str,
}

/// All migrations, in application order.
pub(crate) const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "shares with typed file and download tables",
        sql: r#"
            CREATE TABLE IF NOT EXISTS shares (
                token TEXT PRIMARY KEY,
                recipient TEXT,
                created_at INTEGER NOT NULL,
                expires_at INTEGER,
                downloaded INTEGER NOT NULL DEFAULT 0,
                download_count INTEGER NOT NULL DEFAULT 0,
                last_download_attempt INTEGER,
                last_download_completed INTEGER,
                bytes_transferred INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS share_files (
                token TEXT NOT NULL,
                position INTEGER NOT NULL,
                filename TEXT NOT NULL,
                PRIMARY KEY (token, filename),
                FOREIGN KEY (token) REFERENCES shares(token) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS share_downloads (
                token TEXT NOT NULL,
                filename TEXT NOT NULL,
                downloaded_at INTEGER NOT NULL,
                PRIMARY KEY (token, filename),
                FOREIGN KEY (token) REFERENCES shares(token) ON DELETE CASCADE
            );
        "#,
    },
    Migration {
        version: 2,
        description: "listing and expiry indexes",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_shares_created_at
            ON shares(created_at DESC);

            CREATE INDEX IF NOT EXISTS idx_shares_expires_at
            ON shares(expires_at);

            CREATE INDEX IF NOT EXISTS idx_share_files_position
            ON share_files(token, position);
        "#,
    },
];

/// Latest schema version known to this build.
pub const LATEST_SCHEMA_VERSION: i32 = 2;

/// Reads the current schema version.
pub(crate) fn schema_version(conn: &Connection) -> ShareResult<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Applies every migration newer than the database's current version.
///
/// Returns the resulting schema version.
pub(crate) fn run_migrations(conn: &mut Connection) -> ShareResult<i32> {
    let current = schema_version(conn)?;

    if current > LATEST_SCHEMA_VERSION {
        return Err(ShareError::Storage(format!(
            "database schema version {} is newer than supported version {}",
            current, LATEST_SCHEMA_VERSION
        )));
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.execute(&format!("PRAGMA user_version = {}", migration.version), [])?;
        tx.commit()?;

        info!(
            version = migration.version,
            description = migration.description,
            "Applied registry migration"
        );
    }

    let version = schema_version(conn)?;
    debug!(version, "Registry schema up to date");
    Ok(version)
}
