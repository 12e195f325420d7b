//! Store schema and migrations
//!
//! The store-level version lives in the `store_meta` table. Migrations run
//! forward only, one transaction each; a store written by a newer build is
//! refused.

use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// Current store schema version
pub const SCHEMA_VERSION: i64 = 3;

const SCHEMA_VERSION_KEY: &str = "schema_version";

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: one row per session log
    r#"
    CREATE TABLE sessions (
        session_id            TEXT PRIMARY KEY,
        source                TEXT NOT NULL,
        remote_host           TEXT,
        source_path           TEXT NOT NULL UNIQUE,
        project               TEXT,
        working_directory     TEXT NOT NULL DEFAULT '',
        created_at            INTEGER NOT NULL,   -- unix ms
        updated_at            INTEGER NOT NULL,   -- unix ms
        duration_ms           INTEGER NOT NULL DEFAULT 0,
        active_time_ms        INTEGER NOT NULL DEFAULT 0,

        user_messages         INTEGER NOT NULL DEFAULT 0,
        assistant_messages    INTEGER NOT NULL DEFAULT 0,
        tool_messages         INTEGER NOT NULL DEFAULT 0,
        reasoning_messages    INTEGER NOT NULL DEFAULT 0,
        other_messages        INTEGER NOT NULL DEFAULT 0,

        input_tokens          INTEGER NOT NULL DEFAULT 0,
        output_tokens         INTEGER NOT NULL DEFAULT 0,
        cache_read_tokens     INTEGER NOT NULL DEFAULT 0,
        cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
        total_tokens          INTEGER NOT NULL DEFAULT 0,

        has_terminal_session  INTEGER NOT NULL DEFAULT 0,
        has_review_activity   INTEGER NOT NULL DEFAULT 0,

        -- Fingerprint of the file state that produced this row
        file_size             INTEGER NOT NULL,
        file_modified_ns      INTEGER NOT NULL,
        schema_version        INTEGER NOT NULL,
        parse_error           TEXT
    );

    CREATE INDEX idx_sessions_project ON sessions(project);
    CREATE INDEX idx_sessions_updated_at ON sessions(updated_at);
    CREATE INDEX idx_sessions_created_at ON sessions(created_at);
    CREATE INDEX idx_sessions_source ON sessions(source);
    "#,
    // Version 2: stub rows and truncated scans
    r#"
    ALTER TABLE sessions ADD COLUMN complete INTEGER NOT NULL DEFAULT 1;
    ALTER TABLE sessions ADD COLUMN scan_truncated INTEGER NOT NULL DEFAULT 0;
    ALTER TABLE sessions ADD COLUMN indexed_at INTEGER;
    "#,
    // Version 3: user-owned fields; total_tokens now includes cache tokens
    r#"
    ALTER TABLE sessions ADD COLUMN title TEXT;
    ALTER TABLE sessions ADD COLUMN pinned INTEGER NOT NULL DEFAULT 0;

    UPDATE sessions
    SET total_tokens = input_tokens + output_tokens + cache_read_tokens + cache_creation_tokens;
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS store_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
    )?;

    let current_version = get_schema_version(conn)?;

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking store migrations"
    );

    if current_version > SCHEMA_VERSION {
        tracing::error!(
            found = current_version,
            expected = SCHEMA_VERSION,
            "Store was written by a newer version, refusing to open"
        );
        return Err(Error::Schema {
            found: current_version,
            expected: SCHEMA_VERSION,
        });
    }

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i64;
        if version > current_version {
            tracing::info!(version, "Running migration");
            let tx = conn.transaction()?;
            tx.execute_batch(migration)?;
            tx.execute(
                "INSERT INTO store_meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![SCHEMA_VERSION_KEY, version.to_string()],
            )?;
            tx.commit()?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the store schema version (0 for an empty store)
pub fn get_schema_version(conn: &Connection) -> Result<i64> {
    let has_meta: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'store_meta'",
        [],
        |r| r.get(0),
    )?;
    if !has_meta {
        return Ok(0);
    }

    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM store_meta WHERE key = ?1",
            [SCHEMA_VERSION_KEY],
            |r| r.get(0),
        )
        .optional()?;

    match value {
        None => Ok(0),
        Some(v) => v
            .parse()
            .map_err(|_| Error::Config(format!("store_meta schema_version is not a number: {v}"))),
    }
}

#[cfg(test)]
pub(crate) fn migrate_to(conn: &mut Connection, version: usize) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS store_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
    )?;
    for (i, migration) in MIGRATIONS.iter().enumerate().take(version) {
        conn.execute_batch(migration)?;
        conn.execute(
            "INSERT OR REPLACE INTO store_meta (key, value) VALUES (?1, ?2)",
            params![SCHEMA_VERSION_KEY, (i + 1).to_string()],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column_names(conn: &Connection) -> Vec<String> {
        conn.prepare("PRAGMA table_info(sessions)")
            .unwrap()
            .query_map([], |row| row.get::<_, String>(1))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();

        run_migrations(&mut conn).unwrap();
        run_migrations(&mut conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_indexes_created() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();

        for index in [
            "idx_sessions_project",
            "idx_sessions_updated_at",
            "idx_sessions_created_at",
            "idx_sessions_source",
        ] {
            let exists: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name=?",
                    [index],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(exists, 1, "Index {} should exist", index);
        }
    }

    #[test]
    fn test_newer_store_is_refused() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        conn.execute(
            "UPDATE store_meta SET value = ?1 WHERE key = 'schema_version'",
            [(SCHEMA_VERSION + 1).to_string()],
        )
        .unwrap();

        let err = run_migrations(&mut conn).unwrap_err();
        assert!(matches!(
            err,
            Error::Schema { found, expected } if found == SCHEMA_VERSION + 1 && expected == SCHEMA_VERSION
        ));
    }

    #[test]
    fn test_upgrade_from_v1_keeps_rows_and_recomputes_totals() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate_to(&mut conn, 1).unwrap();
        conn.execute(
            r#"INSERT INTO sessions (session_id, source, source_path, created_at, updated_at,
                   input_tokens, output_tokens, cache_read_tokens, cache_creation_tokens, total_tokens,
                   file_size, file_modified_ns, schema_version)
               VALUES ('s1', 'claude_code', '/tmp/s1.jsonl', 0, 0, 10, 20, 30, 40, 30, 100, 5, 1)"#,
            [],
        )
        .unwrap();

        run_migrations(&mut conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        let columns = column_names(&conn);
        for col in ["complete", "scan_truncated", "title", "pinned"] {
            assert!(columns.iter().any(|c| c == col), "missing column {col}");
        }

        let (total, complete, pinned): (i64, bool, bool) = conn
            .query_row(
                "SELECT total_tokens, complete, pinned FROM sessions WHERE session_id = 's1'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(total, 100);
        assert!(complete);
        assert!(!pinned);
    }
}
