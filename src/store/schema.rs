//! SQLite DDL definitions for the queue store.
//!
//! All `CREATE TABLE` / `CREATE INDEX` statements live here so they are
//! reviewable and testable in isolation.

use rusqlite::Connection;

/// Current schema version stamped into `schema_meta`.
pub(crate) const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Complete DDL for the queue database.
///
/// Uses `IF NOT EXISTS` throughout so `apply_schema` is idempotent.
pub(crate) const SCHEMA_SQL: &str = r#"
-- Enable WAL mode for concurrent reads during writes.
PRAGMA journal_mode = WAL;

-- Enforce foreign key constraints.
PRAGMA foreign_keys = ON;

-- The manager and every worker hold their own connection; wait out
-- short write contention instead of failing with SQLITE_BUSY.
PRAGMA busy_timeout = 5000;

-- Schema version tracking.
CREATE TABLE IF NOT EXISTS schema_meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Named queues. Workers are spawned per row at startup recovery.
CREATE TABLE IF NOT EXISTS queue (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

-- Scheduled tasks. The payload blob is opaque; the scheduling columns
-- (status_code, retry_date, priority, retry_count) are authoritative.
CREATE TABLE IF NOT EXISTS task (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    queue_id       INTEGER NOT NULL REFERENCES queue(id),
    queued_date    TEXT NOT NULL DEFAULT (datetime('now', 'localtime')),
    priority       INTEGER NOT NULL DEFAULT 0,
    status_code    TEXT NOT NULL DEFAULT 'Q',   -- Q queued, S succeeded, F failed
    retry_date     TEXT NOT NULL DEFAULT (datetime('now', 'localtime')),
    retry_count    INTEGER NOT NULL DEFAULT 0,
    failure_reason TEXT,
    exception      BLOB,
    task           BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_task_status_queue_retry
    ON task(status_code, queue_id, retry_date);
CREATE INDEX IF NOT EXISTS idx_task_status_queue_retry_priority
    ON task(status_code, queue_id, retry_date, priority);

-- Durable log lines, attached to a task or free-standing.
CREATE TABLE IF NOT EXISTS event (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id    INTEGER REFERENCES task(id),
    event      BLOB NOT NULL,
    event_date TEXT NOT NULL DEFAULT (datetime('now', 'localtime'))
);

CREATE INDEX IF NOT EXISTS idx_event_task ON event(task_id, id);
CREATE INDEX IF NOT EXISTS idx_event_date ON event(event_date, id);
"#;

/// Apply the full schema to an open connection.
///
/// Safe to call multiple times. Inserts the current schema version into
/// `schema_meta` if not already present.
pub(crate) fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;

    let version_str = CURRENT_SCHEMA_VERSION.to_string();
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        rusqlite::params![version_str],
    )?;

    Ok(())
}

/// Read the current schema version from the database.
///
/// Returns `None` if the `schema_meta` table is empty or the key is missing.
pub(crate) fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<u32>> {
    let mut stmt = conn.prepare("SELECT value FROM schema_meta WHERE key = 'schema_version'")?;
    let mut rows = stmt.query([])?;
    match rows.next()? {
        Some(row) => {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().ok())
        }
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
