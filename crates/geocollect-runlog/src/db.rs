use rusqlite::Connection;

use crate::error::Result;

/// Initialise the run log table and its indexes.
///
/// Safe to call on every startup; uses `IF NOT EXISTS` throughout.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS collector_runs (
            id              TEXT    NOT NULL PRIMARY KEY,   -- UUIDv7
            job_id          INTEGER NOT NULL,
            status          TEXT    NOT NULL DEFAULT 'running',
            started_at      TEXT    NOT NULL,               -- RFC 3339, microseconds, UTC
            finished_at     TEXT,
            data_timestamp  TEXT,                           -- max timestamp seen in the input
            message         TEXT
        ) STRICT;

        -- last_timestamp / last_run_time lookups
        CREATE INDEX IF NOT EXISTS idx_collector_runs_job
            ON collector_runs (job_id, status, started_at);",
    )?;
    Ok(())
}
