use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs`, `job_history` and `job_claims` tables (idempotent).
/// History rows are insert-only and outlive their job definition, so `job_id`
/// is not declared as an enforced foreign key.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id                  TEXT    NOT NULL PRIMARY KEY,
            name                TEXT    NOT NULL,
            task_ref            TEXT    NOT NULL,
            schedule            TEXT    NOT NULL,   -- 5-field cron expression
            priority            INTEGER NOT NULL CHECK (priority BETWEEN 1 AND 4),
            max_retries         INTEGER NOT NULL DEFAULT 3,
            retry_delay_seconds INTEGER NOT NULL DEFAULT 60,
            timeout_seconds     INTEGER NOT NULL,
            dependencies        TEXT    NOT NULL DEFAULT '[]',  -- JSON array of ids
            enabled             INTEGER NOT NULL DEFAULT 1,
            args                TEXT    NOT NULL DEFAULT '[]',  -- JSON array
            kwargs              TEXT    NOT NULL DEFAULT '{}',  -- JSON object
            created_at          TEXT    NOT NULL,
            updated_at          TEXT    NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS job_history (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id      TEXT    NOT NULL,
            status      TEXT    NOT NULL,
            start_time  TEXT    NOT NULL,   -- RFC 3339, microsecond precision
            end_time    TEXT,
            error       TEXT,
            output      TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0
        ) STRICT;

        -- latest_run / history(job_id): WHERE job_id = ? ORDER BY start_time DESC
        CREATE INDEX IF NOT EXISTS idx_job_history_job_start
            ON job_history (job_id, start_time);
        CREATE INDEX IF NOT EXISTS idx_job_history_start
            ON job_history (start_time);

        -- One row per in-flight execution, shared by every process on the file.
        CREATE TABLE IF NOT EXISTS job_claims (
            job_id      TEXT NOT NULL PRIMARY KEY,
            owner       TEXT NOT NULL,
            claimed_at  TEXT NOT NULL,
            expires_at  TEXT NOT NULL   -- lease end; a later claim may take it over
        ) STRICT;
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master
                 WHERE type = 'table' AND name IN ('jobs', 'job_history', 'job_claims')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 3);
    }
}
