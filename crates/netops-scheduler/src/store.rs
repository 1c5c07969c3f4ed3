use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::{types::Type, Connection, OptionalExtension};
use tracing::{debug, error, info, instrument, warn};

use netops_core::config::DEFAULT_STORE_WRITE_ATTEMPTS;

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::types::{JobDefinition, JobRun, Priority, RunStatus};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a claim lease, whatever the job's timeout and retries add up to.
pub const MAX_CLAIM_LEASE_SECS: i64 = 30 * 86_400;

const JOB_COLUMNS: &str = "id, name, task_ref, schedule, priority, max_retries,
     retry_delay_seconds, timeout_seconds, dependencies, enabled, args, kwargs";

const RUN_COLUMNS: &str = "id, job_id, status, start_time, end_time, error, output, retry_count";

/// Durable registry of job definitions and append-only execution history.
///
/// The single source of truth for persisted scheduler state. Implementations
/// must serialise concurrent writers.
pub trait JobStore: Send + Sync {
    /// Insert or fully replace a definition by id.
    fn register(&self, job: &JobDefinition) -> Result<()>;

    /// Remove a definition. Returns whether it existed. History is kept.
    fn unregister(&self, id: &str) -> Result<bool>;

    fn get(&self, id: &str) -> Result<Option<JobDefinition>>;

    /// All definitions, priority descending, then name, then id.
    fn list_all(&self) -> Result<Vec<JobDefinition>>;

    /// Append a history row and return its id. Never updates existing rows.
    fn record_run(&self, run: &JobRun) -> Result<i64>;

    fn latest_run(&self, job_id: &str) -> Result<Option<JobRun>>;

    /// Runs ordered by start time descending, optionally filtered by job.
    fn history(&self, job_id: Option<&str>, limit: usize, offset: usize) -> Result<Vec<JobRun>>;

    /// Definitions in export order.
    fn export_jobs(&self) -> Result<Vec<JobDefinition>> {
        self.list_all()
    }

    /// Take the execution claim for `job_id` on behalf of `owner` for at most
    /// `lease`. Returns `false` while another owner holds an unexpired claim;
    /// claiming again as the current holder restarts the lease.
    ///
    /// Claims are visible to every scheduler sharing the store, so this is
    /// what keeps one execution per job across processes.
    fn try_claim(&self, job_id: &str, owner: &str, lease: ChronoDuration) -> Result<bool>;

    /// Drop `owner`'s claim on `job_id`. Returns whether one was held.
    fn release_claim(&self, job_id: &str, owner: &str) -> Result<bool>;

    /// When the current unexpired claim on `job_id` was taken, if any.
    fn claimed_at(&self, job_id: &str) -> Result<Option<DateTime<Utc>>>;
}

/// [`JobStore`] backed by a single SQLite connection.
///
/// Wraps the connection in a `Mutex`; every operation is a short statement so
/// contention stays low even with a full worker pool recording results.
pub struct SqliteJobStore {
    db: Mutex<Connection>,
    write_attempts: u32,
}

impl SqliteJobStore {
    /// Wrap an already-open connection, initialising the schema if needed.
    ///
    /// Claims whose lease has run out (left behind by a process that died
    /// mid-run) are cleared here.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        let stale = conn.execute(
            "DELETE FROM job_claims WHERE expires_at < ?1",
            [fmt_ts(Utc::now())],
        )?;
        if stale > 0 {
            warn!(stale, "cleared expired job claims");
        }
        Ok(Self {
            db: Mutex::new(conn),
            write_attempts: DEFAULT_STORE_WRITE_ATTEMPTS,
        })
    }

    /// Open (or create) the database file at `path`.
    ///
    /// Creates missing parent directories. `:memory:` opens a private
    /// in-memory database.
    pub fn open(path: &Path) -> Result<Self> {
        if path.as_os_str() == ":memory:" {
            return Self::in_memory();
        }
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        info!(path = %path.display(), "opening scheduler database");

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::new(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// How many times `record_run` tries an insert before giving up.
    pub fn with_write_attempts(mut self, attempts: u32) -> Self {
        self.write_attempts = attempts.max(1);
        self
    }

    /// `(created_at, updated_at)` for a stored definition.
    pub fn timestamps(&self, id: &str) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
        let db = self.db.lock().expect("job store poisoned");
        let row = db
            .query_row(
                "SELECT created_at, updated_at FROM jobs WHERE id = ?1",
                [id],
                |row| Ok((parse_ts(row, 0)?, parse_ts(row, 1)?)),
            )
            .optional()?;
        Ok(row)
    }
}

impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    fn register(&self, job: &JobDefinition) -> Result<()> {
        let now = fmt_ts(Utc::now());
        let retry_delay = seconds_column(&job.id, "retry_delay_seconds", job.retry_delay_seconds)?;
        let timeout = seconds_column(&job.id, "timeout_seconds", job.timeout_seconds)?;
        let dependencies = serde_json::to_string(&job.dependencies)?;
        let args = serde_json::to_string(&job.args)?;
        let kwargs = serde_json::to_string(&job.kwargs)?;

        let db = self.db.lock().expect("job store poisoned");
        // Upsert keeps created_at from the first registration.
        db.execute(
            "INSERT INTO jobs
             (id, name, task_ref, schedule, priority, max_retries, retry_delay_seconds,
              timeout_seconds, dependencies, enabled, args, kwargs, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?13)
             ON CONFLICT(id) DO UPDATE SET
                name                = excluded.name,
                task_ref            = excluded.task_ref,
                schedule            = excluded.schedule,
                priority            = excluded.priority,
                max_retries         = excluded.max_retries,
                retry_delay_seconds = excluded.retry_delay_seconds,
                timeout_seconds     = excluded.timeout_seconds,
                dependencies        = excluded.dependencies,
                enabled             = excluded.enabled,
                args                = excluded.args,
                kwargs              = excluded.kwargs,
                updated_at          = excluded.updated_at",
            rusqlite::params![
                job.id,
                job.name,
                job.task_ref,
                job.schedule,
                u8::from(job.priority),
                job.max_retries,
                retry_delay,
                timeout,
                dependencies,
                job.enabled,
                args,
                kwargs,
                now,
            ],
        )?;
        debug!("job definition stored");
        Ok(())
    }

    #[instrument(skip(self))]
    fn unregister(&self, id: &str) -> Result<bool> {
        let db = self.db.lock().expect("job store poisoned");
        let n = db.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    fn get(&self, id: &str) -> Result<Option<JobDefinition>> {
        let db = self.db.lock().expect("job store poisoned");
        let job = db
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn list_all(&self) -> Result<Vec<JobDefinition>> {
        let db = self.db.lock().expect("job store poisoned");
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY priority DESC, name ASC, id ASC"
        ))?;
        // A row that fails to decode is an error, not a silently shorter list.
        let jobs = stmt
            .query_map([], row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    #[instrument(skip(self, run), fields(job_id = %run.job_id, status = %run.status))]
    fn record_run(&self, run: &JobRun) -> Result<i64> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.insert_run(run) {
                Ok(id) => return Ok(id),
                Err(e) if attempt < self.write_attempts => {
                    warn!(attempt, error = %e, "history write failed, retrying");
                }
                Err(e) => {
                    error!(attempts = attempt, error = %e, "history write failed, giving up");
                    return Err(e.into());
                }
            }
        }
    }

    fn latest_run(&self, job_id: &str) -> Result<Option<JobRun>> {
        let db = self.db.lock().expect("job store poisoned");
        let run = db
            .query_row(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM job_history WHERE job_id = ?1
                     ORDER BY start_time DESC, id DESC LIMIT 1"
                ),
                [job_id],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    fn history(&self, job_id: Option<&str>, limit: usize, offset: usize) -> Result<Vec<JobRun>> {
        let db = self.db.lock().expect("job store poisoned");
        let mut stmt = db.prepare_cached(&format!(
            "SELECT {RUN_COLUMNS} FROM job_history
             WHERE (?1 IS NULL OR job_id = ?1)
             ORDER BY start_time DESC, id DESC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let runs = stmt
            .query_map(
                rusqlite::params![job_id, limit as i64, offset as i64],
                row_to_run,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    #[instrument(skip(self, lease))]
    fn try_claim(&self, job_id: &str, owner: &str, lease: ChronoDuration) -> Result<bool> {
        let now = Utc::now();
        let expires = now
            .checked_add_signed(lease.min(ChronoDuration::seconds(MAX_CLAIM_LEASE_SECS)))
            .unwrap_or(now);
        let db = self.db.lock().expect("job store poisoned");
        // Single statement: inserts, renews our own claim, takes over an
        // expired one, or changes nothing.
        let changed = db.execute(
            "INSERT INTO job_claims (job_id, owner, claimed_at, expires_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(job_id) DO UPDATE SET
                owner      = excluded.owner,
                claimed_at = excluded.claimed_at,
                expires_at = excluded.expires_at
             WHERE job_claims.owner = excluded.owner
                OR job_claims.expires_at < excluded.claimed_at",
            rusqlite::params![job_id, owner, fmt_ts(now), fmt_ts(expires)],
        )?;
        Ok(changed == 1)
    }

    #[instrument(skip(self))]
    fn release_claim(&self, job_id: &str, owner: &str) -> Result<bool> {
        let db = self.db.lock().expect("job store poisoned");
        let n = db.execute(
            "DELETE FROM job_claims WHERE job_id = ?1 AND owner = ?2",
            [job_id, owner],
        )?;
        Ok(n > 0)
    }

    fn claimed_at(&self, job_id: &str) -> Result<Option<DateTime<Utc>>> {
        let db = self.db.lock().expect("job store poisoned");
        let at = db
            .query_row(
                "SELECT claimed_at FROM job_claims WHERE job_id = ?1 AND expires_at >= ?2",
                rusqlite::params![job_id, fmt_ts(Utc::now())],
                |row| parse_ts(row, 0),
            )
            .optional()?;
        Ok(at)
    }
}

impl SqliteJobStore {
    /// Make the next `n` history inserts fail with a SQLite error.
    #[cfg(test)]
    pub(crate) fn fail_next_history_writes(&self, n: u32) {
        let db = self.db.lock().expect("job store poisoned");
        // RAISE(FAIL) keeps the counter update made before the raise.
        db.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS history_write_faults (remaining INTEGER NOT NULL);
             DELETE FROM history_write_faults;
             INSERT INTO history_write_faults VALUES ({n});
             CREATE TRIGGER IF NOT EXISTS history_write_fault
             BEFORE INSERT ON job_history
             WHEN (SELECT remaining FROM history_write_faults) > 0
             BEGIN
                 UPDATE history_write_faults SET remaining = remaining - 1;
                 SELECT RAISE(FAIL, 'disk I/O error');
             END;"
        ))
        .expect("install history fault trigger");
    }

    fn insert_run(&self, run: &JobRun) -> rusqlite::Result<i64> {
        let db = self.db.lock().expect("job store poisoned");
        db.execute(
            "INSERT INTO job_history
             (job_id, status, start_time, end_time, error, output, retry_count)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            rusqlite::params![
                run.job_id,
                run.status.to_string(),
                fmt_ts(run.start_time),
                run.end_time.map(fmt_ts),
                run.error,
                run.output,
                run.retry_count,
            ],
        )?;
        Ok(db.last_insert_rowid())
    }
}

/// Durations are stored as SQLite integers, which are signed.
fn seconds_column(job_id: &str, field: &str, secs: u64) -> Result<i64> {
    i64::try_from(secs)
        .map_err(|_| SchedulerError::Validation(format!("job {job_id}: {field} is out of range")))
}

fn parse_secs(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<u64> {
    let secs: i64 = row.get(idx)?;
    u64::try_from(secs)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

/// Fixed-width UTC timestamps so lexical order is chronological order.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_json<T: serde::de::DeserializeOwned>(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Map a `jobs` row (selected with `JOB_COLUMNS`) to a definition.
fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobDefinition> {
    let priority = Priority::try_from(row.get::<_, u8>(4)?)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Integer, e.into()))?;

    Ok(JobDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        task_ref: row.get(2)?,
        schedule: row.get(3)?,
        priority,
        max_retries: row.get(5)?,
        retry_delay_seconds: parse_secs(row, 6)?,
        timeout_seconds: parse_secs(row, 7)?,
        dependencies: parse_json(row, 8)?,
        enabled: row.get(9)?,
        args: parse_json(row, 10)?,
        kwargs: parse_json(row, 11)?,
    })
}

/// Map a `job_history` row (selected with `RUN_COLUMNS`) to a run record.
fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRun> {
    let status: String = row.get(2)?;
    let status: RunStatus = status
        .parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?;
    let end_time = match row.get::<_, Option<String>>(4)? {
        Some(_) => Some(parse_ts(row, 4)?),
        None => None,
    };

    Ok(JobRun {
        id: Some(row.get(0)?),
        job_id: row.get(1)?,
        status,
        start_time: parse_ts(row, 3)?,
        end_time,
        error: row.get(5)?,
        output: row.get(6)?,
        retry_count: row.get(7)?,
        persisted: true,
    })
}
