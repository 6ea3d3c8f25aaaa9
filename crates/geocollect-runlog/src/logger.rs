use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use geocollect_core::{JobId, RunId};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, instrument, warn};

use crate::db::init_db;
use crate::error::{Result, RunLogError};
use crate::types::{RunRecord, RunStatus};

/// Durable record of pipeline runs, keyed by run id.
///
/// `last_timestamp` must only ever reflect successful runs: it is the lower
/// bound of the next incremental fetch.
pub trait RunLogger: Send + Sync {
    /// Open a new run record in `running` state.
    fn start(&self, job_id: JobId) -> Result<RunId>;

    /// Finalize as `success`, recording the latest input timestamp observed.
    /// `detail` carries per-dataset failures of a partially successful run.
    fn done(
        &self,
        run_id: &RunId,
        observed: Option<DateTime<Utc>>,
        detail: Option<&str>,
    ) -> Result<()>;

    /// Finalize as `no_data`. The job's last timestamp is left unchanged.
    fn no_data(&self, run_id: &RunId) -> Result<()>;

    /// Finalize as `error` with a description.
    fn error(&self, run_id: &RunId, message: &str) -> Result<()>;

    /// Latest data timestamp recorded by a successful run of `job_id`.
    fn last_timestamp(&self, job_id: JobId) -> Result<Option<DateTime<Utc>>>;

    /// Start time of the latest run of `job_id` that completed (`success` or
    /// `no_data`). Anchors the next timer fire.
    fn last_run_time(&self, job_id: JobId) -> Result<Option<DateTime<Utc>>>;

    /// Run history for a job, newest first.
    fn runs(&self, job_id: JobId, limit: usize) -> Result<Vec<RunRecord>>;
}

/// Fixed-width UTC at full nanosecond precision: lexical order in SQLite
/// equals time order, and a stored bound is never earlier than the record it
/// came from.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

/// SQLite-backed [`RunLogger`].
///
/// Wraps a single connection in a `Mutex`; every method is one short
/// statement, so callers on async tasks never hold it across an await.
pub struct SqliteRunLogger {
    db: Mutex<Connection>,
}

impl SqliteRunLogger {
    /// Wrap a connection, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Open (or create) the run log at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            // A failure here resurfaces as an open error below.
            let _ = std::fs::create_dir_all(parent);
        }
        debug!(path = %path.display(), "opening run log");
        Self::new(Connection::open(path)?)
    }

    /// In-memory run log, for tests and throwaway instances.
    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.db.lock().map_err(|_| RunLogError::Poisoned)
    }

    /// Mark runs left `running` by a previous process as `error`.
    ///
    /// Call once at startup, before any timer is armed. Interrupted runs never
    /// advanced the data timestamp, so the next run simply re-fetches.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let now = fmt_ts(Utc::now());
        let n = self.conn()?.execute(
            "UPDATE collector_runs
             SET status = 'error', finished_at = ?1,
                 message = 'interrupted before completion'
             WHERE status = 'running'",
            [&now],
        )?;
        if n > 0 {
            warn!(count = n, "interrupted runs marked as error");
        }
        Ok(n)
    }

    /// Move a `running` record to a terminal status. Fails if the run is
    /// unknown or already finalized.
    fn finalize(
        &self,
        run_id: &RunId,
        status: RunStatus,
        data_timestamp: Option<DateTime<Utc>>,
        message: Option<&str>,
    ) -> Result<()> {
        let now = fmt_ts(Utc::now());
        let db = self.conn()?;
        let changed = db.execute(
            "UPDATE collector_runs
             SET status = ?1, finished_at = ?2, data_timestamp = ?3, message = ?4
             WHERE id = ?5 AND status = 'running'",
            rusqlite::params![
                status.to_string(),
                now,
                data_timestamp.map(fmt_ts),
                message,
                run_id.as_str()
            ],
        )?;
        if changed == 1 {
            debug!(%run_id, %status, "run finalized");
            return Ok(());
        }

        let existing: Option<String> = db
            .query_row(
                "SELECT status FROM collector_runs WHERE id = ?1",
                [run_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            Some(status) => Err(RunLogError::AlreadyFinalized {
                run_id: run_id.to_string(),
                status,
            }),
            None => Err(RunLogError::RunNotFound {
                run_id: run_id.to_string(),
            }),
        }
    }
}

impl RunLogger for SqliteRunLogger {
    #[instrument(skip(self), fields(job_id = %job_id))]
    fn start(&self, job_id: JobId) -> Result<RunId> {
        let run_id = RunId::new();
        self.conn()?.execute(
            "INSERT INTO collector_runs (id, job_id, status, started_at)
             VALUES (?1, ?2, 'running', ?3)",
            rusqlite::params![run_id.as_str(), job_id.get() as i64, fmt_ts(Utc::now())],
        )?;
        debug!(%run_id, "run started");
        Ok(run_id)
    }

    #[instrument(skip(self, detail), fields(run_id = %run_id))]
    fn done(
        &self,
        run_id: &RunId,
        observed: Option<DateTime<Utc>>,
        detail: Option<&str>,
    ) -> Result<()> {
        self.finalize(run_id, RunStatus::Success, observed, detail)
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    fn no_data(&self, run_id: &RunId) -> Result<()> {
        self.finalize(run_id, RunStatus::NoData, None, None)
    }

    #[instrument(skip(self, message), fields(run_id = %run_id))]
    fn error(&self, run_id: &RunId, message: &str) -> Result<()> {
        self.finalize(run_id, RunStatus::Error, None, Some(message))
    }

    fn last_timestamp(&self, job_id: JobId) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self.conn()?.query_row(
            "SELECT MAX(data_timestamp) FROM collector_runs
             WHERE job_id = ?1 AND status = 'success'",
            [job_id.get() as i64],
            |row| row.get(0),
        )?;
        Ok(parse_opt_ts(0, raw)?)
    }

    fn last_run_time(&self, job_id: JobId) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self.conn()?.query_row(
            "SELECT MAX(started_at) FROM collector_runs
             WHERE job_id = ?1 AND status IN ('success', 'no_data')",
            [job_id.get() as i64],
            |row| row.get(0),
        )?;
        Ok(parse_opt_ts(0, raw)?)
    }

    fn runs(&self, job_id: JobId, limit: usize) -> Result<Vec<RunRecord>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT id, job_id, status, started_at, finished_at, data_timestamp, message
             FROM collector_runs
             WHERE job_id = ?1
             ORDER BY started_at DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![job_id.get() as i64, limit as i64],
            row_to_record,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

/// Map a SQLite row to a `RunRecord`.
fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let status_str: String = row.get(2)?;
    let status = status_str.parse::<RunStatus>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            Box::<dyn std::error::Error + Send + Sync>::from(e),
        )
    })?;
    let started_at: String = row.get(3)?;

    Ok(RunRecord {
        run_id: RunId(row.get(0)?),
        job_id: JobId(row.get::<_, i64>(1)? as u64),
        status,
        started_at: parse_ts(3, &started_at)?,
        finished_at: parse_opt_ts(4, row.get(4)?)?,
        data_timestamp: parse_opt_ts(5, row.get(5)?)?,
        message: row.get(6)?,
    })
}
