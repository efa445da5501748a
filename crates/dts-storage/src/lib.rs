//! dts-storage: SQLite-backed reference backends.
//!
//! One database holds the records of all three services: jobs (registry),
//! scheduled runs (scheduler) and executions (tracker). Each service only
//! writes its own tables; cross-table effects are the server-side
//! derivations a real deployment performs (status recomputation, `next_run`,
//! resource accounting).

mod registry;
mod scheduler;
mod tracker;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;

use dts_types::{
    AlreadyFinalized, InvalidTransition, Job, JobStatus, Resources, ValidationError,
};

/// Which kind of record a lookup was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Job,
    ScheduledRun,
    Execution,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RecordKind::Job => "job",
            RecordKind::ScheduledRun => "scheduled run",
            RecordKind::Execution => "execution",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("{kind} {id} not found")]
    NotFound { kind: RecordKind, id: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
    #[error(transparent)]
    AlreadyFinalized(#[from] AlreadyFinalized),
    #[error("insufficient resources: requested {requested:?}, available {available:?}")]
    InsufficientResources {
        requested: Resources,
        available: Resources,
    },
}

impl StorageError {
    fn not_found(kind: RecordKind, id: &str) -> Self {
        StorageError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        cron_expression TEXT NOT NULL,
        priority INTEGER NOT NULL,
        max_retries INTEGER NOT NULL,
        timeout_seconds INTEGER NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}',
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        last_run TEXT,
        next_run TEXT
    );

    CREATE TABLE IF NOT EXISTS scheduled_runs (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL,
        cpu REAL NOT NULL,
        memory REAL NOT NULL,
        storage REAL NOT NULL,
        next_execution_time TEXT NOT NULL,
        created_at TEXT NOT NULL,
        attempt INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_runs_job ON scheduled_runs(job_id);
    CREATE INDEX IF NOT EXISTS idx_runs_time ON scheduled_runs(next_execution_time);

    CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL,
        status TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT,
        result TEXT,
        error TEXT,
        cpu REAL NOT NULL DEFAULT 0,
        memory REAL NOT NULL DEFAULT 0,
        storage REAL NOT NULL DEFAULT 0,
        attempt INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_executions_job ON executions(job_id);
";

/// SQLite-based storage behind the job registry, scheduler and execution tracker.
pub struct DtsStorage {
    conn: Arc<Mutex<Connection>>,
    capacity: Resources,
}

impl DtsStorage {
    /// Open (or create) the SQLite database at the given path.
    pub fn open(path: &Path, capacity: Resources) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrent read performance
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!("Storage opened: {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            capacity,
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory(capacity: Resources) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            capacity,
        })
    }

    /// Total reservable resources.
    pub fn capacity(&self) -> Resources {
        self.capacity
    }

    /// Run `f` on the connection in a blocking task.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        })
        .await?
    }
}

// ─── Row helpers ───────────────────────────────────────

/// Current time at the precision the database stores.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 so that text comparison orders by time.
fn fmt_time(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn time_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_time(idx, &raw)
}

fn opt_time_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|raw| parse_time(idx, &raw))
        .transpose()
}

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
}

fn status_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<JobStatus> {
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

/// Bump `updated_at` so that it strictly increases on every write.
fn touch(job: &mut Job, now: DateTime<Utc>) {
    let floor = job.updated_at + chrono::Duration::microseconds(1);
    job.updated_at = now.max(floor);
}

/// Resources still free: capacity minus active runs minus running executions.
fn available_resources(conn: &Connection, capacity: Resources) -> Result<Resources> {
    let sum = |sql: &str| -> Result<Resources> {
        Ok(conn.query_row(sql, [], |row| {
            Ok(Resources::new(row.get(0)?, row.get(1)?, row.get(2)?))
        })?)
    };
    let reserved = sum(
        "SELECT COALESCE(SUM(cpu), 0), COALESCE(SUM(memory), 0), COALESCE(SUM(storage), 0)
         FROM scheduled_runs",
    )?;
    let running = sum(
        "SELECT COALESCE(SUM(cpu), 0), COALESCE(SUM(memory), 0), COALESCE(SUM(storage), 0)
         FROM executions WHERE status = 'RUNNING'",
    )?;
    Ok(capacity.minus(&reserved).minus(&running))
}

fn reserve(conn: &Connection, capacity: Resources, requested: &Resources) -> Result<()> {
    let available = available_resources(conn, capacity)?;
    if !requested.fits_within(&available) {
        return Err(StorageError::InsufficientResources {
            requested: *requested,
            available,
        });
    }
    Ok(())
}
