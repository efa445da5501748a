//! Execution history.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{info, warn};

use dts_types::{Execution, ExecutionOutcome, ExecutionStatus, JobStatus, Resources};

use crate::registry::{find_job, refresh_next_run, save_job};
use crate::scheduler::{arm_run, runs_for_job};
use crate::{
    DtsStorage, RecordKind, Result, StorageError, conversion_error, fmt_time, opt_time_col,
    reserve, time_col, touch,
};

const EXECUTION_COLUMNS: &str = "id, job_id, status, start_time, end_time, result, error";

fn execution_status(raw: &str) -> Option<ExecutionStatus> {
    match raw {
        "RUNNING" => Some(ExecutionStatus::Running),
        "SUCCEEDED" => Some(ExecutionStatus::Succeeded),
        "FAILED" => Some(ExecutionStatus::Failed),
        _ => None,
    }
}

fn execution_status_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Running => "RUNNING",
        ExecutionStatus::Succeeded => "SUCCEEDED",
        ExecutionStatus::Failed => "FAILED",
    }
}

fn execution_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Execution> {
    let status: String = row.get(2)?;
    let status = execution_status(&status)
        .ok_or_else(|| conversion_error(2, format!("unknown execution status: {status}")))?;
    Ok(Execution {
        id: row.get(0)?,
        job_id: row.get(1)?,
        status,
        start_time: time_col(row, 3)?,
        end_time: opt_time_col(row, 4)?,
        result: row.get(5)?,
        error: row.get(6)?,
    })
}

/// Record a new execution holding `resources` until it finishes.
/// `attempt` is 0 for a regular run and counts up for retries.
pub(crate) fn insert_execution(
    conn: &Connection,
    execution: &Execution,
    resources: &Resources,
    attempt: u32,
) -> Result<()> {
    conn.execute(
        "INSERT INTO executions (id, job_id, status, start_time, end_time, result, error, cpu, memory, storage, attempt)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        rusqlite::params![
            execution.id,
            execution.job_id,
            execution_status_str(execution.status),
            fmt_time(execution.start_time),
            execution.end_time.map(fmt_time),
            execution.result,
            execution.error,
            resources.cpu,
            resources.memory,
            resources.storage,
            attempt,
        ],
    )?;
    Ok(())
}

/// Whether any execution of the job is still `RUNNING`.
pub(crate) fn has_running_execution(conn: &Connection, job_id: &str) -> Result<bool> {
    let running: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM executions WHERE job_id = ?1 AND status = 'RUNNING')",
        rusqlite::params![job_id],
        |row| row.get(0),
    )?;
    Ok(running)
}

fn load_execution(conn: &Connection, id: &str) -> Result<Execution> {
    let sql = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE id = ?1");
    conn.query_row(&sql, rusqlite::params![id], execution_from_row)
        .optional()?
        .ok_or_else(|| StorageError::not_found(RecordKind::Execution, id))
}

/// What a finished execution held, needed to arm a retry.
struct Reservation {
    resources: Resources,
    attempt: u32,
}

fn load_reservation(conn: &Connection, id: &str) -> Result<Reservation> {
    Ok(conn.query_row(
        "SELECT cpu, memory, storage, attempt FROM executions WHERE id = ?1",
        rusqlite::params![id],
        |row| {
            Ok(Reservation {
                resources: Resources::new(row.get(0)?, row.get(1)?, row.get(2)?),
                attempt: row.get(3)?,
            })
        },
    )?)
}

/// Finalize a running execution inside the caller's transaction.
///
/// Releases the reservation, arms a retry run for a failure while the job
/// has retries left, and derives the job status: `RUNNING` ends in
/// `COMPLETED` or `FAILED` once no other execution runs, and goes on to
/// `SCHEDULED` when a run is still armed. A `CANCELLED` job keeps its status.
fn finalize(
    conn: &Connection,
    capacity: Resources,
    id: &str,
    outcome: ExecutionOutcome,
    at: DateTime<Utc>,
) -> Result<Execution> {
    let mut execution = load_execution(conn, id)?;
    let held = load_reservation(conn, id)?;
    let failed = matches!(outcome, ExecutionOutcome::Failed { .. });
    let job_status = outcome.job_status();
    execution.finish(outcome, at)?;
    conn.execute(
        "UPDATE executions
         SET status = ?1, end_time = ?2, result = ?3, error = ?4,
             cpu = 0, memory = 0, storage = 0
         WHERE id = ?5",
        rusqlite::params![
            execution_status_str(execution.status),
            execution.end_time.map(fmt_time),
            execution.result,
            execution.error,
            execution.id,
        ],
    )?;

    let Some(mut job) = find_job(conn, &execution.job_id)? else {
        return Ok(execution);
    };
    let mut changed = false;

    let retries_left = i64::from(job.max_retries) - i64::from(held.attempt);
    if failed && retries_left > 0 && job.status == JobStatus::Running {
        // Due when the failed attempt ended, kept after `last_run`.
        let ended = execution.end_time.unwrap_or(at);
        let retry_at = match job.last_run {
            Some(last) => ended.max(last + Duration::microseconds(1)),
            None => ended,
        };
        match reserve(conn, capacity, &held.resources) {
            Ok(()) => {
                let run = arm_run(conn, &job.id, held.resources, retry_at, held.attempt + 1, at)?;
                info!(
                    job_id = %job.id,
                    run_id = %run.id,
                    attempt = held.attempt + 1,
                    max_retries = job.max_retries,
                    "Retry scheduled"
                );
                changed = true;
            }
            Err(StorageError::InsufficientResources { .. }) => {
                warn!(job_id = %job.id, execution_id = %execution.id, "No capacity left for a retry");
            }
            Err(e) => return Err(e),
        }
    }

    if job.status == JobStatus::Running && !has_running_execution(conn, &job.id)? {
        job.status = job.status.transition(job_status)?;
        if runs_for_job(conn, &job.id)? > 0 {
            job.status = job.status.transition(JobStatus::Scheduled)?;
        }
        changed = true;
    }

    if changed {
        refresh_next_run(conn, &mut job)?;
        touch(&mut job, at);
        save_job(conn, &job)?;
    }
    Ok(execution)
}

impl DtsStorage {
    /// Executions of a job in insertion order. Callers sort by start time.
    pub async fn list_executions(&self, job_id: &str) -> Result<Vec<Execution>> {
        let job_id = job_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {EXECUTION_COLUMNS} FROM executions WHERE job_id = ?1 ORDER BY rowid"
            );
            let mut stmt = conn.prepare(&sql)?;
            let executions = stmt
                .query_map(rusqlite::params![job_id], execution_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(executions)
        })
        .await
    }

    pub async fn get_execution(&self, id: &str) -> Result<Execution> {
        let id = id.to_string();
        self.with_conn(move |conn| load_execution(conn, &id)).await
    }

    /// Worker callback: finalize a running execution exactly once.
    pub async fn finish_execution(
        &self,
        id: &str,
        outcome: ExecutionOutcome,
        at: DateTime<Utc>,
    ) -> Result<Execution> {
        let id = id.to_string();
        let capacity = self.capacity;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let execution = finalize(&tx, capacity, &id, outcome, at)?;
            tx.commit()?;
            info!(
                job_id = %execution.job_id,
                execution_id = %execution.id,
                status = ?execution.status,
                "Execution finished"
            );
            Ok(execution)
        })
        .await
    }

    /// Fail every running execution that outlived its job's
    /// `timeout_seconds` at `now`. A timeout of 0 never expires.
    pub async fn expire_timed_out_executions(&self, now: DateTime<Utc>) -> Result<Vec<Execution>> {
        let capacity = self.capacity;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let running = {
                let mut stmt = tx.prepare(
                    "SELECT e.id, e.start_time, j.timeout_seconds
                     FROM executions e JOIN jobs j ON j.id = e.job_id
                     WHERE e.status = 'RUNNING' AND j.timeout_seconds > 0
                     ORDER BY e.start_time, e.id",
                )?;
                stmt.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, time_col(row, 1)?, row.get::<_, i64>(2)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?
            };

            let mut expired = Vec::new();
            for (id, start_time, timeout_seconds) in running {
                if start_time + Duration::seconds(timeout_seconds) > now {
                    continue;
                }
                let outcome = ExecutionOutcome::Failed {
                    error: format!("timed out after {timeout_seconds}s"),
                };
                let execution = finalize(&tx, capacity, &id, outcome, now)?;
                warn!(job_id = %execution.job_id, execution_id = %execution.id, "Execution timed out");
                expired.push(execution);
            }
            tx.commit()?;
            Ok(expired)
        })
        .await
    }
}
