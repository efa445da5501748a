//! Scheduler tables: scheduled runs, firing and orphan collection.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, warn};

use dts_types::{
    CronSchedule, Execution, InvalidTransition, Job, JobStatus, NewScheduledRun, Resources,
    ScheduledRun, ValidationError,
};

use crate::registry::{find_job, load_job, refresh_next_run, save_job};
use crate::tracker::{has_running_execution, insert_execution};
use crate::{DtsStorage, RecordKind, Result, StorageError, fmt_time, reserve, time_col, touch};

const RUN_COLUMNS: &str = "id, job_id, cpu, memory, storage, next_execution_time, created_at";

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledRun> {
    Ok(ScheduledRun {
        id: row.get(0)?,
        job_id: row.get(1)?,
        resource_requirements: Resources::new(row.get(2)?, row.get(3)?, row.get(4)?),
        next_execution_time: time_col(row, 5)?,
        created_at: time_col(row, 6)?,
    })
}

fn insert_run(conn: &Connection, run: &ScheduledRun, attempt: u32) -> Result<()> {
    conn.execute(
        "INSERT INTO scheduled_runs (id, job_id, cpu, memory, storage, next_execution_time, created_at, attempt)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            run.id,
            run.job_id,
            run.resource_requirements.cpu,
            run.resource_requirements.memory,
            run.resource_requirements.storage,
            fmt_time(run.next_execution_time),
            fmt_time(run.created_at),
            attempt,
        ],
    )?;
    Ok(())
}

/// Insert a run whose resources the caller already reserved.
pub(crate) fn arm_run(
    conn: &Connection,
    job_id: &str,
    resources: Resources,
    fire_at: DateTime<Utc>,
    attempt: u32,
    created_at: DateTime<Utc>,
) -> Result<ScheduledRun> {
    let run = ScheduledRun {
        id: uuid::Uuid::new_v4().to_string(),
        job_id: job_id.to_string(),
        resource_requirements: resources,
        next_execution_time: fire_at,
        created_at,
    };
    insert_run(conn, &run, attempt)?;
    Ok(run)
}

pub(crate) fn runs_for_job(conn: &Connection, job_id: &str) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM scheduled_runs WHERE job_id = ?1",
        rusqlite::params![job_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Single-flight: a job with a running execution cannot be scheduled again,
/// even after it was cancelled while that execution kept going.
fn ensure_not_running(conn: &Connection, job: &Job) -> Result<()> {
    if job.status == JobStatus::Running || has_running_execution(conn, &job.id)? {
        return Err(InvalidTransition {
            from: JobStatus::Running,
            to: JobStatus::Scheduled,
        }
        .into());
    }
    Ok(())
}

/// Enter `SCHEDULED` from `PENDING` or a terminal status.
fn enter_scheduled(job: &mut Job) -> Result<()> {
    if job.status != JobStatus::Scheduled {
        job.status = job.status.transition(JobStatus::Scheduled)?;
    }
    Ok(())
}

/// Consume a run's reservation into a new `RUNNING` execution.
fn start_execution(
    conn: &Connection,
    job: &mut Job,
    resources: &Resources,
    at: DateTime<Utc>,
    attempt: u32,
) -> Result<Execution> {
    enter_scheduled(job)?;
    job.status = job.status.transition(JobStatus::Running)?;
    job.last_run = Some(at);
    refresh_next_run(conn, job)?;
    touch(job, at);
    save_job(conn, job)?;

    let execution = Execution::started(uuid::Uuid::new_v4().to_string(), job.id.clone(), at);
    insert_execution(conn, &execution, resources, attempt)?;
    Ok(execution)
}

/// After a run disappeared without firing: recompute `next_run` and fall
/// back to `PENDING` when nothing is scheduled any more.
fn after_run_removed(conn: &Connection, job_id: &str) -> Result<()> {
    let Some(mut job) = find_job(conn, job_id)? else {
        return Ok(());
    };
    refresh_next_run(conn, &mut job)?;
    if job.status == JobStatus::Scheduled && runs_for_job(conn, job_id)? == 0 {
        job.status = job.status.transition(JobStatus::Pending)?;
    }
    touch(&mut job, crate::now());
    save_job(conn, &job)
}

impl DtsStorage {
    /// Create a run for an existing job, reserving its resources.
    ///
    /// Without an explicit time the run fires at the job's next cron time.
    pub async fn create_scheduled_run(&self, request: NewScheduledRun) -> Result<ScheduledRun> {
        let at = crate::now();
        request.validate(at)?;
        let capacity = self.capacity;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut job = load_job(&tx, &request.job_id)?;
            ensure_not_running(&tx, &job)?;

            let fire_at = match request.next_execution_time {
                Some(t) => t,
                None => CronSchedule::parse(&job.cron_expression)?
                    .next_after(at)
                    .ok_or_else(|| ValidationError::InvalidCron {
                        expression: job.cron_expression.clone(),
                        reason: "schedule never fires again".into(),
                    })?,
            };

            reserve(&tx, capacity, &request.resource_requirements)?;
            let run = arm_run(&tx, &job.id, request.resource_requirements, fire_at, 0, at)?;

            enter_scheduled(&mut job)?;
            refresh_next_run(&tx, &mut job)?;
            touch(&mut job, at);
            save_job(&tx, &job)?;
            tx.commit()?;

            info!(job_id = %run.job_id, run_id = %run.id, at = %run.next_execution_time, "Run scheduled");
            Ok(run)
        })
        .await
    }

    /// List active runs, soonest first, optionally for a single job.
    pub async fn list_scheduled_runs(&self, job_id: Option<String>) -> Result<Vec<ScheduledRun>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {RUN_COLUMNS} FROM scheduled_runs
                 WHERE ?1 IS NULL OR job_id = ?1
                 ORDER BY next_execution_time, id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let runs = stmt
                .query_map(rusqlite::params![job_id], run_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(runs)
        })
        .await
    }

    /// Cancel a run. Returns whether a run was removed; an unknown id is
    /// not an error because the run may already have fired.
    pub async fn cancel_scheduled_run(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let sql = format!("SELECT {RUN_COLUMNS} FROM scheduled_runs WHERE id = ?1");
            let Some(run) = tx
                .query_row(&sql, rusqlite::params![id], run_from_row)
                .optional()?
            else {
                debug!(run_id = %id, "Run already gone");
                return Ok(false);
            };
            tx.execute(
                "DELETE FROM scheduled_runs WHERE id = ?1",
                rusqlite::params![run.id],
            )?;
            after_run_removed(&tx, &run.job_id)?;
            tx.commit()?;
            info!(job_id = %run.job_id, run_id = %run.id, "Run cancelled");
            Ok(true)
        })
        .await
    }

    /// Remove runs whose job no longer exists. Returns how many were removed.
    pub async fn collect_orphaned_runs(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM scheduled_runs
                 WHERE job_id NOT IN (SELECT id FROM jobs)",
                [],
            )?;
            if removed > 0 {
                info!("Collected {removed} orphaned scheduled runs");
            }
            Ok(removed)
        })
        .await
    }

    /// Fire every run due at `now`, higher job priority first. A due run
    /// whose job has a running execution stays in place until it finishes.
    pub async fn fire_due_runs(&self, now: DateTime<Utc>) -> Result<Vec<Execution>> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let due = {
                let mut stmt = tx.prepare(
                    "SELECT r.id, r.job_id, r.cpu, r.memory, r.storage,
                            r.next_execution_time, r.created_at, r.attempt
                     FROM scheduled_runs r LEFT JOIN jobs j ON j.id = r.job_id
                     WHERE r.next_execution_time <= ?1
                     ORDER BY COALESCE(j.priority, 0) DESC, r.next_execution_time, r.id",
                )?;
                stmt.query_map(rusqlite::params![fmt_time(now)], |row| {
                    Ok((run_from_row(row)?, row.get::<_, u32>(7)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?
            };

            let mut started = Vec::new();
            for (run, attempt) in due {
                let Some(mut job) = find_job(&tx, &run.job_id)? else {
                    tx.execute(
                        "DELETE FROM scheduled_runs WHERE id = ?1",
                        rusqlite::params![run.id],
                    )?;
                    debug!(run_id = %run.id, "Dropped run of deleted job");
                    continue;
                };
                if job.status == JobStatus::Running || has_running_execution(&tx, &job.id)? {
                    debug!(job_id = %job.id, run_id = %run.id, "Job still running, run deferred");
                    continue;
                }

                tx.execute(
                    "DELETE FROM scheduled_runs WHERE id = ?1",
                    rusqlite::params![run.id],
                )?;
                match start_execution(&tx, &mut job, &run.resource_requirements, now, attempt) {
                    Ok(execution) => {
                        info!(job_id = %job.id, run_id = %run.id, execution_id = %execution.id, "Run fired");
                        started.push(execution);
                    }
                    Err(StorageError::InvalidTransition(e)) => {
                        warn!(job_id = %job.id, run_id = %run.id, "Dropping run that cannot fire: {e}");
                    }
                    Err(e) => return Err(e),
                }
            }
            tx.commit()?;
            Ok(started)
        })
        .await
    }

    /// Start an execution immediately, bypassing a stored run.
    pub async fn run_now(&self, job_id: &str, resources: Resources) -> Result<Execution> {
        resources.validate()?;
        let job_id = job_id.to_string();
        let capacity = self.capacity;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut job = load_job(&tx, &job_id)?;
            ensure_not_running(&tx, &job)?;
            reserve(&tx, capacity, &resources)?;
            let execution = start_execution(&tx, &mut job, &resources, crate::now(), 0)?;
            tx.commit()?;
            info!(job_id = %job.id, execution_id = %execution.id, "Job started on demand");
            Ok(execution)
        })
        .await
    }

    /// Look up one run.
    pub async fn get_scheduled_run(&self, id: &str) -> Result<ScheduledRun> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {RUN_COLUMNS} FROM scheduled_runs WHERE id = ?1");
            conn.query_row(&sql, rusqlite::params![id], run_from_row)
                .optional()?
                .ok_or_else(|| StorageError::not_found(RecordKind::ScheduledRun, &id))
        })
        .await
    }
}
