//! Job registry tables.

use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension};

use dts_types::{Job, JobPatch, JobSpec, JobStatus};

use crate::{
    DtsStorage, RecordKind, Result, StorageError, conversion_error, fmt_time, now,
    opt_time_col, status_col, time_col, touch,
};

const JOB_COLUMNS: &str = "id, name, description, cron_expression, priority, max_retries,
     timeout_seconds, metadata, status, created_at, updated_at, last_run, next_run";

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let metadata: String = row.get(7)?;
    let metadata: HashMap<String, String> =
        serde_json::from_str(&metadata).map_err(|e| conversion_error(7, e.to_string()))?;
    Ok(Job {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        cron_expression: row.get(3)?,
        priority: row.get(4)?,
        max_retries: row.get(5)?,
        timeout_seconds: row.get(6)?,
        metadata,
        status: status_col(row, 8)?,
        created_at: time_col(row, 9)?,
        updated_at: time_col(row, 10)?,
        last_run: opt_time_col(row, 11)?,
        next_run: opt_time_col(row, 12)?,
    })
}

pub(crate) fn find_job(conn: &Connection, id: &str) -> Result<Option<Job>> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
    Ok(conn
        .query_row(&sql, rusqlite::params![id], job_from_row)
        .optional()?)
}

pub(crate) fn load_job(conn: &Connection, id: &str) -> Result<Job> {
    find_job(conn, id)?.ok_or_else(|| StorageError::not_found(RecordKind::Job, id))
}

pub(crate) fn save_job(conn: &Connection, job: &Job) -> Result<()> {
    let metadata = serde_json::to_string(&job.metadata)
        .map_err(|e| conversion_error(7, e.to_string()))?;
    conn.execute(
        "INSERT INTO jobs (id, name, description, cron_expression, priority, max_retries,
            timeout_seconds, metadata, status, created_at, updated_at, last_run, next_run)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            description = excluded.description,
            cron_expression = excluded.cron_expression,
            priority = excluded.priority,
            max_retries = excluded.max_retries,
            timeout_seconds = excluded.timeout_seconds,
            metadata = excluded.metadata,
            status = excluded.status,
            updated_at = excluded.updated_at,
            last_run = excluded.last_run,
            next_run = excluded.next_run",
        rusqlite::params![
            job.id,
            job.name,
            job.description,
            job.cron_expression,
            job.priority,
            job.max_retries,
            job.timeout_seconds,
            metadata,
            job.status.as_str(),
            fmt_time(job.created_at),
            fmt_time(job.updated_at),
            job.last_run.map(fmt_time),
            job.next_run.map(fmt_time),
        ],
    )?;
    Ok(())
}

/// Recompute `next_run` from the job's active runs. Runs at or before
/// `last_run` are ignored so `next_run > last_run` always holds.
pub(crate) fn refresh_next_run(conn: &Connection, job: &mut Job) -> Result<()> {
    let next: Option<String> = conn.query_row(
        "SELECT MIN(next_execution_time) FROM scheduled_runs
         WHERE job_id = ?1 AND (?2 IS NULL OR next_execution_time > ?2)",
        rusqlite::params![job.id, job.last_run.map(fmt_time)],
        |row| row.get(0),
    )?;
    job.next_run = next
        .map(|raw| crate::parse_time(0, &raw))
        .transpose()?;
    Ok(())
}

impl DtsStorage {
    /// Create a job in `PENDING` status.
    pub async fn create_job(&self, spec: JobSpec) -> Result<Job> {
        spec.validate()?;
        let at = now();
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            name: spec.name,
            description: spec.description,
            cron_expression: spec.cron_expression.trim().to_string(),
            priority: spec.priority,
            max_retries: spec.max_retries,
            timeout_seconds: spec.timeout_seconds,
            metadata: spec.metadata,
            status: JobStatus::Pending,
            created_at: at,
            updated_at: at,
            last_run: None,
            next_run: None,
        };
        let saved = job.clone();
        self.with_conn(move |conn| save_job(conn, &saved)).await?;
        tracing::debug!(job_id = %job.id, "Job created");
        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        let id = id.to_string();
        self.with_conn(move |conn| load_job(conn, &id)).await
    }

    /// List jobs, oldest first, optionally filtered by status.
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {JOB_COLUMNS} FROM jobs
                 WHERE ?1 IS NULL OR status = ?1
                 ORDER BY created_at, id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let jobs = stmt
                .query_map(rusqlite::params![status.map(|s| s.as_str())], job_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(jobs)
        })
        .await
    }

    /// Apply a patch to the mutable fields. Status is never changed here.
    pub async fn update_job(&self, id: &str, patch: JobPatch) -> Result<Job> {
        patch.validate()?;
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut job = load_job(&tx, &id)?;
            patch.apply_to(&mut job);
            touch(&mut job, now());
            save_job(&tx, &job)?;
            tx.commit()?;
            Ok(job)
        })
        .await
    }

    /// Move the job to `CANCELLED`. A job that already is cancelled is
    /// returned unchanged. Scheduled runs are not touched.
    pub async fn cancel_job(&self, id: &str) -> Result<Job> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let mut job = load_job(&tx, &id)?;
            if job.status == JobStatus::Cancelled {
                return Ok(job);
            }
            job.status = job.status.transition(JobStatus::Cancelled)?;
            touch(&mut job, now());
            save_job(&tx, &job)?;
            tx.commit()?;
            tracing::info!(job_id = %job.id, "Job cancelled");
            Ok(job)
        })
        .await
    }

    /// Delete the job record. Scheduled runs and executions are left alone:
    /// runs become orphans for the scheduler to collect, history survives.
    pub async fn delete_job(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let count = conn.execute("DELETE FROM jobs WHERE id = ?1", rusqlite::params![id])?;
            if count == 0 {
                return Err(StorageError::not_found(RecordKind::Job, &id));
            }
            tracing::info!(job_id = %id, "Job deleted");
            Ok(())
        })
        .await
    }
}
