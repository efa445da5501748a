//! dts-types: shared domain model for the distributed task scheduler.
//!
//! Jobs live in the job registry, scheduled runs in the scheduler and
//! executions in the execution tracker. Cross-entity references are by id
//! only; no service owns another service's records.

pub mod schedule;
pub mod status;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use schedule::{CronSchedule, validate_cron};
pub use status::{InvalidTransition, JobStatus};

/// Lowest accepted job priority.
pub const MIN_PRIORITY: i32 = 1;
/// Highest accepted job priority.
pub const MAX_PRIORITY: i32 = 5;

/// Malformed input, rejected before it reaches any service.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("invalid cron expression {expression:?}: {reason}")]
    InvalidCron { expression: String, reason: String },
    #[error("priority must be between 1 and 5, got {0}")]
    PriorityOutOfRange(i32),
    #[error("{field} must not be negative, got {value}")]
    Negative { field: &'static str, value: i64 },
    #[error("resource {field} must be a positive number, got {value}")]
    NonPositiveResource { field: &'static str, value: f64 },
    #[error("execution time {0} is in the past")]
    FireTimeInPast(DateTime<Utc>),
    #[error("patch does not change any field")]
    EmptyPatch,
}

// ──────────────────── Jobs ────────────────────

/// Canonical job definition as held by the job registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub cron_expression: String,
    pub priority: i32,
    pub max_retries: i32,
    pub timeout_seconds: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Start of the most recent execution.
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    /// Next fire time among the job's active scheduled runs.
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
}

impl Job {
    /// The fields a caller controls, as they would be submitted at creation.
    pub fn spec(&self) -> JobSpec {
        JobSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            cron_expression: self.cron_expression.clone(),
            priority: self.priority,
            max_retries: self.max_retries,
            timeout_seconds: self.timeout_seconds,
            metadata: self.metadata.clone(),
        }
    }

    /// Check the cross-field timestamp invariants.
    pub fn timestamps_consistent(&self) -> bool {
        let updated = self.updated_at >= self.created_at;
        let next = match (self.last_run, self.next_run) {
            (Some(last), Some(next)) => next > last,
            _ => true,
        };
        updated && next
    }
}

/// Input for creating a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub cron_expression: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default)]
    pub max_retries: i32,
    #[serde(default)]
    pub timeout_seconds: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_priority() -> i32 {
    3
}

impl JobSpec {
    pub fn new(name: impl Into<String>, cron_expression: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            cron_expression: cron_expression.into(),
            priority: default_priority(),
            max_retries: 0,
            timeout_seconds: 0,
            metadata: HashMap::new(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_name(&self.name)?;
        validate_cron(&self.cron_expression)?;
        validate_priority(self.priority)?;
        validate_non_negative("max_retries", self.max_retries.into())?;
        validate_non_negative("timeout_seconds", self.timeout_seconds)?;
        validate_metadata(&self.metadata)
    }
}

/// Partial update of a job's mutable fields. Status is deliberately absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron_expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
    /// Replaces the whole metadata map when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

impl JobPatch {
    pub fn is_empty(&self) -> bool {
        self == &JobPatch::default()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.is_empty() {
            return Err(ValidationError::EmptyPatch);
        }
        if let Some(name) = &self.name {
            validate_name(name)?;
        }
        if let Some(expr) = &self.cron_expression {
            validate_cron(expr)?;
        }
        if let Some(priority) = self.priority {
            validate_priority(priority)?;
        }
        if let Some(retries) = self.max_retries {
            validate_non_negative("max_retries", retries.into())?;
        }
        if let Some(timeout) = self.timeout_seconds {
            validate_non_negative("timeout_seconds", timeout)?;
        }
        if let Some(metadata) = &self.metadata {
            validate_metadata(metadata)?;
        }
        Ok(())
    }

    /// Apply the present fields to `job`. Does not touch status or timestamps.
    pub fn apply_to(&self, job: &mut Job) {
        if let Some(name) = &self.name {
            job.name = name.clone();
        }
        if let Some(description) = &self.description {
            job.description = description.clone();
        }
        if let Some(expr) = &self.cron_expression {
            job.cron_expression = expr.trim().to_string();
        }
        if let Some(priority) = self.priority {
            job.priority = priority;
        }
        if let Some(retries) = self.max_retries {
            job.max_retries = retries;
        }
        if let Some(timeout) = self.timeout_seconds {
            job.timeout_seconds = timeout;
        }
        if let Some(metadata) = &self.metadata {
            job.metadata = metadata.clone();
        }
    }
}

fn validate_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::Empty("name"));
    }
    Ok(())
}

fn validate_priority(priority: i32) -> Result<(), ValidationError> {
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(ValidationError::PriorityOutOfRange(priority));
    }
    Ok(())
}

fn validate_non_negative(field: &'static str, value: i64) -> Result<(), ValidationError> {
    if value < 0 {
        return Err(ValidationError::Negative { field, value });
    }
    Ok(())
}

fn validate_metadata(metadata: &HashMap<String, String>) -> Result<(), ValidationError> {
    if metadata.keys().any(|k| k.trim().is_empty()) {
        return Err(ValidationError::Empty("metadata key"));
    }
    Ok(())
}

/// Reject an empty identifier before it is put into a request path.
pub fn validate_id(kind: &'static str, id: &str) -> Result<(), ValidationError> {
    if id.trim().is_empty() {
        return Err(ValidationError::Empty(kind));
    }
    Ok(())
}

// ──────────────────── Scheduled Runs ────────────────────

/// Resources reserved for one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu: f64,
    pub memory: f64,
    pub storage: f64,
}

impl Resources {
    pub fn new(cpu: f64, memory: f64, storage: f64) -> Self {
        Self {
            cpu,
            memory,
            storage,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("cpu", self.cpu),
            ("memory", self.memory),
            ("storage", self.storage),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ValidationError::NonPositiveResource { field, value });
            }
        }
        Ok(())
    }

    /// Whether every dimension of `self` fits into `available`.
    pub fn fits_within(&self, available: &Resources) -> bool {
        self.cpu <= available.cpu
            && self.memory <= available.memory
            && self.storage <= available.storage
    }

    pub fn minus(&self, other: &Resources) -> Resources {
        Resources::new(
            self.cpu - other.cpu,
            self.memory - other.memory,
            self.storage - other.storage,
        )
    }
}

/// A resource-bound future execution of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledRun {
    pub id: String,
    /// Weak reference: the job may have been deleted since.
    pub job_id: String,
    pub resource_requirements: Resources,
    pub next_execution_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Request body for creating a scheduled run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewScheduledRun {
    pub job_id: String,
    pub resource_requirements: Resources,
    /// Defaults to the job's next cron fire time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_execution_time: Option<DateTime<Utc>>,
}

impl NewScheduledRun {
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        validate_id("job id", &self.job_id)?;
        self.resource_requirements.validate()?;
        if let Some(when) = self.next_execution_time
            && when < now
        {
            return Err(ValidationError::FireTimeInPast(when));
        }
        Ok(())
    }
}

// ──────────────────── Executions ────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Running,
    Succeeded,
    Failed,
}

/// How a run ended, as reported by the worker that ran it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionOutcome {
    Succeeded { result: String },
    Failed { error: String },
}

impl ExecutionOutcome {
    pub fn status(&self) -> ExecutionStatus {
        match self {
            ExecutionOutcome::Succeeded { .. } => ExecutionStatus::Succeeded,
            ExecutionOutcome::Failed { .. } => ExecutionStatus::Failed,
        }
    }

    /// Job status the owning job moves to when this outcome is recorded.
    pub fn job_status(&self) -> JobStatus {
        match self {
            ExecutionOutcome::Succeeded { .. } => JobStatus::Completed,
            ExecutionOutcome::Failed { .. } => JobStatus::Failed,
        }
    }
}

/// The execution was already finalized.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("execution {id} already finished with status {status:?}")]
pub struct AlreadyFinalized {
    pub id: String,
    pub status: ExecutionStatus,
}

/// Record of one attempted run. Append-only once `end_time` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub job_id: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Execution {
    pub fn started(id: impl Into<String>, job_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            job_id: job_id.into(),
            status: ExecutionStatus::Running,
            start_time: at,
            end_time: None,
            result: None,
            error: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == ExecutionStatus::Running
    }

    /// Finalize exactly once.
    pub fn finish(
        &mut self,
        outcome: ExecutionOutcome,
        at: DateTime<Utc>,
    ) -> Result<(), AlreadyFinalized> {
        if !self.is_running() {
            return Err(AlreadyFinalized {
                id: self.id.clone(),
                status: self.status,
            });
        }
        self.status = outcome.status();
        self.end_time = Some(at.max(self.start_time));
        match outcome {
            ExecutionOutcome::Succeeded { result } => self.result = Some(result),
            ExecutionOutcome::Failed { error } => self.error = Some(error),
        }
        Ok(())
    }

    /// `end_time` iff finished, `result` iff succeeded, `error` iff failed.
    pub fn is_consistent(&self) -> bool {
        let ended = self.end_time.is_some() == !self.is_running();
        let result = self.result.is_some() == (self.status == ExecutionStatus::Succeeded);
        let error = self.error.is_some() == (self.status == ExecutionStatus::Failed);
        ended && result && error
    }
}

/// Order executions newest first. The tracker guarantees no ordering.
pub fn sort_newest_first(executions: &mut [Execution]) {
    executions.sort_by(|a, b| {
        b.start_time
            .cmp(&a.start_time)
            .then_with(|| b.id.cmp(&a.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn backup_spec() -> JobSpec {
        JobSpec {
            name: "backup".into(),
            description: String::new(),
            cron_expression: "0 * * * *".into(),
            priority: 3,
            max_retries: 2,
            timeout_seconds: 30,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_valid_spec() {
        assert!(backup_spec().validate().is_ok());
    }

    #[test]
    fn test_spec_rejections() {
        let mut spec = backup_spec();
        spec.name = "   ".into();
        assert_eq!(spec.validate(), Err(ValidationError::Empty("name")));

        let mut spec = backup_spec();
        spec.priority = 6;
        assert_eq!(spec.validate(), Err(ValidationError::PriorityOutOfRange(6)));

        let mut spec = backup_spec();
        spec.max_retries = -1;
        assert_eq!(
            spec.validate(),
            Err(ValidationError::Negative {
                field: "max_retries",
                value: -1
            })
        );

        let mut spec = backup_spec();
        spec.timeout_seconds = -5;
        assert!(matches!(
            spec.validate(),
            Err(ValidationError::Negative {
                field: "timeout_seconds",
                ..
            })
        ));

        let mut spec = backup_spec();
        spec.cron_expression = "not a cron".into();
        assert!(matches!(
            spec.validate(),
            Err(ValidationError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_spec_defaults_from_json() {
        let json = r#"{"name":"report","cron_expression":"@daily"}"#;
        let spec: JobSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.priority, 3);
        assert_eq!(spec.max_retries, 0);
        assert!(spec.metadata.is_empty());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_patch_validation_and_apply() {
        assert_eq!(JobPatch::default().validate(), Err(ValidationError::EmptyPatch));

        let bad = JobPatch {
            priority: Some(0),
            ..Default::default()
        };
        assert_eq!(bad.validate(), Err(ValidationError::PriorityOutOfRange(0)));

        let now = Utc::now();
        let mut job = Job {
            id: "job-1".into(),
            name: "backup".into(),
            description: String::new(),
            cron_expression: "0 * * * *".into(),
            priority: 3,
            max_retries: 2,
            timeout_seconds: 30,
            metadata: HashMap::new(),
            status: JobStatus::Scheduled,
            created_at: now,
            updated_at: now,
            last_run: None,
            next_run: None,
        };
        let patch = JobPatch {
            description: Some("x".into()),
            ..Default::default()
        };
        assert!(patch.validate().is_ok());
        patch.apply_to(&mut job);
        assert_eq!(job.description, "x");
        assert_eq!(job.name, "backup");
        assert_eq!(job.status, JobStatus::Scheduled);
    }

    #[test]
    fn test_patch_serializes_only_present_fields() {
        let patch = JobPatch {
            description: Some("x".into()),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_string(&patch).unwrap(),
            r#"{"description":"x"}"#
        );
    }

    #[test]
    fn test_resources() {
        assert!(Resources::new(1.0, 2.0, 1.0).validate().is_ok());
        assert!(Resources::new(0.0, 2.0, 1.0).validate().is_err());
        assert!(Resources::new(1.0, -2.0, 1.0).validate().is_err());
        assert!(Resources::new(1.0, 2.0, f64::NAN).validate().is_err());

        let capacity = Resources::new(4.0, 8.0, 10.0);
        let need = Resources::new(1.0, 2.0, 1.0);
        assert!(need.fits_within(&capacity));
        assert!(!Resources::new(5.0, 1.0, 1.0).fits_within(&capacity));
        assert_eq!(capacity.minus(&need), Resources::new(3.0, 6.0, 9.0));
    }

    #[test]
    fn test_new_run_rejects_past_time() {
        let now = Utc::now();
        let run = NewScheduledRun {
            job_id: "job-1".into(),
            resource_requirements: Resources::new(1.0, 2.0, 1.0),
            next_execution_time: Some(now - Duration::minutes(1)),
        };
        assert!(matches!(
            run.validate(now),
            Err(ValidationError::FireTimeInPast(_))
        ));

        let run = NewScheduledRun {
            next_execution_time: None,
            ..run
        };
        assert!(run.validate(now).is_ok());
    }

    #[test]
    fn test_execution_finishes_once() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap();
        let mut exec = Execution::started("exec-1", "job-1", start);
        assert!(exec.is_consistent());

        let end = start + Duration::minutes(5);
        exec.finish(
            ExecutionOutcome::Succeeded {
                result: "ok".into(),
            },
            end,
        )
        .unwrap();
        assert_eq!(exec.status, ExecutionStatus::Succeeded);
        assert_eq!(exec.end_time, Some(end));
        assert_eq!(exec.result.as_deref(), Some("ok"));
        assert!(exec.is_consistent());

        let err = exec
            .finish(
                ExecutionOutcome::Failed {
                    error: "late".into(),
                },
                end,
            )
            .unwrap_err();
        assert_eq!(err.status, ExecutionStatus::Succeeded);
        assert!(exec.error.is_none());
    }

    #[test]
    fn test_outcome_serde() {
        let outcome: ExecutionOutcome =
            serde_json::from_str(r#"{"status":"FAILED","error":"boom"}"#).unwrap();
        assert_eq!(outcome.status(), ExecutionStatus::Failed);
        assert_eq!(outcome.job_status(), JobStatus::Failed);
    }

    #[test]
    fn test_sort_newest_first() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let mut list = vec![
            Execution::started("a", "job", t),
            Execution::started("c", "job", t + Duration::hours(2)),
            Execution::started("b", "job", t + Duration::hours(1)),
        ];
        sort_newest_first(&mut list);
        let ids = list.iter().map(|e| e.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, ["c", "b", "a"]);
    }

    #[test]
    fn test_job_timestamp_invariants() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let mut job = Job {
            id: "j".into(),
            name: "n".into(),
            description: String::new(),
            cron_expression: "@hourly".into(),
            priority: 1,
            max_retries: 0,
            timeout_seconds: 0,
            metadata: HashMap::new(),
            status: JobStatus::Pending,
            created_at: t,
            updated_at: t,
            last_run: Some(t),
            next_run: Some(t + Duration::hours(1)),
        };
        assert!(job.timestamps_consistent());
        job.next_run = Some(t);
        assert!(!job.timestamps_consistent());
    }
}
