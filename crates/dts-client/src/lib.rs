//! dts-client: the three service boundaries the orchestrator talks to.
//!
//! Each service is a trait so the orchestrator can run against the HTTP
//! clients in [`http`] or in-process against [`local::LocalBackend`].

pub mod http;
pub mod local;
pub mod wire;

use async_trait::async_trait;

use dts_types::{
    Execution, ExecutionOutcome, Job, JobPatch, JobSpec, JobStatus, NewScheduledRun, Resources,
    ScheduledRun,
};

/// Failure of a single call against one service.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    /// The referenced record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The service refused the input (validation, capacity, finalized record).
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    /// Transport failure, timeout, or a response that could not be understood.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Owns canonical job definitions and their lifecycle status.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>>;
    /// Returns the id assigned to the new job.
    async fn create_job(&self, spec: &JobSpec) -> Result<String>;
    async fn get_job(&self, id: &str) -> Result<Job>;
    async fn update_job(&self, id: &str, patch: &JobPatch) -> Result<Job>;
    /// Transition to `CANCELLED`; a no-op when already cancelled.
    async fn cancel_job(&self, id: &str) -> Result<Job>;
    async fn delete_job(&self, id: &str) -> Result<()>;
}

/// Owns scheduled runs and the resources they reserve.
#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn list_scheduled_runs(&self, job_id: Option<&str>) -> Result<Vec<ScheduledRun>>;
    async fn create_scheduled_run(&self, request: &NewScheduledRun) -> Result<ScheduledRun>;
    /// Idempotent: succeeds when the run already fired or was cancelled.
    async fn cancel_scheduled_run(&self, id: &str) -> Result<()>;
    /// Fire a run for the job immediately.
    async fn run_now(&self, job_id: &str, resources: Resources) -> Result<Execution>;
}

/// Owns the execution history.
#[async_trait]
pub trait ExecutionTracker: Send + Sync {
    /// Unordered; callers sort by start time.
    async fn list_executions(&self, job_id: &str) -> Result<Vec<Execution>>;
    /// Worker callback finalizing a running execution.
    async fn finish_execution(&self, id: &str, outcome: &ExecutionOutcome) -> Result<Execution>;
}

/// Source of the bearer credential attached to outgoing calls.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<Option<String>>;
}

/// A fixed bearer token.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<Option<String>> {
        Ok(Some(self.0.clone()))
    }
}

/// No authentication.
pub struct NoToken;

#[async_trait]
impl TokenProvider for NoToken {
    async fn token(&self) -> Result<Option<String>> {
        Ok(None)
    }
}
