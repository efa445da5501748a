//! dts-orchestrator: user intents resolved into ordered service calls.
//!
//! Every intent validates its input first, then calls the owning
//! service(s), then re-reads the affected entities so callers only ever
//! see canonical state. Each service call is bounded by a timeout.

pub mod error;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};

use dts_client::http::{HttpExecutionTracker, HttpJobRegistry, HttpScheduler, HttpTransport};
use dts_client::local::LocalBackend;
use dts_client::{ExecutionTracker, JobRegistry, Scheduler, TokenProvider};
use dts_config::ServicesConfig;
use dts_hooks::events::IntentEvent;
use dts_hooks::registry::HookRegistry;
use dts_storage::DtsStorage;
use dts_types::{
    Execution, ExecutionOutcome, Job, JobPatch, JobSpec, JobStatus, NewScheduledRun, Resources,
    ScheduledRun, sort_newest_first, validate_id,
};

pub use error::{CancelStep, OrchestratorError, Result, Service};

/// Bound on a single service call unless configured otherwise.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// A job together with its active runs and execution history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub job: Job,
    /// Soonest first.
    pub runs: Vec<ScheduledRun>,
    /// Newest first.
    pub executions: Vec<Execution>,
}

/// Result of a schedule-run intent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledJob {
    pub job: Job,
    pub run: ScheduledRun,
    /// All active runs of the job after scheduling.
    pub runs: Vec<ScheduledRun>,
}

/// Result of a run-now intent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartedJob {
    pub job: Job,
    pub execution: Execution,
}

/// Result of finalizing an execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinishedExecution {
    pub execution: Execution,
    /// `None` when the job was deleted while the execution ran.
    pub job: Option<Job>,
}

pub struct Orchestrator {
    registry: Arc<dyn JobRegistry>,
    scheduler: Arc<dyn Scheduler>,
    tracker: Arc<dyn ExecutionTracker>,
    call_timeout: Duration,
    hooks: Option<Arc<HookRegistry>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<dyn JobRegistry>,
        scheduler: Arc<dyn Scheduler>,
        tracker: Arc<dyn ExecutionTracker>,
    ) -> Self {
        Self {
            registry,
            scheduler,
            tracker,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            hooks: None,
        }
    }

    /// All three services backed by one local database.
    pub fn local(storage: Arc<DtsStorage>) -> Self {
        let backend = Arc::new(LocalBackend::new(storage));
        Self::new(backend.clone(), backend.clone(), backend)
    }

    /// HTTP clients for the configured service URLs.
    pub fn from_config(services: &ServicesConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let unavailable = |service: Service| {
            move |e: dts_client::ServiceError| OrchestratorError::from_service(service, e)
        };
        let http = HttpTransport::new(services.request_timeout(), tokens)
            .map_err(unavailable(Service::JobRegistry))?;
        let registry = HttpJobRegistry::new(&services.job_registry_url, http.clone())
            .map_err(unavailable(Service::JobRegistry))?;
        let scheduler = HttpScheduler::new(&services.scheduler_url, http.clone())
            .map_err(unavailable(Service::Scheduler))?;
        let tracker = HttpExecutionTracker::new(&services.execution_url, http)
            .map_err(unavailable(Service::ExecutionTracker))?;
        Ok(
            Self::new(Arc::new(registry), Arc::new(scheduler), Arc::new(tracker))
                .with_call_timeout(services.request_timeout()),
        )
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Run one service call under the call timeout.
    async fn call<T>(
        &self,
        service: Service,
        op: &'static str,
        fut: impl Future<Output = dts_client::Result<T>>,
    ) -> Result<T> {
        debug!(%service, op, "Calling service");
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result.map_err(|e| OrchestratorError::from_service(service, e)),
            Err(_) => {
                warn!(%service, op, timeout_ms = self.call_timeout.as_millis() as u64, "Service call timed out");
                Err(OrchestratorError::ServiceUnavailable {
                    service,
                    reason: format!("{op} timed out after {:?}", self.call_timeout),
                })
            }
        }
    }

    async fn emit(&self, event: IntentEvent) {
        if let Some(hooks) = &self.hooks {
            hooks.emit(event).await;
        }
    }

    async fn fetch_job(&self, job_id: &str) -> Result<Job> {
        self.call(Service::JobRegistry, "getJob", self.registry.get_job(job_id))
            .await
    }

    async fn fetch_runs(&self, job_id: Option<&str>) -> Result<Vec<ScheduledRun>> {
        self.call(
            Service::Scheduler,
            "listScheduledRuns",
            self.scheduler.list_scheduled_runs(job_id),
        )
        .await
    }

    // ─── Reads ───────────────────────────────────────────

    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        validate_id("job id", job_id)?;
        self.fetch_job(job_id).await
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        self.call(Service::JobRegistry, "listJobs", self.registry.list_jobs(status))
            .await
    }

    pub async fn list_scheduled_runs(&self, job_id: Option<&str>) -> Result<Vec<ScheduledRun>> {
        if let Some(job_id) = job_id {
            validate_id("job id", job_id)?;
        }
        self.fetch_runs(job_id).await
    }

    /// Execution history of a job, newest first. Empty if it never ran.
    pub async fn list_executions(&self, job_id: &str) -> Result<Vec<Execution>> {
        validate_id("job id", job_id)?;
        let mut executions = self
            .call(
                Service::ExecutionTracker,
                "listExecutions",
                self.tracker.list_executions(job_id),
            )
            .await?;
        sort_newest_first(&mut executions);
        Ok(executions)
    }

    pub async fn job_view(&self, job_id: &str) -> Result<JobView> {
        validate_id("job id", job_id)?;
        let (job, runs, executions) = tokio::try_join!(
            self.fetch_job(job_id),
            self.fetch_runs(Some(job_id)),
            self.list_executions(job_id)
        )?;
        Ok(JobView {
            job,
            runs,
            executions,
        })
    }

    // ─── Job intents ─────────────────────────────────────

    pub async fn create_job(&self, spec: JobSpec) -> Result<Job> {
        spec.validate()?;
        let job_id = self
            .call(Service::JobRegistry, "createJob", self.registry.create_job(&spec))
            .await?;
        let job = self.fetch_job(&job_id).await?;
        info!(job_id = %job.id, name = %job.name, "Job created");
        self.emit(IntentEvent::JobCreated {
            job_id: job.id.clone(),
            name: job.name.clone(),
        })
        .await;
        Ok(job)
    }

    /// Update mutable fields. Returns the re-read job, not the patch echo.
    pub async fn edit_job(&self, job_id: &str, patch: JobPatch) -> Result<Job> {
        validate_id("job id", job_id)?;
        patch.validate()?;
        self.call(
            Service::JobRegistry,
            "updateJob",
            self.registry.update_job(job_id, &patch),
        )
        .await?;
        let job = self.fetch_job(job_id).await?;
        info!(job_id = %job.id, "Job edited");
        self.emit(IntentEvent::JobEdited {
            job_id: job.id.clone(),
        })
        .await;
        Ok(job)
    }

    /// Delete unconditionally. Active runs are left for the scheduler to
    /// collect; execution history is kept.
    pub async fn delete_job(&self, job_id: &str) -> Result<()> {
        validate_id("job id", job_id)?;
        self.call(Service::JobRegistry, "deleteJob", self.registry.delete_job(job_id))
            .await?;
        info!(job_id = %job_id, "Job deleted");
        self.emit(IntentEvent::JobDeleted {
            job_id: job_id.to_string(),
        })
        .await;
        Ok(())
    }

    /// Cancel every active run of the job, then mark it `CANCELLED`.
    ///
    /// A job that already finished its cycle (`COMPLETED`, `FAILED`,
    /// `CANCELLED`) is rejected before anything is changed. When the
    /// sequence stops after some runs were cancelled the error is
    /// [`OrchestratorError::PartialFailure`]; retrying the whole intent or
    /// [`Orchestrator::finish_cancel`] is safe.
    pub async fn cancel_job(&self, job_id: &str) -> Result<Job> {
        validate_id("job id", job_id)?;
        let job = self.fetch_job(job_id).await?;
        job.status.transition(JobStatus::Cancelled)?;

        let runs = self.fetch_runs(Some(job_id)).await?;
        debug!(job_id = %job_id, runs = runs.len(), "Cancelling scheduled runs");

        let results = join_all(runs.iter().map(|run| {
            self.call(
                Service::Scheduler,
                "cancelScheduledRun",
                self.scheduler.cancel_scheduled_run(&run.id),
            )
        }))
        .await;
        let runs_cancelled = results.iter().filter(|r| r.is_ok()).count();
        if let Some(err) = results.into_iter().find_map(|r| r.err()) {
            return Err(self
                .stopped(job_id, &[CancelStep::ListRuns], CancelStep::CancelRuns, runs_cancelled, err)
                .await);
        }

        debug!(job_id = %job_id, "Marking job cancelled");
        if let Err(err) = self
            .call(Service::JobRegistry, "cancelJob", self.registry.cancel_job(job_id))
            .await
        {
            return Err(self
                .stopped(
                    job_id,
                    &[CancelStep::ListRuns, CancelStep::CancelRuns],
                    CancelStep::MarkCancelled,
                    runs_cancelled,
                    err,
                )
                .await);
        }

        let job = self.fetch_job(job_id).await?;
        info!(job_id = %job.id, runs_cancelled, "Job cancelled");
        self.emit(IntentEvent::JobCancelled {
            job_id: job.id.clone(),
            runs_cancelled,
        })
        .await;
        Ok(job)
    }

    /// Retry only the final step of [`Orchestrator::cancel_job`]. A job that
    /// already is `CANCELLED` is returned unchanged.
    pub async fn finish_cancel(&self, job_id: &str) -> Result<Job> {
        validate_id("job id", job_id)?;
        self.call(Service::JobRegistry, "cancelJob", self.registry.cancel_job(job_id))
            .await?;
        let job = self.fetch_job(job_id).await?;
        info!(job_id = %job.id, "Job cancel completed");
        self.emit(IntentEvent::JobCancelled {
            job_id: job.id.clone(),
            runs_cancelled: 0,
        })
        .await;
        Ok(job)
    }

    /// Classify a cancel-job failure. Nothing changed if no run was
    /// cancelled, so the plain error is returned.
    async fn stopped(
        &self,
        job_id: &str,
        completed: &[CancelStep],
        failed: CancelStep,
        runs_cancelled: usize,
        err: OrchestratorError,
    ) -> OrchestratorError {
        if runs_cancelled == 0 {
            return err;
        }
        warn!(job_id = %job_id, step = %failed, runs_cancelled, "Cancel stopped part-way: {err}");
        self.emit(IntentEvent::PartiallyFailed {
            intent: "cancel_job".into(),
            job_id: job_id.to_string(),
            completed: completed.iter().map(|s| s.to_string()).collect(),
            error: err.to_string(),
        })
        .await;
        OrchestratorError::PartialFailure {
            job_id: job_id.to_string(),
            completed: completed.to_vec(),
            failed,
            runs_cancelled,
            source: Box::new(err),
        }
    }

    // ─── Run intents ─────────────────────────────────────

    /// Reserve resources for a future run. Without `when` the run fires at
    /// the job's next cron time.
    pub async fn schedule_run(
        &self,
        job_id: &str,
        resources: Resources,
        when: Option<DateTime<Utc>>,
    ) -> Result<ScheduledJob> {
        let request = NewScheduledRun {
            job_id: job_id.to_string(),
            resource_requirements: resources,
            next_execution_time: when,
        };
        request.validate(Utc::now())?;
        let created = self
            .call(
                Service::Scheduler,
                "createScheduledRun",
                self.scheduler.create_scheduled_run(&request),
            )
            .await?;

        let (job, runs) = tokio::try_join!(self.fetch_job(job_id), self.fetch_runs(Some(job_id)))?;
        // The run may already have fired by the time it is re-read.
        let run = runs
            .iter()
            .find(|r| r.id == created.id)
            .cloned()
            .unwrap_or(created);
        info!(job_id = %job.id, run_id = %run.id, at = %run.next_execution_time, "Run scheduled");
        self.emit(IntentEvent::RunScheduled {
            job_id: job.id.clone(),
            run_id: run.id.clone(),
        })
        .await;
        Ok(ScheduledJob { job, run, runs })
    }

    /// Succeeds when the run already fired or was cancelled.
    pub async fn cancel_scheduled_run(&self, run_id: &str) -> Result<()> {
        validate_id("scheduled run id", run_id)?;
        self.call(
            Service::Scheduler,
            "cancelScheduledRun",
            self.scheduler.cancel_scheduled_run(run_id),
        )
        .await?;
        info!(run_id = %run_id, "Scheduled run cancelled");
        self.emit(IntentEvent::RunCancelled {
            run_id: run_id.to_string(),
        })
        .await;
        Ok(())
    }

    /// Start the job immediately.
    pub async fn run_now(&self, job_id: &str, resources: Resources) -> Result<StartedJob> {
        validate_id("job id", job_id)?;
        resources.validate()?;
        let started = self
            .call(
                Service::Scheduler,
                "runNow",
                self.scheduler.run_now(job_id, resources),
            )
            .await?;
        let job = self.fetch_job(job_id).await?;
        let execution = self
            .list_executions(job_id)
            .await?
            .into_iter()
            .find(|e| e.id == started.id)
            .unwrap_or(started);
        info!(job_id = %job.id, execution_id = %execution.id, "Job started");
        self.emit(IntentEvent::JobStarted {
            job_id: job.id.clone(),
            execution_id: execution.id.clone(),
        })
        .await;
        Ok(StartedJob { job, execution })
    }

    /// Record how a running execution ended.
    pub async fn finish_execution(
        &self,
        execution_id: &str,
        outcome: ExecutionOutcome,
    ) -> Result<FinishedExecution> {
        validate_id("execution id", execution_id)?;
        let finished = self
            .call(
                Service::ExecutionTracker,
                "finishExecution",
                self.tracker.finish_execution(execution_id, &outcome),
            )
            .await?;

        let job = match self.fetch_job(&finished.job_id).await {
            Ok(job) => Some(job),
            Err(OrchestratorError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        let execution = self
            .list_executions(&finished.job_id)
            .await?
            .into_iter()
            .find(|e| e.id == finished.id)
            .unwrap_or(finished);
        info!(job_id = %execution.job_id, execution_id = %execution.id, status = ?execution.status, "Execution finished");
        self.emit(IntentEvent::ExecutionFinished {
            job_id: execution.job_id.clone(),
            execution_id: execution.id.clone(),
            status: execution.status,
            job_status: job.as_ref().map(|j| j.status),
        })
        .await;
        Ok(FinishedExecution { execution, job })
    }
}
