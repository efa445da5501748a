//! In-process backend over [`DtsStorage`].

use std::sync::Arc;

use async_trait::async_trait;

use dts_storage::{DtsStorage, StorageError};
use dts_types::{
    Execution, ExecutionOutcome, Job, JobPatch, JobSpec, JobStatus, NewScheduledRun, Resources,
    ScheduledRun,
};

use crate::{ExecutionTracker, JobRegistry, Result, Scheduler, ServiceError};

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } => ServiceError::NotFound(err.to_string()),
            StorageError::InvalidTransition(t) => ServiceError::InvalidTransition {
                from: t.from,
                to: t.to,
            },
            StorageError::Validation(_)
            | StorageError::AlreadyFinalized(_)
            | StorageError::InsufficientResources { .. } => ServiceError::Rejected(err.to_string()),
            StorageError::Sqlite(_) | StorageError::Join(_) => {
                ServiceError::Unavailable(err.to_string())
            }
        }
    }
}

/// All three services backed by one local database.
#[derive(Clone)]
pub struct LocalBackend(Arc<DtsStorage>);

impl LocalBackend {
    pub fn new(storage: Arc<DtsStorage>) -> Self {
        Self(storage)
    }

    pub fn storage(&self) -> &Arc<DtsStorage> {
        &self.0
    }
}

#[async_trait]
impl JobRegistry for LocalBackend {
    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        Ok(self.0.list_jobs(status).await?)
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<String> {
        Ok(self.0.create_job(spec.clone()).await?.id)
    }

    async fn get_job(&self, id: &str) -> Result<Job> {
        Ok(self.0.get_job(id).await?)
    }

    async fn update_job(&self, id: &str, patch: &JobPatch) -> Result<Job> {
        Ok(self.0.update_job(id, patch.clone()).await?)
    }

    async fn cancel_job(&self, id: &str) -> Result<Job> {
        Ok(self.0.cancel_job(id).await?)
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        Ok(self.0.delete_job(id).await?)
    }
}

#[async_trait]
impl Scheduler for LocalBackend {
    async fn list_scheduled_runs(&self, job_id: Option<&str>) -> Result<Vec<ScheduledRun>> {
        Ok(self.0.list_scheduled_runs(job_id.map(String::from)).await?)
    }

    async fn create_scheduled_run(&self, request: &NewScheduledRun) -> Result<ScheduledRun> {
        Ok(self.0.create_scheduled_run(request.clone()).await?)
    }

    async fn cancel_scheduled_run(&self, id: &str) -> Result<()> {
        let removed = self.0.cancel_scheduled_run(id).await?;
        if !removed {
            tracing::debug!(run_id = %id, "Scheduled run already gone");
        }
        Ok(())
    }

    async fn run_now(&self, job_id: &str, resources: Resources) -> Result<Execution> {
        Ok(self.0.run_now(job_id, resources).await?)
    }
}

#[async_trait]
impl ExecutionTracker for LocalBackend {
    async fn list_executions(&self, job_id: &str) -> Result<Vec<Execution>> {
        Ok(self.0.list_executions(job_id).await?)
    }

    async fn finish_execution(&self, id: &str, outcome: &ExecutionOutcome) -> Result<Execution> {
        Ok(self
            .0
            .finish_execution(id, outcome.clone(), dts_storage::now())
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> LocalBackend {
        let storage = DtsStorage::open_in_memory(Resources::new(4.0, 4.0, 4.0)).unwrap();
        LocalBackend::new(Arc::new(storage))
    }

    #[tokio::test]
    async fn test_errors_map_to_service_errors() {
        let backend = backend();
        assert!(matches!(
            backend.get_job("missing").await,
            Err(ServiceError::NotFound(_))
        ));

        let mut spec = JobSpec::new("bad", "@hourly");
        spec.priority = 9;
        assert!(matches!(
            JobRegistry::create_job(&backend, &spec).await,
            Err(ServiceError::Rejected(_))
        ));

        let id = JobRegistry::create_job(&backend, &JobSpec::new("ok", "@hourly"))
            .await
            .unwrap();
        let too_big = NewScheduledRun {
            job_id: id,
            resource_requirements: Resources::new(100.0, 1.0, 1.0),
            next_execution_time: None,
        };
        assert!(matches!(
            backend.create_scheduled_run(&too_big).await,
            Err(ServiceError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_scheduled_run_is_idempotent() {
        let backend = backend();
        backend.cancel_scheduled_run("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn test_running_job_rejects_schedule_with_transition_error() {
        let backend = backend();
        let id = JobRegistry::create_job(&backend, &JobSpec::new("busy", "@hourly"))
            .await
            .unwrap();
        backend
            .run_now(&id, Resources::new(1.0, 1.0, 1.0))
            .await
            .unwrap();
        let err = backend
            .run_now(&id, Resources::new(1.0, 1.0, 1.0))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ServiceError::InvalidTransition {
                from: JobStatus::Running,
                to: JobStatus::Scheduled,
            }
        );
    }
}
