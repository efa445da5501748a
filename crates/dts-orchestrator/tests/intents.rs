use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};

use dts_orchestrator::{Orchestrator, OrchestratorError, Service};
use dts_storage::DtsStorage;
use dts_types::{
    ExecutionOutcome, ExecutionStatus, JobPatch, JobSpec, JobStatus, Resources,
};

fn setup() -> (Arc<DtsStorage>, Orchestrator) {
    let storage =
        Arc::new(DtsStorage::open_in_memory(Resources::new(16.0, 32.0, 16.0)).unwrap());
    (storage.clone(), Orchestrator::local(storage))
}

fn backup_spec() -> JobSpec {
    JobSpec {
        name: "backup".into(),
        description: "nightly database backup".into(),
        cron_expression: "0 * * * *".into(),
        priority: 3,
        max_retries: 2,
        timeout_seconds: 30,
        metadata: HashMap::from([("team".to_string(), "infra".to_string())]),
    }
}

fn small() -> Resources {
    Resources::new(1.0, 2.0, 1.0)
}

#[tokio::test]
async fn test_create_then_get_returns_input_fields_and_pending() {
    let (_, orch) = setup();
    let specs = [
        backup_spec(),
        JobSpec::new("reindex", "*/15 * * * *"),
        JobSpec {
            priority: 5,
            max_retries: 0,
            timeout_seconds: 0,
            ..JobSpec::new("six-field", "30 0 12 * * *")
        },
    ];
    for spec in specs {
        let created = orch.create_job(spec.clone()).await.unwrap();
        let fetched = orch.get_job(&created.id).await.unwrap();
        assert_eq!(fetched.spec(), spec);
        assert_eq!(fetched.status, JobStatus::Pending);
        assert_eq!(fetched.next_run, None);
        assert_eq!(fetched.last_run, None);
        assert!(fetched.timestamps_consistent());
    }
}

#[tokio::test]
async fn test_cancel_scheduled_run_twice_succeeds() {
    let (_, orch) = setup();
    let job = orch.create_job(backup_spec()).await.unwrap();
    let scheduled = orch
        .schedule_run(&job.id, small(), Some(Utc::now() + Duration::hours(1)))
        .await
        .unwrap();

    orch.cancel_scheduled_run(&scheduled.run.id).await.unwrap();
    orch.cancel_scheduled_run(&scheduled.run.id).await.unwrap();

    let job = orch.get_job(&job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.next_run, None);
}

#[tokio::test]
async fn test_cancel_scheduled_run_after_it_fired_succeeds() {
    let (storage, orch) = setup();
    let job = orch.create_job(backup_spec()).await.unwrap();
    let at = Utc::now() + Duration::minutes(10);
    let scheduled = orch.schedule_run(&job.id, small(), Some(at)).await.unwrap();
    let fired = storage.fire_due_runs(at).await.unwrap();
    assert_eq!(fired.len(), 1);

    orch.cancel_scheduled_run(&scheduled.run.id).await.unwrap();
    assert_eq!(orch.get_job(&job.id).await.unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn test_cancel_job_in_terminal_status_changes_nothing() {
    let (_, orch) = setup();

    let completed = orch.create_job(JobSpec::new("completed", "@hourly")).await.unwrap();
    let started = orch.run_now(&completed.id, small()).await.unwrap();
    orch.finish_execution(
        &started.execution.id,
        ExecutionOutcome::Succeeded { result: "ok".into() },
    )
    .await
    .unwrap();

    let failed = orch.create_job(JobSpec::new("failed", "@hourly")).await.unwrap();
    let started = orch.run_now(&failed.id, small()).await.unwrap();
    orch.finish_execution(
        &started.execution.id,
        ExecutionOutcome::Failed { error: "boom".into() },
    )
    .await
    .unwrap();

    let cancelled = orch.create_job(JobSpec::new("cancelled", "@hourly")).await.unwrap();
    orch.cancel_job(&cancelled.id).await.unwrap();

    for (id, status) in [
        (&completed.id, JobStatus::Completed),
        (&failed.id, JobStatus::Failed),
        (&cancelled.id, JobStatus::Cancelled),
    ] {
        let before = orch.job_view(id).await.unwrap();
        assert_eq!(before.job.status, status);

        let err = orch.cancel_job(id).await.unwrap_err();
        assert!(
            matches!(
                err,
                OrchestratorError::InvalidTransition { from, to: JobStatus::Cancelled } if from == status
            ),
            "{err:?}"
        );
        assert!(!err.is_retryable());
        assert_eq!(orch.job_view(id).await.unwrap(), before);
    }
}

#[tokio::test]
async fn test_cancel_scheduled_job_with_two_runs() {
    let (_, orch) = setup();
    let job = orch.create_job(backup_spec()).await.unwrap();
    let now = Utc::now();
    orch.schedule_run(&job.id, small(), Some(now + Duration::hours(1)))
        .await
        .unwrap();
    let second = orch
        .schedule_run(&job.id, small(), Some(now + Duration::hours(2)))
        .await
        .unwrap();
    assert_eq!(second.runs.len(), 2);
    assert_eq!(second.job.status, JobStatus::Scheduled);

    let cancelled = orch.cancel_job(&job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(orch.list_scheduled_runs(Some(&job.id)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_backup_lifecycle() {
    let (storage, orch) = setup();
    let t = Utc::now();

    let job = orch.create_job(backup_spec()).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.next_run, None);

    let fire_at = t + Duration::hours(1);
    let scheduled = orch
        .schedule_run(&job.id, small(), Some(fire_at))
        .await
        .unwrap();
    assert_eq!(scheduled.runs.len(), 1);
    assert_eq!(scheduled.run.resource_requirements, small());
    assert_eq!(scheduled.job.status, JobStatus::Scheduled);
    assert_eq!(scheduled.job.next_run, Some(scheduled.run.next_execution_time));

    // Nothing is due yet.
    assert!(storage.fire_due_runs(t).await.unwrap().is_empty());

    let fired = storage
        .fire_due_runs(scheduled.run.next_execution_time)
        .await
        .unwrap();
    assert_eq!(fired.len(), 1);
    let view = orch.job_view(&job.id).await.unwrap();
    assert_eq!(view.job.status, JobStatus::Running);
    assert!(view.runs.is_empty());
    assert_eq!(view.executions.len(), 1);
    assert_eq!(view.executions[0].status, ExecutionStatus::Running);
    assert_eq!(view.executions[0].end_time, None);

    let end = scheduled.run.next_execution_time + Duration::minutes(5);
    storage
        .finish_execution(
            &fired[0].id,
            ExecutionOutcome::Succeeded {
                result: "backed up 3 databases".into(),
            },
            end,
        )
        .await
        .unwrap();

    let view = orch.job_view(&job.id).await.unwrap();
    assert_eq!(view.job.status, JobStatus::Completed);
    let execution = &view.executions[0];
    assert_eq!(execution.status, ExecutionStatus::Succeeded);
    assert_eq!(execution.end_time, Some(end));
    assert_eq!(execution.result.as_deref(), Some("backed up 3 databases"));
    assert!(execution.is_consistent());
    assert!(view.job.timestamps_consistent());
}

#[tokio::test]
async fn test_edit_changes_only_patched_field() {
    let (_, orch) = setup();
    let before = orch.create_job(backup_spec()).await.unwrap();

    let patch = JobPatch {
        description: Some("x".into()),
        ..Default::default()
    };
    let edited = orch.edit_job(&before.id, patch).await.unwrap();
    let after = orch.get_job(&before.id).await.unwrap();
    assert_eq!(edited, after);

    assert_eq!(after.description, "x");
    assert!(after.updated_at > before.updated_at);
    assert_eq!(
        (
            &after.name,
            &after.cron_expression,
            after.priority,
            after.max_retries,
            after.timeout_seconds,
            &after.metadata,
            after.status,
            after.created_at,
        ),
        (
            &before.name,
            &before.cron_expression,
            before.priority,
            before.max_retries,
            before.timeout_seconds,
            &before.metadata,
            before.status,
            before.created_at,
        )
    );
}

#[tokio::test]
async fn test_edit_never_changes_status() {
    let (_, orch) = setup();
    let job = orch.create_job(backup_spec()).await.unwrap();
    orch.schedule_run(&job.id, small(), None).await.unwrap();
    let edited = orch
        .edit_job(
            &job.id,
            JobPatch {
                priority: Some(1),
                cron_expression: Some("@daily".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(edited.status, JobStatus::Scheduled);
    assert_eq!(edited.priority, 1);
}

#[tokio::test]
async fn test_history_survives_deletion() {
    let (storage, orch) = setup();
    let job = orch.create_job(backup_spec()).await.unwrap();
    let started = orch.run_now(&job.id, small()).await.unwrap();
    orch.finish_execution(
        &started.execution.id,
        ExecutionOutcome::Succeeded { result: "ok".into() },
    )
    .await
    .unwrap();
    orch.schedule_run(&job.id, small(), Some(Utc::now() + Duration::hours(1)))
        .await
        .unwrap();

    orch.delete_job(&job.id).await.unwrap();

    let history = orch.list_executions(&job.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, started.execution.id);

    let err = orch.get_job(&job.id).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::NotFound {
            service: Service::JobRegistry,
            ..
        }
    ));

    // The orphaned run is the scheduler's to collect.
    assert_eq!(orch.list_scheduled_runs(Some(&job.id)).await.unwrap().len(), 1);
    assert_eq!(storage.collect_orphaned_runs().await.unwrap(), 1);
    assert!(orch.list_scheduled_runs(Some(&job.id)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_list_executions_of_unknown_job_is_empty() {
    let (_, orch) = setup();
    assert!(orch.list_executions("never-ran").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_unknown_job_is_not_found() {
    let (_, orch) = setup();
    assert!(matches!(
        orch.delete_job("missing").await,
        Err(OrchestratorError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_terminal_job_can_be_rescheduled() {
    let (_, orch) = setup();
    let job = orch.create_job(backup_spec()).await.unwrap();
    orch.cancel_job(&job.id).await.unwrap();

    let scheduled = orch.schedule_run(&job.id, small(), None).await.unwrap();
    assert_eq!(scheduled.job.status, JobStatus::Scheduled);
}

#[tokio::test]
async fn test_list_jobs_filters_by_status() {
    let (_, orch) = setup();
    let pending = orch.create_job(JobSpec::new("a", "@hourly")).await.unwrap();
    let scheduled = orch.create_job(JobSpec::new("b", "@hourly")).await.unwrap();
    orch.schedule_run(&scheduled.id, small(), None).await.unwrap();

    let all = orch.list_jobs(None).await.unwrap();
    assert_eq!(all.len(), 2);
    let only_pending = orch.list_jobs(Some(JobStatus::Pending)).await.unwrap();
    assert_eq!(only_pending.len(), 1);
    assert_eq!(only_pending[0].id, pending.id);
}

#[tokio::test]
async fn test_cancelled_job_waits_for_its_running_execution() {
    let (_, orch) = setup();
    let job = orch.create_job(JobSpec::new("long", "@hourly")).await.unwrap();
    let started = orch.run_now(&job.id, small()).await.unwrap();
    assert_eq!(orch.cancel_job(&job.id).await.unwrap().status, JobStatus::Cancelled);

    let err = orch
        .schedule_run(&job.id, small(), Some(Utc::now() + Duration::hours(1)))
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            OrchestratorError::InvalidTransition {
                from: JobStatus::Running,
                to: JobStatus::Scheduled
            }
        ),
        "{err:?}"
    );

    let finished = orch
        .finish_execution(
            &started.execution.id,
            ExecutionOutcome::Succeeded { result: "ok".into() },
        )
        .await
        .unwrap();
    assert_eq!(finished.job.unwrap().status, JobStatus::Cancelled);
    let scheduled = orch.schedule_run(&job.id, small(), None).await.unwrap();
    assert_eq!(scheduled.job.status, JobStatus::Scheduled);
}
