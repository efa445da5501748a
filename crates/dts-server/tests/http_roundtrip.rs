//! The orchestrator driving a real server over HTTP.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::net::TcpListener;

use dts_client::{NoToken, StaticToken, TokenProvider};
use dts_config::ServicesConfig;
use dts_orchestrator::{Orchestrator, OrchestratorError, Service};
use dts_server::{ServerState, serve};
use dts_storage::DtsStorage;
use dts_types::{ExecutionOutcome, ExecutionStatus, JobPatch, JobSpec, JobStatus, Resources};

const TOKEN: &str = "s3cret";

struct TestServer {
    base_url: String,
    storage: Arc<DtsStorage>,
}

async fn start() -> TestServer {
    let storage = Arc::new(DtsStorage::open_in_memory(Resources::new(8.0, 8.0, 8.0)).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = Arc::new(ServerState::new(storage.clone(), Some(TOKEN.to_string())));
    tokio::spawn(serve(listener, state));
    TestServer {
        base_url: format!("http://{addr}"),
        storage,
    }
}

fn orchestrator(server: &TestServer, tokens: Arc<dyn TokenProvider>) -> Orchestrator {
    let services = ServicesConfig {
        job_registry_url: server.base_url.clone(),
        scheduler_url: server.base_url.clone(),
        execution_url: server.base_url.clone(),
        request_timeout_ms: 5_000,
        auth_token: None,
    };
    Orchestrator::from_config(&services, tokens).unwrap()
}

fn small() -> Resources {
    Resources::new(1.0, 2.0, 1.0)
}

#[tokio::test]
async fn test_lifecycle_over_http() {
    let server = start().await;
    let orch = orchestrator(&server, Arc::new(StaticToken::new(TOKEN)));

    let job = orch
        .create_job(JobSpec {
            max_retries: 2,
            timeout_seconds: 30,
            ..JobSpec::new("backup", "0 * * * *")
        })
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let edited = orch
        .edit_job(
            &job.id,
            JobPatch {
                description: Some("x".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(edited.description, "x");
    assert!(edited.updated_at > job.updated_at);

    let at = Utc::now() + Duration::hours(1);
    let scheduled = orch.schedule_run(&job.id, small(), Some(at)).await.unwrap();
    assert_eq!(scheduled.job.status, JobStatus::Scheduled);
    assert_eq!(scheduled.runs.len(), 1);

    let fired = server
        .storage
        .fire_due_runs(scheduled.run.next_execution_time)
        .await
        .unwrap();
    assert_eq!(fired.len(), 1);

    let finished = orch
        .finish_execution(
            &fired[0].id,
            ExecutionOutcome::Succeeded {
                result: "ok".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(finished.execution.status, ExecutionStatus::Succeeded);
    assert_eq!(finished.job.unwrap().status, JobStatus::Completed);

    // Completed jobs cannot be cancelled; the 409 comes back typed.
    let err = orch.cancel_job(&job.id).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::InvalidTransition {
            from: JobStatus::Completed,
            to: JobStatus::Cancelled
        }
    ));

    let started = orch.run_now(&job.id, small()).await.unwrap();
    assert_eq!(started.job.status, JobStatus::Running);

    let view = orch.job_view(&job.id).await.unwrap();
    assert_eq!(view.executions.len(), 2);
    assert!(view.executions[0].start_time >= view.executions[1].start_time);
    assert!(view.executions.iter().any(|e| e.id == started.execution.id && e.is_running()));

    orch.delete_job(&job.id).await.unwrap();
    assert_eq!(orch.list_executions(&job.id).await.unwrap().len(), 2);
    assert!(matches!(
        orch.get_job(&job.id).await,
        Err(OrchestratorError::NotFound {
            service: Service::JobRegistry,
            ..
        })
    ));
}

#[tokio::test]
async fn test_cancel_job_over_http() {
    let server = start().await;
    let orch = orchestrator(&server, Arc::new(StaticToken::new(TOKEN)));

    let job = orch.create_job(JobSpec::new("report", "@daily")).await.unwrap();
    let now = Utc::now();
    for hours in [1, 2] {
        orch.schedule_run(&job.id, small(), Some(now + Duration::hours(hours)))
            .await
            .unwrap();
    }
    let runs = orch.list_scheduled_runs(Some(&job.id)).await.unwrap();
    assert_eq!(runs.len(), 2);

    let cancelled = orch.cancel_job(&job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(orch.list_scheduled_runs(Some(&job.id)).await.unwrap().is_empty());

    // Already gone: still a success.
    orch.cancel_scheduled_run(&runs[0].id).await.unwrap();

    let cancelled_jobs = orch.list_jobs(Some(JobStatus::Cancelled)).await.unwrap();
    assert_eq!(cancelled_jobs.len(), 1);
}

#[tokio::test]
async fn test_server_side_rejections_over_http() {
    let server = start().await;
    let orch = orchestrator(&server, Arc::new(StaticToken::new(TOKEN)));
    let job = orch.create_job(JobSpec::new("big", "@hourly")).await.unwrap();

    let err = orch
        .schedule_run(&job.id, Resources::new(100.0, 1.0, 1.0), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Rejected {
            service: Service::Scheduler,
            ..
        }
    ));

    let err = orch
        .schedule_run("missing", small(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound { .. }));
}

#[tokio::test]
async fn test_missing_token_is_unavailable() {
    let server = start().await;
    let orch = orchestrator(&server, Arc::new(NoToken));
    let err = orch.list_jobs(None).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::ServiceUnavailable {
            service: Service::JobRegistry,
            ..
        }
    ));
}
