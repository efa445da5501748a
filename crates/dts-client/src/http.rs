//! REST clients for the three services.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use url::Url;

use dts_types::{
    Execution, ExecutionOutcome, Job, JobPatch, JobSpec, JobStatus, NewScheduledRun, Resources,
    ScheduledRun,
};

use crate::wire::{
    CreatedJob, ErrorBody, ExecutionList, JobList, ListQuery, RunList, RunNowRequest,
};
use crate::{ExecutionTracker, JobRegistry, Result, Scheduler, ServiceError, TokenProvider};

/// Shared HTTP client with a per-request timeout and credential source.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    tokens: Arc<dyn TokenProvider>,
}

impl HttpTransport {
    pub fn new(timeout: Duration, tokens: Arc<dyn TokenProvider>) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, tokens })
    }

    async fn execute(&self, mut request: RequestBuilder, what: &str) -> Result<Response> {
        if let Some(token) = self.tokens.token().await? {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ServiceError::Unavailable(format!("{what} request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.json::<ErrorBody>().await.unwrap_or_else(|_| ErrorBody {
            kind: "unknown".into(),
            message: status.canonical_reason().unwrap_or("unknown error").into(),
            from: None,
            to: None,
        });
        tracing::debug!(status = status.as_u16(), kind = %body.kind, "{what} failed");
        Err(body.into_service_error(status.as_u16()))
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder, what: &str) -> Result<T> {
        self.execute(request, what)
            .await?
            .json()
            .await
            .map_err(|e| ServiceError::Unavailable(format!("{what} response parse failed: {e}")))
    }
}

/// One service's base URL plus the transport.
#[derive(Clone)]
struct Endpoint {
    http: HttpTransport,
    base_url: Url,
}

impl Endpoint {
    fn new(base_url: &str, http: HttpTransport) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ServiceError::Unavailable(format!("invalid base URL {base_url:?}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ServiceError::Unavailable(format!(
                "invalid base URL {base_url}"
            )));
        }
        Ok(Self { http, base_url })
    }

    /// Build `base/seg/seg/...`, percent-encoding each segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        self.http.client.request(method, self.url(segments))
    }
}

// ──────────────────── Job Registry ────────────────────

pub struct HttpJobRegistry(Endpoint);

impl HttpJobRegistry {
    pub fn new(base_url: &str, http: HttpTransport) -> Result<Self> {
        Endpoint::new(base_url, http).map(Self)
    }
}

#[async_trait]
impl JobRegistry for HttpJobRegistry {
    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let query = ListQuery {
            status,
            ..Default::default()
        };
        let request = self.0.request(Method::GET, &["v1", "jobs"]).query(&query);
        let list: JobList = self.0.http.json(request, "listJobs").await?;
        Ok(list.jobs)
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<String> {
        let request = self.0.request(Method::POST, &["v1", "jobs"]).json(spec);
        let created: CreatedJob = self.0.http.json(request, "createJob").await?;
        Ok(created.job_id)
    }

    async fn get_job(&self, id: &str) -> Result<Job> {
        let request = self.0.request(Method::GET, &["v1", "jobs", id]);
        self.0.http.json(request, "getJob").await
    }

    async fn update_job(&self, id: &str, patch: &JobPatch) -> Result<Job> {
        let request = self.0.request(Method::PUT, &["v1", "jobs", id]).json(patch);
        self.0.http.json(request, "updateJob").await
    }

    async fn cancel_job(&self, id: &str) -> Result<Job> {
        let request = self.0.request(Method::POST, &["v1", "jobs", id, "cancel"]);
        self.0.http.json(request, "cancelJob").await
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        let request = self.0.request(Method::DELETE, &["v1", "jobs", id]);
        self.0.http.execute(request, "deleteJob").await.map(|_| ())
    }
}

// ──────────────────── Scheduler ────────────────────

pub struct HttpScheduler(Endpoint);

impl HttpScheduler {
    pub fn new(base_url: &str, http: HttpTransport) -> Result<Self> {
        Endpoint::new(base_url, http).map(Self)
    }
}

#[async_trait]
impl Scheduler for HttpScheduler {
    async fn list_scheduled_runs(&self, job_id: Option<&str>) -> Result<Vec<ScheduledRun>> {
        let query = ListQuery {
            job_id: job_id.map(String::from),
            ..Default::default()
        };
        let request = self
            .0
            .request(Method::GET, &["v1", "scheduled-runs"])
            .query(&query);
        let list: RunList = self.0.http.json(request, "listScheduledRuns").await?;
        Ok(list.runs)
    }

    async fn create_scheduled_run(&self, request: &NewScheduledRun) -> Result<ScheduledRun> {
        let http_request = self
            .0
            .request(Method::POST, &["v1", "scheduled-runs"])
            .json(request);
        self.0.http.json(http_request, "createScheduledRun").await
    }

    async fn cancel_scheduled_run(&self, id: &str) -> Result<()> {
        let request = self
            .0
            .request(Method::DELETE, &["v1", "scheduled-runs", id]);
        match self.0.http.execute(request, "cancelScheduledRun").await {
            Ok(_) => Ok(()),
            // Already fired or cancelled. A route miss maps to Unavailable.
            Err(ServiceError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn run_now(&self, job_id: &str, resources: Resources) -> Result<Execution> {
        let body = RunNowRequest {
            job_id: job_id.to_string(),
            resource_requirements: resources,
        };
        let request = self
            .0
            .request(Method::POST, &["v1", "scheduled-runs", "run-now"])
            .json(&body);
        self.0.http.json(request, "runNow").await
    }
}

// ──────────────────── Execution Tracker ────────────────────

pub struct HttpExecutionTracker(Endpoint);

impl HttpExecutionTracker {
    pub fn new(base_url: &str, http: HttpTransport) -> Result<Self> {
        Endpoint::new(base_url, http).map(Self)
    }
}

#[async_trait]
impl ExecutionTracker for HttpExecutionTracker {
    async fn list_executions(&self, job_id: &str) -> Result<Vec<Execution>> {
        let query = ListQuery {
            job_id: Some(job_id.to_string()),
            ..Default::default()
        };
        let request = self
            .0
            .request(Method::GET, &["v1", "executions"])
            .query(&query);
        let list: ExecutionList = self.0.http.json(request, "listExecutions").await?;
        Ok(list.executions)
    }

    async fn finish_execution(&self, id: &str, outcome: &ExecutionOutcome) -> Result<Execution> {
        let request = self
            .0
            .request(Method::POST, &["v1", "executions", id, "finish"])
            .json(outcome);
        self.0.http.json(request, "finishExecution").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NoToken;

    fn transport() -> HttpTransport {
        HttpTransport::new(Duration::from_secs(1), Arc::new(NoToken)).unwrap()
    }

    #[test]
    fn test_url_building() {
        let endpoint = Endpoint::new("http://jobs.internal:8080/", transport()).unwrap();
        assert_eq!(
            endpoint.url(&["v1", "jobs", "abc"]).as_str(),
            "http://jobs.internal:8080/v1/jobs/abc"
        );
    }

    #[test]
    fn test_url_keeps_base_path_and_encodes_ids() {
        let endpoint = Endpoint::new("http://gw/api/scheduler", transport()).unwrap();
        assert_eq!(
            endpoint.url(&["v1", "scheduled-runs", "a/b c"]).as_str(),
            "http://gw/api/scheduler/v1/scheduled-runs/a%2Fb%20c"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            HttpJobRegistry::new("not a url", transport()),
            Err(ServiceError::Unavailable(_))
        ));
        assert!(HttpScheduler::new("mailto:ops@example.com", transport()).is_err());
    }

    /// Serve one canned HTTP response on a local port.
    async fn one_shot_server(response: String) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_cancel_run_route_miss_is_not_success() {
        let base = one_shot_server(
            "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".into(),
        )
        .await;
        let scheduler = HttpScheduler::new(&base, transport()).unwrap();
        let err = scheduler.cancel_scheduled_run("r1").await.unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_cancel_unknown_run_is_success() {
        let body = r#"{"kind":"not_found","message":"scheduled run r1 not found"}"#;
        let response = format!(
            "HTTP/1.1 404 Not Found\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let base = one_shot_server(response).await;
        let scheduler = HttpScheduler::new(&base, transport()).unwrap();
        scheduler.cancel_scheduled_run("r1").await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        // Port 9 (discard) is closed on test hosts.
        let registry = HttpJobRegistry::new("http://127.0.0.1:9", transport()).unwrap();
        let err = registry.get_job("j1").await.unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)), "{err:?}");
    }
}
