//! JSON bodies shared by the HTTP clients and the server.

use serde::{Deserialize, Serialize};

use dts_types::{Execution, Job, JobStatus, Resources, ScheduledRun};

use crate::ServiceError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobList {
    pub jobs: Vec<Job>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedJob {
    pub job_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunList {
    pub runs: Vec<ScheduledRun>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionList {
    pub executions: Vec<Execution>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunNowRequest {
    pub job_id: String,
    pub resource_requirements: Resources,
}

/// Query string of the list endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<JobStatus>,
}

impl ErrorBody {
    fn new(kind: &str, message: String) -> Self {
        Self {
            kind: kind.to_string(),
            message,
            from: None,
            to: None,
        }
    }

    /// HTTP status code and body for a service error.
    pub fn from_service_error(err: &ServiceError) -> (u16, ErrorBody) {
        match err {
            ServiceError::NotFound(m) => (404, ErrorBody::new("not_found", m.clone())),
            ServiceError::Rejected(m) => (400, ErrorBody::new("rejected", m.clone())),
            ServiceError::InvalidTransition { from, to } => (
                409,
                ErrorBody {
                    from: Some(*from),
                    to: Some(*to),
                    ..ErrorBody::new("invalid_transition", err.to_string())
                },
            ),
            ServiceError::Unavailable(m) => (503, ErrorBody::new("unavailable", m.clone())),
        }
    }

    /// Map a non-2xx response back to a service error.
    ///
    /// A 404 only means a missing record when the body says so; a bare 404
    /// comes from a route that does not exist, i.e. a misconfigured URL.
    pub fn into_service_error(self, status: u16) -> ServiceError {
        match (status, self.from, self.to) {
            (404, _, _) if self.kind == "not_found" => ServiceError::NotFound(self.message),
            (400, _, _) => ServiceError::Rejected(self.message),
            (409, Some(from), Some(to)) => ServiceError::InvalidTransition { from, to },
            _ => ServiceError::Unavailable(format!("HTTP {status}: {}", self.message)),
        }
    }
}
