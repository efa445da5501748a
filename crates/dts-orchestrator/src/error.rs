//! Typed failures of an intent.

use std::fmt;

use serde::Serialize;

use dts_client::ServiceError;
use dts_types::{InvalidTransition, JobStatus, ValidationError};

/// The three services an intent may call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    JobRegistry,
    Scheduler,
    ExecutionTracker,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Service::JobRegistry => "job registry",
            Service::Scheduler => "scheduler",
            Service::ExecutionTracker => "execution tracker",
        })
    }
}

/// Steps of the cancel-job sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelStep {
    ListRuns,
    CancelRuns,
    MarkCancelled,
}

impl fmt::Display for CancelStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CancelStep::ListRuns => "list scheduled runs",
            CancelStep::CancelRuns => "cancel scheduled runs",
            CancelStep::MarkCancelled => "mark job cancelled",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Malformed input; no service was called.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// A service refused well-formed input (capacity, finalized execution).
    #[error("{service} rejected the request: {reason}")]
    Rejected { service: Service, reason: String },

    #[error("{service}: {message}")]
    NotFound { service: Service, message: String },

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// Transport failure or timeout. Never treated as success.
    #[error("{service} unavailable: {reason}")]
    ServiceUnavailable { service: Service, reason: String },

    /// Some steps of a composite intent took effect before a later one failed.
    #[error("cancel of job {job_id} stopped at '{failed}' after {runs_cancelled} run(s) were cancelled: {source}")]
    PartialFailure {
        job_id: String,
        completed: Vec<CancelStep>,
        failed: CancelStep,
        runs_cancelled: usize,
        #[source]
        source: Box<OrchestratorError>,
    },
}

impl OrchestratorError {
    pub(crate) fn from_service(service: Service, err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound(message) => OrchestratorError::NotFound { service, message },
            ServiceError::Rejected(reason) => OrchestratorError::Rejected { service, reason },
            ServiceError::InvalidTransition { from, to } => {
                OrchestratorError::InvalidTransition { from, to }
            }
            ServiceError::Unavailable(reason) => {
                OrchestratorError::ServiceUnavailable { service, reason }
            }
        }
    }

    /// Whether repeating the same intent may succeed. Validation and
    /// transition errors need new input instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::ServiceUnavailable { .. } | OrchestratorError::PartialFailure { .. }
        )
    }

    /// Short machine-readable kind, for display layers.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_) => "validation",
            OrchestratorError::Rejected { .. } => "rejected",
            OrchestratorError::NotFound { .. } => "not_found",
            OrchestratorError::InvalidTransition { .. } => "invalid_transition",
            OrchestratorError::ServiceUnavailable { .. } => "service_unavailable",
            OrchestratorError::PartialFailure { .. } => "partial_failure",
        }
    }
}

impl From<InvalidTransition> for OrchestratorError {
    fn from(err: InvalidTransition) -> Self {
        OrchestratorError::InvalidTransition {
            from: err.from,
            to: err.to,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        let unavailable = OrchestratorError::ServiceUnavailable {
            service: Service::Scheduler,
            reason: "timed out".into(),
        };
        assert!(unavailable.is_retryable());

        let partial = OrchestratorError::PartialFailure {
            job_id: "j1".into(),
            completed: vec![CancelStep::ListRuns, CancelStep::CancelRuns],
            failed: CancelStep::MarkCancelled,
            runs_cancelled: 2,
            source: Box::new(unavailable),
        };
        assert!(partial.is_retryable());
        assert_eq!(partial.kind(), "partial_failure");

        assert!(!OrchestratorError::Validation(ValidationError::Empty("name")).is_retryable());
        assert!(
            !OrchestratorError::InvalidTransition {
                from: JobStatus::Completed,
                to: JobStatus::Cancelled,
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_service_error_mapping() {
        let err = OrchestratorError::from_service(
            Service::JobRegistry,
            ServiceError::InvalidTransition {
                from: JobStatus::Failed,
                to: JobStatus::Cancelled,
            },
        );
        assert!(matches!(
            err,
            OrchestratorError::InvalidTransition {
                from: JobStatus::Failed,
                to: JobStatus::Cancelled
            }
        ));

        let err = OrchestratorError::from_service(
            Service::Scheduler,
            ServiceError::Rejected("insufficient resources".into()),
        );
        assert_eq!(err.kind(), "rejected");
        assert_eq!(
            err.to_string(),
            "scheduler rejected the request: insufficient resources"
        );
    }
}
