//! Intent event types.

use serde::{Deserialize, Serialize};

use dts_types::{ExecutionStatus, JobStatus};

/// Events that hooks can subscribe to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntentEvent {
    JobCreated {
        job_id: String,
        name: String,
    },
    JobEdited {
        job_id: String,
    },
    JobDeleted {
        job_id: String,
    },
    RunScheduled {
        job_id: String,
        run_id: String,
    },
    /// Also emitted when the run was already gone.
    RunCancelled {
        run_id: String,
    },
    JobCancelled {
        job_id: String,
        runs_cancelled: usize,
    },
    /// A run-now intent started an execution.
    JobStarted {
        job_id: String,
        execution_id: String,
    },
    ExecutionFinished {
        job_id: String,
        execution_id: String,
        status: ExecutionStatus,
        /// `None` when the job was deleted while running.
        job_status: Option<JobStatus>,
    },
    /// A composite intent failed after some of its steps took effect.
    PartiallyFailed {
        intent: String,
        job_id: String,
        completed: Vec<String>,
        error: String,
    },
}

impl IntentEvent {
    /// Name used to route the event to subscribers.
    pub fn name(&self) -> &'static str {
        match self {
            IntentEvent::JobCreated { .. } => "job_created",
            IntentEvent::JobEdited { .. } => "job_edited",
            IntentEvent::JobDeleted { .. } => "job_deleted",
            IntentEvent::RunScheduled { .. } => "run_scheduled",
            IntentEvent::RunCancelled { .. } => "run_cancelled",
            IntentEvent::JobCancelled { .. } => "job_cancelled",
            IntentEvent::JobStarted { .. } => "job_started",
            IntentEvent::ExecutionFinished { .. } => "execution_finished",
            IntentEvent::PartiallyFailed { .. } => "partially_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_matches_serde_tag() {
        let events = [
            IntentEvent::JobDeleted { job_id: "j".into() },
            IntentEvent::RunCancelled { run_id: "r".into() },
            IntentEvent::PartiallyFailed {
                intent: "cancel_job".into(),
                job_id: "j".into(),
                completed: vec!["list_runs".into()],
                error: "unavailable".into(),
            },
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.name());
        }
    }
}
