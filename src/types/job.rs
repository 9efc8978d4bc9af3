//! Jobs: one row per queued workflow job awaiting a runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{CheckEventId, JobId, TargetId};

/// Lifecycle status of a Job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for the starter to dispatch a runner.
    Pending,
    /// A runner was created for it; the provider takes over from here.
    Dispatched,
    /// Given up on: permanent auth failure or rescued after webhook loss.
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Dispatched | JobStatus::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Dispatched => "dispatched",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "dispatched" => Ok(JobStatus::Dispatched),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A unit of work derived from one queued workflow job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub target_id: TargetId,
    /// Denormalised scope string, so the starter does not need the
    /// Target row just to compose a runner spec.
    pub scope: String,
    /// Raw provider event payload, kept for the rescue subsystem.
    pub payload: String,
    pub check_event_id: CheckEventId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Creates a new pending Job.
    pub fn new(
        target_id: TargetId,
        scope: impl Into<String>,
        payload: impl Into<String>,
        check_event_id: CheckEventId,
    ) -> Self {
        Job {
            id: JobId::generate(),
            target_id,
            scope: scope.into(),
            payload: payload.into(),
            check_event_id,
            status: JobStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// The workflow run ID extracted from the stored payload, if any.
    ///
    /// The rescue subsystem uses this to ask the provider whether the
    /// run is still queued.
    pub fn workflow_run_id(&self) -> Option<u64> {
        let payload: serde_json::Value = serde_json::from_str(&self.payload).ok()?;
        payload
            .get("workflow_job")?
            .get("run_id")?
            .as_u64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_pending() {
        let job = Job::new(
            TargetId::generate(),
            "octo/widget",
            "{}",
            CheckEventId::new("1"),
        );
        assert_eq!(job.status, JobStatus::Pending);
        assert!(!job.status.is_terminal());
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Dispatched.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }

    #[test]
    fn workflow_run_id_from_payload() {
        let payload = r#"{"action":"queued","workflow_job":{"id":7,"run_id":4242}}"#;
        let job = Job::new(
            TargetId::generate(),
            "octo/widget",
            payload,
            CheckEventId::new("7"),
        );
        assert_eq!(job.workflow_run_id(), Some(4242));
    }

    #[test]
    fn workflow_run_id_absent() {
        let job = Job::new(
            TargetId::generate(),
            "octo/widget",
            "not json",
            CheckEventId::new("7"),
        );
        assert_eq!(job.workflow_run_id(), None);
    }
}
