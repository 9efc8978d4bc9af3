//! Runners: backend instances registered (or intended to be) with GitHub.
//!
//! A Runner row is the datastore's record of intent and audit trail;
//! the backend plugin holds the authoritative instance handle. The
//! lifecycle manager reconciles the two views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::{RunnerUuid, TargetId};

/// Lifecycle status of a Runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    /// Backend instance created; not yet seen online by the provider.
    Created,
    /// Observed online (or busy) on the provider side.
    Running,
    /// Finished its job; detached from the provider.
    Completed,
    /// Never became useful; reaped by the reconciler.
    Orphaned,
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunnerStatus::Created => "created",
            RunnerStatus::Running => "running",
            RunnerStatus::Completed => "completed",
            RunnerStatus::Orphaned => "orphaned",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RunnerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(RunnerStatus::Created),
            "running" => Ok(RunnerStatus::Running),
            "completed" => Ok(RunnerStatus::Completed),
            "orphaned" => Ok(RunnerStatus::Orphaned),
            other => Err(format!("unknown runner status: {other}")),
        }
    }
}

/// Why a Runner row was marked deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletedReason {
    /// The runner went offline after finishing its job.
    Completed,
    /// The runner never did useful work and was reaped.
    Orphaned,
}

impl fmt::Display for DeletedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeletedReason::Completed => "completed",
            DeletedReason::Orphaned => "orphaned",
        };
        write!(f, "{s}")
    }
}

/// A materialised backend instance.
///
/// Invariants:
/// - `cloud_id` is unique among rows with `deleted = false`.
/// - A row is never removed from the store while `deleted = false`;
///   deletion is a flag flip with `finished_at` set.
/// - Once `status` is `Completed`, no further transitions happen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runner {
    pub uuid: RunnerUuid,
    /// Backend flavour reported by the plugin's `add` reply.
    pub shoes_type: String,
    pub ip_address: Option<String>,
    pub target_id: TargetId,
    /// Opaque instance handle returned by the backend.
    pub cloud_id: String,
    pub deleted: bool,
    pub status: RunnerStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub deleted_reason: Option<DeletedReason>,
}

impl Runner {
    /// Creates a freshly-dispatched Runner row.
    pub fn new(
        uuid: RunnerUuid,
        target_id: TargetId,
        cloud_id: impl Into<String>,
        shoes_type: impl Into<String>,
        ip_address: Option<String>,
    ) -> Self {
        Runner {
            uuid,
            shoes_type: shoes_type.into(),
            ip_address,
            target_id,
            cloud_id: cloud_id.into(),
            deleted: false,
            status: RunnerStatus::Created,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            deleted_reason: None,
        }
    }

    /// True when a status transition to `next` is allowed.
    ///
    /// Completed is terminal; everything else may advance.
    pub fn can_transition_to(&self, next: RunnerStatus) -> bool {
        if self.status == RunnerStatus::Completed {
            return false;
        }
        self.status != next
    }

    /// Age of the runner at `now`.
    pub fn age_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> Runner {
        Runner::new(
            RunnerUuid::generate(),
            TargetId::generate(),
            "i-001",
            "shoes-test",
            Some("192.0.2.1".to_string()),
        )
    }

    #[test]
    fn new_runner_is_live() {
        let r = runner();
        assert!(!r.deleted);
        assert_eq!(r.status, RunnerStatus::Created);
        assert!(r.finished_at.is_none());
    }

    #[test]
    fn completed_is_terminal() {
        let mut r = runner();
        r.status = RunnerStatus::Completed;
        assert!(!r.can_transition_to(RunnerStatus::Running));
        assert!(!r.can_transition_to(RunnerStatus::Orphaned));
    }

    #[test]
    fn created_may_advance() {
        let r = runner();
        assert!(r.can_transition_to(RunnerStatus::Running));
        assert!(r.can_transition_to(RunnerStatus::Completed));
        assert!(!r.can_transition_to(RunnerStatus::Created));
    }

    #[test]
    fn age_is_measured_from_creation() {
        let r = runner();
        let later = r.created_at + chrono::Duration::minutes(20);
        assert_eq!(r.age_at(later), chrono::Duration::minutes(20));
    }
}
