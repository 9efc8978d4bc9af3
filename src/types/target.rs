//! Targets: the scopes the autoscaler is responsible for.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::TargetId;
use super::scope::Scope;

/// Lifecycle status of a Target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    /// Eligible for autoscaling.
    Active,
    /// Deletion requested; no new runners are dispatched for it.
    Deleting,
    /// Something is wrong (e.g. the installation disappeared).
    Errored,
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetStatus::Active => "active",
            TargetStatus::Deleting => "deleting",
            TargetStatus::Errored => "errored",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TargetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(TargetStatus::Active),
            "deleting" => Ok(TargetStatus::Deleting),
            "errored" => Ok(TargetStatus::Errored),
            other => Err(format!("unknown target status: {other}")),
        }
    }
}

/// A registered scope the system autoscales for.
///
/// The scope string is unique across Targets; its shape (organization
/// vs repository) decides which GitHub API family is used for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub scope: Scope,
    /// Hint forwarded to the backend plugin (instance size, pool, ...).
    pub resource_type: String,
    /// OS user the runner agent runs as; falls back to the global default.
    pub runner_user: Option<String>,
    /// Pinned runner agent version; falls back to the global default.
    pub runner_version: Option<String>,
    /// Personal access token override for this scope, if any.
    ///
    /// Never serialized back out through the admin API.
    #[serde(skip_serializing)]
    pub github_token: Option<String>,
    pub status: TargetStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Target {
    /// Creates a new active Target for a scope.
    pub fn new(scope: Scope, resource_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Target {
            id: TargetId::generate(),
            scope,
            resource_type: resource_type.into(),
            runner_user: None,
            runner_version: None,
            github_token: None,
            status: TargetStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when the starter may dispatch runners for this Target.
    pub fn is_active(&self) -> bool {
        self.status == TargetStatus::Active
    }
}
