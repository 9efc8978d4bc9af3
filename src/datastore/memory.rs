//! In-memory datastore.
//!
//! Backs the test suite and single-node experiments. Enforces the same
//! uniqueness rules as the Postgres implementation so tests exercise
//! the real failure paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use super::{Datastore, DatastoreError};
use crate::types::{
    DeletedReason, Job, JobId, JobStatus, Runner, RunnerStatus, RunnerUuid, Target, TargetId,
    TargetStatus,
};

#[derive(Default)]
struct State {
    targets: HashMap<TargetId, Target>,
    jobs: HashMap<JobId, Job>,
    runners: HashMap<RunnerUuid, Runner>,
}

/// Mutex-protected maps with the gateway's uniqueness rules.
#[derive(Default)]
pub struct MemoryDatastore {
    state: Mutex<State>,
    locked: AtomicBool,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
impl MemoryDatastore {
    /// Test-only peek at a job's status regardless of terminality.
    pub async fn job_status(&self, id: JobId) -> Option<JobStatus> {
        let state = self.state.lock().await;
        state.jobs.get(&id).map(|j| j.status)
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn list_targets(&self) -> Result<Vec<Target>, DatastoreError> {
        let state = self.state.lock().await;
        let mut targets: Vec<_> = state.targets.values().cloned().collect();
        targets.sort_by_key(|t| t.created_at);
        Ok(targets)
    }

    async fn get_target(&self, id: TargetId) -> Result<Target, DatastoreError> {
        let state = self.state.lock().await;
        state
            .targets
            .get(&id)
            .cloned()
            .ok_or_else(|| DatastoreError::NotFound(format!("target {id}")))
    }

    async fn get_target_by_scope(&self, scope: &str) -> Result<Option<Target>, DatastoreError> {
        let state = self.state.lock().await;
        Ok(state
            .targets
            .values()
            .find(|t| t.scope.as_str() == scope)
            .cloned())
    }

    async fn create_target(&self, target: &Target) -> Result<(), DatastoreError> {
        let mut state = self.state.lock().await;
        if state
            .targets
            .values()
            .any(|t| t.scope.as_str() == target.scope.as_str())
        {
            return Err(DatastoreError::Duplicate(format!(
                "target scope {}",
                target.scope
            )));
        }
        state.targets.insert(target.id, target.clone());
        Ok(())
    }

    async fn update_target_status(
        &self,
        id: TargetId,
        status: TargetStatus,
    ) -> Result<(), DatastoreError> {
        let mut state = self.state.lock().await;
        let target = state
            .targets
            .get_mut(&id)
            .ok_or_else(|| DatastoreError::NotFound(format!("target {id}")))?;
        target.status = status;
        target.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_target(&self, id: TargetId) -> Result<(), DatastoreError> {
        let mut state = self.state.lock().await;
        state
            .targets
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| DatastoreError::NotFound(format!("target {id}")))
    }

    async fn enqueue_job(&self, job: &Job) -> Result<(), DatastoreError> {
        let mut state = self.state.lock().await;
        if state
            .jobs
            .values()
            .any(|j| j.check_event_id == job.check_event_id)
        {
            return Err(DatastoreError::Duplicate(format!(
                "check event {}",
                job.check_event_id
            )));
        }
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn list_pending_jobs(&self, limit: usize) -> Result<Vec<Job>, DatastoreError> {
        let state = self.state.lock().await;
        let mut pending: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|j| j.created_at);
        pending.truncate(limit);
        Ok(pending)
    }

    async fn delete_job(&self, id: JobId) -> Result<(), DatastoreError> {
        let mut state = self.state.lock().await;
        state
            .jobs
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| DatastoreError::NotFound(format!("job {id}")))
    }

    async fn update_job_status(
        &self,
        id: JobId,
        status: JobStatus,
    ) -> Result<(), DatastoreError> {
        let mut state = self.state.lock().await;
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| DatastoreError::NotFound(format!("job {id}")))?;
        job.status = status;
        Ok(())
    }

    async fn create_runner(&self, runner: &Runner) -> Result<(), DatastoreError> {
        let mut state = self.state.lock().await;
        if state
            .runners
            .values()
            .any(|r| !r.deleted && r.cloud_id == runner.cloud_id)
        {
            return Err(DatastoreError::Duplicate(format!(
                "cloud id {}",
                runner.cloud_id
            )));
        }
        state.runners.insert(runner.uuid, runner.clone());
        Ok(())
    }

    async fn get_runner(&self, uuid: RunnerUuid) -> Result<Runner, DatastoreError> {
        let state = self.state.lock().await;
        state
            .runners
            .get(&uuid)
            .cloned()
            .ok_or_else(|| DatastoreError::NotFound(format!("runner {uuid}")))
    }

    async fn list_runners(&self, include_deleted: bool) -> Result<Vec<Runner>, DatastoreError> {
        let state = self.state.lock().await;
        let mut runners: Vec<_> = state
            .runners
            .values()
            .filter(|r| include_deleted || !r.deleted)
            .cloned()
            .collect();
        runners.sort_by_key(|r| r.created_at);
        Ok(runners)
    }

    async fn list_runners_by_target(
        &self,
        target_id: TargetId,
        include_deleted: bool,
    ) -> Result<Vec<Runner>, DatastoreError> {
        let state = self.state.lock().await;
        let mut runners: Vec<_> = state
            .runners
            .values()
            .filter(|r| r.target_id == target_id && (include_deleted || !r.deleted))
            .cloned()
            .collect();
        runners.sort_by_key(|r| r.created_at);
        Ok(runners)
    }

    async fn update_runner_status(
        &self,
        uuid: RunnerUuid,
        status: RunnerStatus,
    ) -> Result<(), DatastoreError> {
        let mut state = self.state.lock().await;
        let runner = state
            .runners
            .get_mut(&uuid)
            .ok_or_else(|| DatastoreError::NotFound(format!("runner {uuid}")))?;
        if !runner.can_transition_to(status) {
            return Ok(());
        }
        runner.status = status;
        if status == RunnerStatus::Running && runner.started_at.is_none() {
            runner.started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_runner_deleted(
        &self,
        uuid: RunnerUuid,
        finished_at: DateTime<Utc>,
        reason: DeletedReason,
    ) -> Result<(), DatastoreError> {
        let mut state = self.state.lock().await;
        let runner = state
            .runners
            .get_mut(&uuid)
            .ok_or_else(|| DatastoreError::NotFound(format!("runner {uuid}")))?;
        if runner.deleted {
            return Ok(());
        }
        runner.deleted = true;
        runner.finished_at = Some(finished_at.max(runner.created_at));
        runner.deleted_reason = Some(reason);
        runner.status = match reason {
            DeletedReason::Completed => RunnerStatus::Completed,
            DeletedReason::Orphaned => RunnerStatus::Orphaned,
        };
        Ok(())
    }

    async fn get_lock(&self) -> Result<(), DatastoreError> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            Ok(())
        } else {
            Err(DatastoreError::Locked)
        }
    }

    async fn is_locked(&self) -> Result<bool, DatastoreError> {
        Ok(self.locked.load(Ordering::SeqCst))
    }

    async fn release_lock(&self) -> Result<(), DatastoreError> {
        self.locked.store(false, Ordering::SeqCst);
        Ok(())
    }
}
