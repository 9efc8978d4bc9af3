//! Datastore gateway: the persistence operations the core consumes.
//!
//! The pipeline never speaks SQL directly; everything goes through
//! [`Datastore`]. Production uses [`postgres::PostgresDatastore`];
//! tests (and single-node experiments) use [`memory::MemoryDatastore`].
//!
//! The gateway also owns two coordination primitives:
//!
//! - a process-wide **advisory lock** making one process the sole
//!   owner of the dispatch pipeline, and
//! - the **enqueue-notify rendezvous**, a capacity-1 channel the
//!   webhook intake posts to after persisting a Job so the starter
//!   wakes without waiting for its ticker. A post while a previous one
//!   is undrained is dropped: N webhooks during one tick cause exactly
//!   one extra tick.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::types::{
    DeletedReason, Job, JobId, JobStatus, Runner, RunnerStatus, RunnerUuid, Target, TargetId,
    TargetStatus,
};

/// Errors surfaced by datastore operations.
#[derive(Debug, Error)]
pub enum DatastoreError {
    /// A uniqueness rule rejected the write (duplicate check event id,
    /// duplicate scope, duplicate live cloud id).
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// The referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The advisory lock is held by another process.
    #[error("advisory lock is held by another process")]
    Locked,

    /// The backing store failed.
    #[error("datastore query failed: {0}")]
    Query(String),
}

impl From<sqlx::Error> for DatastoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DatastoreError::Duplicate(db.message().to_string())
            }
            sqlx::Error::RowNotFound => DatastoreError::NotFound(e.to_string()),
            _ => DatastoreError::Query(e.to_string()),
        }
    }
}

/// Persistence operations the core consumes.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn list_targets(&self) -> Result<Vec<Target>, DatastoreError>;
    async fn get_target(&self, id: TargetId) -> Result<Target, DatastoreError>;
    async fn get_target_by_scope(&self, scope: &str) -> Result<Option<Target>, DatastoreError>;
    async fn create_target(&self, target: &Target) -> Result<(), DatastoreError>;
    async fn update_target_status(
        &self,
        id: TargetId,
        status: TargetStatus,
    ) -> Result<(), DatastoreError>;
    async fn delete_target(&self, id: TargetId) -> Result<(), DatastoreError>;

    /// Persists a new pending Job. Fails with `Duplicate` when a Job
    /// for the same check event id already exists.
    async fn enqueue_job(&self, job: &Job) -> Result<(), DatastoreError>;
    /// Pending jobs, oldest first, at most `limit`.
    async fn list_pending_jobs(&self, limit: usize) -> Result<Vec<Job>, DatastoreError>;
    async fn delete_job(&self, id: JobId) -> Result<(), DatastoreError>;
    async fn update_job_status(&self, id: JobId, status: JobStatus)
    -> Result<(), DatastoreError>;

    /// Persists a new Runner row. Fails with `Duplicate` when a
    /// non-deleted row with the same cloud id exists.
    async fn create_runner(&self, runner: &Runner) -> Result<(), DatastoreError>;
    async fn get_runner(&self, uuid: RunnerUuid) -> Result<Runner, DatastoreError>;
    async fn list_runners(&self, include_deleted: bool) -> Result<Vec<Runner>, DatastoreError>;
    async fn list_runners_by_target(
        &self,
        target_id: TargetId,
        include_deleted: bool,
    ) -> Result<Vec<Runner>, DatastoreError>;
    /// Advances a live runner's status. Transitioning to `Running`
    /// stamps `started_at`. Completed rows are never modified.
    async fn update_runner_status(
        &self,
        uuid: RunnerUuid,
        status: RunnerStatus,
    ) -> Result<(), DatastoreError>;
    /// Flags a runner deleted with a reason and `finished_at`. A row
    /// that is already deleted is left untouched.
    async fn mark_runner_deleted(
        &self,
        uuid: RunnerUuid,
        finished_at: DateTime<Utc>,
        reason: DeletedReason,
    ) -> Result<(), DatastoreError>;

    /// Acquires the process-wide advisory lock, or `Locked`.
    async fn get_lock(&self) -> Result<(), DatastoreError>;
    /// Whether any process (including this one) holds the lock.
    async fn is_locked(&self) -> Result<bool, DatastoreError>;
    /// Releases the advisory lock on clean shutdown.
    async fn release_lock(&self) -> Result<(), DatastoreError>;
}

/// Creates the enqueue-notify rendezvous pair.
pub fn enqueue_channel() -> (JobNotifier, EnqueueSignal) {
    let (tx, rx) = mpsc::channel(1);
    (JobNotifier { tx }, EnqueueSignal { rx })
}

/// Posting half of the enqueue-notify rendezvous (webhook intake).
#[derive(Clone)]
pub struct JobNotifier {
    tx: mpsc::Sender<()>,
}

impl JobNotifier {
    /// Wakes the starter. Coalesces: a post while a previous one is
    /// undrained is silently dropped.
    pub fn notify(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Waiting half of the enqueue-notify rendezvous (starter loop).
pub struct EnqueueSignal {
    rx: mpsc::Receiver<()>,
}

impl EnqueueSignal {
    /// Waits for the next enqueue notification.
    ///
    /// Pends forever if every notifier has been dropped, which only
    /// happens during shutdown when the starter is being cancelled
    /// anyway.
    pub async fn wait(&mut self) {
        if self.rx.recv().await.is_none() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_wakes_waiter() {
        let (notifier, mut signal) = enqueue_channel();
        notifier.notify();
        tokio::time::timeout(std::time::Duration::from_millis(100), signal.wait())
            .await
            .expect("signal should fire");
    }

    #[tokio::test]
    async fn posts_coalesce_to_one_wakeup() {
        let (notifier, mut signal) = enqueue_channel();
        for _ in 0..10 {
            notifier.notify();
        }
        // First wait drains the single buffered post...
        tokio::time::timeout(std::time::Duration::from_millis(100), signal.wait())
            .await
            .expect("one wakeup is buffered");
        // ...and no second wakeup is pending.
        let second =
            tokio::time::timeout(std::time::Duration::from_millis(50), signal.wait()).await;
        assert!(second.is_err(), "coalesced posts must not queue up");
    }

    #[tokio::test]
    async fn notify_after_drain_wakes_again() {
        let (notifier, mut signal) = enqueue_channel();
        notifier.notify();
        signal.wait().await;
        notifier.notify();
        tokio::time::timeout(std::time::Duration::from_millis(100), signal.wait())
            .await
            .expect("fresh post after drain fires");
    }
}
