//! Rescue pass: reclaim jobs orphaned by webhook loss.
//!
//! A pending Job normally becomes `dispatched` within a tick or two.
//! When the backend is down for long enough, or the dispatch webhook
//! chain broke, jobs can sit pending forever. The rescue pass cancels
//! pending jobs older than the retention window whose provider-side
//! workflow run has already settled; anything still queued or running
//! on the provider is left for the starter.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::datastore::Datastore;
use crate::gh::ProviderApi;
use crate::metrics::count_error;
use crate::types::{Job, JobStatus};

/// How often the rescue pass runs.
const RESCUE_INTERVAL: Duration = Duration::from_secs(30);

/// Pending jobs younger than this are never touched.
const JOB_RETENTION_MINUTES: i64 = 30;

/// How many pending jobs one pass will examine.
const RESCUE_BATCH: usize = 1000;

/// The rescue reconciler.
pub struct Rescue {
    store: Arc<dyn Datastore>,
    provider: Arc<dyn ProviderApi>,
    retention: ChronoDuration,
}

impl Rescue {
    pub fn new(store: Arc<dyn Datastore>, provider: Arc<dyn ProviderApi>) -> Self {
        Rescue {
            store,
            provider,
            retention: ChronoDuration::minutes(JOB_RETENTION_MINUTES),
        }
    }

    #[cfg(test)]
    fn with_retention(mut self, retention: ChronoDuration) -> Self {
        self.retention = retention;
        self
    }

    /// Runs until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(RESCUE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("rescue loop stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }
            self.pass().await;
        }
    }

    /// One pass over the aged pending jobs.
    pub async fn pass(&self) {
        let jobs = match self.store.list_pending_jobs(RESCUE_BATCH).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "rescue could not list pending jobs");
                count_error("rescue", "list_pending");
                return;
            }
        };

        let cutoff = Utc::now() - self.retention;
        for job in jobs {
            if job.created_at > cutoff {
                continue;
            }
            self.examine(&job).await;
        }
    }

    async fn examine(&self, job: &Job) {
        let Some((owner, repo, run_id)) = run_reference(job) else {
            debug!(job = %job.id, "aged job has no workflow-run reference, skipping");
            return;
        };

        match self.provider.workflow_run_state(&owner, &repo, run_id).await {
            Ok(state) if state.is_active() => {
                debug!(job = %job.id, run_id, "run still active, leaving job pending");
            }
            Ok(_) => {
                info!(job = %job.id, run_id, "run settled without a dispatch, cancelling job");
                if let Err(e) = self
                    .store
                    .update_job_status(job.id, JobStatus::Cancelled)
                    .await
                {
                    warn!(job = %job.id, error = %e, "could not cancel rescued job");
                    count_error("rescue", "cancel");
                }
            }
            Err(e) => {
                warn!(job = %job.id, run_id, error = %e, "could not check run state");
                count_error("rescue", "run_state");
            }
        }
    }
}

/// Extracts `(owner, repo, run_id)` from the job's stored payload.
fn run_reference(job: &Job) -> Option<(String, String, u64)> {
    let run_id = job.workflow_run_id()?;
    let payload: serde_json::Value = serde_json::from_str(&job.payload).ok()?;
    let full_name = payload
        .get("repository")?
        .get("full_name")?
        .as_str()?;
    let (owner, repo) = full_name.split_once('/')?;
    Some((owner.to_string(), repo.to_string(), run_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::memory::MemoryDatastore;
    use crate::gh::WorkflowRunState;
    use crate::test_utils::FakeProvider;
    use crate::types::{CheckEventId, Scope, Target};

    fn payload(run_id: u64) -> String {
        serde_json::json!({
            "action": "queued",
            "workflow_job": { "id": 7, "run_id": run_id },
            "repository": { "full_name": "octo/widget" },
        })
        .to_string()
    }

    struct Fixture {
        store: Arc<MemoryDatastore>,
        provider: Arc<FakeProvider>,
        rescue: Rescue,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryDatastore::new());
        let provider = Arc::new(FakeProvider::new());
        let rescue = Rescue::new(store.clone(), provider.clone())
            .with_retention(ChronoDuration::minutes(30));
        Fixture {
            store,
            provider,
            rescue,
        }
    }

    async fn seed_aged_job(f: &Fixture, run_id: u64, age_minutes: i64) -> Job {
        let target = Target::new(Scope::parse("octo/widget").unwrap(), "default");
        f.store.create_target(&target).await.unwrap();
        let mut job = Job::new(
            target.id,
            "octo/widget",
            payload(run_id),
            CheckEventId::new(run_id.to_string()),
        );
        job.created_at = Utc::now() - ChronoDuration::minutes(age_minutes);
        f.store.enqueue_job(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn settled_run_cancels_the_aged_job() {
        let f = fixture();
        let job = seed_aged_job(&f, 42, 45).await;
        f.provider.set_run_state(42, WorkflowRunState::Settled);

        f.rescue.pass().await;

        assert_eq!(
            f.store.job_status(job.id).await,
            Some(JobStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn queued_run_is_left_pending() {
        let f = fixture();
        let job = seed_aged_job(&f, 42, 45).await;
        f.provider.set_run_state(42, WorkflowRunState::Queued);

        f.rescue.pass().await;

        assert_eq!(f.store.job_status(job.id).await, Some(JobStatus::Pending));
    }

    #[tokio::test]
    async fn young_jobs_are_never_touched() {
        let f = fixture();
        let job = seed_aged_job(&f, 42, 5).await;
        f.provider.set_run_state(42, WorkflowRunState::Settled);

        f.rescue.pass().await;

        assert_eq!(f.store.job_status(job.id).await, Some(JobStatus::Pending));
    }

    #[tokio::test]
    async fn provider_failure_leaves_the_job_pending() {
        let f = fixture();
        // No run state registered: the fake reports NotFound.
        let job = seed_aged_job(&f, 42, 45).await;

        f.rescue.pass().await;

        assert_eq!(f.store.job_status(job.id).await, Some(JobStatus::Pending));
    }

    #[tokio::test]
    async fn unparseable_payload_is_skipped() {
        let f = fixture();
        let target = Target::new(Scope::parse("octo/widget").unwrap(), "default");
        f.store.create_target(&target).await.unwrap();
        let mut job = Job::new(target.id, "octo/widget", "not json", CheckEventId::new("9"));
        job.created_at = Utc::now() - ChronoDuration::minutes(45);
        f.store.enqueue_job(&job).await.unwrap();

        f.rescue.pass().await;

        assert_eq!(f.store.job_status(job.id).await, Some(JobStatus::Pending));
    }
}
