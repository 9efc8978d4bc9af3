//! Starter loop: pending Jobs become backend provisioning calls.
//!
//! A single long-lived reconciler. Each tick it drains a batch of
//! pending jobs and dispatches them in parallel, bounded by the batch
//! size. The tick fires on the enqueue-notify rendezvous or a ticker,
//! whichever comes first, so webhook bursts get immediate service and
//! missed notifications are bounded by the ticker interval.
//!
//! Jobs are never lost by a failed dispatch: anything that goes wrong
//! short of a permanent auth failure leaves the row pending for a
//! later tick (or the rescue pass).

pub mod rescue;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::datastore::{Datastore, DatastoreError, EnqueueSignal};
use crate::gh::{
    GhApiError, GhErrorKind, ProviderApi, RateLimitTracker, RetryConfig, retry_with_backoff,
};
use crate::metrics::{count_dispatch, count_error};
use crate::safety::{Admission, Safety};
use crate::shoes::{DockerHubCredential, RunnerSpec, Shoes, ShoesError};
use crate::types::{Job, JobStatus, Runner, RunnerUuid, Scope, Target};

/// Fallback tick interval when no enqueue notification arrives.
const TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Starter configuration.
#[derive(Debug, Clone)]
pub struct StarterConfig {
    /// Batch size and parallel-dispatch bound
    /// (`MAX_CONNECTIONS_TO_BACKEND`).
    pub batch_size: usize,
    /// Global default runner user.
    pub runner_user: String,
    /// Global default runner version.
    pub runner_version: String,
    pub docker_hub: Option<DockerHubCredential>,
}

/// The dispatch reconciler.
pub struct Starter {
    store: Arc<dyn Datastore>,
    provider: Arc<dyn ProviderApi>,
    shoes: Arc<dyn Shoes>,
    safety: Arc<dyn Safety>,
    rate_limits: Arc<RateLimitTracker>,
    config: StarterConfig,
}

impl Starter {
    pub fn new(
        store: Arc<dyn Datastore>,
        provider: Arc<dyn ProviderApi>,
        shoes: Arc<dyn Shoes>,
        safety: Arc<dyn Safety>,
        rate_limits: Arc<RateLimitTracker>,
        config: StarterConfig,
    ) -> Self {
        Starter {
            store,
            provider,
            shoes,
            safety,
            rate_limits,
            config,
        }
    }

    /// Runs until cancelled.
    pub async fn run(self: Arc<Self>, mut signal: EnqueueSignal, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("starter loop stopping");
                    return;
                }
                _ = signal.wait() => {}
                _ = ticker.tick() => {}
            }
            self.tick().await;
        }
    }

    /// One pass over the pending queue.
    pub async fn tick(&self) {
        let jobs = match self.store.list_pending_jobs(self.config.batch_size).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "could not list pending jobs");
                count_error("starter", "list_pending");
                return;
            }
        };
        if jobs.is_empty() {
            return;
        }
        debug!(batch = jobs.len(), "dispatching pending jobs");

        // The batch size doubles as the parallelism bound: the store
        // never hands us more than batch_size jobs.
        let mut dispatches = JoinSet::new();
        for job in jobs {
            let starter = self.clone_refs();
            dispatches.spawn(async move { starter.process_job(job).await });
        }
        while dispatches.join_next().await.is_some() {}
    }

    fn clone_refs(&self) -> JobProcessor {
        JobProcessor {
            store: self.store.clone(),
            provider: self.provider.clone(),
            shoes: self.shoes.clone(),
            safety: self.safety.clone(),
            rate_limits: self.rate_limits.clone(),
            config: self.config.clone(),
        }
    }
}

/// Per-job dispatch state, cheap to move into a task.
struct JobProcessor {
    store: Arc<dyn Datastore>,
    provider: Arc<dyn ProviderApi>,
    shoes: Arc<dyn Shoes>,
    safety: Arc<dyn Safety>,
    rate_limits: Arc<RateLimitTracker>,
    config: StarterConfig,
}

impl JobProcessor {
    async fn process_job(&self, job: Job) {
        let target = match self.store.get_target(job.target_id).await {
            Ok(target) => target,
            Err(DatastoreError::NotFound(_)) => {
                warn!(job = %job.id, "job references a missing target, deleting");
                if let Err(e) = self.store.delete_job(job.id).await {
                    warn!(job = %job.id, error = %e, "could not delete orphaned job");
                }
                return;
            }
            Err(e) => {
                warn!(job = %job.id, error = %e, "could not resolve target");
                count_error("starter", "target_lookup");
                return;
            }
        };
        if !target.is_active() {
            debug!(job = %job.id, scope = %target.scope, "target inactive, leaving job pending");
            return;
        }

        // Scenario: quota exhausted for the scope. Yield; the ticker
        // will come back after the reset.
        if let Some(reset) = self.rate_limits.exhausted_until(&job.scope, Utc::now()) {
            info!(job = %job.id, scope = %job.scope, %reset, "rate limited, deferring dispatch");
            return;
        }

        match self.safety.check(&job).await {
            Ok(Admission::Allow) => {}
            Ok(Admission::Deny(reason)) => {
                info!(job = %job.id, reason, "admission denied, leaving job pending");
                return;
            }
            Err(e) => {
                warn!(job = %job.id, error = %e, "admission check failed");
                count_error("starter", "safety");
                return;
            }
        }

        let scope = match Scope::parse(job.scope.clone()) {
            Ok(scope) => scope,
            Err(e) => {
                warn!(job = %job.id, error = %e, "job has an unparseable scope, cancelling");
                self.cancel_job(&job).await;
                return;
            }
        };

        let registration_token = match self.mint_registration_token(&scope).await {
            Ok(token) => token,
            Err(e) if is_permanent_auth(&e) => {
                warn!(job = %job.id, scope = %scope, error = %e, "permanent auth failure, cancelling job");
                count_error("starter", "permanent_auth");
                self.cancel_job(&job).await;
                return;
            }
            Err(e) => {
                if e.kind == GhErrorKind::RateLimited
                    && let Some(reset) = e.reset_at
                {
                    self.rate_limits.record(scope.as_str(), 0, reset);
                }
                warn!(job = %job.id, scope = %scope, error = %e, "could not mint registration token, leaving job pending");
                count_error("starter", "transient_auth");
                return;
            }
        };

        let spec = self.compose_spec(&target, registration_token);
        match self.shoes.add(&spec).await {
            Ok(added) => {
                let runner = Runner::new(
                    spec.uuid,
                    target.id,
                    added.cloud_id.clone(),
                    added.shoes_type,
                    added.ip_address,
                );
                if let Err(e) = self.store.create_runner(&runner).await {
                    // The instance exists but we cannot account for it;
                    // tear it down rather than leak it.
                    warn!(job = %job.id, cloud_id = %added.cloud_id, error = %e, "could not record runner, destroying instance");
                    count_error("starter", "record_runner");
                    if let Err(e) = self.shoes.delete(&added.cloud_id).await {
                        warn!(cloud_id = %added.cloud_id, error = %e, "instance teardown failed, manual reap needed");
                    }
                    return;
                }
                if let Err(e) = self
                    .store
                    .update_job_status(job.id, JobStatus::Dispatched)
                    .await
                {
                    warn!(job = %job.id, error = %e, "runner created but job not marked dispatched");
                    count_error("starter", "job_status");
                    return;
                }
                count_dispatch();
                info!(job = %job.id, runner = %runner.uuid, cloud_id = %runner.cloud_id, "job dispatched");
            }
            Err(ShoesError::Permanent(reason)) => {
                warn!(job = %job.id, reason, "backend rejected the runner spec, leaving job pending");
                count_error("starter", "backend_permanent");
            }
            Err(e) => {
                // Transient, timeout, or crash (already retried once by
                // the driver): a later tick or the rescue pass resolves.
                warn!(job = %job.id, error = %e, "backend add failed, leaving job pending");
                count_error("starter", "backend_transient");
            }
        }
    }

    async fn mint_registration_token(&self, scope: &Scope) -> Result<String, GhApiError> {
        retry_with_backoff(RetryConfig::REGISTRATION, || {
            self.provider.registration_token(scope)
        })
        .await
    }

    fn compose_spec(&self, target: &Target, registration_token: String) -> RunnerSpec {
        RunnerSpec {
            uuid: RunnerUuid::generate(),
            scope: target.scope.as_str().to_string(),
            registration_token,
            runner_version: target
                .runner_version
                .clone()
                .unwrap_or_else(|| self.config.runner_version.clone()),
            runner_user: target
                .runner_user
                .clone()
                .unwrap_or_else(|| self.config.runner_user.clone()),
            resource_type: target.resource_type.clone(),
            docker_hub: self.config.docker_hub.clone(),
        }
    }

    async fn cancel_job(&self, job: &Job) {
        if let Err(e) = self
            .store
            .update_job_status(job.id, JobStatus::Cancelled)
            .await
        {
            warn!(job = %job.id, error = %e, "could not cancel job");
        }
    }
}

fn is_permanent_auth(e: &GhApiError) -> bool {
    matches!(
        e.kind,
        GhErrorKind::Permanent | GhErrorKind::NotInstalled | GhErrorKind::NotFound
    )
}
