//! Runner lifecycle manager.
//!
//! Reconciles three views of the world every ten seconds: the
//! provider's list of registered runners, the backend's live
//! instances, and the datastore's intent. Drift is resolved toward
//! deletion: completed runners are destroyed, stuck ones are removed
//! from both provider and backend, and local rows with no provider
//! counterpart are reaped once a registration grace period passes.
//!
//! Backend deletes are retried with backoff; after the retries are
//! exhausted the row is left live with its cloud id so an operator can
//! reap the instance manually.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::datastore::Datastore;
use crate::gh::{ProviderApi, ProviderRunner, RetryConfig, retry_with_backoff};
use crate::metrics::{count_error, count_reaped};
use crate::shoes::Shoes;
use crate::types::{DeletedReason, Runner, RunnerStatus, RunnerUuid, Target, TargetStatus};

/// Reconciliation interval.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(10);

/// Lifecycle manager timing knobs.
#[derive(Debug, Clone)]
pub struct RunnerManagerConfig {
    /// A runner that never reached `running` within this window is
    /// stuck.
    pub must_running_time: ChronoDuration,
    /// A local row absent from the provider view is only reaped after
    /// this grace period; registration takes a while.
    pub orphan_grace: ChronoDuration,
}

impl Default for RunnerManagerConfig {
    fn default() -> Self {
        RunnerManagerConfig {
            must_running_time: ChronoDuration::minutes(15),
            orphan_grace: ChronoDuration::minutes(5),
        }
    }
}

/// The reconciler.
pub struct RunnerManager {
    store: Arc<dyn Datastore>,
    provider: Arc<dyn ProviderApi>,
    shoes: Arc<dyn Shoes>,
    config: RunnerManagerConfig,
}

impl RunnerManager {
    pub fn new(
        store: Arc<dyn Datastore>,
        provider: Arc<dyn ProviderApi>,
        shoes: Arc<dyn Shoes>,
        config: RunnerManagerConfig,
    ) -> Self {
        RunnerManager {
            store,
            provider,
            shoes,
            config,
        }
    }

    /// Runs until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("runner lifecycle manager stopping");
                    return;
                }
                _ = ticker.tick() => {}
            }
            self.reconcile().await;
        }
    }

    /// One reconciliation pass over every target.
    pub async fn reconcile(&self) {
        let targets = match self.store.list_targets().await {
            Ok(targets) => targets,
            Err(e) => {
                warn!(error = %e, "could not list targets");
                count_error("lifecycle", "list_targets");
                return;
            }
        };

        for target in targets {
            // Errored targets are an operator problem; deleting
            // targets still need their runners reaped.
            if target.status == TargetStatus::Errored {
                continue;
            }
            self.reconcile_target(&target).await;
        }
    }

    async fn reconcile_target(&self, target: &Target) {
        let provider_runners = match self.provider.list_runners(&target.scope).await {
            Ok(runners) => runners,
            Err(e) => {
                // Without the provider view we cannot tell live from
                // orphaned; skip the whole target this pass.
                warn!(scope = %target.scope, error = %e, "could not list provider runners");
                count_error("lifecycle", "list_runners");
                return;
            }
        };

        let locals = match self
            .store
            .list_runners_by_target(target.id, false)
            .await
        {
            Ok(locals) => locals,
            Err(e) => {
                warn!(scope = %target.scope, error = %e, "could not list local runners");
                count_error("lifecycle", "list_local");
                return;
            }
        };
        let locals: HashMap<RunnerUuid, Runner> =
            locals.into_iter().map(|r| (r.uuid, r)).collect();

        let now = Utc::now();
        let mut seen = Vec::new();

        for provider_runner in &provider_runners {
            let Some(uuid) = RunnerUuid::from_runner_name(&provider_runner.name) else {
                // Not one of ours (operators may register their own).
                continue;
            };
            let Some(local) = locals.get(&uuid) else {
                continue;
            };
            seen.push(uuid);
            self.reconcile_registered(target, provider_runner, local, now)
                .await;
        }

        // Local rows the provider does not know about.
        for (uuid, local) in &locals {
            if seen.contains(uuid) {
                continue;
            }
            self.reconcile_unregistered(target, local, now).await;
        }
    }

    /// A runner present in both the provider view and the store.
    async fn reconcile_registered(
        &self,
        target: &Target,
        provider_runner: &ProviderRunner,
        local: &Runner,
        now: DateTime<Utc>,
    ) {
        if provider_runner.busy {
            if local.status == RunnerStatus::Created {
                self.mark_running(local).await;
            }
            return;
        }

        // Stuck: registered but never picked up work inside the window.
        let never_ran = local.status == RunnerStatus::Created && local.started_at.is_none();
        if never_ran && local.age_at(now) > self.config.must_running_time {
            info!(
                runner = %local.uuid,
                scope = %target.scope,
                "runner never reached running, reaping from provider and backend"
            );
            if let Err(e) = self
                .provider
                .remove_runner(&target.scope, provider_runner.id)
                .await
            {
                warn!(runner = %local.uuid, error = %e, "provider removal failed, continuing with backend delete");
                count_error("lifecycle", "remove_runner");
            }
            self.destroy(local, DeletedReason::Orphaned, now).await;
            return;
        }

        if provider_runner.is_offline() {
            match local.status {
                // Detached cleanly after finishing its job.
                RunnerStatus::Running | RunnerStatus::Completed => {
                    self.destroy(local, DeletedReason::Completed, now).await;
                }
                // Still registering or already reaped; wait.
                _ => {}
            }
            return;
        }

        // Online and idle: the runner came up. Record it.
        if local.status == RunnerStatus::Created {
            self.mark_running(local).await;
        }
    }

    /// A local row with no provider-side registration.
    async fn reconcile_unregistered(&self, target: &Target, local: &Runner, now: DateTime<Utc>) {
        match local.status {
            // The webhook already told us this one finished.
            RunnerStatus::Completed => {
                debug!(runner = %local.uuid, scope = %target.scope, "completed runner gone from provider, destroying");
                self.destroy(local, DeletedReason::Completed, now).await;
            }
            _ => {
                if local.age_at(now) > self.config.orphan_grace {
                    info!(
                        runner = %local.uuid,
                        scope = %target.scope,
                        "runner never registered with the provider, reaping"
                    );
                    self.destroy(local, DeletedReason::Orphaned, now).await;
                }
            }
        }
    }

    async fn mark_running(&self, local: &Runner) {
        debug!(runner = %local.uuid, "runner observed online");
        if let Err(e) = self
            .store
            .update_runner_status(local.uuid, RunnerStatus::Running)
            .await
        {
            warn!(runner = %local.uuid, error = %e, "could not record running status");
        }
    }

    /// Destroys the backend instance (with retries) and flags the row
    /// deleted. On exhausted retries the row is left live and escalated.
    async fn destroy(&self, local: &Runner, reason: DeletedReason, now: DateTime<Utc>) {
        let delete = retry_with_backoff(RetryConfig::BACKEND_DELETE, || {
            self.shoes.delete(&local.cloud_id)
        })
        .await;

        if let Err(e) = delete {
            error!(
                runner = %local.uuid,
                cloud_id = %local.cloud_id,
                error = %e,
                "backend delete failed after retries; instance needs manual reaping"
            );
            count_error("lifecycle", "backend_delete");
            return;
        }

        match self.store.mark_runner_deleted(local.uuid, now, reason).await {
            Ok(()) => {
                count_reaped(match reason {
                    DeletedReason::Completed => "completed",
                    DeletedReason::Orphaned => "orphaned",
                });
                info!(runner = %local.uuid, %reason, "runner deleted");
            }
            Err(e) => {
                warn!(runner = %local.uuid, error = %e, "could not flag runner deleted");
                count_error("lifecycle", "mark_deleted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::memory::MemoryDatastore;
    use crate::test_utils::{FakeProvider, FakeShoes};
    use crate::types::Scope;
    use crate::shoes::ShoesError;

    struct Fixture {
        store: Arc<MemoryDatastore>,
        provider: Arc<FakeProvider>,
        shoes: Arc<FakeShoes>,
        manager: RunnerManager,
        target: Target,
    }

    async fn fixture(scope: &str) -> Fixture {
        let store = Arc::new(MemoryDatastore::new());
        let provider = Arc::new(FakeProvider::new());
        let shoes = Arc::new(FakeShoes::new());
        let target = Target::new(Scope::parse(scope).unwrap(), "default");
        store.create_target(&target).await.unwrap();
        let manager = RunnerManager::new(
            store.clone(),
            provider.clone(),
            shoes.clone(),
            RunnerManagerConfig::default(),
        );
        Fixture {
            store,
            provider,
            shoes,
            manager,
            target,
        }
    }

    async fn seed_runner(f: &Fixture, cloud_id: &str, age_minutes: i64) -> Runner {
        let mut runner = Runner::new(
            RunnerUuid::generate(),
            f.target.id,
            cloud_id,
            "shoes-fake",
            None,
        );
        runner.created_at = Utc::now() - ChronoDuration::minutes(age_minutes);
        f.store.create_runner(&runner).await.unwrap();
        runner
    }

    fn on_provider(runner: &Runner, id: u64, status: &str, busy: bool) -> ProviderRunner {
        ProviderRunner {
            id,
            name: runner.uuid.to_string(),
            status: status.to_string(),
            busy,
        }
    }

    #[tokio::test]
    async fn offline_running_runner_is_deleted_as_completed() {
        let f = fixture("octo/widget").await;
        let runner = seed_runner(&f, "i-001", 3).await;
        f.store
            .update_runner_status(runner.uuid, RunnerStatus::Running)
            .await
            .unwrap();
        f.provider
            .set_runners("octo/widget", vec![on_provider(&runner, 11, "offline", false)]);

        f.manager.reconcile().await;

        assert_eq!(f.shoes.deleted_ids(), vec!["i-001"]);
        let stored = f.store.get_runner(runner.uuid).await.unwrap();
        assert!(stored.deleted);
        assert_eq!(stored.deleted_reason, Some(DeletedReason::Completed));
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn busy_runners_are_ignored() {
        let f = fixture("octo/widget").await;
        let runner = seed_runner(&f, "i-001", 30).await;
        f.provider
            .set_runners("octo/widget", vec![on_provider(&runner, 11, "online", true)]);

        f.manager.reconcile().await;

        assert!(f.shoes.deleted_ids().is_empty());
        let stored = f.store.get_runner(runner.uuid).await.unwrap();
        assert!(!stored.deleted);
        // Busy implies it picked up work.
        assert_eq!(stored.status, RunnerStatus::Running);
    }

    #[tokio::test]
    async fn stuck_runner_is_reaped_from_both_sides() {
        let f = fixture("octo/widget").await;
        let runner = seed_runner(&f, "i-002", 20).await;
        f.provider
            .set_runners("octo/widget", vec![on_provider(&runner, 22, "offline", false)]);

        f.manager.reconcile().await;

        assert_eq!(
            f.provider.removed.lock().unwrap().as_slice(),
            &[("octo/widget".to_string(), 22)]
        );
        assert_eq!(f.shoes.deleted_ids(), vec!["i-002"]);
        let stored = f.store.get_runner(runner.uuid).await.unwrap();
        assert!(stored.deleted);
        assert_eq!(stored.deleted_reason, Some(DeletedReason::Orphaned));
    }

    #[tokio::test]
    async fn young_created_runner_is_left_alone() {
        let f = fixture("octo/widget").await;
        let runner = seed_runner(&f, "i-003", 2).await;
        f.provider
            .set_runners("octo/widget", vec![on_provider(&runner, 33, "offline", false)]);

        f.manager.reconcile().await;

        assert!(f.shoes.deleted_ids().is_empty());
        assert!(!f.store.get_runner(runner.uuid).await.unwrap().deleted);
    }

    #[tokio::test]
    async fn online_idle_runner_is_marked_running() {
        let f = fixture("octo/widget").await;
        let runner = seed_runner(&f, "i-004", 2).await;
        f.provider
            .set_runners("octo/widget", vec![on_provider(&runner, 44, "online", false)]);

        f.manager.reconcile().await;

        let stored = f.store.get_runner(runner.uuid).await.unwrap();
        assert_eq!(stored.status, RunnerStatus::Running);
        assert!(stored.started_at.is_some());
    }

    #[tokio::test]
    async fn unregistered_runner_is_orphaned_after_grace() {
        let f = fixture("octo/widget").await;
        let aged = seed_runner(&f, "i-005", 6).await;
        let young = seed_runner(&f, "i-006", 1).await;
        f.provider.set_runners("octo/widget", vec![]);

        f.manager.reconcile().await;

        assert_eq!(f.shoes.deleted_ids(), vec!["i-005"]);
        let reaped = f.store.get_runner(aged.uuid).await.unwrap();
        assert!(reaped.deleted);
        assert_eq!(reaped.deleted_reason, Some(DeletedReason::Orphaned));
        assert!(!f.store.get_runner(young.uuid).await.unwrap().deleted);
    }

    #[tokio::test]
    async fn webhook_completed_runner_is_destroyed_symmetrically() {
        let f = fixture("octo/widget").await;
        let runner = seed_runner(&f, "i-007", 1).await;
        f.store
            .update_runner_status(runner.uuid, RunnerStatus::Completed)
            .await
            .unwrap();
        f.provider.set_runners("octo/widget", vec![]);

        f.manager.reconcile().await;

        assert_eq!(f.shoes.deleted_ids(), vec!["i-007"]);
        let stored = f.store.get_runner(runner.uuid).await.unwrap();
        assert!(stored.deleted);
        assert_eq!(stored.deleted_reason, Some(DeletedReason::Completed));
    }

    #[tokio::test]
    async fn provider_listing_failure_skips_the_target() {
        let f = fixture("octo/widget").await;
        let aged = seed_runner(&f, "i-008", 60).await;
        f.provider.break_listing("octo/widget");

        f.manager.reconcile().await;

        // Without the provider view we cannot tell live from orphaned,
        // so even a very old runner is left untouched.
        assert!(f.shoes.deleted_ids().is_empty());
        assert!(!f.store.get_runner(aged.uuid).await.unwrap().deleted);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_delete_retries_leave_the_row_for_manual_reaping() {
        let f = fixture("octo/widget").await;
        let runner = seed_runner(&f, "i-009", 6).await;
        f.provider.set_runners("octo/widget", vec![]);
        // Initial attempt plus five retries, all failing.
        for _ in 0..6 {
            f.shoes
                .script_delete(Err(ShoesError::Transient("api flapping".to_string())));
        }

        f.manager.reconcile().await;

        let stored = f.store.get_runner(runner.uuid).await.unwrap();
        assert!(!stored.deleted, "row must survive for manual reaping");
        assert_eq!(stored.cloud_id, "i-009");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_delete_failures_are_retried_to_success() {
        let f = fixture("octo/widget").await;
        let runner = seed_runner(&f, "i-010", 6).await;
        f.provider.set_runners("octo/widget", vec![]);
        f.shoes
            .script_delete(Err(ShoesError::Transient("blip".to_string())));

        f.manager.reconcile().await;

        assert_eq!(f.shoes.deleted_ids(), vec!["i-010"]);
        assert!(f.store.get_runner(runner.uuid).await.unwrap().deleted);
    }

    #[tokio::test]
    async fn foreign_provider_runners_are_ignored() {
        let f = fixture("octo/widget").await;
        f.provider.set_runners(
            "octo/widget",
            vec![ProviderRunner {
                id: 99,
                name: "ops-build-box".to_string(),
                status: "offline".to_string(),
                busy: false,
            }],
        );

        f.manager.reconcile().await;

        assert!(f.provider.removed.lock().unwrap().is_empty());
        assert!(f.shoes.deleted_ids().is_empty());
    }
}
