//! The provider operations the core pipeline consumes.
//!
//! [`ProviderApi`] is the narrow interface injected into the starter,
//! the lifecycle manager, and the rescue pass; [`GitHubApi`] is the
//! production implementation on top of the client factory, the token
//! cache, and installation discovery. Tests substitute fakes.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use octocrab::Octocrab;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::client::ClientFactory;
use super::error::GhApiError;
use super::installation::{
    INSTALLATIONS_PER_PAGE, InstallationLister, InstallationRecord, RepositoryListing,
    find_installation,
};
use super::rate_limit::RateLimitTracker;
use super::token_cache::{MintedToken, TokenCache, TokenMinter};
use crate::types::Scope;

/// Deadline for any single provider API call.
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Self-hosted runners are listed in pages of this size.
const RUNNERS_PER_PAGE: u32 = 100;

/// A registered runner as the provider sees it.
#[derive(Debug, Clone)]
pub struct ProviderRunner {
    pub id: u64,
    pub name: String,
    pub status: String,
    pub busy: bool,
}

impl ProviderRunner {
    pub fn is_offline(&self) -> bool {
        self.status.eq_ignore_ascii_case("offline")
    }
}

/// Provider-side state of a workflow run, as far as rescue cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowRunState {
    Queued,
    InProgress,
    /// Completed, cancelled, skipped — anything no longer waiting for
    /// or holding a runner.
    Settled,
}

impl WorkflowRunState {
    pub fn from_status(status: &str) -> Self {
        match status {
            "queued" => WorkflowRunState::Queued,
            "in_progress" => WorkflowRunState::InProgress,
            _ => WorkflowRunState::Settled,
        }
    }

    /// True while the run may still need (or be using) a runner.
    pub fn is_active(&self) -> bool {
        matches!(self, WorkflowRunState::Queued | WorkflowRunState::InProgress)
    }
}

/// The provider operations the pipeline needs.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    /// Mints a one-shot runner registration token for the scope.
    async fn registration_token(&self, scope: &Scope) -> Result<String, GhApiError>;

    /// All self-hosted runners currently registered on the scope.
    async fn list_runners(&self, scope: &Scope) -> Result<Vec<ProviderRunner>, GhApiError>;

    /// Removes a runner registration. Missing registrations count as
    /// success.
    async fn remove_runner(&self, scope: &Scope, runner_id: u64) -> Result<(), GhApiError>;

    /// The state of a workflow run, for rescue decisions.
    async fn workflow_run_state(
        &self,
        owner: &str,
        repo: &str,
        run_id: u64,
    ) -> Result<WorkflowRunState, GhApiError>;
}

// Wire types for the endpoints octocrab does not model.

#[derive(Debug, Deserialize)]
struct AccessTokenWire {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RegistrationTokenWire {
    token: String,
}

#[derive(Debug, Deserialize)]
struct RunnerPageWire {
    runners: Vec<RunnerWire>,
}

#[derive(Debug, Deserialize)]
struct RunnerWire {
    id: u64,
    name: String,
    status: String,
    busy: bool,
}

#[derive(Debug, Deserialize)]
struct WorkflowRunWire {
    status: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitWire {
    resources: RateLimitResourcesWire,
}

#[derive(Debug, Deserialize)]
struct RateLimitResourcesWire {
    core: RateResourceWire,
}

#[derive(Debug, Deserialize)]
struct RateResourceWire {
    remaining: u64,
    reset: i64,
}

#[derive(Debug, Deserialize)]
struct InstallationWire {
    id: u64,
    account: AccountWire,
    #[serde(default)]
    repository_selection: Option<String>,
    #[serde(default)]
    suspended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct AccountWire {
    login: String,
}

#[derive(Debug, Deserialize)]
struct InstallationRepositoriesWire {
    total_count: i64,
    repositories: Vec<RepositoryWire>,
}

#[derive(Debug, Deserialize)]
struct RepositoryWire {
    full_name: String,
}

/// Production [`ProviderApi`] built on octocrab.
pub struct GitHubApi {
    factory: ClientFactory,
    tokens: Arc<TokenCache>,
    rate_limits: Arc<RateLimitTracker>,
}

impl GitHubApi {
    pub fn new(
        factory: ClientFactory,
        tokens: Arc<TokenCache>,
        rate_limits: Arc<RateLimitTracker>,
    ) -> Self {
        GitHubApi {
            factory,
            tokens,
            rate_limits,
        }
    }

    /// A client authenticated for the installation covering `scope`.
    async fn installation_client(&self, scope: &Scope) -> Result<Octocrab, GhApiError> {
        let installation_id = find_installation(self, scope).await?;
        let token = self
            .tokens
            .installation_token(installation_id, scope.as_str())
            .await?;
        self.factory.token_client(&token)
    }

    /// Best-effort refresh of the scope's rate-limit snapshot.
    async fn refresh_rate_limit(&self, client: &Octocrab, scope: &str) {
        let result: Result<RateLimitWire, _> = client.get("/rate_limit", None::<&()>).await;
        match result {
            Ok(wire) => {
                let reset_at = Utc
                    .timestamp_opt(wire.resources.core.reset, 0)
                    .single()
                    .unwrap_or_else(Utc::now);
                self.rate_limits
                    .record(scope, wire.resources.core.remaining, reset_at);
            }
            Err(e) => debug!(scope, error = %e, "rate limit probe failed"),
        }
    }
}

#[async_trait]
impl InstallationLister for GitHubApi {
    async fn list_installations(
        &self,
        page: u32,
    ) -> Result<Vec<InstallationRecord>, GhApiError> {
        let client = self.factory.app_client()?;
        let route = format!(
            "/app/installations?per_page={INSTALLATIONS_PER_PAGE}&page={page}"
        );
        let wire: Vec<InstallationWire> = timed("list_installations", async {
            client
                .get(&route, None::<&()>)
                .await
                .map_err(GhApiError::from_octocrab)
        })
        .await?;

        Ok(wire
            .into_iter()
            .map(|i| InstallationRecord {
                id: i.id,
                account_login: i.account.login,
                repository_selection: i.repository_selection.unwrap_or_default(),
                suspended: i.suspended_at.is_some(),
            })
            .collect())
    }

    async fn list_installation_repositories(
        &self,
        installation_id: u64,
        scope: &str,
    ) -> Result<RepositoryListing, GhApiError> {
        let token = self
            .tokens
            .installation_token(installation_id, scope)
            .await?;
        let client = self.factory.token_client(&token)?;
        let wire: InstallationRepositoriesWire = timed("list_installation_repositories", async {
            client
                .get("/installation/repositories", None::<&()>)
                .await
                .map_err(GhApiError::from_octocrab)
        })
        .await?;

        Ok(RepositoryListing {
            total_count: wire.total_count,
            full_names: wire.repositories.into_iter().map(|r| r.full_name).collect(),
        })
    }
}

#[async_trait]
impl ProviderApi for GitHubApi {
    async fn registration_token(&self, scope: &Scope) -> Result<String, GhApiError> {
        let client = self.installation_client(scope).await?;
        let route = registration_token_route(scope);
        let wire: RegistrationTokenWire = timed("registration_token", async {
            client
                .post(&route, None::<&()>)
                .await
                .map_err(GhApiError::from_octocrab)
        })
        .await?;
        self.refresh_rate_limit(&client, scope.as_str()).await;
        Ok(wire.token)
    }

    async fn list_runners(&self, scope: &Scope) -> Result<Vec<ProviderRunner>, GhApiError> {
        let client = self.installation_client(scope).await?;
        let mut runners = Vec::new();
        let mut page = 1u32;
        loop {
            let route = runners_route(scope, page);
            let wire: RunnerPageWire = timed("list_runners", async {
                client
                    .get(&route, None::<&()>)
                    .await
                    .map_err(GhApiError::from_octocrab)
            })
            .await?;
            let fetched = wire.runners.len();
            runners.extend(wire.runners.into_iter().map(|r| ProviderRunner {
                id: r.id,
                name: r.name,
                status: r.status,
                busy: r.busy,
            }));
            if fetched < RUNNERS_PER_PAGE as usize {
                return Ok(runners);
            }
            page += 1;
        }
    }

    async fn remove_runner(&self, scope: &Scope, runner_id: u64) -> Result<(), GhApiError> {
        let client = self.installation_client(scope).await?;
        let route = remove_runner_route(scope, runner_id);
        let result: Result<serde_json::Value, GhApiError> = timed("remove_runner", async {
            client
                .delete(&route, None::<&()>)
                .await
                .map_err(GhApiError::from_octocrab)
        })
        .await;
        match result {
            Ok(_) => Ok(()),
            // Already unregistered: the outcome we wanted.
            Err(e) if e.kind == super::error::GhErrorKind::NotFound => {
                debug!(scope = %scope, runner_id, "runner already removed from provider");
                Ok(())
            }
            // DELETE returns 204; a body-decode failure after a
            // successful request is success.
            Err(e) if is_empty_body_error(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn workflow_run_state(
        &self,
        owner: &str,
        repo: &str,
        run_id: u64,
    ) -> Result<WorkflowRunState, GhApiError> {
        let scope = Scope::parse(format!("{owner}/{repo}"))
            .map_err(|e| GhApiError::permanent(e.to_string()))?;
        let client = self.installation_client(&scope).await?;
        let route = format!("/repos/{owner}/{repo}/actions/runs/{run_id}");
        let wire: WorkflowRunWire = timed("workflow_run", async {
            client
                .get(&route, None::<&()>)
                .await
                .map_err(GhApiError::from_octocrab)
        })
        .await?;
        Ok(WorkflowRunState::from_status(&wire.status))
    }
}

/// Production [`TokenMinter`]: presents the app assertion to the
/// token-exchange endpoint and snapshots the scope's rate limit.
pub struct AppTokenMinter {
    factory: ClientFactory,
    rate_limits: Arc<RateLimitTracker>,
}

impl AppTokenMinter {
    pub fn new(factory: ClientFactory, rate_limits: Arc<RateLimitTracker>) -> Self {
        AppTokenMinter {
            factory,
            rate_limits,
        }
    }
}

#[async_trait]
impl TokenMinter for AppTokenMinter {
    async fn mint(&self, installation_id: u64, scope: &str) -> Result<MintedToken, GhApiError> {
        let client = self.factory.app_client()?;
        let route = format!("/app/installations/{installation_id}/access_tokens");
        let wire: AccessTokenWire = timed("create_installation_token", async {
            client
                .post(&route, None::<&()>)
                .await
                .map_err(GhApiError::from_octocrab)
        })
        .await?;

        // The freshly-minted token sees the installation's own quota.
        match self.factory.token_client(&wire.token) {
            Ok(token_client) => {
                let probe: Result<RateLimitWire, _> =
                    token_client.get("/rate_limit", None::<&()>).await;
                if let Ok(limits) = probe {
                    let reset_at = Utc
                        .timestamp_opt(limits.resources.core.reset, 0)
                        .single()
                        .unwrap_or_else(Utc::now);
                    self.rate_limits
                        .record(scope, limits.resources.core.remaining, reset_at);
                }
            }
            Err(e) => warn!(scope, error = %e, "could not build rate-limit probe client"),
        }

        Ok(MintedToken {
            token: wire.token,
            expires_at: wire.expires_at,
        })
    }
}

/// Runs a provider call under the 30 s deadline and records latency.
async fn timed<T, F>(endpoint: &'static str, fut: F) -> Result<T, GhApiError>
where
    F: Future<Output = Result<T, GhApiError>>,
{
    let started = Instant::now();
    let result = tokio::time::timeout(PROVIDER_TIMEOUT, fut)
        .await
        .unwrap_or_else(|_| Err(GhApiError::transient(format!("{endpoint} timed out"))));
    metrics::histogram!("treadmill_github_request_seconds", "endpoint" => endpoint)
        .record(started.elapsed().as_secs_f64());
    result
}

/// An octocrab decode failure on an intentionally empty response body.
fn is_empty_body_error(err: &GhApiError) -> bool {
    err.status_code.is_none()
        && (err.message.contains("EOF") || err.message.contains("empty"))
}

fn registration_token_route(scope: &Scope) -> String {
    match scope.repository() {
        Some((owner, repo)) => {
            format!("/repos/{owner}/{repo}/actions/runners/registration-token")
        }
        None => format!("/orgs/{}/actions/runners/registration-token", scope.owner()),
    }
}

fn runners_route(scope: &Scope, page: u32) -> String {
    match scope.repository() {
        Some((owner, repo)) => format!(
            "/repos/{owner}/{repo}/actions/runners?per_page={RUNNERS_PER_PAGE}&page={page}"
        ),
        None => format!(
            "/orgs/{}/actions/runners?per_page={RUNNERS_PER_PAGE}&page={page}",
            scope.owner()
        ),
    }
}

fn remove_runner_route(scope: &Scope, runner_id: u64) -> String {
    match scope.repository() {
        Some((owner, repo)) => format!("/repos/{owner}/{repo}/actions/runners/{runner_id}"),
        None => format!("/orgs/{}/actions/runners/{runner_id}", scope.owner()),
    }
}
