//! Backend plugin ("shoes") integration.
//!
//! The backend that actually materialises machines is an external
//! process. Keeping it out-of-process keeps vendor SDKs out of this
//! binary and isolates backend crashes from the pipeline. The contract
//! is two calls: `add` turns a runner spec into a live instance,
//! `delete` destroys one.
//!
//! - [`protocol`] frames requests/responses as newline-delimited JSON
//!   and multiplexes concurrent calls over one connection.
//! - [`driver`] spawns and supervises the plugin process and applies
//!   the delete-concurrency throttle and per-call deadlines.

pub mod driver;
pub mod protocol;

pub use driver::{ShoesConfig, ShoesDriver};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gh::Retryable;
use crate::types::RunnerUuid;

/// Docker Hub credentials forwarded to the runner environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DockerHubCredential {
    pub username: String,
    pub password: String,
}

/// Everything the backend needs to materialise one runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerSpec {
    pub uuid: RunnerUuid,
    pub scope: String,
    /// One-shot credential the runner agent presents to join the scope.
    pub registration_token: String,
    /// `latest` or a pinned `vX.Y.Z`.
    pub runner_version: String,
    pub runner_user: String,
    /// Resource hint carried from the Target.
    pub resource_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_hub: Option<DockerHubCredential>,
}

/// The backend's reply to a successful `add`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddResult {
    /// Opaque instance handle; unique among live instances.
    pub cloud_id: String,
    pub ip_address: Option<String>,
    /// Backend flavour, recorded on the Runner row.
    pub shoes_type: String,
}

/// Errors from the plugin driver.
#[derive(Debug, Clone, Error)]
pub enum ShoesError {
    /// The plugin exited while the call was in flight. Fatal to the
    /// call, not to the process; the supervisor respawns the plugin.
    #[error("plugin crashed during the call")]
    PluginCrashed,

    /// The backend reported a retriable failure.
    #[error("backend transient failure: {0}")]
    Transient(String),

    /// The backend reported a non-retriable failure.
    #[error("backend permanent failure: {0}")]
    Permanent(String),

    /// The per-operation deadline elapsed.
    #[error("backend {0} timed out")]
    Timeout(&'static str),
}

impl Retryable for ShoesError {
    fn is_retriable(&self) -> bool {
        matches!(self, ShoesError::Transient(_) | ShoesError::Timeout(_))
    }
}

/// The backend operations the pipeline consumes.
///
/// Production uses [`ShoesDriver`]; tests inject a scripted fake.
#[async_trait]
pub trait Shoes: Send + Sync {
    async fn add(&self, spec: &RunnerSpec) -> Result<AddResult, ShoesError>;
    async fn delete(&self, cloud_id: &str) -> Result<(), ShoesError>;
}
