//! GitHub integration: identity, clients, and the provider operations
//! the pipeline consumes.
//!
//! Authentication is layered the way GitHub Apps require: a signed app
//! assertion mints short-lived installation tokens (cached in
//! [`token_cache`]), installation tokens authorise scope-level
//! operations, and runner registration tokens are one-shot credentials
//! minted per dispatch. [`api::ProviderApi`] is the seam the starter
//! and lifecycle manager are written against.

pub mod api;
pub mod client;
pub mod error;
pub mod installation;
pub mod rate_limit;
pub mod retry;
pub mod token_cache;

pub use api::{AppTokenMinter, GitHubApi, ProviderApi, ProviderRunner, WorkflowRunState};
pub use client::ClientFactory;
pub use error::{GhApiError, GhErrorKind};
pub use installation::{InstallationLister, InstallationRecord, RepositoryListing, find_installation};
pub use rate_limit::{RateLimitSnapshot, RateLimitTracker};
pub use retry::{RetryConfig, Retryable, retry_with_backoff};
pub use token_cache::{MintedToken, TokenCache, TokenMinter};
