//! Octocrab client factories.
//!
//! Three authentication levels, mirroring how GitHub Apps work:
//!
//! - **App client**: authenticates with the RS256 app assertion; can
//!   list installations and mint installation tokens.
//! - **Installation client**: a token client wrapping a cached
//!   installation token (see [`super::token_cache`]).
//! - **Token client**: carries an already-minted token.
//!
//! All factories honour the configured GitHub base URL so GitHub
//! Enterprise Server deployments work unchanged.

use jsonwebtoken::EncodingKey;
use octocrab::Octocrab;
use octocrab::models::AppId;

use super::error::GhApiError;

/// Builds octocrab clients against one GitHub deployment.
#[derive(Clone)]
pub struct ClientFactory {
    app_id: u64,
    key: EncodingKey,
    api_base: String,
}

impl ClientFactory {
    /// Creates a factory for the given app against `github_url`
    /// (e.g. `https://github.com` or a GHES base URL).
    pub fn new(app_id: u64, key: EncodingKey, github_url: &str) -> Result<Self, GhApiError> {
        let api_base = api_base_url(github_url)?;
        Ok(ClientFactory {
            app_id,
            key,
            api_base,
        })
    }

    /// The API base URL requests are issued against.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// A client authenticated as the GitHub App itself.
    ///
    /// octocrab signs the RS256 assertion (`iss` = app id, ~10 minute
    /// expiry) from the configured private key on each request.
    pub fn app_client(&self) -> Result<Octocrab, GhApiError> {
        Octocrab::builder()
            .base_uri(&self.api_base)
            .map_err(GhApiError::from_octocrab)?
            .app(AppId(self.app_id), self.key.clone())
            .build()
            .map_err(GhApiError::from_octocrab)
    }

    /// A client carrying a pre-minted token (installation token,
    /// registration flow, or a Target's PAT override).
    pub fn token_client(&self, token: &str) -> Result<Octocrab, GhApiError> {
        Octocrab::builder()
            .base_uri(&self.api_base)
            .map_err(GhApiError::from_octocrab)?
            .personal_token(token.to_string())
            .build()
            .map_err(GhApiError::from_octocrab)
    }
}

impl std::fmt::Debug for ClientFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientFactory")
            .field("app_id", &self.app_id)
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

/// Derives the REST API base URL from a GitHub web URL.
///
/// github.com uses the dedicated `api.github.com` host; GHES serves
/// the API under `/api/v3` on the instance host.
fn api_base_url(github_url: &str) -> Result<String, GhApiError> {
    let url = reqwest::Url::parse(github_url)
        .map_err(|e| GhApiError::permanent(format!("invalid GitHub URL {github_url:?}: {e}")))?;
    match url.host_str() {
        Some("github.com") | Some("www.github.com") => Ok("https://api.github.com".to_string()),
        Some(_) => Ok(format!("{}/api/v3", github_url.trim_end_matches('/'))),
        None => Err(GhApiError::permanent(format!(
            "GitHub URL {github_url:?} has no host"
        ))),
    }
}
