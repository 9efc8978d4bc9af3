//! GitHub App installation discovery.
//!
//! Given a scope, find the installation of our app that covers it. The
//! matching rules are deliberately asymmetric and load-bearing:
//!
//! - The input scope is matched against the installation account login
//!   with a case-SENSITIVE prefix check.
//! - When the installation only covers selected repositories, the
//!   scope is matched against repository `full_name`s with an exact
//!   case-INSENSITIVE comparison (organization scopes only need the
//!   repository list to be non-empty).
//!
//! Unifying the two comparisons would silently change authorisation
//! semantics, so both are preserved and pinned by tests.

use async_trait::async_trait;
use tracing::debug;

use super::error::GhApiError;
use crate::types::Scope;

/// Installations are fetched in pages of this size.
pub const INSTALLATIONS_PER_PAGE: u8 = 10;

/// One installation of the app, as reported by the provider.
#[derive(Debug, Clone)]
pub struct InstallationRecord {
    pub id: u64,
    pub account_login: String,
    /// `"all"` or `"selected"`.
    pub repository_selection: String,
    pub suspended: bool,
}

/// The repositories an installation covers.
#[derive(Debug, Clone)]
pub struct RepositoryListing {
    pub total_count: i64,
    pub full_names: Vec<String>,
}

/// The seam over the installation endpoints.
///
/// Production implements this on the client factory; tests inject a
/// fixed fixture.
#[async_trait]
pub trait InstallationLister: Send + Sync {
    /// One page of installations (1-based); an empty page ends iteration.
    async fn list_installations(&self, page: u32)
    -> Result<Vec<InstallationRecord>, GhApiError>;

    /// The repositories covered by an installation, fetched with a
    /// token minted for that installation.
    async fn list_installation_repositories(
        &self,
        installation_id: u64,
        scope: &str,
    ) -> Result<RepositoryListing, GhApiError>;
}

/// Finds the installation id covering `scope`, or `NotInstalled`.
pub async fn find_installation(
    lister: &dyn InstallationLister,
    scope: &Scope,
) -> Result<u64, GhApiError> {
    let mut page = 1u32;
    loop {
        let installations = lister.list_installations(page).await?;
        if installations.is_empty() {
            return Err(GhApiError::not_installed(scope.as_str()));
        }

        for installation in &installations {
            if installation.suspended {
                continue;
            }
            // Account login is a prefix of both `owner` and `owner/repo`
            // scopes; deliberately case-sensitive.
            if !scope.as_str().starts_with(&installation.account_login) {
                continue;
            }

            match installation.repository_selection.as_str() {
                "all" => {
                    debug!(scope = %scope, installation = installation.id, "matched installation (all repositories)");
                    return Ok(installation.id);
                }
                "selected" => {
                    if covers_selected(lister, installation.id, scope).await? {
                        debug!(scope = %scope, installation = installation.id, "matched installation (selected repositories)");
                        return Ok(installation.id);
                    }
                }
                other => {
                    debug!(
                        installation = installation.id,
                        selection = other,
                        "unknown repository selection, skipping"
                    );
                }
            }
        }

        if installations.len() < INSTALLATIONS_PER_PAGE as usize {
            return Err(GhApiError::not_installed(scope.as_str()));
        }
        page += 1;
    }
}

/// Whether a selected-repositories installation covers the scope.
async fn covers_selected(
    lister: &dyn InstallationLister,
    installation_id: u64,
    scope: &Scope,
) -> Result<bool, GhApiError> {
    let listing = lister
        .list_installation_repositories(installation_id, scope.as_str())
        .await?;

    if listing.total_count <= 0 {
        return Ok(false);
    }
    if scope.is_organization() {
        // Organization scope with at least one permitted repository.
        return Ok(true);
    }
    Ok(listing
        .full_names
        .iter()
        .any(|name| name.eq_ignore_ascii_case(scope.as_str())))
}
