//! GitHub API error types.
//!
//! Distinguishes transient from permanent failures; the distinction
//! drives retry decisions everywhere the core talks to the provider:
//!
//! - **Transient** errors are retriable (5xx, network timeouts).
//! - **RateLimited** errors are retriable after the reported reset.
//! - **Permanent** errors surface to the caller (most 4xx; for token
//!   minting these mean a mis-configured app or revoked installation).
//! - **NotFound** is context-specific: a DELETE against a resource
//!   that is already gone is usually treated as success.
//! - **NotInstalled** means no installation of the app covers the
//!   requested scope.

use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// The kind of GitHub API error, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GhErrorKind {
    /// Safe to retry with backoff.
    Transient,
    /// Requires operator intervention; never retried.
    Permanent,
    /// Quota exhausted; retry after the reset time.
    RateLimited,
    /// The resource does not exist.
    NotFound,
    /// The app is not installed on the requested scope.
    NotInstalled,
}

impl GhErrorKind {
    /// Returns true if an immediate backoff-retry may help.
    pub fn is_retriable(&self) -> bool {
        matches!(self, GhErrorKind::Transient)
    }
}

/// A GitHub API error with categorization for retry decisions.
#[derive(Debug, Error)]
pub struct GhApiError {
    pub kind: GhErrorKind,
    pub status_code: Option<u16>,
    pub message: String,
    /// When the quota resets, if the error is `RateLimited` and the
    /// reset time was observable.
    pub reset_at: Option<DateTime<Utc>>,
    #[source]
    pub source: Option<octocrab::Error>,
}

impl fmt::Display for GhApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "GitHub API error (HTTP {}): {}", code, self.message),
            None => write!(f, "GitHub API error: {}", self.message),
        }
    }
}

impl GhApiError {
    fn bare(kind: GhErrorKind, message: impl Into<String>) -> Self {
        GhApiError {
            kind,
            status_code: None,
            message: message.into(),
            reset_at: None,
            source: None,
        }
    }

    /// Creates a transient error without an octocrab source.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::bare(GhErrorKind::Transient, message)
    }

    /// Creates a permanent error without an octocrab source.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::bare(GhErrorKind::Permanent, message)
    }

    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::bare(GhErrorKind::NotFound, message)
    }

    /// Creates a not-installed error for a scope.
    pub fn not_installed(scope: &str) -> Self {
        Self::bare(
            GhErrorKind::NotInstalled,
            format!("{scope} is not installed for the configured GitHub App"),
        )
    }

    /// Creates a rate-limited error with a known reset time.
    pub fn rate_limited(reset_at: DateTime<Utc>) -> Self {
        GhApiError {
            kind: GhErrorKind::RateLimited,
            status_code: Some(403),
            message: format!("rate limit exhausted until {reset_at}"),
            reset_at: Some(reset_at),
            source: None,
        }
    }

    /// Categorizes an octocrab error.
    ///
    /// Based on HTTP status codes where available, with message
    /// pattern checks for rate limits and network-level failures.
    pub fn from_octocrab(err: octocrab::Error) -> Self {
        let status_code = extract_status_code(&err);
        let message = err.to_string();

        let kind = match status_code {
            Some(429) => GhErrorKind::RateLimited,
            Some(403) if is_rate_limit_message(&message) => GhErrorKind::RateLimited,
            Some(404) => GhErrorKind::NotFound,
            Some(code) if (500..600).contains(&code) => GhErrorKind::Transient,
            Some(_) => GhErrorKind::Permanent,
            None => {
                if is_network_message(&message) {
                    GhErrorKind::Transient
                } else {
                    GhErrorKind::Permanent
                }
            }
        };

        GhApiError {
            kind,
            status_code,
            message,
            reset_at: None,
            source: Some(err),
        }
    }
}

/// Extracts the HTTP status code from an octocrab error, if present.
///
/// octocrab's `Error::GitHub` carries a typed status; other variants
/// only expose it through the message, so we fall back to scanning for
/// well-known codes.
fn extract_status_code(err: &octocrab::Error) -> Option<u16> {
    if let octocrab::Error::GitHub { source, .. } = err {
        return Some(source.status_code.as_u16());
    }

    let err_str = err.to_string();
    for code in [429u16, 404, 403, 401, 422, 500, 502, 503] {
        if err_str.contains(&code.to_string()) {
            return Some(code);
        }
    }
    None
}

/// Checks if an error message indicates a rate limit.
fn is_rate_limit_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("rate limit")
        || message.contains("api rate")
        || message.contains("secondary rate")
        || message.contains("abuse detection")
}

/// Checks if an error message indicates a network-level error.
fn is_network_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("timeout")
        || message.contains("timed out")
        || message.contains("connection")
        || message.contains("network")
        || message.contains("dns")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_detection() {
        assert!(is_rate_limit_message("API rate limit exceeded"));
        assert!(is_rate_limit_message("secondary rate limit"));
        assert!(is_rate_limit_message("abuse detection mechanism"));
        assert!(!is_rate_limit_message("Permission denied"));
    }

    #[test]
    fn network_error_detection() {
        assert!(is_network_message("connection refused"));
        assert!(is_network_message("request timed out"));
        assert!(is_network_message("DNS resolution failed"));
        assert!(!is_network_message("Not found"));
    }

    #[test]
    fn only_transient_is_retriable() {
        assert!(GhErrorKind::Transient.is_retriable());
        assert!(!GhErrorKind::Permanent.is_retriable());
        assert!(!GhErrorKind::RateLimited.is_retriable());
        assert!(!GhErrorKind::NotFound.is_retriable());
        assert!(!GhErrorKind::NotInstalled.is_retriable());
    }

    #[test]
    fn rate_limited_carries_reset() {
        let reset = Utc::now() + chrono::Duration::minutes(10);
        let err = GhApiError::rate_limited(reset);
        assert_eq!(err.kind, GhErrorKind::RateLimited);
        assert_eq!(err.reset_at, Some(reset));
    }

    #[test]
    fn display_includes_status() {
        let mut err = GhApiError::permanent("bad credentials");
        err.status_code = Some(401);
        assert_eq!(
            err.to_string(),
            "GitHub API error (HTTP 401): bad credentials"
        );
    }
}
