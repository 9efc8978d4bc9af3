//! Scope strings: the unit of authorisation and runner targeting.
//!
//! A scope is either an organization (`octo-org`) or a repository
//! (`octo-org/widget`). The distinction matters everywhere we talk to
//! GitHub: organizations and repositories use different API endpoint
//! families for registration tokens and runner listings.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error returned when parsing an invalid scope string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid scope {input:?}: {reason}")]
pub struct InvalidScope {
    input: String,
    reason: &'static str,
}

impl InvalidScope {
    fn new(input: &str, reason: &'static str) -> Self {
        InvalidScope {
            input: input.chars().take(80).collect(),
            reason,
        }
    }
}

/// A parsed scope: `owner` (organization) or `owner/repo` (repository).
///
/// Construction is only possible via [`Scope::parse`], which validates
/// the shape. The original string is recoverable via [`Scope::as_str`]
/// and is what gets persisted on a Target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Scope(String);

impl Scope {
    /// Parses a scope string, rejecting empty segments and anything
    /// with more than one `/`.
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidScope> {
        let s = s.into();
        if s.is_empty() {
            return Err(InvalidScope::new(&s, "empty"));
        }
        if s.chars().any(char::is_whitespace) {
            return Err(InvalidScope::new(&s, "contains whitespace"));
        }
        let mut parts = s.split('/');
        let owner = parts.next().unwrap_or_default();
        if owner.is_empty() {
            return Err(InvalidScope::new(&s, "empty owner segment"));
        }
        match parts.next() {
            None => {}
            Some("") => return Err(InvalidScope::new(&s, "empty repository segment")),
            Some(_) => {
                if parts.next().is_some() {
                    return Err(InvalidScope::new(&s, "more than one '/'"));
                }
            }
        }
        Ok(Scope(s))
    }

    /// Returns the scope as the original string (`owner` or `owner/repo`).
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the owner segment (organization or repository owner).
    pub fn owner(&self) -> &str {
        match self.0.split_once('/') {
            Some((owner, _)) => owner,
            None => &self.0,
        }
    }

    /// Splits a repository scope into `(owner, repo)`.
    ///
    /// Returns `None` for organization scopes.
    pub fn repository(&self) -> Option<(&str, &str)> {
        self.0.split_once('/')
    }

    /// True if this scope names an organization (no `/`).
    pub fn is_organization(&self) -> bool {
        !self.0.contains('/')
    }

    /// For a repository scope, the owner-level scope it falls back to.
    ///
    /// Webhook intake uses this when a repository-level Target is not
    /// registered but an organization-level one is.
    pub fn organization_fallback(&self) -> Option<Scope> {
        self.repository().map(|(owner, _)| Scope(owner.to_string()))
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Scope::parse(s).map_err(serde::de::Error::custom)
    }
}

impl std::str::FromStr for Scope {
    type Err = InvalidScope;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scope::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn organization_scope() {
        let scope = Scope::parse("octo-org").unwrap();
        assert!(scope.is_organization());
        assert_eq!(scope.owner(), "octo-org");
        assert_eq!(scope.repository(), None);
        assert_eq!(scope.organization_fallback(), None);
    }

    #[test]
    fn repository_scope() {
        let scope = Scope::parse("octo/widget").unwrap();
        assert!(!scope.is_organization());
        assert_eq!(scope.owner(), "octo");
        assert_eq!(scope.repository(), Some(("octo", "widget")));
        assert_eq!(
            scope.organization_fallback(),
            Some(Scope::parse("octo").unwrap())
        );
    }

    #[test]
    fn rejects_malformed() {
        assert!(Scope::parse("").is_err());
        assert!(Scope::parse("/widget").is_err());
        assert!(Scope::parse("octo/").is_err());
        assert!(Scope::parse("a/b/c").is_err());
        assert!(Scope::parse("octo widget").is_err());
    }

    #[test]
    fn deserialize_rejects_invalid() {
        let result: Result<Scope, _> = serde_json::from_str(r#""a/b/c""#);
        assert!(result.is_err());
    }

    proptest! {
        #[test]
        fn serde_roundtrip(
            owner in "[a-zA-Z][a-zA-Z0-9-]{0,38}",
            repo in proptest::option::of("[a-zA-Z][a-zA-Z0-9_.-]{0,99}"),
        ) {
            let raw = match &repo {
                Some(r) => format!("{owner}/{r}"),
                None => owner.clone(),
            };
            let scope = Scope::parse(&raw).unwrap();
            let json = serde_json::to_string(&scope).unwrap();
            let parsed: Scope = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(scope, parsed);
        }

        #[test]
        fn owner_is_prefix(
            owner in "[a-zA-Z][a-zA-Z0-9-]{0,38}",
            repo in "[a-zA-Z][a-zA-Z0-9_.-]{0,99}",
        ) {
            let scope = Scope::parse(format!("{owner}/{repo}")).unwrap();
            prop_assert_eq!(scope.owner(), owner.as_str());
            prop_assert!(scope.as_str().starts_with(scope.owner()));
        }
    }
}
