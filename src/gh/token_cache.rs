//! Installation-token cache with single-flight minting.
//!
//! Installation tokens are valid for about an hour; the provider rate
//! limits the mint endpoint, so every component that needs a token for
//! `(installation-id, scope)` goes through this cache. Entries are
//! treated as expired five minutes early (plus a small per-key jitter
//! so a fleet of scopes does not refresh in lockstep), and concurrent
//! misses for the same key collapse into a single mint.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::error::GhApiError;

/// How long before the provider-reported expiry an entry is refreshed.
const EXPIRY_SKEW_SECS: i64 = 5 * 60;

/// Upper bound on the per-key refresh jitter.
const JITTER_RANGE_SECS: i64 = 60;

/// A freshly minted installation token.
#[derive(Debug, Clone)]
pub struct MintedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// The seam over the token-exchange endpoint.
///
/// Production uses [`AppTokenMinter`]; tests inject a fake.
#[async_trait]
pub trait TokenMinter: Send + Sync {
    async fn mint(&self, installation_id: u64, scope: &str) -> Result<MintedToken, GhApiError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    installation_id: u64,
    scope: String,
}

impl CacheKey {
    /// Deterministic refresh jitter in seconds, derived from the key
    /// hash so the same key always refreshes at the same offset.
    fn jitter_secs(&self) -> i64 {
        let mut hasher = std::hash::DefaultHasher::new();
        self.hash(&mut hasher);
        (hasher.finish() % JITTER_RANGE_SECS as u64) as i64
    }
}

/// Process-local cache of installation tokens.
pub struct TokenCache {
    minter: Arc<dyn TokenMinter>,
    entries: RwLock<HashMap<CacheKey, MintedToken>>,
    /// Per-key single-flight gates; the outer mutex only guards the map.
    gates: Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl TokenCache {
    pub fn new(minter: Arc<dyn TokenMinter>) -> Self {
        TokenCache {
            minter,
            entries: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a valid installation token for `(installation_id, scope)`,
    /// minting one if the cache has no fresh entry.
    pub async fn installation_token(
        &self,
        installation_id: u64,
        scope: &str,
    ) -> Result<String, GhApiError> {
        let key = CacheKey {
            installation_id,
            scope: scope.to_string(),
        };

        if let Some(token) = self.fresh(&key).await {
            return Ok(token);
        }

        let gate = {
            let mut gates = self.gates.lock().await;
            gates
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _inflight = gate.lock().await;

        // A concurrent caller may have minted while we waited.
        if let Some(token) = self.fresh(&key).await {
            return Ok(token);
        }

        debug!(installation_id, scope, "minting installation token");
        let minted = self.minter.mint(installation_id, scope).await?;
        let token = minted.token.clone();
        self.entries.write().await.insert(key, minted);
        Ok(token)
    }

    /// Drops every cache entry belonging to `login`'s account.
    ///
    /// Called when `installation` / `installation_repositories` webhook
    /// events signal that the installation's reach changed.
    pub async fn invalidate_account(&self, login: &str) {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| {
            let owner = key.scope.split('/').next().unwrap_or(&key.scope);
            !owner.eq_ignore_ascii_case(login)
        });
        if entries.len() != before {
            debug!(
                login,
                dropped = before - entries.len(),
                "invalidated installation tokens"
            );
        }
    }

    async fn fresh(&self, key: &CacheKey) -> Option<String> {
        let entries = self.entries.read().await;
        let entry = entries.get(key)?;
        let deadline = entry.expires_at
            - Duration::seconds(EXPIRY_SKEW_SECS)
            - Duration::seconds(key.jitter_secs());
        if deadline > Utc::now() {
            Some(entry.token.clone())
        } else {
            None
        }
    }
}
