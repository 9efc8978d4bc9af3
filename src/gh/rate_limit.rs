//! Per-scope rate-limit bookkeeping.
//!
//! The client factory records the provider's remaining-quota counter
//! whenever it learns it; the starter consults the snapshot before a
//! tick and yields until the reset when a scope is exhausted.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

/// Last-observed quota state for one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
}

/// Thread-safe map of scope → latest rate-limit snapshot.
#[derive(Debug, Default)]
pub struct RateLimitTracker {
    snapshots: RwLock<HashMap<String, RateLimitSnapshot>>,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an observation for a scope.
    pub fn record(&self, scope: &str, remaining: u64, reset_at: DateTime<Utc>) {
        let snapshot = RateLimitSnapshot {
            remaining,
            reset_at,
            observed_at: Utc::now(),
        };
        let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
        snapshots.insert(scope.to_string(), snapshot);
    }

    /// The latest snapshot for a scope, if one was ever observed.
    pub fn snapshot(&self, scope: &str) -> Option<RateLimitSnapshot> {
        let snapshots = self.snapshots.read().unwrap_or_else(|e| e.into_inner());
        snapshots.get(scope).copied()
    }

    /// If the scope's quota is exhausted as of `now`, returns the reset
    /// time the caller should wait for.
    ///
    /// A snapshot whose reset time has already passed is stale and does
    /// not block.
    pub fn exhausted_until(&self, scope: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let snapshot = self.snapshot(scope)?;
        if snapshot.remaining == 0 && snapshot.reset_at > now {
            Some(snapshot.reset_at)
        } else {
            None
        }
    }
}
