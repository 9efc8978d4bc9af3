//! Admission policy: may a pending Job be dispatched right now?
//!
//! The starter consults exactly one predicate per job. Policies are
//! stateless from the starter's point of view; whatever bookkeeping a
//! policy needs (per-scope caps, cost quotas, business hours) is its
//! own concern.

mod unlimited;

pub use unlimited::Unlimited;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::Job;

/// The verdict of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Dispatch now.
    Allow,
    /// Leave the job pending; the reason is logged.
    Deny(String),
}

/// Error from a policy that could not reach a verdict.
///
/// The job stays pending and the failure is counted, but the starter
/// keeps going.
#[derive(Debug, Error)]
#[error("admission check failed: {0}")]
pub struct SafetyError(pub String);

/// The admission predicate the starter consults per job.
#[async_trait]
pub trait Safety: Send + Sync {
    async fn check(&self, job: &Job) -> Result<Admission, SafetyError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CheckEventId, TargetId};

    struct DenyAll;

    #[async_trait]
    impl Safety for DenyAll {
        async fn check(&self, _job: &Job) -> Result<Admission, SafetyError> {
            Ok(Admission::Deny("maintenance window".to_string()))
        }
    }

    #[tokio::test]
    async fn custom_policies_can_deny() {
        let job = Job::new(TargetId::generate(), "octo", "{}", CheckEventId::new("1"));
        let verdict = DenyAll.check(&job).await.unwrap();
        assert_eq!(verdict, Admission::Deny("maintenance window".to_string()));
    }
}
