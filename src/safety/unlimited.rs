//! The default admission policy: always allow.

use async_trait::async_trait;

use super::{Admission, Safety, SafetyError};
use crate::types::Job;

/// Admits every job unconditionally.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

#[async_trait]
impl Safety for Unlimited {
    async fn check(&self, _job: &Job) -> Result<Admission, SafetyError> {
        Ok(Admission::Allow)
    }
}
