//! Core domain types: scopes, identifiers, and the persisted rows.

mod ids;
mod job;
mod runner;
mod scope;
mod target;

pub use ids::{CheckEventId, DeliveryId, JobId, RunnerUuid, TargetId};
pub use job::{Job, JobStatus};
pub use runner::{DeletedReason, Runner, RunnerStatus};
pub use scope::{InvalidScope, Scope};
pub use target::{Target, TargetStatus};
