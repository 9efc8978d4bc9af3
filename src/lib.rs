//! treadmill — an autoscaler for ephemeral, just-in-time GitHub
//! Actions runners.
//!
//! Queued workflow jobs arrive as webhooks, become Job rows, and are
//! dispatched by the starter loop to an out-of-process backend plugin
//! that materialises one machine per job; the lifecycle manager
//! destroys runners once their job (or its grace period) has ended.

#[cfg(test)]
pub mod test_utils;

pub mod config;
pub mod datastore;
pub mod gh;
pub mod metrics;
pub mod runner_manager;
pub mod safety;
pub mod shoes;
pub mod starter;
pub mod types;
pub mod web;
