//! Plugin process supervision and the production [`Shoes`] driver.
//!
//! The plugin is spawned once at startup and supervised for the
//! process lifetime: when it exits, in-flight calls fail with
//! [`ShoesError::PluginCrashed`] and the supervisor respawns it with
//! exponential backoff. Callers observing a crash wait for the respawn
//! and retry the operation once.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::protocol::{ConnectionHandle, Method, connect};
use super::{AddResult, RunnerSpec, Shoes, ShoesError};

/// Deadline for a backend `add` call.
const ADD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Deadline for a backend `delete` call.
const DELETE_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Respawn backoff bounds.
const RESPAWN_BASE: Duration = Duration::from_secs(1);
const RESPAWN_CAP: Duration = Duration::from_secs(32);

/// A run longer than this resets the respawn backoff.
const STABLE_RUN: Duration = Duration::from_secs(60);

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct ShoesConfig {
    /// Absolute path to the validated plugin binary.
    pub plugin_path: PathBuf,
    /// Permits for concurrent `delete` calls.
    pub max_concurrency_deleting: usize,
}

struct Generation {
    number: u64,
    handle: ConnectionHandle,
}

/// Production plugin driver: one supervised child, one multiplexed
/// connection, a semaphore throttling deletes.
pub struct ShoesDriver {
    current: watch::Receiver<Generation>,
    delete_permits: Semaphore,
}

impl ShoesDriver {
    /// Spawns the plugin and its supervisor task.
    ///
    /// Fails only if the very first spawn fails; later exits are
    /// handled by the supervisor.
    pub async fn start(
        config: ShoesConfig,
        cancel: CancellationToken,
    ) -> Result<ShoesDriver, ShoesError> {
        let (mut child, handle) = spawn_plugin(&config.plugin_path)?;
        info!(path = %config.plugin_path.display(), "shoes plugin started");

        let (publish, current) = watch::channel(Generation { number: 1, handle });
        let delete_permits = Semaphore::new(config.max_concurrency_deleting.max(1));

        let plugin_path = config.plugin_path.clone();
        tokio::spawn(async move {
            let mut generation = 1u64;
            let mut backoff = RESPAWN_BASE;
            loop {
                let started = tokio::time::Instant::now();
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = child.kill().await;
                        return;
                    }
                    status = child.wait() => {
                        warn!(?status, "shoes plugin exited");
                    }
                }

                if started.elapsed() >= STABLE_RUN {
                    backoff = RESPAWN_BASE;
                }

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(RESPAWN_CAP);
                    match spawn_plugin(&plugin_path) {
                        Ok((new_child, new_handle)) => {
                            generation += 1;
                            info!(generation, "shoes plugin respawned");
                            child = new_child;
                            let _ = publish.send(Generation {
                                number: generation,
                                handle: new_handle,
                            });
                            break;
                        }
                        Err(e) => {
                            error!(error = %e, "shoes plugin respawn failed");
                        }
                    }
                }
            }
        });

        Ok(ShoesDriver {
            current,
            delete_permits,
        })
    }

    fn snapshot(&self) -> (u64, ConnectionHandle) {
        let generation = self.current.borrow();
        (generation.number, generation.handle.clone())
    }

    /// Waits (bounded) until a generation newer than `seen` is live.
    async fn wait_for_respawn(&self, seen: u64, deadline: Duration) -> Result<(), ShoesError> {
        let mut rx = self.current.clone();
        let waited = tokio::time::timeout(deadline, async {
            loop {
                if rx.borrow().number > seen {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Supervisor gone; shutdown in progress.
                    std::future::pending::<()>().await;
                }
            }
        })
        .await;
        waited.map_err(|_| ShoesError::PluginCrashed)
    }

    /// Issues a call; on a crash, waits for the respawn and retries once.
    async fn call_with_respawn_retry(
        &self,
        name: &'static str,
        deadline: Duration,
        method: Method,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, ShoesError> {
        let (generation, handle) = self.snapshot();
        let first = tokio::time::timeout(deadline, handle.call(method, params.clone()))
            .await
            .map_err(|_| ShoesError::Timeout(name))?;
        match first {
            Err(ShoesError::PluginCrashed) => {
                warn!(call = name, "plugin crashed mid-call, retrying after respawn");
                self.wait_for_respawn(generation, deadline).await?;
                let (_, handle) = self.snapshot();
                tokio::time::timeout(deadline, handle.call(method, params))
                    .await
                    .map_err(|_| ShoesError::Timeout(name))?
            }
            other => other,
        }
    }
}

#[async_trait]
impl Shoes for ShoesDriver {
    async fn add(&self, spec: &RunnerSpec) -> Result<AddResult, ShoesError> {
        let params = serde_json::to_value(spec)
            .map_err(|e| ShoesError::Permanent(format!("unserialisable runner spec: {e}")))?;
        let result = self
            .call_with_respawn_retry("add", ADD_TIMEOUT, Method::Add, params)
            .await?;
        serde_json::from_value(result)
            .map_err(|e| ShoesError::Permanent(format!("malformed add reply: {e}")))
    }

    async fn delete(&self, cloud_id: &str) -> Result<(), ShoesError> {
        let _permit = self
            .delete_permits
            .acquire()
            .await
            .map_err(|_| ShoesError::PluginCrashed)?;
        let params = serde_json::json!({ "cloud_id": cloud_id });
        self.call_with_respawn_retry("delete", DELETE_TIMEOUT, Method::Delete, params)
            .await?;
        Ok(())
    }
}

/// Spawns the plugin with piped stdio and wires up the framed
/// connection. Stderr is inherited so backend logs land in ours.
fn spawn_plugin(path: &PathBuf) -> Result<(tokio::process::Child, ConnectionHandle), ShoesError> {
    let mut child = Command::new(path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ShoesError::Permanent(format!("failed to spawn plugin: {e}")))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| ShoesError::Permanent("plugin stdin unavailable".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ShoesError::Permanent("plugin stdout unavailable".to_string()))?;

    Ok((child, connect(stdout, stdin)))
}
