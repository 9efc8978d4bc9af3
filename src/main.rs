//! treadmill server entry point.
//!
//! Boot order matters: configuration (fatal on error), plugin binary
//! validation, datastore connection, then the advisory lock — only one
//! process may own the dispatch pipeline, so we spin on the lock with
//! one-second sleeps until it frees up. Once locked, the long-lived
//! tasks start: HTTP intake, starter loop, lifecycle manager, and the
//! optional rescue pass. Shutdown drains them under a deadline, then
//! releases the lock.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use treadmill::config::{Config, resolve_plugin};
use treadmill::datastore::{Datastore, DatastoreError, enqueue_channel};
use treadmill::gh::{
    AppTokenMinter, ClientFactory, GitHubApi, ProviderApi, RateLimitTracker, TokenCache,
};
use treadmill::runner_manager::{RunnerManager, RunnerManagerConfig};
use treadmill::safety::Unlimited;
use treadmill::shoes::{Shoes, ShoesConfig, ShoesDriver};
use treadmill::starter::rescue::Rescue;
use treadmill::starter::{Starter, StarterConfig};
use treadmill::web::{AppState, build_router};

/// How long shutdown waits for tasks to drain in-flight work.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    // Tracing comes up before configuration so config errors are
    // visible; the DEBUG flag is honoured via the default filter.
    let default_filter = if std::env::var("DEBUG").as_deref() == Ok("true") {
        "treadmill=debug"
    } else {
        "treadmill=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    info!(?config, "configuration loaded");

    let plugin_path = resolve_plugin(&config.plugin_path, &config.plugin_output_path).await?;

    let store: Arc<dyn Datastore> = Arc::new(
        treadmill::datastore::postgres::PostgresDatastore::connect(&config.datastore_url).await?,
    );

    acquire_lock(store.as_ref()).await?;
    info!("advisory lock acquired, this process owns the pipeline");

    let cancel = CancellationToken::new();

    // Identity and provider plumbing.
    let rate_limits = Arc::new(RateLimitTracker::new());
    let factory = ClientFactory::new(
        config.app_id,
        config.app_private_key.clone(),
        &config.github_url,
    )?;
    let minter = Arc::new(AppTokenMinter::new(factory.clone(), rate_limits.clone()));
    let tokens = Arc::new(TokenCache::new(minter));
    let provider: Arc<dyn ProviderApi> = Arc::new(GitHubApi::new(
        factory,
        tokens.clone(),
        rate_limits.clone(),
    ));

    // Backend plugin.
    let shoes: Arc<dyn Shoes> = Arc::new(
        ShoesDriver::start(
            ShoesConfig {
                plugin_path,
                max_concurrency_deleting: config.max_concurrency_deleting,
            },
            cancel.clone(),
        )
        .await?,
    );

    let (notifier, signal) = enqueue_channel();

    let mut tasks = JoinSet::new();

    // Intake HTTP server.
    let app_state = AppState::new(
        store.clone(),
        notifier,
        tokens.clone(),
        config.app_secret.clone(),
        config.admin_token.clone(),
        config.webhook_type,
        config.strict,
    );
    let router = build_router(app_state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
            {
                error!(error = %e, "http server failed");
            }
        });
    }

    // Starter loop.
    let starter = Arc::new(Starter::new(
        store.clone(),
        provider.clone(),
        shoes.clone(),
        Arc::new(Unlimited),
        rate_limits,
        StarterConfig {
            batch_size: config.max_connections_to_backend,
            runner_user: config.runner_user.clone(),
            runner_version: config.runner_version.clone(),
            docker_hub: config.docker_hub.clone(),
        },
    ));
    tasks.spawn(starter.run(signal, cancel.clone()));

    // Lifecycle manager.
    let manager = Arc::new(RunnerManager::new(
        store.clone(),
        provider.clone(),
        shoes,
        RunnerManagerConfig::default(),
    ));
    tasks.spawn(manager.run(cancel.clone()));

    // Optional rescue pass.
    if config.enable_rescue_workflow {
        let rescue = Arc::new(Rescue::new(store.clone(), provider));
        tasks.spawn(rescue.run(cancel.clone()));
    }

    // Wait for a shutdown signal.
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        result = terminate_signal() => {
            let _ = result;
            info!("terminate received, shutting down");
        }
    }
    cancel.cancel();

    if tokio::time::timeout(SHUTDOWN_DEADLINE, async {
        while tasks.join_next().await.is_some() {}
    })
    .await
    .is_err()
    {
        warn!("tasks did not drain within the shutdown deadline");
        tasks.shutdown().await;
    }

    store.release_lock().await?;
    info!("advisory lock released, bye");
    Ok(())
}

/// Spins on the advisory lock until we own it.
///
/// Another live process holding the lock is normal during failover;
/// anything else going wrong while probing is fatal.
async fn acquire_lock(store: &dyn Datastore) -> Result<(), DatastoreError> {
    loop {
        match store.get_lock().await {
            Ok(()) => return Ok(()),
            Err(DatastoreError::Locked) => {
                info!("advisory lock is held elsewhere, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(unix)]
async fn terminate_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate_signal() -> std::io::Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}
