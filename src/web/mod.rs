//! HTTP shell: webhook intake, admin API, health.
//!
//! A thin axum layer over the pipeline. Endpoints:
//!
//! - `POST /github/events` — webhook intake (signature-verified)
//! - `GET|POST /targets`, `GET|DELETE /targets/{id}` — admin CRUD,
//!   bearer-token protected
//! - `GET /health` — liveness

pub mod health;
pub mod signature;
pub mod targets;
pub mod webhook;

pub use signature::{SignatureError, sign_payload, verify_webhook_signature};

use std::sync::Arc;

use crate::config::WebhookType;
use crate::datastore::{Datastore, JobNotifier};
use crate::gh::TokenCache;

/// Shared application state, passed to handlers via axum's `State`.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    store: Arc<dyn Datastore>,
    notifier: JobNotifier,
    tokens: Arc<TokenCache>,
    webhook_secret: Vec<u8>,
    admin_token: String,
    webhook_type: WebhookType,
    strict: bool,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Datastore>,
        notifier: JobNotifier,
        tokens: Arc<TokenCache>,
        webhook_secret: impl Into<Vec<u8>>,
        admin_token: impl Into<String>,
        webhook_type: WebhookType,
        strict: bool,
    ) -> Self {
        AppState {
            inner: Arc::new(AppStateInner {
                store,
                notifier,
                tokens,
                webhook_secret: webhook_secret.into(),
                admin_token: admin_token.into(),
                webhook_type,
                strict,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn Datastore> {
        &self.inner.store
    }

    pub fn notifier(&self) -> &JobNotifier {
        &self.inner.notifier
    }

    pub fn tokens(&self) -> &Arc<TokenCache> {
        &self.inner.tokens
    }

    pub fn webhook_secret(&self) -> &[u8] {
        &self.inner.webhook_secret
    }

    pub fn admin_token(&self) -> &str {
        &self.inner.admin_token
    }

    pub fn webhook_type(&self) -> WebhookType {
        self.inner.webhook_type
    }

    pub fn strict(&self) -> bool {
        self.inner.strict
    }
}

/// Builds the axum router with all endpoints.
pub fn build_router(app_state: AppState) -> axum::Router {
    use axum::routing::{get, post};

    axum::Router::new()
        .route("/github/events", post(webhook::webhook_handler))
        .route(
            "/targets",
            get(targets::list_targets).post(targets::create_target),
        )
        .route(
            "/targets/{id}",
            get(targets::get_target).delete(targets::delete_target),
        )
        .route("/health", get(health::health_handler))
        .with_state(app_state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;

    use crate::datastore::enqueue_channel;
    use crate::datastore::memory::MemoryDatastore;
    use crate::gh::{GhApiError, MintedToken, TokenMinter};

    struct StubMinter;

    #[async_trait]
    impl TokenMinter for StubMinter {
        async fn mint(
            &self,
            installation_id: u64,
            _scope: &str,
        ) -> Result<MintedToken, GhApiError> {
            Ok(MintedToken {
                token: format!("ghs_stub_{installation_id}"),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            })
        }
    }

    pub(crate) struct TestApp {
        pub state: AppState,
        pub store: Arc<MemoryDatastore>,
        pub signal: crate::datastore::EnqueueSignal,
    }

    /// An app state over a fresh memory store, with the test defaults:
    /// secret `test-secret`, admin token `admin-token`, workflow_job
    /// mode, strict on.
    pub(crate) fn test_app() -> TestApp {
        let store = Arc::new(MemoryDatastore::new());
        let (notifier, signal) = enqueue_channel();
        let tokens = Arc::new(TokenCache::new(Arc::new(StubMinter)));
        let state = AppState::new(
            store.clone(),
            notifier,
            tokens,
            b"test-secret".to_vec(),
            "admin-token",
            WebhookType::WorkflowJob,
            true,
        );
        TestApp {
            state,
            store,
            signal,
        }
    }
}
