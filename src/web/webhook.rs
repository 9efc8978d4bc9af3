//! Webhook intake.
//!
//! Verifies the delivery signature, classifies the event, and turns
//! queued workflow jobs into pending Job rows. Persisting the Job and
//! posting the enqueue-notify signal is all that happens here; the
//! starter does the heavy lifting asynchronously.
//!
//! Webhook delivery order is not trusted: duplicates and reordering
//! are normal. Duplicate deliveries are detected by the datastore's
//! check-event uniqueness and acknowledged without side effects.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::AppState;
use super::signature::{SignatureError, verify_webhook_signature};
use crate::config::WebhookType;
use crate::datastore::{Datastore, DatastoreError};
use crate::metrics::count_error;
use crate::types::{CheckEventId, DeliveryId, Job, RunnerStatus, RunnerUuid, Target};

const HEADER_EVENT: &str = "x-github-event";
const HEADER_DELIVERY: &str = "x-github-delivery";
const HEADER_SIGNATURE: &str = "x-hub-signature-256";

/// Errors that can occur when processing a webhook.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),

    #[error("invalid JSON body: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload is missing {0}")]
    MissingField(&'static str),

    #[error("unknown event kind: {0}")]
    UnknownEvent(String),

    #[error("datastore error: {0}")]
    Store(#[from] DatastoreError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::MissingHeader(_)
            | WebhookError::InvalidJson(_)
            | WebhookError::MissingField(_) => StatusCode::BAD_REQUEST,
            WebhookError::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
            WebhookError::UnknownEvent(_) => StatusCode::UNPROCESSABLE_ENTITY,
            WebhookError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// `POST /github/events`.
pub async fn webhook_handler(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, WebhookError> {
    let event_type = get_header(&headers, HEADER_EVENT)?;
    let delivery_id = DeliveryId::new(get_header(&headers, HEADER_DELIVERY)?);
    let signature_header = get_header(&headers, HEADER_SIGNATURE)?;

    // Verify before any parsing; malicious requests get no work done
    // on their behalf.
    if let Err(reason) =
        verify_webhook_signature(&body, &signature_header, app_state.webhook_secret())
    {
        warn!(delivery_id = %delivery_id, %reason, "webhook signature rejected");
        count_error("webhook", "bad_signature");
        return Err(reason.into());
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)?;
    debug!(delivery_id = %delivery_id, event = %event_type, "received webhook");

    match event_type.as_str() {
        "ping" => Ok(StatusCode::NO_CONTENT),
        "installation" | "installation_repositories" => {
            handle_installation_change(&app_state, &payload).await;
            Ok(StatusCode::NO_CONTENT)
        }
        "workflow_job" => {
            if app_state.webhook_type() != WebhookType::WorkflowJob {
                return Ok(StatusCode::NO_CONTENT);
            }
            handle_workflow_job(&app_state, &delivery_id, &payload, &body).await
        }
        "check_run" => {
            if app_state.webhook_type() != WebhookType::CheckRun {
                return Ok(StatusCode::NO_CONTENT);
            }
            debug!("handling deprecated check_run webhook mode");
            handle_check_run(&app_state, &delivery_id, &payload, &body).await
        }
        other => {
            count_error("webhook", "unknown_event");
            Err(WebhookError::UnknownEvent(other.to_string()))
        }
    }
}

async fn handle_workflow_job(
    app_state: &AppState,
    delivery_id: &DeliveryId,
    payload: &serde_json::Value,
    raw_body: &[u8],
) -> Result<StatusCode, WebhookError> {
    let action = payload
        .get("action")
        .and_then(|a| a.as_str())
        .ok_or(WebhookError::MissingField("action"))?;

    match action {
        "queued" => {
            let job_id = payload
                .get("workflow_job")
                .and_then(|j| j.get("id"))
                .and_then(|id| id.as_u64())
                .ok_or(WebhookError::MissingField("workflow_job.id"))?;
            materialise_job(
                app_state,
                delivery_id,
                payload,
                raw_body,
                CheckEventId::new(job_id.to_string()),
            )
            .await
        }
        "completed" => {
            // Best effort: flag the runner completed so the lifecycle
            // manager reaps it without waiting for the provider view.
            if let Some(name) = payload
                .get("workflow_job")
                .and_then(|j| j.get("runner_name"))
                .and_then(|n| n.as_str())
                && let Some(uuid) = RunnerUuid::from_runner_name(name)
            {
                match app_state
                    .store()
                    .update_runner_status(uuid, RunnerStatus::Completed)
                    .await
                {
                    Ok(()) => info!(runner = %uuid, "runner reported completed via webhook"),
                    Err(DatastoreError::NotFound(_)) => {
                        debug!(runner = %uuid, "completed webhook for unknown runner")
                    }
                    Err(e) => warn!(runner = %uuid, error = %e, "could not record completion"),
                }
            }
            Ok(StatusCode::NO_CONTENT)
        }
        _ => Ok(StatusCode::NO_CONTENT),
    }
}

async fn handle_check_run(
    app_state: &AppState,
    delivery_id: &DeliveryId,
    payload: &serde_json::Value,
    raw_body: &[u8],
) -> Result<StatusCode, WebhookError> {
    let action = payload
        .get("action")
        .and_then(|a| a.as_str())
        .ok_or(WebhookError::MissingField("action"))?;
    if action != "created" {
        return Ok(StatusCode::NO_CONTENT);
    }
    let check_run_id = payload
        .get("check_run")
        .and_then(|c| c.get("id"))
        .and_then(|id| id.as_u64())
        .ok_or(WebhookError::MissingField("check_run.id"))?;
    materialise_job(
        app_state,
        delivery_id,
        payload,
        raw_body,
        CheckEventId::new(check_run_id.to_string()),
    )
    .await
}

/// Resolves the Target for the event's scope and persists a pending Job.
async fn materialise_job(
    app_state: &AppState,
    delivery_id: &DeliveryId,
    payload: &serde_json::Value,
    raw_body: &[u8],
    check_event_id: CheckEventId,
) -> Result<StatusCode, WebhookError> {
    let Some(target) = resolve_target(app_state, payload).await? else {
        let scope = scope_candidates(payload).join(", ");
        if app_state.strict() {
            warn!(delivery_id = %delivery_id, scope, "webhook for unregistered scope, dropping");
        } else {
            debug!(delivery_id = %delivery_id, scope, "webhook for unregistered scope, dropping");
        }
        count_error("webhook", "unknown_scope");
        return Ok(StatusCode::NO_CONTENT);
    };

    if !target.is_active() {
        warn!(
            delivery_id = %delivery_id,
            scope = %target.scope,
            status = %target.status,
            "target is not active, dropping job"
        );
        return Ok(StatusCode::NO_CONTENT);
    }

    let job = Job::new(
        target.id,
        target.scope.as_str(),
        String::from_utf8_lossy(raw_body),
        check_event_id,
    );

    match app_state.store().enqueue_job(&job).await {
        Ok(()) => {
            info!(
                delivery_id = %delivery_id,
                job = %job.id,
                scope = %target.scope,
                "job enqueued"
            );
            app_state.notifier().notify();
            Ok(StatusCode::NO_CONTENT)
        }
        Err(DatastoreError::Duplicate(_)) => {
            // Idempotent redelivery; acknowledge without side effects.
            debug!(delivery_id = %delivery_id, "duplicate delivery, already enqueued");
            Ok(StatusCode::NO_CONTENT)
        }
        Err(e) => {
            count_error("webhook", "enqueue_failed");
            Err(e.into())
        }
    }
}

/// Scope strings this event could bind to, most specific first.
fn scope_candidates(payload: &serde_json::Value) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Some(full_name) = payload
        .get("repository")
        .and_then(|r| r.get("full_name"))
        .and_then(|n| n.as_str())
    {
        candidates.push(full_name.to_string());
        if let Some((owner, _)) = full_name.split_once('/') {
            candidates.push(owner.to_string());
        }
    }
    if let Some(org) = payload
        .get("organization")
        .and_then(|o| o.get("login"))
        .and_then(|l| l.as_str())
    {
        if !candidates.iter().any(|c| c == org) {
            candidates.push(org.to_string());
        }
    }
    candidates
}

async fn resolve_target(
    app_state: &AppState,
    payload: &serde_json::Value,
) -> Result<Option<Target>, WebhookError> {
    for candidate in scope_candidates(payload) {
        if let Some(target) = app_state.store().get_target_by_scope(&candidate).await? {
            return Ok(Some(target));
        }
    }
    Ok(None)
}

/// Invalidate cached credentials for the account an installation event
/// refers to.
async fn handle_installation_change(app_state: &AppState, payload: &serde_json::Value) {
    let login = payload
        .get("installation")
        .and_then(|i| i.get("account"))
        .and_then(|a| a.get("login"))
        .and_then(|l| l.as_str());
    if let Some(login) = login {
        info!(login, "installation changed, invalidating cached tokens");
        app_state.tokens().invalidate_account(login).await;
    }
}

fn get_header(headers: &HeaderMap, name: &'static str) -> Result<String, WebhookError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or(WebhookError::MissingHeader(name))
}
