//! Admin API: CRUD over Target rows.
//!
//! JSON in/out, protected by a bearer token. Creating a target is how
//! an operator tells the autoscaler to care about a scope; deletion
//! marks the target `deleting` so the lifecycle manager can reap its
//! runners before the row disappears.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use super::AppState;
use crate::datastore::{Datastore, DatastoreError};
use crate::types::{InvalidScope, Scope, Target, TargetId, TargetStatus};

/// Errors surfaced by the admin API.
#[derive(Debug, Error)]
pub enum TargetApiError {
    #[error("missing or invalid bearer token")]
    Unauthorized,

    #[error("invalid target id")]
    BadId,

    #[error(transparent)]
    BadScope(#[from] InvalidScope),

    #[error("target not found")]
    NotFound,

    #[error("scope is already registered")]
    Conflict,

    #[error("datastore error: {0}")]
    Store(DatastoreError),
}

impl From<DatastoreError> for TargetApiError {
    fn from(e: DatastoreError) -> Self {
        match e {
            DatastoreError::NotFound(_) => TargetApiError::NotFound,
            DatastoreError::Duplicate(_) => TargetApiError::Conflict,
            other => TargetApiError::Store(other),
        }
    }
}

impl IntoResponse for TargetApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            TargetApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            TargetApiError::BadId | TargetApiError::BadScope(_) => StatusCode::BAD_REQUEST,
            TargetApiError::NotFound => StatusCode::NOT_FOUND,
            TargetApiError::Conflict => StatusCode::CONFLICT,
            TargetApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// Request body for `POST /targets`.
#[derive(Debug, Deserialize)]
pub struct CreateTargetRequest {
    pub scope: String,
    #[serde(default = "default_resource_type")]
    pub resource_type: String,
    #[serde(default)]
    pub runner_user: Option<String>,
    #[serde(default)]
    pub runner_version: Option<String>,
    #[serde(default)]
    pub github_token: Option<String>,
}

fn default_resource_type() -> String {
    "default".to_string()
}

/// `GET /targets`.
pub async fn list_targets(
    State(app_state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Target>>, TargetApiError> {
    authorize(&app_state, &headers)?;
    Ok(Json(app_state.store().list_targets().await?))
}

/// `POST /targets`.
pub async fn create_target(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateTargetRequest>,
) -> Result<(StatusCode, Json<Target>), TargetApiError> {
    authorize(&app_state, &headers)?;

    let scope = Scope::parse(request.scope)?;
    let mut target = Target::new(scope, request.resource_type);
    target.runner_user = request.runner_user;
    target.runner_version = request.runner_version;
    target.github_token = request.github_token;

    app_state.store().create_target(&target).await?;
    info!(target = %target.id, scope = %target.scope, "target registered");
    Ok((StatusCode::CREATED, Json(target)))
}

/// `GET /targets/{id}`.
pub async fn get_target(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Target>, TargetApiError> {
    authorize(&app_state, &headers)?;
    let id = parse_target_id(&id)?;
    Ok(Json(app_state.store().get_target(id).await?))
}

/// `DELETE /targets/{id}`.
///
/// Marks the target `deleting` rather than removing the row; the
/// lifecycle manager needs it while reaping the target's runners.
pub async fn delete_target(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, TargetApiError> {
    authorize(&app_state, &headers)?;
    let id = parse_target_id(&id)?;
    app_state
        .store()
        .update_target_status(id, TargetStatus::Deleting)
        .await?;
    info!(target = %id, "target marked for deletion");
    Ok(StatusCode::NO_CONTENT)
}

fn parse_target_id(raw: &str) -> Result<TargetId, TargetApiError> {
    Uuid::parse_str(raw)
        .map(TargetId)
        .map_err(|_| TargetApiError::BadId)
}

fn authorize(app_state: &AppState, headers: &HeaderMap) -> Result<(), TargetApiError> {
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(TargetApiError::Unauthorized)?;
    if presented == app_state.admin_token() {
        Ok(())
    } else {
        Err(TargetApiError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::web::build_router;
    use crate::web::test_support::test_app;

    fn authed(request: axum::http::request::Builder) -> axum::http::request::Builder {
        request.header("authorization", "Bearer admin-token")
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn create_then_list_roundtrip() {
        let app = test_app();
        let router = build_router(app.state.clone());

        let request = authed(Request::builder().method("POST").uri("/targets"))
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"scope": "octo/widget", "resource_type": "large"}).to_string(),
            ))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["scope"], "octo/widget");
        assert_eq!(created["status"], "active");

        let router = build_router(app.state.clone());
        let request = authed(Request::builder().uri("/targets"))
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let listed = body_json(response).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_bearer_token_is_unauthorized() {
        let app = test_app();
        let router = build_router(app.state.clone());
        let request = Request::builder()
            .uri("/targets")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_bearer_token_is_unauthorized() {
        let app = test_app();
        let router = build_router(app.state.clone());
        let request = Request::builder()
            .uri("/targets")
            .header("authorization", "Bearer nope")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn duplicate_scope_conflicts() {
        let app = test_app();
        for expected in [StatusCode::CREATED, StatusCode::CONFLICT] {
            let router = build_router(app.state.clone());
            let request = authed(Request::builder().method("POST").uri("/targets"))
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({"scope": "octo/widget"}).to_string(),
                ))
                .unwrap();
            let response = router.oneshot(request).await.unwrap();
            assert_eq!(response.status(), expected);
        }
    }

    #[tokio::test]
    async fn invalid_scope_is_bad_request() {
        let app = test_app();
        let router = build_router(app.state.clone());
        let request = authed(Request::builder().method("POST").uri("/targets"))
            .header("content-type", "application/json")
            .body(Body::from(serde_json::json!({"scope": "a/b/c"}).to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_marks_target_deleting() {
        let app = test_app();
        let target = crate::types::Target::new(Scope::parse("octo").unwrap(), "default");
        app.store.create_target(&target).await.unwrap();

        let router = build_router(app.state.clone());
        let request = authed(
            Request::builder()
                .method("DELETE")
                .uri(format!("/targets/{}", target.id)),
        )
        .body(Body::empty())
        .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let stored = app.store.get_target(target.id).await.unwrap();
        assert_eq!(stored.status, TargetStatus::Deleting);
    }

    #[tokio::test]
    async fn get_unknown_target_is_not_found() {
        let app = test_app();
        let router = build_router(app.state.clone());
        let request = authed(
            Request::builder().uri(format!("/targets/{}", uuid::Uuid::new_v4())),
        )
        .body(Body::empty())
        .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn github_token_never_leaks_in_responses() {
        let app = test_app();
        let router = build_router(app.state.clone());
        let request = authed(Request::builder().method("POST").uri("/targets"))
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({"scope": "octo", "github_token": "ghp_secret"}).to_string(),
            ))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        let created = body_json(response).await;
        assert!(created.get("github_token").is_none());
    }
}
