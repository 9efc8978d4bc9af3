//! Liveness endpoint.

use axum::http::StatusCode;

/// Returns 200 OK while the server is up.
pub async fn health_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}
