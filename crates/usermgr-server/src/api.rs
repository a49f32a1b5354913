//! HTTP handlers and the error-to-status mapping.

use std::sync::Arc;

use axum::{
    extract::{Extension, Json},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{json, Value};
use thiserror::Error;
use usermgr_db::DbError;
use usermgr_users::UserError;

use crate::AppState;

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Connection(_) | DbError::PoolExhausted { .. } | DbError::Storage(_) => {
                ApiError::Unavailable(err.to_string())
            }
            DbError::UniqueViolation { .. } => ApiError::Conflict(err.to_string()),
            other => ApiError::InternalServerError(other.to_string()),
        }
    }
}

impl From<UserError> for ApiError {
    fn from(err: UserError) -> Self {
        match err {
            UserError::InvalidUsername(_) => ApiError::BadRequest(err.to_string()),
            UserError::UsernameTaken(_) => ApiError::Conflict(err.to_string()),
            UserError::NotFound(_) => ApiError::NotFound(err.to_string()),
            UserError::Hash(_) => ApiError::InternalServerError(err.to_string()),
            UserError::Db(db) => ApiError::from(db),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

/// Health check handler.
///
/// Returns `200 OK` when the database answers `SELECT 1`, `503` otherwise.
pub async fn health(Extension(state): Extension<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    state.engine.ping_async().await.map_err(|e| {
        tracing::warn!(error = %e, "health check failed");
        ApiError::from(e)
    })?;

    let pool = state.engine.state();
    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "pool": {
            "size": state.engine.pool_size(),
            "connections": pool.connections,
            "idle": pool.idle_connections,
        }
    })))
}
