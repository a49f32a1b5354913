//! Usermgr server library logic.

pub mod api;
pub mod config;

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use thiserror::Error;
use usermgr_db::{build_identifier, provision_with, DbError, Engine, SessionFactory};
use usermgr_users::AsyncUserDao;

use crate::config::DatabaseConfig;

/// Application state shared across all request handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// The process-wide database engine.
    pub engine: Arc<Engine>,
    /// User repository for request handlers.
    pub users: AsyncUserDao,
}

impl AppState {
    /// Wraps an already provisioned engine.
    pub fn new(engine: Arc<Engine>) -> Self {
        let users = AsyncUserDao::new(SessionFactory::new(Arc::clone(&engine)));
        Self { engine, users }
    }
}

/// Errors that stop the server from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The engine could not be provisioned.
    #[error("failed to provision database engine: {0}")]
    Provision(#[source] DbError),

    /// Embedded migrations failed.
    #[error("failed to run database migrations: {0}")]
    Migrate(#[source] DbError),

    /// The database did not answer the liveness check.
    #[error("database liveness check failed: {0}")]
    Liveness(#[source] DbError),

    /// The blocking startup task panicked or was cancelled.
    #[error("startup task failed: {0}")]
    Task(String),
}

/// Provisions the engine once, applies migrations and runs one liveness
/// check.
///
/// # Errors
///
/// Returns [`StartupError`] naming the step that failed.
pub fn startup(config: &DatabaseConfig) -> Result<AppState, StartupError> {
    let identifier = build_identifier(&config.connection_spec()).map_err(StartupError::Provision)?;
    tracing::info!(
        identifier = %identifier,
        isolation = ?config.isolation,
        execution = ?config.execution,
        "provisioning database engine"
    );

    let engine = provision_with(
        &identifier,
        config.isolation,
        config.execution,
        config.pool_settings(),
    )
    .map_err(StartupError::Provision)?;

    let applied = engine.run_migrations().map_err(StartupError::Migrate)?;
    if applied > 0 {
        tracing::info!(count = applied, "applied database migrations");
    }

    engine.ping().map_err(StartupError::Liveness)?;
    tracing::info!(
        pool_size = engine.pool_size(),
        "database engine ready"
    );

    Ok(AppState::new(Arc::new(engine)))
}

/// Runs [`startup`] on the blocking thread pool.
///
/// Blocking provisioning can wait up to the acquire timeout for its first
/// connection; this keeps that wait off the async worker threads.
///
/// # Errors
///
/// Same as [`startup`], plus [`StartupError::Task`] if the task panicked.
pub async fn startup_async(config: DatabaseConfig) -> Result<AppState, StartupError> {
    tokio::task::spawn_blocking(move || startup(&config))
        .await
        .map_err(|e| StartupError::Task(e.to_string()))?
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .layer(Extension(Arc::new(state)))
}
