//! Error taxonomy for the data-access layer.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the credential codec, the engine provisioner, sessions
/// and transaction scopes.
#[derive(Debug, Error)]
pub enum DbError {
    /// A credential field could not be turned into (or read back from) a
    /// connection identifier.
    #[error("invalid connection credentials: {0}")]
    Encoding(String),

    /// The database could not be reached, or the identifier names a backend
    /// that is not compiled in.
    #[error("database unreachable: {0}")]
    Connection(String),

    /// Pool settings that the pool cannot be built with.
    #[error("invalid engine configuration: {0}")]
    Config(String),

    /// Every pooled connection stayed checked out for the whole wait window.
    #[error("connection pool exhausted: {pool_size} connections busy after waiting {waited:?}")]
    PoolExhausted {
        /// Configured pool size.
        pool_size: u32,
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// Storage rejected a write because it would duplicate a unique key.
    #[error("unique constraint violation: {message}")]
    UniqueViolation {
        /// `table.column` list reported by the backend, when available.
        constraint: Option<String>,
        /// Backend message.
        message: String,
    },

    /// Any other backend failure.
    #[error("storage error: {0}")]
    Storage(#[source] rusqlite::Error),

    /// A session or scope was driven through an invalid lifecycle step.
    #[error("invalid transaction state: {0}")]
    Transaction(&'static str),

    /// The caller abandoned a non-blocking operation before it committed.
    #[error("operation cancelled before commit")]
    Cancelled,

    /// The blocking task running a non-blocking operation failed to complete.
    #[error("database task failed: {0}")]
    Task(String),

    /// An embedded migration failed.
    #[error("migration '{name}' failed: {source}")]
    Migration {
        /// The name of the migration that failed.
        name: String,
        /// The underlying SQLite error.
        #[source]
        source: rusqlite::Error,
    },
}

impl DbError {
    /// Whether retrying the same call later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, DbError::PoolExhausted { .. } | DbError::Connection(_))
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, message) = &err {
            let code = failure.extended_code;
            if code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            {
                let message = message.clone().unwrap_or_else(|| failure.to_string());
                // SQLite reports "UNIQUE constraint failed: users.username"
                let constraint = message
                    .split_once("failed: ")
                    .map(|(_, columns)| columns.trim().to_string());
                return DbError::UniqueViolation {
                    constraint,
                    message,
                };
            }
        }
        DbError::Storage(err)
    }
}

/// Type alias for data-access results.
pub type Result<T> = std::result::Result<T, DbError>;
