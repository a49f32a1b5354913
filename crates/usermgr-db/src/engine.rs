//! Engine provisioning: pooled connections under one isolation contract.
//!
//! Both execution models go through [`provision_with`] and share the same
//! [`PoolSettings`]; they differ only in whether provisioning validates
//! connectivity up front and in how callers wait for a connection.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use r2d2::{HandleError, Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OpenFlags};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{ConnectionSpec, ExecutionModel, IsolationMode, PoolSettings};
use crate::dsn::{build_identifier, ConnectionIdentifier};
use crate::error::{DbError, Result};

/// A type alias for the SQLite connection pool.
pub type DbPool = Pool<SqliteConnectionManager>;

/// A connection checked out of a [`DbPool`].
pub type PooledConn = PooledConnection<SqliteConnectionManager>;

const SUPPORTED_DIALECT: &str = "sqlite";
const SUPPORTED_DRIVER: &str = "rusqlite";

/// A provisioned, pooled database engine.
///
/// Held for the lifetime of the process (usually behind an `Arc`) and
/// shared by every session.
pub struct Engine {
    identifier: ConnectionIdentifier,
    isolation: IsolationMode,
    model: ExecutionModel,
    settings: PoolSettings,
    pool: DbPool,
    permits: Arc<Semaphore>,
    disposed: AtomicBool,
}

/// Routes r2d2's background connection errors into `tracing`.
#[derive(Debug)]
struct TracingErrorHandler;

impl HandleError<rusqlite::Error> for TracingErrorHandler {
    fn handle_error(&self, error: rusqlite::Error) {
        tracing::warn!(error = %error, "pooled connection error");
    }
}

/// Provisions an engine for `spec` with the default pool settings.
///
/// # Errors
///
/// See [`provision_with`].
pub fn provision(
    spec: &ConnectionSpec,
    isolation: IsolationMode,
    model: ExecutionModel,
) -> Result<Engine> {
    let identifier = build_identifier(spec)?;
    provision_with(&identifier, isolation, model, PoolSettings::default())
}

/// Provisions an engine for an already-built identifier.
///
/// Under [`ExecutionModel::Blocking`] a connection is checked out and
/// `SELECT 1` is run before returning, so a returned engine is backed by a
/// reachable database. Under [`ExecutionModel::NonBlocking`] no I/O happens
/// here and the first real operation reports connectivity problems.
///
/// # Errors
///
/// - [`DbError::Encoding`] if the identifier cannot be parsed.
/// - [`DbError::Config`] if `settings` cannot configure a pool.
/// - [`DbError::Connection`] if the dialect is not supported, or if blocking
///   validation fails.
pub fn provision_with(
    identifier: &ConnectionIdentifier,
    isolation: IsolationMode,
    model: ExecutionModel,
    settings: PoolSettings,
) -> Result<Engine> {
    validate_settings(&settings)?;

    let parts = identifier.parse()?;
    let driver_ok = parts
        .driver
        .as_deref()
        .map_or(true, |driver| driver == SUPPORTED_DRIVER);
    if parts.dialect != SUPPORTED_DIALECT || !driver_ok {
        return Err(DbError::Connection(format!(
            "unsupported dialect '{}{}'",
            parts.dialect,
            parts
                .driver
                .as_deref()
                .map(|d| format!("+{d}"))
                .unwrap_or_default()
        )));
    }

    tracing::debug!(
        identifier = %identifier,
        ?isolation,
        ?model,
        pool_size = settings.pool_size,
        pool_recycle_secs = settings.pool_recycle.as_secs(),
        "provisioning database engine"
    );

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    let busy_timeout_ms = settings.busy_timeout_ms;

    let manager = SqliteConnectionManager::file(&parts.database_name)
        .with_flags(flags)
        .with_init(move |conn| init_connection(conn, isolation, busy_timeout_ms));

    // Connections are opened on demand only: non-blocking provisioning must
    // not touch the database.
    let pool = Pool::builder()
        .max_size(settings.pool_size)
        .min_idle(Some(0))
        .max_lifetime(Some(settings.pool_recycle))
        .connection_timeout(settings.acquire_timeout)
        .test_on_check_out(true)
        .error_handler(Box::new(TracingErrorHandler))
        .build_unchecked(manager);

    let engine = Engine {
        identifier: identifier.clone(),
        isolation,
        model,
        settings,
        pool,
        permits: Arc::new(Semaphore::new(settings.pool_size as usize)),
        disposed: AtomicBool::new(false),
    };

    if model == ExecutionModel::Blocking {
        if let Err(e) = engine.ping() {
            tracing::error!(identifier = %identifier, error = %e, "database connection failed");
            return Err(match e {
                DbError::Connection(_) => e,
                other => DbError::Connection(other.to_string()),
            });
        }
        tracing::debug!(identifier = %identifier, "database connection is valid");
    }

    Ok(engine)
}

fn validate_settings(settings: &PoolSettings) -> Result<()> {
    if settings.pool_size == 0 {
        return Err(DbError::Config("pool_size must be > 0".to_string()));
    }
    if settings.pool_recycle == Duration::ZERO {
        return Err(DbError::Config("pool_recycle must be > 0".to_string()));
    }
    if settings.acquire_timeout == Duration::ZERO {
        return Err(DbError::Config("acquire_timeout must be > 0".to_string()));
    }
    Ok(())
}

fn init_connection(
    conn: &mut Connection,
    isolation: IsolationMode,
    busy_timeout_ms: u64,
) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = {busy_timeout_ms};"
    ))?;

    if isolation == IsolationMode::RepeatableRead {
        // WAL gives every read transaction a stable snapshot while writers
        // commit concurrently. In-memory databases report "memory".
        let journal_mode: String =
            conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
        if journal_mode != "wal" && journal_mode != "memory" {
            return Err(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                Some(format!(
                    "failed to enable snapshot reads, journal_mode is {journal_mode}"
                )),
            ));
        }
        conn.execute_batch("PRAGMA read_uncommitted = OFF;")?;
    }

    Ok(())
}

impl Engine {
    /// The identifier this engine was provisioned from.
    pub fn identifier(&self) -> &ConnectionIdentifier {
        &self.identifier
    }

    /// Isolation applied to every connection.
    pub fn isolation(&self) -> IsolationMode {
        self.isolation
    }

    /// Execution model chosen at provisioning time.
    pub fn execution_model(&self) -> ExecutionModel {
        self.model
    }

    /// Pool settings in effect.
    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Maximum number of pooled connections.
    pub fn pool_size(&self) -> u32 {
        self.pool.max_size()
    }

    /// Age after which pooled connections are replaced.
    pub fn pool_recycle(&self) -> Option<Duration> {
        self.pool.max_lifetime()
    }

    /// Current pool occupancy.
    pub fn state(&self) -> r2d2::State {
        self.pool.state()
    }

    /// Whether [`Engine::dispose`] has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Runs `SELECT 1` on a pooled connection.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] if no connection can be opened or the
    /// query fails, [`DbError::PoolExhausted`] if the pool stays full.
    pub fn ping(&self) -> Result<()> {
        let conn = self.checkout()?;
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .map_err(|e| DbError::Connection(e.to_string()))?;
        Ok(())
    }

    /// Non-blocking variant of [`Engine::ping`].
    ///
    /// # Errors
    ///
    /// Same as [`Engine::ping`].
    pub async fn ping_async(self: &Arc<Self>) -> Result<()> {
        self.run_blocking(|engine| engine.ping()).await
    }

    /// Applies pending embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Migration`] if a migration fails, or a checkout
    /// error if no connection is available.
    pub fn run_migrations(&self) -> Result<usize> {
        let conn = self.checkout()?;
        crate::migrations::run_migrations(&conn)
    }

    /// Stops handing out connections. The pool itself closes when the last
    /// handle to the engine is dropped.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        let state = self.pool.state();
        tracing::info!(
            identifier = %self.identifier,
            connections = state.connections,
            idle = state.idle_connections,
            "database engine disposed"
        );
    }

    /// Checks a connection out of the pool, blocking up to the acquire
    /// timeout.
    pub(crate) fn checkout(&self) -> Result<PooledConn> {
        if self.is_disposed() {
            return Err(DbError::Connection(
                "engine has been disposed".to_string(),
            ));
        }
        self.pool.get().map_err(|e| {
            let state = self.pool.state();
            if state.connections >= self.settings.pool_size && state.idle_connections == 0 {
                tracing::warn!(
                    pool_size = self.settings.pool_size,
                    "timed out waiting for a pooled connection"
                );
                DbError::PoolExhausted {
                    pool_size: self.settings.pool_size,
                    waited: self.settings.acquire_timeout,
                }
            } else {
                DbError::Connection(e.to_string())
            }
        })
    }

    /// Waits cooperatively for one of `pool_size` permits.
    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        let waited = self.settings.acquire_timeout;
        match tokio::time::timeout(waited, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => Err(DbError::Connection(
                "engine has been disposed".to_string(),
            )),
            Err(_elapsed) => Err(DbError::PoolExhausted {
                pool_size: self.settings.pool_size,
                waited,
            }),
        }
    }

    /// Runs blocking database work off the async workers.
    ///
    /// The caller suspends while waiting for a permit; the permit then
    /// travels with the work onto the blocking pool and is released only
    /// when the work (and any connection it checked out) is finished.
    pub(crate) async fn run_blocking<T, E, F>(self: &Arc<Self>, work: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Arc<Engine>) -> std::result::Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<DbError> + Send + 'static,
    {
        let permit = self.acquire_permit().await?;
        let engine = Arc::clone(self);

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            work(&engine)
        })
        .await
        .map_err(|e| E::from(DbError::Task(e.to_string())))?
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("identifier", &self.identifier)
            .field("isolation", &self.isolation)
            .field("model", &self.model)
            .field("settings", &self.settings)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsn::build_connection_identifier;
    use tempfile::TempDir;

    fn identifier_for(path: &str) -> ConnectionIdentifier {
        build_connection_identifier("root", "root", "localhost:3306", path, "sqlite+rusqlite")
            .expect("identifier should build")
    }

    fn quick_settings() -> PoolSettings {
        PoolSettings {
            acquire_timeout: Duration::from_millis(200),
            ..PoolSettings::default()
        }
    }

    #[test]
    fn blocking_provision_validates_and_configures_pool() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("engine.db");
        let identifier = identifier_for(path.to_str().expect("utf-8 path"));

        let engine = provision_with(
            &identifier,
            IsolationMode::RepeatableRead,
            ExecutionModel::Blocking,
            quick_settings(),
        )
        .expect("provisioning should succeed");

        assert_eq!(engine.pool_size(), 5);
        assert_eq!(engine.pool_recycle(), Some(Duration::from_secs(3600)));
        assert!(path.exists(), "validation should have opened the database");

        let conn = engine.checkout().expect("checkout");
        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .expect("journal_mode");
        assert_eq!(mode, "wal");
        let fk: i32 = conn
            .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
            .expect("foreign_keys");
        assert_eq!(fk, 1);
    }

    #[test]
    fn default_isolation_leaves_journal_mode_alone() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("plain.db");
        let engine = provision_with(
            &identifier_for(path.to_str().expect("utf-8 path")),
            IsolationMode::Default,
            ExecutionModel::Blocking,
            quick_settings(),
        )
        .expect("provisioning should succeed");

        let conn = engine.checkout().expect("checkout");
        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .expect("journal_mode");
        assert_eq!(mode, "delete");
    }

    #[test]
    fn blocking_provision_fails_for_unreachable_database() {
        let identifier = identifier_for("/nonexistent-usermgr-dir/sub/engine.db");

        let err = provision_with(
            &identifier,
            IsolationMode::RepeatableRead,
            ExecutionModel::Blocking,
            quick_settings(),
        )
        .expect_err("provisioning should fail");

        assert!(matches!(err, DbError::Connection(_)), "got {err:?}");
    }

    #[test]
    fn non_blocking_provision_defers_failure_to_first_use() {
        let identifier = identifier_for("/nonexistent-usermgr-dir/sub/engine.db");

        let engine = provision_with(
            &identifier,
            IsolationMode::RepeatableRead,
            ExecutionModel::NonBlocking,
            quick_settings(),
        )
        .expect("non-blocking provisioning does no I/O");

        assert_eq!(engine.state().connections, 0);
        let err = engine.ping().expect_err("first use should fail");
        assert!(matches!(err, DbError::Connection(_)), "got {err:?}");
    }

    #[test]
    fn unsupported_dialect_is_a_connection_error() {
        let identifier = build_connection_identifier(
            "root",
            "root",
            "localhost:3306",
            "app_db_name",
            "mysql+pymysql",
        )
        .expect("identifier should build");

        let err = provision_with(
            &identifier,
            IsolationMode::RepeatableRead,
            ExecutionModel::NonBlocking,
            quick_settings(),
        )
        .expect_err("mysql is not compiled in");

        match err {
            DbError::Connection(msg) => assert!(msg.contains("mysql+pymysql"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let identifier = identifier_for("unused.db");
        let err = provision_with(
            &identifier,
            IsolationMode::Default,
            ExecutionModel::NonBlocking,
            PoolSettings {
                pool_size: 0,
                ..PoolSettings::default()
            },
        )
        .expect_err("zero-sized pool");
        assert!(matches!(err, DbError::Config(_)));
    }

    #[test]
    fn pool_never_exceeds_its_size() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("bounded.db");
        let engine = provision_with(
            &identifier_for(path.to_str().expect("utf-8 path")),
            IsolationMode::RepeatableRead,
            ExecutionModel::Blocking,
            quick_settings(),
        )
        .expect("provisioning should succeed");

        let held: Vec<_> = (0..5)
            .map(|_| engine.checkout().expect("checkout within pool size"))
            .collect();
        assert_eq!(engine.state().connections, 5);

        let err = engine.checkout().expect_err("sixth checkout should time out");
        assert!(
            matches!(err, DbError::PoolExhausted { pool_size: 5, .. }),
            "got {err:?}"
        );
        assert_eq!(engine.state().connections, 5);

        drop(held);
        engine.checkout().expect("checkout after release");
    }

    #[test]
    fn disposed_engine_refuses_checkouts() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("disposed.db");
        let engine = provision_with(
            &identifier_for(path.to_str().expect("utf-8 path")),
            IsolationMode::RepeatableRead,
            ExecutionModel::Blocking,
            quick_settings(),
        )
        .expect("provisioning should succeed");

        engine.dispose();
        engine.dispose();
        assert!(engine.is_disposed());
        assert!(matches!(engine.ping(), Err(DbError::Connection(_))));
    }

    #[tokio::test]
    async fn ping_async_runs_on_the_blocking_pool() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("async.db");
        let engine = Arc::new(
            provision_with(
                &identifier_for(path.to_str().expect("utf-8 path")),
                IsolationMode::RepeatableRead,
                ExecutionModel::NonBlocking,
                quick_settings(),
            )
            .expect("provisioning should succeed"),
        );

        engine.ping_async().await.expect("ping should succeed");
        assert_eq!(engine.state().idle_connections, engine.state().connections);
    }

    #[test]
    fn debug_output_hides_secret() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("debug.db");
        let identifier = build_connection_identifier(
            "root",
            "hunter2",
            "localhost",
            path.to_str().expect("utf-8 path"),
            "sqlite+rusqlite",
        )
        .expect("identifier should build");
        let engine = provision_with(
            &identifier,
            IsolationMode::RepeatableRead,
            ExecutionModel::NonBlocking,
            quick_settings(),
        )
        .expect("provisioning should succeed");

        assert!(!format!("{engine:?}").contains("hunter2"));
    }
}
