//! Connection credentials and pool tunables.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

/// Default pool size shared by both execution models.
pub const DEFAULT_POOL_SIZE: u32 = 5;

/// Age after which a pooled connection is discarded and replaced.
pub const DEFAULT_POOL_RECYCLE: Duration = Duration::from_secs(3600);

/// Default charset appended to every connection identifier.
pub const DEFAULT_CHARSET: &str = "utf8mb4";

/// Dialect and driver compiled into this crate.
pub const DEFAULT_DIALECT_DRIVER: &str = "sqlite+rusqlite";

/// Discrete credential fields used to build a connection identifier.
///
/// Built once at process start and passed by reference afterwards.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionSpec {
    /// Database user.
    pub user: String,
    /// Password. Percent-encoded when the identifier is built.
    pub secret: String,
    /// `host:port` of the database server.
    pub host_port: String,
    /// Database name. For SQLite this is the database file path.
    pub database_name: String,
    /// `dialect+driver`, e.g. `sqlite+rusqlite`.
    pub dialect_driver: String,
    /// Charset query parameter.
    pub charset: String,
}

impl ConnectionSpec {
    /// Creates a spec with the default dialect and charset.
    pub fn new(
        user: impl Into<String>,
        secret: impl Into<String>,
        host_port: impl Into<String>,
        database_name: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            secret: secret.into(),
            host_port: host_port.into(),
            database_name: database_name.into(),
            dialect_driver: DEFAULT_DIALECT_DRIVER.to_string(),
            charset: DEFAULT_CHARSET.to_string(),
        }
    }

    /// Overrides the `dialect+driver` prefix.
    pub fn with_dialect_driver(mut self, dialect_driver: impl Into<String>) -> Self {
        self.dialect_driver = dialect_driver.into();
        self
    }

    /// Reads the connection fields from the process environment.
    ///
    /// - `USERMGR_DB_USER` (default `root`)
    /// - `USERMGR_DB_PASSWORD` (default `root`)
    /// - `USERMGR_DB_ADDRESS` (default `localhost:3306`)
    /// - `USERMGR_DB_NAME` (default `app_db_name`)
    /// - `USERMGR_DB_DIALECT` (default `sqlite+rusqlite`)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ConnectionSpec::from_env`] with a caller-supplied lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str, fallback: &str| lookup(key).unwrap_or_else(|| fallback.to_string());

        Self {
            user: read("USERMGR_DB_USER", "root"),
            secret: read("USERMGR_DB_PASSWORD", "root"),
            host_port: read("USERMGR_DB_ADDRESS", "localhost:3306"),
            database_name: read("USERMGR_DB_NAME", "app_db_name"),
            dialect_driver: read("USERMGR_DB_DIALECT", DEFAULT_DIALECT_DRIVER),
            charset: DEFAULT_CHARSET.to_string(),
        }
    }
}

impl Default for ConnectionSpec {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl fmt::Debug for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSpec")
            .field("user", &self.user)
            .field("secret", &"***")
            .field("host_port", &self.host_port)
            .field("database_name", &self.database_name)
            .field("dialect_driver", &self.dialect_driver)
            .field("charset", &self.charset)
            .finish()
    }
}

/// Transaction isolation applied to every pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Repeated reads inside one transaction observe the same snapshot.
    #[default]
    RepeatableRead,
    /// Whatever the backend does out of the box.
    Default,
}

/// How callers wait on the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionModel {
    /// Callers block their thread; provisioning validates connectivity.
    #[default]
    Blocking,
    /// Callers suspend cooperatively; provisioning does no I/O.
    NonBlocking,
}

/// Pool tunables. One value configures both execution models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum number of pooled connections.
    pub pool_size: u32,
    /// Connections older than this are discarded instead of reused.
    pub pool_recycle: Duration,
    /// How long a caller waits for a free connection.
    pub acquire_timeout: Duration,
    /// SQLite busy timeout, in milliseconds.
    pub busy_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            pool_recycle: DEFAULT_POOL_RECYCLE,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout_ms: 5_000,
        }
    }
}
