//! Server configuration loading from file and environment variables.

use serde::de::{value::StrDeserializer, DeserializeOwned, IntoDeserializer};
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;
use usermgr_db::{
    ConnectionSpec, ExecutionModel, IsolationMode, PoolSettings, DEFAULT_CHARSET,
    DEFAULT_POOL_RECYCLE, DEFAULT_POOL_SIZE,
};

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database credentials and engine settings.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database user.
    pub user: String,
    /// Database password. Redacted from `Debug` output.
    pub password: String,
    /// `host:port` of the database server.
    pub address: String,
    /// Database name; the file path for SQLite.
    pub name: String,
    /// `dialect+driver` prefix.
    pub dialect: String,
    /// Isolation contract every pooled connection is set up with.
    pub isolation: IsolationMode,
    /// Whether callers block on the pool or suspend on the async runtime.
    pub execution: ExecutionModel,
    /// Maximum number of open connections.
    pub pool_size: u32,
    /// Seconds after which a connection is closed and replaced.
    pub pool_recycle_secs: u64,
    /// Milliseconds a caller waits for a free connection before giving up.
    pub acquire_timeout_ms: u64,
    /// Milliseconds SQLite retries a locked database before failing.
    pub busy_timeout_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "usermgr_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let spec = ConnectionSpec::default();
        let pool = PoolSettings::default();
        Self {
            user: spec.user,
            password: spec.secret,
            address: spec.host_port,
            name: spec.database_name,
            dialect: spec.dialect_driver,
            isolation: IsolationMode::default(),
            execution: ExecutionModel::default(),
            pool_size: DEFAULT_POOL_SIZE,
            pool_recycle_secs: DEFAULT_POOL_RECYCLE.as_secs(),
            acquire_timeout_ms: duration_ms(pool.acquire_timeout),
            busy_timeout_ms: pool.busy_timeout_ms,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl DatabaseConfig {
    /// Credential fields for the connection identifier.
    pub fn connection_spec(&self) -> ConnectionSpec {
        ConnectionSpec {
            user: self.user.clone(),
            secret: self.password.clone(),
            host_port: self.address.clone(),
            database_name: self.name.clone(),
            dialect_driver: self.dialect.clone(),
            charset: DEFAULT_CHARSET.to_string(),
        }
    }

    /// Pool tunables shared by both execution models.
    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            pool_size: self.pool_size,
            pool_recycle: Duration::from_secs(self.pool_recycle_secs),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            busy_timeout_ms: self.busy_timeout_ms,
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("user", &self.user)
            .field("password", &"***")
            .field("address", &self.address)
            .field("name", &self.name)
            .field("dialect", &self.dialect)
            .field("isolation", &self.isolation)
            .field("execution", &self.execution)
            .field("pool_size", &self.pool_size)
            .field("pool_recycle_secs", &self.pool_recycle_secs)
            .field("acquire_timeout_ms", &self.acquire_timeout_ms)
            .field("busy_timeout_ms", &self.busy_timeout_ms)
            .finish()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `USERMGR_HOST`, `USERMGR_PORT` override `server.host` / `server.port`
/// - `USERMGR_DB_USER`, `USERMGR_DB_PASSWORD`, `USERMGR_DB_ADDRESS`,
///   `USERMGR_DB_NAME`, `USERMGR_DB_DIALECT` override the credentials
/// - `USERMGR_DB_ISOLATION` (`repeatable_read` | `default`) and
///   `USERMGR_DB_EXECUTION` (`blocking` | `non_blocking`)
/// - `USERMGR_DB_POOL_SIZE` overrides `database.pool_size`
/// - `USERMGR_LOG_LEVEL` overrides `logging.level`
/// - `USERMGR_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    load_config_with(path, |key| std::env::var(key).ok())
}

/// Same as [`load_config`] with a caller-supplied environment lookup.
///
/// # Errors
///
/// See [`load_config`].
pub fn load_config_with<F>(path: Option<&str>, env: F) -> Result<Config, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Some(host) = env("USERMGR_HOST") {
        override_parsed("USERMGR_HOST", &host, &mut config.server.host);
    }
    if let Some(port) = env("USERMGR_PORT") {
        override_parsed("USERMGR_PORT", &port, &mut config.server.port);
    }

    let db = &mut config.database;
    for (key, field) in [
        ("USERMGR_DB_USER", &mut db.user),
        ("USERMGR_DB_PASSWORD", &mut db.password),
        ("USERMGR_DB_ADDRESS", &mut db.address),
        ("USERMGR_DB_NAME", &mut db.name),
        ("USERMGR_DB_DIALECT", &mut db.dialect),
    ] {
        if let Some(value) = env(key) {
            *field = value;
        }
    }
    if let Some(isolation) = env("USERMGR_DB_ISOLATION") {
        override_variant("USERMGR_DB_ISOLATION", &isolation, &mut db.isolation);
    }
    if let Some(execution) = env("USERMGR_DB_EXECUTION") {
        override_variant("USERMGR_DB_EXECUTION", &execution, &mut db.execution);
    }
    if let Some(pool_size) = env("USERMGR_DB_POOL_SIZE") {
        override_parsed("USERMGR_DB_POOL_SIZE", &pool_size, &mut db.pool_size);
    }

    if let Some(level) = env("USERMGR_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = env("USERMGR_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }

    Ok(config)
}

fn override_parsed<T: std::str::FromStr>(key: &str, raw: &str, target: &mut T) {
    match raw.parse() {
        Ok(parsed) => *target = parsed,
        Err(_) => tracing::warn!(key, value = raw, "ignoring unparseable environment override"),
    }
}

fn override_variant<T: DeserializeOwned>(key: &str, raw: &str, target: &mut T) {
    let deserializer: StrDeserializer<'_, serde::de::value::Error> = raw.into_deserializer();
    match T::deserialize(deserializer) {
        Ok(parsed) => *target = parsed,
        Err(_) => tracing::warn!(key, value = raw, "ignoring unknown environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = load_config_with(Some("/nonexistent/usermgr.toml"), no_env)
            .expect("missing file falls back to defaults");

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.database.user, "root");
        assert_eq!(config.database.address, "localhost:3306");
        assert_eq!(config.database.name, "app_db_name");
        assert_eq!(config.database.dialect, "sqlite+rusqlite");
        assert_eq!(config.database.isolation, IsolationMode::RepeatableRead);
        assert_eq!(config.database.execution, ExecutionModel::Blocking);
        assert_eq!(config.database.pool_settings(), PoolSettings::default());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn file_values_are_read() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
[server]
port = 8080

[database]
name = "/var/lib/usermgr/users.db"
isolation = "default"
execution = "non_blocking"
pool_size = 3
acquire_timeout_ms = 250

[logging]
json = true
"#
        )
        .expect("write config");

        let path = file.path().to_str().expect("utf-8 path");
        let config = load_config_with(Some(path), no_env).expect("config parses");

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.database.name, "/var/lib/usermgr/users.db");
        assert_eq!(config.database.user, "root", "unset keys keep defaults");
        assert_eq!(config.database.isolation, IsolationMode::Default);
        assert_eq!(config.database.execution, ExecutionModel::NonBlocking);
        let pool = config.database.pool_settings();
        assert_eq!(pool.pool_size, 3);
        assert_eq!(pool.acquire_timeout, Duration::from_millis(250));
        assert_eq!(pool.pool_recycle, Duration::from_secs(3600));
        assert!(config.logging.json);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "[database\nname = ").expect("write config");

        let path = file.path().to_str().expect("utf-8 path");
        assert!(matches!(
            load_config_with(Some(path), no_env),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn environment_overrides_win() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("USERMGR_PORT", "9000"),
            ("USERMGR_DB_PASSWORD", "p@ss"),
            ("USERMGR_DB_NAME", "other.db"),
            ("USERMGR_DB_EXECUTION", "non_blocking"),
            ("USERMGR_DB_ISOLATION", "serializable"),
            ("USERMGR_DB_POOL_SIZE", "not-a-number"),
            ("USERMGR_LOG_LEVEL", "debug"),
        ]);
        let config = load_config_with(None, |key| env.get(key).map(|v| v.to_string()))
            .expect("config");

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.database.password, "p@ss");
        assert_eq!(config.database.name, "other.db");
        assert_eq!(config.database.execution, ExecutionModel::NonBlocking);
        assert_eq!(
            config.database.isolation,
            IsolationMode::RepeatableRead,
            "unknown variants are ignored"
        );
        assert_eq!(config.database.pool_size, 5, "unparseable values are ignored");
        assert_eq!(config.logging.level, "debug");

        let spec = config.database.connection_spec();
        assert_eq!(spec.secret, "p@ss");
        assert_eq!(spec.database_name, "other.db");
    }

    #[test]
    fn debug_output_hides_password() {
        let config = DatabaseConfig {
            password: "hunter2".to_string(),
            ..DatabaseConfig::default()
        };
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
