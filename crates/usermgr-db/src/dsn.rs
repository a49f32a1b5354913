//! Connection identifier codec.
//!
//! Identifiers follow the usual DSN shape:
//!
//! ```text
//! <dialect>+<driver>://<user>:<percent-encoded-secret>@<host:port>/<database>?charset=<charset>
//! ```
//!
//! Only the secret is percent-encoded. The other fields are interpolated
//! verbatim, so they are rejected up front when they contain URL delimiters
//! that would change how the identifier parses.

use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::config::{ConnectionSpec, DEFAULT_CHARSET};
use crate::error::{DbError, Result};

/// A fully built connection identifier.
///
/// `Display` prints the identifier with the secret masked; use
/// [`ConnectionIdentifier::as_str`] when the real value is needed.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionIdentifier {
    raw: String,
}

/// The decoded parts of a [`ConnectionIdentifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifierParts {
    /// Dialect, e.g. `sqlite`.
    pub dialect: String,
    /// Driver, e.g. `rusqlite`, when the scheme names one.
    pub driver: Option<String>,
    /// Database user.
    pub user: String,
    /// Decoded secret.
    pub secret: String,
    /// `host` or `host:port`.
    pub host_port: String,
    /// Database name (for SQLite, the file path).
    pub database_name: String,
    /// Charset query parameter, if present.
    pub charset: Option<String>,
}

/// Builds a connection identifier from discrete credential fields.
///
/// The secret is percent-encoded; every other field is checked and
/// interpolated as given. The charset is always `utf8mb4`.
///
/// # Errors
///
/// Returns [`DbError::Encoding`] if a field is empty or contains characters
/// that would corrupt the identifier's structure.
pub fn build_connection_identifier(
    user: &str,
    secret: &str,
    host_port: &str,
    database_name: &str,
    dialect_driver: &str,
) -> Result<ConnectionIdentifier> {
    compose(
        user,
        secret,
        host_port,
        database_name,
        dialect_driver,
        DEFAULT_CHARSET,
    )
}

/// Builds the identifier for a [`ConnectionSpec`], honouring its charset.
///
/// # Errors
///
/// Same as [`build_connection_identifier`].
pub fn build_identifier(spec: &ConnectionSpec) -> Result<ConnectionIdentifier> {
    compose(
        &spec.user,
        &spec.secret,
        &spec.host_port,
        &spec.database_name,
        &spec.dialect_driver,
        &spec.charset,
    )
}

fn compose(
    user: &str,
    secret: &str,
    host_port: &str,
    database_name: &str,
    dialect_driver: &str,
    charset: &str,
) -> Result<ConnectionIdentifier> {
    validate_dialect_driver(dialect_driver)?;
    validate_field("user", user, &[':', '@', '/', '?', '#', '%'])?;
    validate_field("host_port", host_port, &['@', '/', '?', '#', '%'])?;
    validate_field("database_name", database_name, &['?', '#', '%'])?;
    if charset.is_empty() || !charset.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(DbError::Encoding(format!("invalid charset: {charset:?}")));
    }

    let encoded_secret = urlencoding::encode(secret);
    Ok(ConnectionIdentifier {
        raw: format!(
            "{dialect_driver}://{user}:{encoded_secret}@{host_port}/{database_name}?charset={charset}"
        ),
    })
}

fn validate_dialect_driver(value: &str) -> Result<()> {
    let is_token =
        |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

    let valid = match value.split_once('+') {
        Some((dialect, driver)) => is_token(dialect) && is_token(driver),
        None => is_token(value),
    };
    if valid {
        Ok(())
    } else {
        Err(DbError::Encoding(format!(
            "dialect_driver must look like 'dialect+driver', got {value:?}"
        )))
    }
}

fn validate_field(name: &str, value: &str, forbidden: &[char]) -> Result<()> {
    if value.is_empty() {
        return Err(DbError::Encoding(format!("{name} cannot be empty")));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || forbidden.contains(c))
    {
        return Err(DbError::Encoding(format!(
            "{name} contains reserved character {bad:?}"
        )));
    }
    Ok(())
}

fn decode(name: &str, value: &str) -> Result<String> {
    urlencoding::decode(value)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| DbError::Encoding(format!("{name} is not valid percent-encoded UTF-8: {e}")))
}

impl ConnectionIdentifier {
    /// The full identifier, secret included.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The identifier with the secret replaced by `***`.
    pub fn redacted(&self) -> String {
        let Some(scheme_end) = self.raw.find("://") else {
            return self.raw.clone();
        };
        let authority_start = scheme_end + 3;
        let rest = &self.raw[authority_start..];
        let authority_end = rest.find('/').unwrap_or(rest.len());
        let Some(at) = rest[..authority_end].rfind('@') else {
            return self.raw.clone();
        };
        match rest[..at].split_once(':') {
            Some((user, _)) => format!(
                "{}{}:***{}",
                &self.raw[..authority_start],
                user,
                &rest[at..]
            ),
            None => self.raw.clone(),
        }
    }

    /// The text between the authority and the query, exactly as written.
    ///
    /// Taken from the raw identifier because URL parsing collapses `.` and
    /// `..` segments, which would point SQLite at a different file.
    fn raw_database_segment(&self) -> &str {
        let Some(scheme_end) = self.raw.find("://") else {
            return "";
        };
        let rest = &self.raw[scheme_end + 3..];
        let Some(path_start) = rest.find('/') else {
            return "";
        };
        let path = &rest[path_start + 1..];
        let path_end = path.find(|c: char| c == '?' || c == '#').unwrap_or(path.len());
        &path[..path_end]
    }

    /// Decodes the identifier back into its parts.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Encoding`] if the identifier is not a valid URL,
    /// lacks a user, host or database, or carries undecodable escapes.
    pub fn parse(&self) -> Result<IdentifierParts> {
        let url = Url::parse(&self.raw)
            .map_err(|e| DbError::Encoding(format!("malformed connection identifier: {e}")))?;

        let (dialect, driver) = match url.scheme().split_once('+') {
            Some((dialect, driver)) => (dialect.to_string(), Some(driver.to_string())),
            None => (url.scheme().to_string(), None),
        };

        if url.username().is_empty() {
            return Err(DbError::Encoding(
                "connection identifier has no user".to_string(),
            ));
        }
        let user = decode("user", url.username())?;
        let secret = decode("secret", url.password().unwrap_or_default())?;

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| DbError::Encoding("connection identifier has no host".to_string()))?;
        let host_port = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let database_name = decode("database_name", self.raw_database_segment())?;
        if database_name.is_empty() {
            return Err(DbError::Encoding(
                "connection identifier has no database".to_string(),
            ));
        }

        let charset = url
            .query_pairs()
            .find(|(key, _)| key == "charset")
            .map(|(_, value)| value.into_owned());

        Ok(IdentifierParts {
            dialect,
            driver,
            user,
            secret,
            host_port,
            database_name,
            charset,
        })
    }
}

impl FromStr for ConnectionIdentifier {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        let identifier = ConnectionIdentifier { raw: s.to_string() };
        identifier.parse()?;
        Ok(identifier)
    }
}

impl fmt::Display for ConnectionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for ConnectionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConnectionIdentifier")
            .field(&self.redacted())
            .finish()
    }
}
