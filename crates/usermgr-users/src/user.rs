//! The `users` record.

use chrono::NaiveDateTime;
use rusqlite::{Connection, OptionalExtension, Row};
use usermgr_db::Persist;

use crate::error::UserError;

/// Longest username the `users.username` column accepts, in characters.
pub const MAX_USERNAME_LEN: usize = 255;

/// A stored user.
///
/// `id`, `created_at` and `updated_at` are assigned by storage when the
/// record is flushed; before that `id` is 0 and the timestamps are unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub secret_hash: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl User {
    /// A user that has not been written yet.
    pub fn new(username: impl Into<String>, secret_hash: impl Into<String>) -> Self {
        Self {
            id: 0,
            username: username.into(),
            secret_hash: secret_hash.into(),
            created_at: NaiveDateTime::default(),
            updated_at: NaiveDateTime::default(),
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            username: row.get(1)?,
            secret_hash: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    /// Id of the user called `username`, if any.
    pub(crate) fn id_for_username(
        conn: &Connection,
        username: &str,
    ) -> rusqlite::Result<Option<i64>> {
        conn.query_row(
            "SELECT id FROM users WHERE username = ?1",
            [username],
            |row| row.get(0),
        )
        .optional()
    }
}

impl Persist for User {
    const TABLE: &'static str = "users";

    fn primary_key(&self) -> Option<i64> {
        (self.id > 0).then_some(self.id)
    }

    fn insert(&mut self, conn: &Connection) -> rusqlite::Result<()> {
        let (id, created_at, updated_at): (i64, NaiveDateTime, NaiveDateTime) = conn.query_row(
            "INSERT INTO users (username, secret_hash) VALUES (?1, ?2)
             RETURNING id, created_at, updated_at",
            [&self.username, &self.secret_hash],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        self.id = id;
        self.created_at = created_at;
        self.updated_at = updated_at;
        Ok(())
    }

    fn load(conn: &Connection, key: i64) -> rusqlite::Result<Option<Self>> {
        conn.query_row(
            "SELECT id, username, secret_hash, created_at, updated_at FROM users WHERE id = ?1",
            [key],
            User::from_row,
        )
        .optional()
    }
}

/// Rejects usernames the `users` table cannot hold.
///
/// # Errors
///
/// Returns [`UserError::InvalidUsername`] for blank names or names longer
/// than [`MAX_USERNAME_LEN`] characters.
pub fn validate_username(username: &str) -> Result<(), UserError> {
    if username.trim().is_empty() {
        return Err(UserError::InvalidUsername("username must not be empty".to_string()));
    }
    if username.chars().count() > MAX_USERNAME_LEN {
        return Err(UserError::InvalidUsername(format!(
            "username must be at most {MAX_USERNAME_LEN} characters"
        )));
    }
    Ok(())
}
