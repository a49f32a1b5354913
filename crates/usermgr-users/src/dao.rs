//! User repository.
//!
//! [`UserDao`] and [`AsyncUserDao`] run the same transaction bodies; they
//! differ only in whether the caller's thread blocks. Every method runs in
//! its own transaction scope and returns owned [`User`] snapshots.

use usermgr_db::{DbError, SessionFactory, Tracked, Unit};

use crate::error::UserError;
use crate::password::{hash_secret, verify_secret, Argon2Params};
use crate::user::{validate_username, User};

fn create_body(
    unit: &mut Unit<'_>,
    username: &str,
    secret: &str,
    params: Argon2Params,
) -> Result<Tracked<User>, UserError> {
    let secret_hash = hash_secret(secret, params)?;
    let tracked = unit.add(User::new(username, secret_hash));

    // Flushed here so a duplicate is reported against this username.
    unit.flush().map_err(|e| match e {
        DbError::UniqueViolation { .. } => UserError::UsernameTaken(username.to_string()),
        other => UserError::Db(other),
    })?;

    if let Some(user) = unit.get(&tracked) {
        tracing::info!(user_id = user.id, username = %user.username, "user created");
    }
    Ok(tracked)
}

fn get_body(unit: &mut Unit<'_>, id: i64) -> Result<Tracked<User>, UserError> {
    unit.find::<User>(id)?.ok_or(UserError::NotFound(id))
}

fn by_username_body(
    unit: &mut Unit<'_>,
    username: &str,
) -> Result<Option<Tracked<User>>, UserError> {
    let Some(id) = User::id_for_username(unit.connection()?, username).map_err(DbError::from)?
    else {
        return Ok(None);
    };
    Ok(unit.find::<User>(id)?)
}

fn update_secret_body(
    unit: &mut Unit<'_>,
    id: i64,
    secret: &str,
    params: Argon2Params,
) -> Result<Tracked<User>, UserError> {
    let secret_hash = hash_secret(secret, params)?;
    let updated = unit
        .connection()?
        .execute(
            "UPDATE users SET secret_hash = ?1 WHERE id = ?2",
            rusqlite::params![secret_hash, id],
        )
        .map_err(DbError::from)?;
    if updated == 0 {
        return Err(UserError::NotFound(id));
    }

    tracing::info!(user_id = id, "user secret updated");
    get_body(unit, id)
}

fn delete_body(unit: &mut Unit<'_>, id: i64) -> Result<(), UserError> {
    let deleted = unit
        .connection()?
        .execute("DELETE FROM users WHERE id = ?1", [id])
        .map_err(DbError::from)?;
    if deleted == 0 {
        return Err(UserError::NotFound(id));
    }

    tracing::info!(user_id = id, "user deleted");
    Ok(())
}

fn authenticate_body(
    unit: &mut Unit<'_>,
    username: &str,
    secret: &str,
) -> Result<Option<Tracked<User>>, UserError> {
    let Some(tracked) = by_username_body(unit, username)? else {
        tracing::debug!(username, "authentication failed: unknown user");
        return Ok(None);
    };
    let verified = match unit.get(&tracked) {
        Some(user) => verify_secret(secret, &user.secret_hash)?,
        None => false,
    };
    if !verified {
        tracing::debug!(username, "authentication failed: wrong secret");
        return Ok(None);
    }
    Ok(Some(tracked))
}

/// Blocking user repository.
#[derive(Debug, Clone)]
pub struct UserDao {
    sessions: SessionFactory,
    params: Argon2Params,
}

impl UserDao {
    /// A repository hashing with the default Argon2 parameters.
    pub fn new(sessions: SessionFactory) -> Self {
        Self {
            sessions,
            params: Argon2Params::default(),
        }
    }

    /// Replaces the hashing parameters used for new secrets.
    pub fn with_hash_params(mut self, params: Argon2Params) -> Self {
        self.params = params;
        self
    }

    /// The session factory this repository draws from.
    pub fn sessions(&self) -> &SessionFactory {
        &self.sessions
    }

    /// Creates a user and returns it with its storage-assigned id and
    /// timestamps. The secret is stored only as a hash.
    ///
    /// # Errors
    ///
    /// - [`UserError::InvalidUsername`] before any database work.
    /// - [`UserError::UsernameTaken`] when the username already exists.
    /// - [`UserError::Db`] for connection, pool and storage failures.
    pub fn create_user(&self, username: &str, secret: &str) -> Result<User, UserError> {
        validate_username(username)?;
        let params = self.params;
        self.sessions
            .transaction(|unit| create_body(unit, username, secret, params))
    }

    /// Fetches a user by id.
    ///
    /// # Errors
    ///
    /// [`UserError::NotFound`] when no such user exists.
    pub fn get_user(&self, id: i64) -> Result<User, UserError> {
        self.sessions.transaction(|unit| get_body(unit, id))
    }

    /// Fetches a user by username.
    pub fn get_user_by_username(&self, username: &str) -> Result<Option<User>, UserError> {
        self.sessions
            .transaction(|unit| by_username_body(unit, username))
    }

    /// Replaces a user's secret and returns the updated record.
    ///
    /// # Errors
    ///
    /// [`UserError::NotFound`] when no such user exists.
    pub fn update_secret(&self, id: i64, secret: &str) -> Result<User, UserError> {
        let params = self.params;
        self.sessions
            .transaction(|unit| update_secret_body(unit, id, secret, params))
    }

    /// Deletes a user.
    ///
    /// # Errors
    ///
    /// [`UserError::NotFound`] when no such user exists.
    pub fn delete_user(&self, id: i64) -> Result<(), UserError> {
        self.sessions.transaction(|unit| delete_body(unit, id))
    }

    /// Returns the user when `secret` matches the stored hash, `None` for an
    /// unknown username or a wrong secret.
    pub fn authenticate(&self, username: &str, secret: &str) -> Result<Option<User>, UserError> {
        self.sessions
            .transaction(|unit| authenticate_body(unit, username, secret))
    }
}

/// Non-blocking user repository.
///
/// Callers suspend while every pooled connection is busy; the transaction
/// bodies, hashing included, run on the blocking thread pool.
#[derive(Debug, Clone)]
pub struct AsyncUserDao {
    sessions: SessionFactory,
    params: Argon2Params,
}

impl AsyncUserDao {
    /// A repository hashing with the default Argon2 parameters.
    pub fn new(sessions: SessionFactory) -> Self {
        Self {
            sessions,
            params: Argon2Params::default(),
        }
    }

    /// Replaces the hashing parameters used for new secrets.
    pub fn with_hash_params(mut self, params: Argon2Params) -> Self {
        self.params = params;
        self
    }

    /// The session factory this repository draws from.
    pub fn sessions(&self) -> &SessionFactory {
        &self.sessions
    }

    /// See [`UserDao::create_user`].
    pub async fn create_user(&self, username: &str, secret: &str) -> Result<User, UserError> {
        validate_username(username)?;
        let (username, secret, params) = (username.to_string(), secret.to_string(), self.params);
        self.sessions
            .transaction_async(move |unit| create_body(unit, &username, &secret, params))
            .await
    }

    /// See [`UserDao::get_user`].
    pub async fn get_user(&self, id: i64) -> Result<User, UserError> {
        self.sessions
            .transaction_async(move |unit| get_body(unit, id))
            .await
    }

    /// See [`UserDao::get_user_by_username`].
    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, UserError> {
        let username = username.to_string();
        self.sessions
            .transaction_async(move |unit| by_username_body(unit, &username))
            .await
    }

    /// See [`UserDao::update_secret`].
    pub async fn update_secret(&self, id: i64, secret: &str) -> Result<User, UserError> {
        let (secret, params) = (secret.to_string(), self.params);
        self.sessions
            .transaction_async(move |unit| update_secret_body(unit, id, &secret, params))
            .await
    }

    /// See [`UserDao::delete_user`].
    pub async fn delete_user(&self, id: i64) -> Result<(), UserError> {
        self.sessions
            .transaction_async(move |unit| delete_body(unit, id))
            .await
    }

    /// See [`UserDao::authenticate`].
    pub async fn authenticate(
        &self,
        username: &str,
        secret: &str,
    ) -> Result<Option<User>, UserError> {
        let (username, secret) = (username.to_string(), secret.to_string());
        self.sessions
            .transaction_async(move |unit| authenticate_body(unit, &username, &secret))
            .await
    }
}
