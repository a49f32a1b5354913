use thiserror::Error;
use usermgr_db::DbError;

/// Errors returned by the user repository.
#[derive(Debug, Error)]
pub enum UserError {
    /// The username is empty or longer than the column allows.
    #[error("invalid username: {0}")]
    InvalidUsername(String),

    /// Another user already holds this username.
    #[error("username '{0}' is already taken")]
    UsernameTaken(String),

    /// No user has the given id.
    #[error("user {0} not found")]
    NotFound(i64),

    /// The secret could not be hashed or the stored hash could not be read.
    #[error("secret hashing failed: {0}")]
    Hash(String),

    /// Any other data-access failure.
    #[error(transparent)]
    Db(#[from] DbError),
}
