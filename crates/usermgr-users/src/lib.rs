//! User records and the repository that stores them.
//!
//! Secrets are never stored as given: they are hashed with Argon2id before
//! the record is written, and [`UserDao::authenticate`] verifies against the
//! stored hash. Usernames are unique at the storage level; a duplicate is
//! reported as [`UserError::UsernameTaken`] without a pre-check query.

mod dao;
mod error;
mod password;
mod user;

pub use dao::{AsyncUserDao, UserDao};
pub use error::UserError;
pub use password::{hash_secret, verify_secret, Argon2Params};
pub use user::{validate_username, User, MAX_USERNAME_LEN};
